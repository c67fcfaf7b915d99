// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use dbd_core::ChipId;
use dbd_device::{Device, DynamicTlb};

use super::{tile, DebugImplementation, DebugResult, MAX_READ_SIZE};
use crate::ServerError;

/// Serves the debug primitives from an opened device.
pub struct UmdImplementation {
    device: Device,
}

impl UmdImplementation {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn read_block(
        &self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        size: u32,
    ) -> Result<Vec<u8>, ServerError> {
        if size > MAX_READ_SIZE {
            return Err(ServerError::RequestTooLarge {
                size: size.into(),
                max: MAX_READ_SIZE.into(),
            });
        }

        let mut data = vec![0u8; size as usize];
        self.device
            .read_from_device(chip, x, y, addr, &mut data, DynamicTlb::LargeRead)?;

        Ok(data)
    }
}

impl DebugImplementation for UmdImplementation {
    fn read4(&mut self, chip: ChipId, x: u8, y: u8, addr: u64) -> DebugResult<u32> {
        let mut data = [0u8; 4];
        self.device
            .read_from_device(chip, x, y, addr, &mut data, DynamicTlb::SmallReadWrite)?;

        // Device memory is little endian, the reply carries the host value.
        Ok(Some(u32::from_le_bytes(data)))
    }

    fn write4(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, data: u32) -> DebugResult<u32> {
        // Stored little endian regardless of the host.
        self.device.write_to_device(
            chip,
            x,
            y,
            addr,
            &data.to_le_bytes(),
            DynamicTlb::SmallReadWrite,
        )?;

        Ok(Some(data))
    }

    fn read(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, size: u32) -> DebugResult<Vec<u8>> {
        Ok(Some(self.read_block(chip, x, y, addr, size)?))
    }

    fn write(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, data: &[u8]) -> DebugResult<u32> {
        self.device
            .write_to_device(chip, x, y, addr, data, DynamicTlb::LargeWrite)?;

        Ok(Some(data.len() as u32))
    }

    fn read4_raw(&mut self, chip: ChipId, addr: u64) -> DebugResult<u32> {
        let addr = u32::try_from(addr).map_err(|_| ServerError::BarAddress(addr))?;

        Ok(Some(self.device.bar_read32(chip, addr)?))
    }

    fn write4_raw(&mut self, chip: ChipId, addr: u64, data: u32) -> DebugResult<u32> {
        let addr = u32::try_from(addr).map_err(|_| ServerError::BarAddress(addr))?;
        self.device.bar_write32(chip, addr, data)?;

        Ok(Some(data))
    }

    fn dma_buffer_read4(&mut self, chip: ChipId, addr: u64, channel: u16) -> DebugResult<u32> {
        let mut data = [0u8; 4];
        self.device
            .read_from_sysmem(chip, channel as usize, addr, &mut data)?;

        // Written by the device, so little endian like its own memory.
        Ok(Some(u32::from_le_bytes(data)))
    }

    fn read_tile(
        &mut self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        size: u32,
        data_format: u8,
    ) -> DebugResult<String> {
        if tile::DataFormat::try_from(data_format).is_err() {
            return Ok(None);
        }

        let data = self.read_block(chip, x, y, addr, size)?;
        Ok(tile::dump(&data, data_format))
    }

    fn get_harvester_coordinate_translation(&mut self, chip: ChipId) -> DebugResult<String> {
        Ok(Some(self.device.harvesting_translation(chip)?))
    }

    fn get_device_ids(&mut self) -> DebugResult<Vec<u8>> {
        Ok(Some(self.device.target_devices().collect()))
    }

    fn get_device_arch(&mut self, chip: ChipId) -> DebugResult<String> {
        self.device.soc_descriptor(chip)?;

        Ok(Some(self.device.arch().to_string()))
    }
}
