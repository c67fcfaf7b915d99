// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Debug primitives served to the debugger.
//!
//! Every operation returns `Ok(None)` when the backend does not support it. That is a normal
//! answer and is reported to the client as `NOT_SUPPORTED`, it is never retried. `Err` is kept
//! for operations that were supported but failed on the device.

use dbd_core::ChipId;

use crate::ServerError;

mod not_implemented;
mod open;
pub mod tile;
mod umd;

pub use not_implemented::NotImplemented;
pub use open::{OpenOptions, UmdWithOpen};
pub use umd::UmdImplementation;

pub type DebugResult<T> = Result<Option<T>, ServerError>;

/// Largest block a single read may ask for.
pub const MAX_READ_SIZE: u32 = 1 << 28;

#[allow(unused_variables)]
pub trait DebugImplementation: Send {
    fn read4(&mut self, chip: ChipId, x: u8, y: u8, addr: u64) -> DebugResult<u32> {
        Ok(None)
    }

    /// Returns the value written.
    fn write4(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, data: u32) -> DebugResult<u32> {
        Ok(None)
    }

    fn read(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, size: u32) -> DebugResult<Vec<u8>> {
        Ok(None)
    }

    /// Returns the number of bytes written.
    fn write(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, data: &[u8]) -> DebugResult<u32> {
        Ok(None)
    }

    /// Read a register straight from the BAR of an MMIO chip, no window involved.
    fn read4_raw(&mut self, chip: ChipId, addr: u64) -> DebugResult<u32> {
        Ok(None)
    }

    fn write4_raw(&mut self, chip: ChipId, addr: u64, data: u32) -> DebugResult<u32> {
        Ok(None)
    }

    /// Read from the host memory the chip DMAs into.
    fn dma_buffer_read4(&mut self, chip: ChipId, addr: u64, channel: u16) -> DebugResult<u32> {
        Ok(None)
    }

    /// Read a packed tile and render it as text.
    fn read_tile(
        &mut self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        size: u32,
        data_format: u8,
    ) -> DebugResult<String> {
        Ok(None)
    }

    fn get_runtime_data(&mut self) -> DebugResult<String> {
        Ok(None)
    }

    fn get_cluster_description(&mut self) -> DebugResult<String> {
        Ok(None)
    }

    fn get_harvester_coordinate_translation(&mut self, chip: ChipId) -> DebugResult<String> {
        Ok(None)
    }

    fn get_device_ids(&mut self) -> DebugResult<Vec<u8>> {
        Ok(None)
    }

    fn get_device_arch(&mut self, chip: ChipId) -> DebugResult<String> {
        Ok(None)
    }

    fn get_device_soc_description(&mut self, chip: ChipId) -> DebugResult<String> {
        Ok(None)
    }
}

impl<T: DebugImplementation + ?Sized> DebugImplementation for Box<T> {
    fn read4(&mut self, chip: ChipId, x: u8, y: u8, addr: u64) -> DebugResult<u32> {
        (**self).read4(chip, x, y, addr)
    }

    fn write4(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, data: u32) -> DebugResult<u32> {
        (**self).write4(chip, x, y, addr, data)
    }

    fn read(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, size: u32) -> DebugResult<Vec<u8>> {
        (**self).read(chip, x, y, addr, size)
    }

    fn write(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, data: &[u8]) -> DebugResult<u32> {
        (**self).write(chip, x, y, addr, data)
    }

    fn read4_raw(&mut self, chip: ChipId, addr: u64) -> DebugResult<u32> {
        (**self).read4_raw(chip, addr)
    }

    fn write4_raw(&mut self, chip: ChipId, addr: u64, data: u32) -> DebugResult<u32> {
        (**self).write4_raw(chip, addr, data)
    }

    fn dma_buffer_read4(&mut self, chip: ChipId, addr: u64, channel: u16) -> DebugResult<u32> {
        (**self).dma_buffer_read4(chip, addr, channel)
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
        (**self).read_tile(chip, x, y, addr, size, data_format)
    }

    fn get_runtime_data(&mut self) -> DebugResult<String> {
        (**self).get_runtime_data()
    }

    fn get_cluster_description(&mut self) -> DebugResult<String> {
        (**self).get_cluster_description()
    }

    fn get_harvester_coordinate_translation(&mut self, chip: ChipId) -> DebugResult<String> {
        (**self).get_harvester_coordinate_translation(chip)
    }

    fn get_device_ids(&mut self) -> DebugResult<Vec<u8>> {
        (**self).get_device_ids()
    }

    fn get_device_arch(&mut self, chip: ChipId) -> DebugResult<String> {
        (**self).get_device_arch(chip)
    }

    fn get_device_soc_description(&mut self, chip: ChipId) -> DebugResult<String> {
        (**self).get_device_soc_description(chip)
    }
}
