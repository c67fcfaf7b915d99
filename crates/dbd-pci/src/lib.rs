// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::os::{fd::AsRawFd, unix::prelude::FileTypeExt};

mod error;
pub mod fake;
pub mod ioctl;
pub mod kmdif;
mod pci;
pub mod sysmem;
pub mod tlb;

use dbd_core::Arch;
pub use error::{PciError, PciOpenError};
use ioctl::{query_mappings, AllocateDmaBuffer, GetDeviceInfo, GetDeviceInfoOut, QueryMappings};
pub use tlb::Tlb;

/// The register level view of an MMIO device.
///
/// Everything above the raw mapping (TLB programming, chunked NOC access, host memory) is written
/// against this so it can run on the in-memory [`fake::FakeBar`].
pub trait BarIo {
    fn id(&self) -> usize;
    fn arch(&self) -> Arch;

    fn read32(&mut self, addr: u32) -> Result<u32, PciError>;
    fn write32(&mut self, addr: u32, value: u32) -> Result<(), PciError>;
    fn write_tlb_reg(&mut self, addr: u32, value: u64) -> Result<(), PciError>;
    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), PciError>;
    fn read_block(&mut self, addr: u32, data: &mut [u8]) -> Result<(), PciError>;

    fn sysmem_write(&mut self, channel: usize, addr: u64, data: &[u8]) -> Result<(), PciError>;
    fn sysmem_read(&mut self, channel: usize, addr: u64, data: &mut [u8]) -> Result<(), PciError>;
}

fn arch_from_device_info(value: &GetDeviceInfoOut) -> Result<Arch, u16> {
    match value.device_id {
        0xfaca => Ok(Arch::Grayskull),
        0x401e => Ok(Arch::Wormhole),
        id => Err(id),
    }
}

pub struct DmaBuffer {
    pub buffer: memmap2::MmapMut,
    pub physical_address: u64,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct DmaConfig {
    /// Address in CSM where the DMA request structure resides
    pub csm_pcie_ctrl_dma_request_offset: u32,

    /// To trigger ARC interrupt
    pub arc_misc_cntl_addr: u32,

    /// DMA host phys addr high
    pub dma_host_phys_addr_high: u32,

    pub support_64_bit_dma: bool,

    /// Have the device signal completion by MSI instead of writing the completion flag. Not
    /// supported, every DMA fails with `MsiDmaUnsupported` while this is set.
    pub use_msi_for_dma: bool,

    /// Transfers of at least this many bytes use DMA, 0 disables it.
    pub read_threshold: u32,
    pub write_threshold: u32,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            csm_pcie_ctrl_dma_request_offset: kmdif::CSM_PCIE_CTRL_DMA_REQUEST_OFFSET,
            arc_misc_cntl_addr: kmdif::ARC_MISC_CNTL_ADDR,
            dma_host_phys_addr_high: 0,
            support_64_bit_dma: false,
            use_msi_for_dma: false,
            read_threshold: 0,
            write_threshold: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PhysicalDevice {
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,

    pub pci_bus: u16,
    pub slot: u16,
    pub pci_function: u16,
    pub pci_domain: u16,
}

pub struct BarMapping {
    pub bar_size_bytes: u64,

    pub bar0_uc: memmap2::MmapMut,
    pub bar0_uc_offset: u64,

    pub bar0_wc: Option<memmap2::MmapMut>,
    pub bar0_wc_size: u64,

    pub system_reg_mapping: Option<memmap2::MmapMut>,
    pub system_reg_start_offset: u32, // Registers >= this are system regs, use the mapping.
    pub system_reg_offset_adjust: u32, // This is the offset of the first reg in the system reg mapping.
}

pub struct PciDevice {
    pub id: usize,

    pub physical: PhysicalDevice,
    pub arch: Arch,

    pub read_checking_enabled: bool,

    next_dma_buf: usize,

    device_fd: std::fs::File,
    pub driver_version: u32,

    max_dma_buf_size_log2: u16,

    completion_flag_buffer: Option<DmaBuffer>,
    transfer_buffer: Option<DmaBuffer>,
    sysmem: Vec<DmaBuffer>,

    pub dma_config: Option<DmaConfig>,
    pub pci_bar: Option<BarMapping>,
}

fn allocate_dma_buffer(
    device_id: usize,
    device_fd: &std::fs::File,
    max_dma_buf_size_log2: u32,
    buffer_index: usize,
    size: u32,
) -> Result<DmaBuffer, PciError> {
    let page_size = kmdif::getpagesize().unwrap_or(4096) as u32;

    let mut allocate_dma_buf = AllocateDmaBuffer::default();
    allocate_dma_buf.input.requested_size = (size.min(1 << max_dma_buf_size_log2)).max(page_size);
    allocate_dma_buf.input.buf_index = buffer_index as u8;

    if let Err(err) =
        unsafe { ioctl::allocate_dma_buffer(device_fd.as_raw_fd(), &mut allocate_dma_buf) }
    {
        return Err(PciError::DmaAllocationFailed {
            id: device_id,
            size: allocate_dma_buf.input.requested_size,
            err,
        });
    }

    let map = unsafe {
        memmap2::MmapOptions::default()
            .len(allocate_dma_buf.output.size as usize)
            .offset(allocate_dma_buf.output.mapping_offset)
            .map_mut(device_fd.as_raw_fd())
    }
    .map_err(|source| PciError::DmaBufferMappingFailed {
        id: device_id,
        source,
    })?;

    Ok(DmaBuffer {
        buffer: map,
        physical_address: allocate_dma_buf.output.physical_address,
        size: allocate_dma_buf.output.size as u64,
    })
}

impl PciDevice {
    fn map_region(
        &self,
        name: &str,
        base: u64,
        size: u64,
    ) -> Result<memmap2::MmapMut, PciOpenError> {
        unsafe {
            memmap2::MmapOptions::default()
                .len(size as usize)
                .offset(base)
                .map_mut(self.device_fd.as_raw_fd())
        }
        .map_err(|err| {
            tracing::debug!("mapping {name} for device {} failed: {err}", self.id);
            PciOpenError::BarMappingError {
                name: name.to_string(),
                id: self.id,
            }
        })
    }

    fn map_bar(&mut self) -> Result<(), PciOpenError> {
        let mut mappings = QueryMappings::<8>::default();

        if let Err(errno) = unsafe { query_mappings(self.device_fd.as_raw_fd(), &mut mappings) } {
            return Err(PciOpenError::IoctlError {
                name: "query_mappings".to_string(),
                id: self.id,
                source: errno,
            });
        }

        let mut bar0_uc_mapping = None;
        let mut bar0_wc_mapping = None;
        let mut bar4_uc_mapping = None;

        let count = mappings.input.output_mapping_count as usize;
        for mapping in mappings.output.iter().take(count) {
            match kmdif::MappingId::from_u32(mapping.mapping_id) {
                kmdif::MappingId::Resource0Uc => bar0_uc_mapping = Some(*mapping),
                kmdif::MappingId::Resource0Wc => bar0_wc_mapping = Some(*mapping),
                kmdif::MappingId::Resource2Uc => bar4_uc_mapping = Some(*mapping),
                kmdif::MappingId::Unknown(v) => {
                    tracing::warn!("Received unknown mapping id {v}");
                }
                _ => {}
            }
        }

        let Some(bar0_uc_mapping) = bar0_uc_mapping else {
            return Err(PciOpenError::BarMappingError {
                name: "bar0_uc_mapping".to_string(),
                id: self.id,
            });
        };

        let wc_mapping_size = kmdif::BAR0_WC_MAPPING_SIZE;

        let mut bar0_wc_size = 0;
        let mut bar0_wc = None;
        if let Some(bar0_wc_mapping) = bar0_wc_mapping {
            let size = bar0_wc_mapping.mapping_size.min(wc_mapping_size);
            match self.map_region("bar0_wc", bar0_wc_mapping.mapping_base, size) {
                Ok(map) => {
                    bar0_wc = Some(map);
                    bar0_wc_size = size;
                }
                Err(err) => {
                    tracing::warn!("{err}, falling back to an uncached mapping");
                }
            }
        }

        // Without a WC mapping the entire BAR is mapped UC.
        let (bar0_uc_size, bar0_uc_offset) = if bar0_wc.is_some() {
            (
                bar0_uc_mapping.mapping_size.saturating_sub(wc_mapping_size),
                wc_mapping_size,
            )
        } else {
            (bar0_uc_mapping.mapping_size, 0)
        };

        let bar0_uc = self.map_region(
            "bar0_uc",
            bar0_uc_mapping.mapping_base + bar0_uc_offset,
            bar0_uc_size,
        )?;

        let mut system_reg_mapping = None;
        let mut system_reg_start_offset = 0;
        let mut system_reg_offset_adjust = 0;
        if self.arch.is_wormhole() {
            let Some(bar4_uc_mapping) = bar4_uc_mapping else {
                return Err(PciOpenError::BarMappingError {
                    name: "bar4_uc_mapping".to_string(),
                    id: self.id,
                });
            };

            system_reg_mapping = Some(self.map_region(
                "bar4_uc",
                bar4_uc_mapping.mapping_base,
                bar4_uc_mapping.mapping_size,
            )?);
            system_reg_start_offset = (512 - 16) * 1024 * 1024;
            system_reg_offset_adjust = (512 - 32) * 1024 * 1024;
        }

        self.pci_bar = Some(BarMapping {
            bar_size_bytes: bar0_uc_mapping.mapping_size,
            bar0_uc,
            bar0_uc_offset,
            bar0_wc,
            bar0_wc_size,
            system_reg_mapping,
            system_reg_start_offset,
            system_reg_offset_adjust,
        });

        Ok(())
    }

    pub fn open(device_id: usize) -> Result<PciDevice, PciOpenError> {
        let fd = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/tenstorrent/{device_id}"))
            .map_err(|source| PciOpenError::DeviceOpenFailed {
                id: device_id,
                source,
            })?;

        let mut device_info = GetDeviceInfo::default();
        if let Err(errorno) = unsafe { ioctl::get_device_info(fd.as_raw_fd(), &mut device_info) } {
            return Err(PciOpenError::IoctlError {
                name: "get_device_info".to_string(),
                id: device_id,
                source: errorno,
            });
        }

        let mut driver_info = ioctl::GetDriverInfo::default();
        if let Err(errorno) = unsafe { ioctl::get_driver_info(fd.as_raw_fd(), &mut driver_info) } {
            return Err(PciOpenError::IoctlError {
                name: "get_driver_info".to_string(),
                id: device_id,
                source: errorno,
            });
        }

        let arch = arch_from_device_info(&device_info.output).map_err(|asic_id| {
            PciOpenError::UnrecognizedDeviceId {
                pci_id: device_id,
                device_id: asic_id,
            }
        })?;

        let bus_dev_fn = device_info.output.bus_dev_fn;
        let mut device = PciDevice {
            id: device_id,
            arch,

            physical: PhysicalDevice {
                vendor_id: device_info.output.vendor_id,
                device_id: device_info.output.device_id,
                subsystem_vendor_id: device_info.output.subsystem_vendor_id,
                subsystem_id: device_info.output.subsystem_id,
                pci_bus: bus_dev_fn >> 8,
                slot: (bus_dev_fn >> 3) & 0x1f,
                pci_function: bus_dev_fn & 0x7,
                pci_domain: device_info.output.pci_domain,
            },

            read_checking_enabled: true,

            next_dma_buf: 0,

            device_fd: fd,
            driver_version: driver_info.output.driver_version,

            max_dma_buf_size_log2: device_info.output.max_dma_buf_size_log2,

            completion_flag_buffer: None,
            transfer_buffer: None,
            sysmem: vec![],

            dma_config: None,
            pci_bar: None,
        };

        device.map_bar()?;

        tracing::debug!(
            "opened device {device_id}: {arch} on bus {:02x}, driver version {}",
            device.physical.pci_bus,
            device.driver_version
        );

        Ok(device)
    }

    /// Allocate the bounce buffer and completion flag used by DMA transfers.
    pub fn allocate_transfer_buffers(&mut self) -> bool {
        let page_size = kmdif::getpagesize().unwrap_or(4096) as u32;

        // No point in a completion flag without somewhere to transfer to.
        if self.transfer_buffer.is_none() {
            self.transfer_buffer = self
                .allocate_dma_buffer_range(page_size, kmdif::MAX_DMA_BYTES)
                .ok();
        }

        if self.transfer_buffer.is_some() && self.completion_flag_buffer.is_none() {
            self.completion_flag_buffer = self
                .allocate_dma_buffer(std::mem::size_of::<u64>() as u32)
                .ok();
        }

        self.transfer_buffer.is_some() && self.completion_flag_buffer.is_some()
    }

    /// Allocate the largest buffer between `min_size` and `max_size` the driver will give us,
    /// halving the request after every failure.
    pub fn allocate_dma_buffer_range(
        &mut self,
        min_size: u32,
        max_size: u32,
    ) -> Result<DmaBuffer, PciError> {
        let page_size = kmdif::getpagesize().unwrap_or(4096) as u32;

        let mut page_aligned_size = (max_size + page_size - 1) & !(page_size - 1);
        let min_aligned_page_size = (min_size + page_size - 1) & !(page_size - 1);

        loop {
            match allocate_dma_buffer(
                self.id,
                &self.device_fd,
                self.max_dma_buf_size_log2 as u32,
                self.next_dma_buf,
                page_aligned_size,
            ) {
                Ok(buf) => {
                    self.next_dma_buf += 1;
                    return Ok(buf);
                }
                Err(err) => {
                    if page_aligned_size <= min_aligned_page_size {
                        return Err(err);
                    }

                    page_aligned_size = (page_aligned_size / 2).max(min_aligned_page_size);
                }
            }
        }
    }

    pub fn allocate_dma_buffer(&mut self, size: u32) -> Result<DmaBuffer, PciError> {
        self.allocate_dma_buffer_range(size, size)
    }

    pub fn scan() -> Vec<usize> {
        let output = match std::fs::read_dir("/dev/tenstorrent") {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!("When reading /dev/tenstorrent for a scan hit error: {err}");
                return Vec::new();
            }
        };

        let mut output = output
            .filter_map(|entry| {
                let entry = entry.ok()?;

                if !entry.file_type().ok()?.is_char_device() {
                    return None;
                }

                let path = entry.path();
                let file_name = path.file_name()?.to_str()?;
                file_name.parse::<usize>().ok()
            })
            .collect::<Vec<_>>();

        output.sort();

        output
    }
}

impl BarIo for PciDevice {
    fn id(&self) -> usize {
        self.id
    }

    fn arch(&self) -> Arch {
        self.arch
    }

    fn read32(&mut self, addr: u32) -> Result<u32, PciError> {
        PciDevice::read32(self, addr)
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<(), PciError> {
        PciDevice::write32(self, addr, value)
    }

    fn write_tlb_reg(&mut self, addr: u32, value: u64) -> Result<(), PciError> {
        PciDevice::write_tlb_reg(self, addr, value)
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), PciError> {
        PciDevice::write_block(self, addr, data)
    }

    fn read_block(&mut self, addr: u32, data: &mut [u8]) -> Result<(), PciError> {
        PciDevice::read_block(self, addr, data)
    }

    fn sysmem_write(&mut self, channel: usize, addr: u64, data: &[u8]) -> Result<(), PciError> {
        PciDevice::sysmem_write(self, channel, addr, data)
    }

    fn sysmem_read(&mut self, channel: usize, addr: u64, data: &mut [u8]) -> Result<(), PciError> {
        PciDevice::sysmem_read(self, channel, addr, data)
    }
}

/// End of `[addr, addr + len)`, failing if it does not fit in a `u64`.
pub fn checked_end(addr: u64, len: usize) -> Result<u64, PciError> {
    addr.checked_add(len as u64).ok_or(PciError::AddressOverflow { addr, len })
}

/// Write `data` to the NOC address in `tlb` through window `index`, reprogramming the window for
/// every chunk that crosses its end.
pub fn noc_write<B: BarIo + ?Sized>(
    device: &mut B,
    index: u32,
    mut tlb: Tlb,
    data: &[u8],
) -> Result<(), PciError> {
    let mut written = 0;
    let addr = tlb.local_offset;
    checked_end(addr, data.len())?;
    while written < data.len() {
        let (offset, size) = tlb::setup_tlb(device, index, tlb.clone())?;

        let remaining_data = &data[written..];
        let chunk = &remaining_data[..(size as usize).min(remaining_data.len())];
        device.write_block(offset as u32, chunk)?;

        written += chunk.len();

        tlb.local_offset = addr + written as u64;
    }

    Ok(())
}

pub fn noc_read<B: BarIo + ?Sized>(
    device: &mut B,
    index: u32,
    mut tlb: Tlb,
    data: &mut [u8],
) -> Result<(), PciError> {
    let mut read = 0;
    let addr = tlb.local_offset;
    checked_end(addr, data.len())?;
    while read < data.len() {
        let (offset, size) = tlb::setup_tlb(device, index, tlb.clone())?;

        let remaining_buffer = &mut data[read..];
        let chunk_len = (size as usize).min(remaining_buffer.len());
        device.read_block(offset as u32, &mut remaining_buffer[..chunk_len])?;

        read += chunk_len;

        tlb.local_offset = addr + read as u64;
    }

    Ok(())
}

pub fn noc_write32<B: BarIo + ?Sized>(
    device: &mut B,
    index: u32,
    tlb: Tlb,
    data: u32,
) -> Result<(), PciError> {
    let (offset, size) = tlb::setup_tlb(device, index, tlb.clone())?;
    if size < 4 {
        // Straddles the end of the window.
        return noc_write(device, index, tlb, &data.to_le_bytes());
    }

    device.write32(offset as u32, data)
}

pub fn noc_read32<B: BarIo + ?Sized>(device: &mut B, index: u32, tlb: Tlb) -> Result<u32, PciError> {
    let (offset, size) = tlb::setup_tlb(device, index, tlb.clone())?;
    if size < 4 {
        let mut data = [0u8; 4];
        noc_read(device, index, tlb, &mut data)?;
        return Ok(u32::from_le_bytes(data));
    }

    device.read32(offset as u32)
}

#[derive(Debug, Default, PartialEq)]
pub struct DriverVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub quirk: Option<String>,
}

impl PartialOrd for DriverVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch)) {
            std::cmp::Ordering::Equal if self.quirk != other.quirk => None,
            ordering => Some(ordering),
        }
    }
}

fn driver_version_parse(version: &str) -> DriverVersion {
    let mut driver_version = DriverVersion::default();
    let version = version.trim();

    let version = if let Some((a, b)) = version.split_once('-') {
        driver_version.quirk = Some(b.to_string());

        a
    } else {
        version
    };

    let mut it = version.splitn(3, '.').map(|v| v.parse().ok());
    if let Some(Some(v)) = it.next() {
        driver_version.major = v;
    }
    if let Some(Some(v)) = it.next() {
        driver_version.minor = v;
    }
    if let Some(Some(v)) = it.next() {
        driver_version.patch = v;
    }

    driver_version
}

pub fn get_version() -> Option<DriverVersion> {
    std::fs::read_to_string("/sys/module/tenstorrent/version")
        .ok()
        .map(|version| driver_version_parse(&version))
}
