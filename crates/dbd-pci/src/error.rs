// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
use thiserror::Error;

/// Failures while opening and mapping a device.
#[derive(Error, Debug)]
pub enum PciOpenError {
    #[error("Could not open /dev/tenstorrent/{id}: {source}")]
    DeviceOpenFailed { id: usize, source: std::io::Error },

    #[error("/dev/tenstorrent/{pci_id} reports unknown PCI device id {device_id:#x}")]
    UnrecognizedDeviceId { pci_id: usize, device_id: u16 },

    #[error("Driver request {name} on device {id} failed: {source}")]
    IoctlError {
        name: String,
        id: usize,
        source: nix::Error,
    },

    #[error("Could not map {name} of device {id}")]
    BarMappingError { name: String, id: usize },
}

/// Failures of an access to an opened device.
#[derive(Error, Debug)]
pub enum PciError {
    #[error("Could not map a DMA buffer of device {id}: {source}")]
    DmaBufferMappingFailed { id: usize, source: std::io::Error },

    #[error("Device {id} has no DMA transfer buffers")]
    DmaNotConfigured { id: usize },

    #[error("Could not allocate a {size} byte DMA buffer on device {id}: {err}")]
    DmaAllocationFailed { id: usize, size: u32, err: Errno },

    #[error("Device {id} needs 64 bit DMA addresses which its ARC firmware lacks")]
    No64bitDma { id: usize },

    #[error("DMA of {size} bytes on device {id} does not fit the 28 bit size field")]
    DmaTooLarge { id: usize, size: usize },

    #[error("Device {id} cannot signal DMA completion by MSI")]
    MsiDmaUnsupported { id: usize },

    #[error("Read 0xffffffff from ARC scratch[6]: {}", if *.reset_succeeded { "auto-reset succeeded." } else { "you should reset the board." })]
    DeviceHung { reset_succeeded: bool },

    #[error("TLB window {id} does not exist")]
    TlbOutOfRange { id: usize },

    #[error("Access of {len} bytes at {addr:#x} runs past the end of the address space")]
    AddressOverflow { addr: u64, len: usize },

    #[error("No pinned window covers {len} bytes at {addr:#x} on core ({x}, {y})")]
    Unpinned { x: u8, y: u8, addr: u64, len: usize },

    #[error("Device {id} has no host memory channel {channel}")]
    NoSysmem { id: usize, channel: usize },

    #[error("Access of {size} bytes at {addr:#x} is outside of host memory channel {channel} ({channel_size} bytes)")]
    SysmemOutOfRange {
        channel: usize,
        addr: u64,
        size: usize,
        channel_size: u64,
    },

    #[error("Hugepage setup failed for device {id}: {reason}")]
    HugepageSetupFailed { id: usize, reason: String },

    #[error("The BAR of this device is not mapped")]
    BarUnmapped,

    #[error("{0}")]
    DeviceOpenError(#[from] PciOpenError),
}
