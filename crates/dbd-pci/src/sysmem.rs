// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Host memory shared with the device: one pinned 1G hugepage per channel, or a single small DMA
//! buffer when no hugepages are available.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::{umask, Mode};

use crate::{ioctl, DmaBuffer, PciDevice, PciError};

pub const HUGEPAGE_REGION_SIZE: u64 = 1 << 30;
pub const DMA_FALLBACK_SIZE: u32 = 4 << 20;

const DEFAULT_HUGEPAGE_DIR: &str = "/dev/hugepages-1G";

pub fn hugepage_dir() -> PathBuf {
    std::env::var_os("TT_BACKEND_HUGEPAGE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HUGEPAGE_DIR))
}

/// Every process driving the same device must agree on this name.
/// Device 0 channel 0 keeps the historical shared name.
pub fn hugepage_file_name(device_id: usize, channel: usize) -> String {
    let mut name = String::new();
    if device_id != 0 || channel != 0 {
        name.push_str(&format!("device_{device_id}_"));
    }
    if channel != 0 {
        name.push_str(&format!("channel_{channel}_"));
    }
    name.push_str("tenstorrent");

    name
}

fn open_hugepage_file(path: &Path) -> std::io::Result<std::fs::File> {
    let open = || {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(path)
    };

    let old_umask = umask(Mode::empty());
    let file = match open() {
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::warn!(
                "Could not open {}, unlinking it and retrying",
                path.display()
            );
            let _ = std::fs::remove_file(path);
            open()
        }
        other => other,
    };
    umask(old_umask);

    file
}

impl PciDevice {
    fn map_hugepage(&self, channel: usize) -> Result<DmaBuffer, PciError> {
        let setup_failed = |reason: String| PciError::HugepageSetupFailed {
            id: self.id,
            reason,
        };

        let path = hugepage_dir().join(hugepage_file_name(self.id, channel));
        let file = open_hugepage_file(&path)
            .map_err(|err| setup_failed(format!("opening {}: {err}", path.display())))?;

        let mut buffer = unsafe {
            memmap2::MmapOptions::default()
                .len(HUGEPAGE_REGION_SIZE as usize)
                .populate()
                .map_mut(&file)
        }
        .map_err(|err| setup_failed(format!("mapping {}: {err}", path.display())))?;

        let mut pin = ioctl::PinPages {
            input: ioctl::PinPagesIn {
                flags: ioctl::PIN_PAGES_CONTIGUOUS,
                virtual_address: buffer.as_mut_ptr() as u64,
                size: HUGEPAGE_REGION_SIZE,
                ..Default::default()
            },
            ..Default::default()
        };
        unsafe { ioctl::pin_pages(self.device_fd.as_raw_fd(), &mut pin) }
            .map_err(|err| setup_failed(format!("pinning channel {channel}: {err}")))?;

        tracing::debug!(
            "device {} channel {channel}: hugepage {} at physical {:#x}",
            self.id,
            path.display(),
            pin.output.physical_address
        );

        Ok(DmaBuffer {
            buffer,
            physical_address: pin.output.physical_address,
            size: HUGEPAGE_REGION_SIZE,
        })
    }

    /// Map `channels` host memory channels. A hugepage failure degrades to a single DMA buffer.
    pub fn init_sysmem(&mut self, channels: usize) -> Result<(), PciError> {
        let hugepages = (0..channels)
            .map(|channel| self.map_hugepage(channel))
            .collect::<Result<Vec<_>, _>>();

        self.sysmem = match hugepages {
            Ok(hugepages) => hugepages,
            Err(err) => {
                tracing::warn!("{err}; falling back to a {DMA_FALLBACK_SIZE} byte DMA buffer");
                vec![self.allocate_dma_buffer(DMA_FALLBACK_SIZE)?]
            }
        };

        Ok(())
    }

    pub fn sysmem_channels(&self) -> usize {
        self.sysmem.len()
    }

    fn sysmem_range(
        &self,
        channel: usize,
        addr: u64,
        len: usize,
    ) -> Result<std::ops::Range<usize>, PciError> {
        let buffer = self.sysmem.get(channel).ok_or(PciError::NoSysmem {
            id: self.id,
            channel,
        })?;

        // Channel sizes are powers of two, device side addresses wrap onto them.
        let start = (addr & (buffer.size - 1)) as usize;
        if start + len > buffer.size as usize {
            return Err(PciError::SysmemOutOfRange {
                channel,
                addr,
                size: len,
                channel_size: buffer.size,
            });
        }

        Ok(start..start + len)
    }

    pub fn sysmem_write(&mut self, channel: usize, addr: u64, data: &[u8]) -> Result<(), PciError> {
        let range = self.sysmem_range(channel, addr, data.len())?;
        self.sysmem[channel].buffer[range].copy_from_slice(data);

        Ok(())
    }

    pub fn sysmem_read(&self, channel: usize, addr: u64, data: &mut [u8]) -> Result<(), PciError> {
        let range = self.sysmem_range(channel, addr, data.len())?;
        data.copy_from_slice(&self.sysmem[channel].buffer[range]);

        Ok(())
    }
}
