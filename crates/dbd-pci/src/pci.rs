// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{fence, Ordering};

use crate::{error::PciError, ioctl, kmdif, BarMapping, DmaBuffer, PciDevice};

const ERROR_VALUE: u32 = 0xffffffff;

impl BarMapping {
    unsafe fn register_address_mut<T>(&self, mut register_addr: u32) -> *mut T {
        let reg_mapping: *mut u8 = match (&self.system_reg_mapping, &self.bar0_wc) {
            (Some(mapping), _) if register_addr >= self.system_reg_start_offset => {
                register_addr -= self.system_reg_offset_adjust;
                mapping.as_ptr() as *mut u8
            }
            (_, Some(mapping)) if (register_addr as u64) < self.bar0_wc_size => {
                mapping.as_ptr() as *mut u8
            }
            _ => {
                register_addr -= self.bar0_uc_offset as u32;
                self.bar0_uc.as_ptr() as *mut u8
            }
        };

        reg_mapping.offset(register_addr as isize) as *mut T
    }

    unsafe fn register_address<T>(&self, register_addr: u32) -> *const T {
        self.register_address_mut(register_addr) as *const T
    }
}

impl PciDevice {
    fn bar(&self) -> Result<&BarMapping, PciError> {
        self.pci_bar.as_ref().ok_or(PciError::BarUnmapped)
    }

    fn is_hardware_hung(&self) -> Result<bool, PciError> {
        let scratch = unsafe {
            self.bar()?
                .register_address::<u32>(kmdif::ARC_SCRATCH6_ADDR)
                .read_volatile()
        };

        Ok(scratch == ERROR_VALUE)
    }

    fn reset_by_ioctl(&self) -> bool {
        let mut reset = ioctl::ResetDevice::default();
        match unsafe { ioctl::reset_device(self.device_fd.as_raw_fd(), &mut reset) } {
            Ok(_) => reset.output.result == 0,
            Err(err) => {
                tracing::debug!("reset ioctl failed for device {}: {err}", self.id);
                false
            }
        }
    }

    fn reset_by_helper(&self) -> bool {
        let Some(virtual_env) = std::env::var_os("VIRTUAL_ENV") else {
            return false;
        };

        let helper = PathBuf::from(virtual_env).join("bin").join("reset-helper");
        match std::process::Command::new(&helper)
            .arg(self.physical.pci_bus.to_string())
            .status()
        {
            Ok(status) => status.success(),
            Err(err) => {
                tracing::debug!("failed to run {}: {err}", helper.display());
                false
            }
        }
    }

    /// Try to recover a hung board. Returns true if the board responds again.
    pub fn auto_reset(&self) -> bool {
        tracing::warn!("Device {} is not responding, attempting reset", self.id);

        (self.reset_by_ioctl() || self.reset_by_helper()) && !self.is_hardware_hung().unwrap_or(true)
    }

    #[inline]
    pub fn detect_ffffffff_read(&self, data_read: u32) -> Result<(), PciError> {
        if self.read_checking_enabled && data_read == ERROR_VALUE && self.is_hardware_hung()? {
            return Err(PciError::DeviceHung {
                reset_succeeded: self.auto_reset(),
            });
        }

        Ok(())
    }

    #[inline]
    pub fn read32(&self, addr: u32) -> Result<u32, PciError> {
        let ptr = unsafe { self.bar()?.register_address::<u8>(addr) } as usize;

        let data = if ptr % core::mem::align_of::<u32>() != 0 {
            unsafe {
                let aligned = (ptr & !(core::mem::align_of::<u32>() - 1)) as *const u32;
                let a = aligned.read_volatile();
                let b = aligned.add(1).read_volatile();

                let shift = (ptr % core::mem::align_of::<u32>()) * 8;
                (a >> shift) | (b << (32 - shift))
            }
        } else {
            unsafe { (ptr as *const u32).read_volatile() }
        };
        self.detect_ffffffff_read(data)?;

        Ok(data)
    }

    #[inline]
    pub fn write32(&mut self, addr: u32, data: u32) -> Result<(), PciError> {
        let ptr = unsafe { self.bar()?.register_address_mut::<u8>(addr) } as usize;

        if ptr % core::mem::align_of::<u32>() != 0 {
            unsafe {
                let aligned = (ptr & !(core::mem::align_of::<u32>() - 1)) as *mut u32;
                let a = aligned.read_volatile();
                let b = aligned.add(1).read_volatile();

                let shift = (ptr % core::mem::align_of::<u32>()) * 8;
                let keep_a = (1u32 << shift) - 1;
                let keep_b = !(u32::MAX >> (32 - shift));

                aligned.write_volatile((a & keep_a) | (data << shift));
                aligned
                    .add(1)
                    .write_volatile((b & keep_b) | (data >> (32 - shift)));
            }
        } else {
            unsafe { (ptr as *mut u32).write_volatile(data) }
        }

        Ok(())
    }

    /// Program a TLB config register with a single 64 bit store.
    pub fn write_tlb_reg(&mut self, addr: u32, value: u64) -> Result<(), PciError> {
        let ptr = unsafe { self.bar()?.register_address_mut::<u64>(addr) };

        // The config register is UC while windows may be WC; keep the two streams ordered.
        fence(Ordering::SeqCst);
        unsafe { ptr.write_volatile(value) };
        fence(Ordering::SeqCst);

        Ok(())
    }

    fn write_words_no_dma(&mut self, addr: u32, data: &[u32]) -> Result<(), PciError> {
        let ptr = unsafe { self.bar()?.register_address_mut::<u32>(addr) };
        for (i, word) in data.iter().enumerate() {
            unsafe { ptr.add(i).write_volatile(*word) };
        }

        Ok(())
    }
}

impl PciDevice {
    pub fn pcie_dma_transfer_turbo(
        &mut self,
        chip_addr: u32,
        host_buffer_addr: u64,
        size: u32,
        write: bool,
    ) -> Result<(), PciError> {
        let Some(dma_config) = self.dma_config.clone() else {
            return Err(PciError::DmaNotConfigured { id: self.id });
        };

        if dma_config.use_msi_for_dma {
            return Err(PciError::MsiDmaUnsupported { id: self.id });
        }

        let host_phys_addr_hi = (host_buffer_addr >> 32) as u32;
        if host_phys_addr_hi != 0 && !dma_config.support_64_bit_dma {
            return Err(PciError::No64bitDma { id: self.id });
        }

        if size > (1 << 28) - 1 {
            return Err(PciError::DmaTooLarge {
                id: self.id,
                size: size as usize,
            });
        }

        let Some(completion_flag_buffer) = self.completion_flag_buffer.as_mut() else {
            return Err(PciError::DmaNotConfigured { id: self.id });
        };

        let req = kmdif::ArcPcieCtrlDmaRequest {
            chip_addr,
            host_phys_addr_lo: (host_buffer_addr & 0xffffffff) as u32,
            completion_flag_phys_addr: completion_flag_buffer.physical_address as u32,
            dma_pack: kmdif::DmaPack::new()
                .with_size_bytes(size)
                .with_write(write)
                .with_pcie_msi_on_done(false)
                .with_pcie_write_on_done(true)
                .with_trigger(true),
            repeat: 1 | (((host_phys_addr_hi != 0) as u32) << 31),
        };

        let complete_flag = completion_flag_buffer.buffer.as_mut_ptr() as *mut u32;
        unsafe { complete_flag.write_volatile(0) };

        if dma_config.support_64_bit_dma {
            self.write32(dma_config.dma_host_phys_addr_high, host_phys_addr_hi)?;
        }

        self.write_words_no_dma(dma_config.csm_pcie_ctrl_dma_request_offset, &req.to_words())?;

        // IRQ0 on ARC core 0. Reading the register first would cost more than the whole request.
        self.write32(dma_config.arc_misc_cntl_addr, 1 << 16)?;

        // Set by the ARC DMA handler once the transfer lands.
        while unsafe { complete_flag.read_volatile() } != kmdif::DMA_COMPLETION_VALUE {
            std::hint::spin_loop();
        }

        Ok(())
    }

    fn dma_threshold_met(&self, len: usize, write: bool) -> bool {
        match &self.dma_config {
            Some(config) => {
                let threshold = if write {
                    config.write_threshold
                } else {
                    config.read_threshold
                };
                threshold > 0 && len >= threshold as usize
            }
            None => false,
        }
    }

    fn take_transfer_buffer(&mut self) -> Option<DmaBuffer> {
        if self.allocate_transfer_buffers() {
            self.transfer_buffer.take()
        } else {
            None
        }
    }

    pub fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), PciError> {
        if self.dma_threshold_met(data.len(), true) {
            if let Some(mut buffer) = self.take_transfer_buffer() {
                let result = data
                    .chunks(buffer.size as usize)
                    .enumerate()
                    .try_for_each(|(i, chunk)| {
                        buffer.buffer[..chunk.len()].copy_from_slice(chunk);
                        self.pcie_dma_transfer_turbo(
                            addr + (i as u64 * buffer.size) as u32,
                            buffer.physical_address,
                            chunk.len() as u32,
                            true,
                        )
                    });
                self.transfer_buffer = Some(buffer);

                return result;
            }
        }

        self.write_block_no_dma(addr, data)
    }

    pub fn read_block(&mut self, addr: u32, data: &mut [u8]) -> Result<(), PciError> {
        if self.dma_threshold_met(data.len(), false) {
            if let Some(buffer) = self.take_transfer_buffer() {
                let buffer_size = buffer.size as usize;
                let result: Result<(), PciError> = data
                    .chunks_mut(buffer_size)
                    .enumerate()
                    .try_for_each(|(i, chunk)| {
                        self.pcie_dma_transfer_turbo(
                            addr + (i * buffer_size) as u32,
                            buffer.physical_address,
                            chunk.len() as u32,
                            false,
                        )?;
                        chunk.copy_from_slice(&buffer.buffer[..chunk.len()]);
                        Ok(())
                    });
                self.transfer_buffer = Some(buffer);
                result?;

                return self.check_block_read(data);
            }
        }

        self.read_block_no_dma(addr, data)
    }

    pub fn write_block_no_dma(&self, addr: u32, data: &[u8]) -> Result<(), PciError> {
        unsafe {
            let ptr = self.bar()?.register_address_mut(addr);
            Self::memcpy_to_device(ptr, data);
        }

        Ok(())
    }

    pub fn read_block_no_dma(&self, addr: u32, data: &mut [u8]) -> Result<(), PciError> {
        unsafe {
            let ptr = self.bar()?.register_address(addr);
            Self::memcpy_from_device(data, ptr);
        }

        self.check_block_read(data)
    }

    fn check_block_read(&self, data: &[u8]) -> Result<(), PciError> {
        if data.len() >= std::mem::size_of::<u32>() {
            self.detect_ffffffff_read(u32::from_ne_bytes([data[0], data[1], data[2], data[3]]))?;
        }

        Ok(())
    }
}

impl PciDevice {
    /// Copy to a memory location mapped to the PciDevice from a buffer passed in by the host.
    /// Both dest and src may be unaligned. The device only ever sees aligned 32 bit stores.
    ///
    /// # Safety
    /// `dest` must come from `register_address_mut` and `src.len()` bytes from it must be mapped.
    pub unsafe fn memcpy_to_device(dest: *mut u8, src: &[u8]) {
        // aarch64 device memory faults on the unaligned pair stores memcpy likes to emit.
        let align = if cfg!(target_arch = "aarch64") {
            4 * core::mem::align_of::<u32>()
        } else {
            core::mem::align_of::<u32>()
        };

        let mut offset = 0;
        while offset < src.len() {
            let bytes_left = src.len() - offset;
            let block_write_length = bytes_left & !(align - 1);

            let dest_misalign = ((dest as usize) + offset) % align;
            let src_misalign = ((src.as_ptr() as usize) + offset) % align;

            if bytes_left < 4
                || dest_misalign != 0
                || src_misalign != 0
                || block_write_length < align
            {
                let addr = (dest as usize) + offset;
                let byte_offset = addr % core::mem::align_of::<u32>();
                let src_size_bytes = (core::mem::size_of::<u32>() - byte_offset).min(bytes_left);

                let mut src_data = 0u32;
                for i in (offset..(offset + src_size_bytes)).rev() {
                    src_data <<= 8;
                    src_data |= src[i] as u32;
                }

                let word = (addr & !(core::mem::align_of::<u32>() - 1)) as *mut u32;
                let to_write = if byte_offset != 0 || src_size_bytes != 4 {
                    let dest_data = word.read_volatile();
                    let shift = byte_offset * 8;
                    let src_mask = (((1u64 << (src_size_bytes * 8)) - 1) as u32) << shift;

                    (dest_data & !src_mask) | ((src_data << shift) & src_mask)
                } else {
                    src_data
                };
                word.write_volatile(to_write);

                offset += src_size_bytes;
            } else {
                let words = block_write_length / core::mem::size_of::<u32>();
                let dest_words = (dest as usize + offset) as *mut u32;
                let src_words = (src.as_ptr() as usize + offset) as *const u32;
                for i in 0..words {
                    dest_words.add(i).write_volatile(src_words.add(i).read());
                }
                offset += block_write_length;
            }
        }
    }

    /// Copy from a memory location mapped to the PciDevice to a buffer passed in by the host.
    ///
    /// # Safety
    /// `src` must come from `register_address` and `dest.len()` bytes from it must be mapped.
    pub unsafe fn memcpy_from_device(dest: &mut [u8], src: *const u8) {
        let align = if cfg!(target_arch = "aarch64") {
            4 * core::mem::align_of::<u32>()
        } else {
            core::mem::align_of::<u32>()
        };

        let mut offset = 0;
        while offset < dest.len() {
            let bytes_left = dest.len() - offset;
            let block_read_length = bytes_left & !(align - 1);

            let dest_misalign = ((dest.as_ptr() as usize) + offset) % align;
            let src_misalign = ((src as usize) + offset) % align;

            if bytes_left < 4
                || dest_misalign != 0
                || src_misalign != 0
                || block_read_length < align
            {
                let addr = (src as usize) + offset;
                let byte_offset = addr % core::mem::align_of::<u32>();

                let src_data =
                    ((addr & !(core::mem::align_of::<u32>() - 1)) as *const u32).read_volatile();
                let read = (src_data >> (byte_offset * 8)).to_le_bytes();

                let read_count = (core::mem::size_of::<u32>() - byte_offset).min(bytes_left);
                dest[offset..(offset + read_count)].copy_from_slice(&read[..read_count]);

                offset += read_count;
            } else {
                let words = block_read_length / core::mem::size_of::<u32>();
                let dest_words = (dest.as_mut_ptr() as usize + offset) as *mut u32;
                let src_words = (src as usize + offset) as *const u32;
                for i in 0..words {
                    dest_words.add(i).write(src_words.add(i).read_volatile());
                }
                offset += block_read_length;
            }
        }
    }
}
