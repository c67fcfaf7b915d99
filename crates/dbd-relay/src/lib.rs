// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reads and writes to chips without a PCIe link.
//!
//! Requests are posted into command queues owned by the ethernet firmware of an MMIO chip. The
//! firmware forwards them over the mesh and, for reads, posts the answer into a response queue.
//! Payloads up to [`queue::MAX_BLOCK_SIZE`] are staged in the ethernet core's L1, anything larger
//! goes through host memory.
//!
//! The first four relay cores carry ordinary traffic and are rotated through whenever a queue
//! fills up. The last two are reserved for epoch commands which skip the locking and pointer
//! polling of the ordinary path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use dbd_pci::PciError;

mod error;
pub mod queue;
#[cfg(test)]
mod sim;

pub use error::RelayError;
use queue::*;
pub use queue::{RemoteAddr, RoutingCmd};

pub const NON_EPOCH_RELAY_CORES: usize = 4;
pub const EPOCH_RELAY_CORES: usize = 2;
pub const RELAY_CORES: usize = NON_EPOCH_RELAY_CORES + EPOCH_RELAY_CORES;

/// NOC location of an ethernet core on the MMIO chip.
pub type EthCore = (u8, u8);

/// Access to the L1 of the relay cores and to host memory of the MMIO chip they live on.
pub trait EthCoreIo {
    fn read_core(&mut self, core: EthCore, addr: u64, data: &mut [u8]) -> Result<(), PciError>;
    fn write_core(&mut self, core: EthCore, addr: u64, data: &[u8]) -> Result<(), PciError>;

    fn sysmem_write(&mut self, channel: usize, addr: u64, data: &[u8]) -> Result<(), PciError>;
    fn sysmem_read(&mut self, channel: usize, addr: u64, data: &mut [u8]) -> Result<(), PciError>;

    /// Order all previous stores before any that follow.
    fn fence(&mut self) {
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    fn read_core32(&mut self, core: EthCore, addr: u64) -> Result<u32, PciError> {
        let mut value = [0u8; 4];
        self.read_core(core, addr, &mut value)?;
        Ok(u32::from_le_bytes(value))
    }

    fn write_core32(&mut self, core: EthCore, addr: u64, value: u32) -> Result<(), PciError> {
        self.write_core(core, addr, &value.to_le_bytes())
    }
}

#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    /// How long any single poll of the firmware may spin before giving up. Unbounded when
    /// unset, the firmware is trusted to make progress.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Copy, Debug)]
struct QueuePtrs {
    wptr: u32,
    rptr: u32,
}

impl QueuePtrs {
    fn is_full(&self) -> bool {
        is_full(self.wptr, self.rptr)
    }

    fn advance(&mut self) {
        self.wptr = (self.wptr + 1) & CMD_BUF_PTR_MASK;
    }
}

struct EpochState {
    active_core: usize,
    ptrs: Option<QueuePtrs>,
}

pub struct RelayEngine {
    cores: Vec<EthCore>,
    config: RelayConfig,
    // Index of the ordinary relay core currently written to. Holding the lock is the in-process
    // half of the NON_MMIO mutex.
    active_core: Mutex<usize>,
    epoch: Mutex<EpochState>,
    flush_pending: AtomicBool,
}

fn read_ptrs<E: EthCoreIo + ?Sized>(io: &mut E, core: EthCore) -> Result<QueuePtrs, PciError> {
    let mut raw = [0u8; 2 * REMOTE_UPDATE_PTR_SIZE_BYTES as usize];
    io.read_core(core, REQUEST_WPTR_ADDR, &mut raw)?;

    let word = |index: usize| {
        let at = index * 4;
        u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
    };

    Ok(QueuePtrs {
        wptr: word(0),
        rptr: word(4),
    })
}

fn check_words(len: usize) -> Result<(), RelayError> {
    if len % 4 != 0 {
        Err(RelayError::PartialWord { len })
    } else {
        Ok(())
    }
}

fn check_response(flags: u32, expected: u32) -> Result<(), RelayError> {
    if flags & CMD_DEST_UNREACHABLE != 0 {
        Err(RelayError::DestinationUnreachable)
    } else if flags & CMD_DATA_BLOCK_UNAVAILABLE != 0 {
        Err(RelayError::DataBlockUnavailable)
    } else if flags != expected {
        Err(RelayError::UnexpectedResponse { flags, expected })
    } else {
        Ok(())
    }
}

impl RelayEngine {
    /// `cores` are the ethernet cores of the MMIO chip in relay order, at least [`RELAY_CORES`].
    pub fn new(cores: &[EthCore], config: RelayConfig) -> Result<Self, RelayError> {
        if cores.len() < RELAY_CORES {
            return Err(RelayError::NotEnoughRelayCores {
                needed: RELAY_CORES,
                found: cores.len(),
            });
        }

        Ok(Self {
            cores: cores[..RELAY_CORES].to_vec(),
            config,
            active_core: Mutex::new(0),
            epoch: Mutex::new(EpochState {
                active_core: NON_EPOCH_RELAY_CORES,
                ptrs: None,
            }),
            flush_pending: AtomicBool::new(false),
        })
    }

    pub fn cores(&self) -> &[EthCore] {
        &self.cores
    }

    fn lock_active_core(&self) -> MutexGuard<'_, usize> {
        self.active_core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn poll<T>(
        &self,
        what: &'static str,
        mut check: impl FnMut() -> Result<Option<T>, RelayError>,
    ) -> Result<T, RelayError> {
        let start = Instant::now();
        loop {
            if let Some(value) = check()? {
                return Ok(value);
            }

            if let Some(timeout) = self.config.timeout {
                if start.elapsed() > timeout {
                    return Err(RelayError::Timeout(what));
                }
            }
        }
    }

    /// Spin on the read pointer until the firmware has consumed at least one command.
    fn wait_for_space<E: EthCoreIo + ?Sized>(
        &self,
        io: &mut E,
        core: EthCore,
        wptr: u32,
    ) -> Result<u32, RelayError> {
        self.poll("a free command slot", || {
            let rptr = io.read_core32(core, REQUEST_RPTR_ADDR)?;
            Ok((!is_full(wptr, rptr)).then_some(rptr))
        })
    }

    fn post_command<E: EthCoreIo + ?Sized>(
        io: &mut E,
        core: EthCore,
        slot: u32,
        cmd: &RoutingCmd,
    ) -> Result<(), PciError> {
        io.write_core(core, request_slot_addr(slot), &cmd.to_bytes())?;
        io.fence();
        Ok(())
    }

    fn publish_wptr<E: EthCoreIo + ?Sized>(
        io: &mut E,
        core: EthCore,
        wptr: u32,
    ) -> Result<(), PciError> {
        io.write_core32(core, REQUEST_WPTR_ADDR, wptr)?;
        io.fence();
        Ok(())
    }

    /// Switch to the next ordinary relay core and pick up its queue state.
    fn rotate<E: EthCoreIo + ?Sized>(
        &self,
        io: &mut E,
        active_core: &mut usize,
    ) -> Result<(EthCore, QueuePtrs), PciError> {
        *active_core = (*active_core + 1) % NON_EPOCH_RELAY_CORES;
        let core = self.cores[*active_core];
        tracing::trace!("relay queue full, moving to ethernet core {core:?}");

        Ok((core, read_ptrs(io, core)?))
    }

    pub fn write<E: EthCoreIo + ?Sized>(
        &self,
        io: &mut E,
        dest: RemoteAddr,
        data: &[u8],
    ) -> Result<(), RelayError> {
        check_words(data.len())?;

        let use_dram = data.len() > MAX_BLOCK_SIZE;
        let max_block = if use_dram {
            ETH_ROUTING_BLOCK_SIZE
        } else {
            MAX_BLOCK_SIZE
        };

        let mut active_core = self.lock_active_core();
        let mut core = self.cores[*active_core];
        let mut ptrs = read_ptrs(io, core)?;
        let mut full = ptrs.is_full();

        let mut offset = 0;
        while offset < data.len() {
            if full {
                ptrs.rptr = self.wait_for_space(io, core, ptrs.wptr)?;
                full = false;
            }

            let target = dest.add(offset as u64);
            let block_size = if target.offset & 0x1f != 0 {
                4
            } else {
                max_block.min(data.len() - offset)
            };
            let block = &data[offset..offset + block_size];

            let slot = ptrs.wptr & CMD_BUF_SIZE_MASK;
            let host_dram_block_addr = ETH_ROUTING_BUFFERS_START
                + ((*active_core as u64) * CMD_BUF_SIZE as u64 + slot as u64)
                    * max_block as u64;

            let mut cmd = RoutingCmd {
                sys_addr: target.sys_addr(),
                rack: target.rack(),
                ..Default::default()
            };
            if block_size > 4 {
                cmd.flags = CMD_DATA_BLOCK | CMD_WR_REQ;
                cmd.data = block_size as u32;
                if use_dram {
                    cmd.flags |= CMD_DATA_BLOCK_DRAM;
                    io.sysmem_write(HOST_DRAM_CHANNEL, host_dram_block_addr, block)?;
                } else {
                    let buf_address =
                        ETH_ROUTING_DATA_BUFFER_ADDR + slot as u64 * max_block as u64;
                    io.write_core(core, buf_address, block)?;
                }
                io.fence();
            } else {
                cmd.flags = CMD_WR_REQ;
                cmd.data = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
            }
            if use_dram {
                cmd.src_addr_tag = host_dram_block_addr as u32;
            }

            Self::post_command(io, core, slot, &cmd)?;
            ptrs.advance();
            Self::publish_wptr(io, core, ptrs.wptr)?;
            offset += block_size;

            if ptrs.is_full() {
                (core, ptrs) = self.rotate(io, &mut active_core)?;
                full = ptrs.is_full();
            }
        }

        self.flush_pending.store(true, Ordering::Release);

        Ok(())
    }

    /// Write one block through the epoch cores.
    ///
    /// Queue pointers are cached between calls and the write pointer is only published when
    /// `last` is set or the queue fills up. Only one caller may be in here at a time, a second
    /// concurrent caller gets [`RelayError::EpochConcurrentUse`].
    pub fn write_epoch<E: EthCoreIo + ?Sized>(
        &self,
        io: &mut E,
        dest: RemoteAddr,
        data: &[u8],
        last: bool,
    ) -> Result<(), RelayError> {
        let mut epoch = match self.epoch.try_lock() {
            Ok(epoch) => epoch,
            Err(TryLockError::WouldBlock) => return Err(RelayError::EpochConcurrentUse),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        check_words(data.len())?;
        let fits = if dest.offset & 0x1f != 0 {
            data.len() == 4
        } else {
            !data.is_empty() && data.len() <= MAX_BLOCK_SIZE
        };
        if !fits {
            return Err(RelayError::EpochTooLarge {
                addr: dest.offset,
                size: data.len(),
            });
        }

        let mut core = self.cores[epoch.active_core];
        let mut ptrs = match epoch.ptrs {
            Some(ptrs) => ptrs,
            None => read_ptrs(io, core)?,
        };
        if ptrs.is_full() {
            let epoch = &mut *epoch;
            (core, ptrs) = self.poll("a free epoch command slot", || {
                epoch.active_core = NON_EPOCH_RELAY_CORES
                    + (epoch.active_core + 1 - NON_EPOCH_RELAY_CORES) % EPOCH_RELAY_CORES;
                let core = self.cores[epoch.active_core];
                let ptrs = read_ptrs(io, core)?;
                Ok((!ptrs.is_full()).then_some((core, ptrs)))
            })?;
        }

        let slot = ptrs.wptr & CMD_BUF_SIZE_MASK;
        let mut cmd = RoutingCmd {
            sys_addr: dest.sys_addr(),
            rack: dest.rack(),
            ..Default::default()
        };
        if data.len() > 4 {
            let buf_address = ETH_ROUTING_DATA_BUFFER_ADDR + slot as u64 * MAX_BLOCK_SIZE as u64;
            io.write_core(core, buf_address, data)?;
            io.fence();

            cmd.flags = CMD_DATA_BLOCK | CMD_WR_REQ;
            cmd.data = data.len() as u32;
        } else {
            cmd.flags = CMD_WR_REQ;
            cmd.data = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        }

        Self::post_command(io, core, slot, &cmd)?;
        ptrs.advance();
        if last || ptrs.is_full() {
            Self::publish_wptr(io, core, ptrs.wptr)?;
        }
        epoch.ptrs = Some(ptrs);

        self.flush_pending.store(true, Ordering::Release);

        Ok(())
    }

    /// Replicate `block` `unroll_count` times at consecutive addresses starting at `dest`.
    ///
    /// The first word of every copy is overwritten with the copy's index. Copies are packed into
    /// host memory so that one command carries as many as fit in a routing buffer.
    pub fn rolled_write<E: EthCoreIo + ?Sized>(
        &self,
        io: &mut E,
        dest: RemoteAddr,
        block: &[u8],
        unroll_count: u32,
    ) -> Result<(), RelayError> {
        check_words(block.len())?;
        if block.is_empty() || unroll_count == 0 {
            return Ok(());
        }
        if block.len() > ETH_ROUTING_BLOCK_SIZE {
            return Err(RelayError::RolledBlockTooLarge {
                size: block.len(),
                max: ETH_ROUTING_BLOCK_SIZE,
            });
        }

        let total = block.len() * unroll_count as usize;
        let mut copy = block.to_vec();

        let mut active_core = self.lock_active_core();
        let mut core = self.cores[*active_core];
        let mut ptrs = read_ptrs(io, core)?;
        let mut full = ptrs.is_full();

        let mut unrolled = 0u32;
        let mut offset = 0;
        while offset < total {
            if full {
                ptrs.rptr = self.wait_for_space(io, core, ptrs.wptr)?;
                full = false;
            }

            let target = dest.add(offset as u64);
            if target.offset & 0x1f != 0 {
                return Err(RelayError::Unaligned {
                    addr: target.offset,
                });
            }

            let slot = ptrs.wptr & CMD_BUF_SIZE_MASK;
            let host_dram_block_addr = ETH_ROUTING_BUFFERS_START
                + ((*active_core as u64) * CMD_BUF_SIZE as u64 + slot as u64)
                    * ETH_ROUTING_BLOCK_SIZE as u64;

            let mut host_mem_offset = 0;
            while unrolled < unroll_count && host_mem_offset + copy.len() <= ETH_ROUTING_BLOCK_SIZE
            {
                copy[..4].copy_from_slice(&unrolled.to_le_bytes());
                io.sysmem_write(
                    HOST_DRAM_CHANNEL,
                    host_dram_block_addr + host_mem_offset as u64,
                    &copy,
                )?;
                host_mem_offset += copy.len();
                unrolled += 1;
            }
            io.fence();

            let cmd = RoutingCmd {
                sys_addr: target.sys_addr(),
                rack: target.rack(),
                data: host_mem_offset as u32,
                flags: CMD_DATA_BLOCK_DRAM | CMD_DATA_BLOCK | CMD_WR_REQ,
                src_addr_tag: host_dram_block_addr as u32,
                ..Default::default()
            };
            Self::post_command(io, core, slot, &cmd)?;
            ptrs.advance();
            Self::publish_wptr(io, core, ptrs.wptr)?;
            offset += host_mem_offset;

            if ptrs.is_full() {
                (core, ptrs) = self.rotate(io, &mut active_core)?;
                full = ptrs.is_full();
            }
        }

        self.flush_pending.store(true, Ordering::Release);

        Ok(())
    }

    pub fn read<E: EthCoreIo + ?Sized>(
        &self,
        io: &mut E,
        src: RemoteAddr,
        data: &mut [u8],
    ) -> Result<(), RelayError> {
        check_words(data.len())?;

        let use_dram = data.len() > MAX_BLOCK_SIZE;
        let max_block = if use_dram {
            ETH_ROUTING_BLOCK_SIZE
        } else {
            MAX_BLOCK_SIZE
        };

        // Reads always go through the first relay core so responses come back in order.
        let _active_core = self.lock_active_core();
        let core = self.cores[0];
        let mut ptrs = read_ptrs(io, core)?;
        let mut resp_rptr = io.read_core32(core, RESPONSE_RPTR_ADDR)?;
        let mut full = ptrs.is_full();

        let mut offset = 0;
        while offset < data.len() {
            if full {
                ptrs.rptr = self.wait_for_space(io, core, ptrs.wptr)?;
                full = false;
            }

            let target = src.add(offset as u64);
            let block_size = if target.offset & 0x1f != 0 {
                4
            } else {
                max_block.min(data.len() - offset)
            };

            let (mut req_flags, mut resp_flags) = if block_size > 4 {
                (CMD_DATA_BLOCK | CMD_RD_REQ, CMD_DATA_BLOCK | CMD_RD_DATA)
            } else {
                (CMD_RD_REQ, CMD_RD_DATA)
            };
            if use_dram {
                req_flags |= CMD_DATA_BLOCK_DRAM;
                resp_flags |= CMD_DATA_BLOCK_DRAM;
            }

            let resp_slot = resp_rptr & CMD_BUF_SIZE_MASK;
            let host_dram_block_addr =
                ETH_ROUTING_BUFFERS_START + resp_slot as u64 * max_block as u64;

            let cmd = RoutingCmd {
                sys_addr: target.sys_addr(),
                rack: target.rack(),
                data: block_size as u32,
                flags: req_flags,
                src_addr_tag: if use_dram {
                    host_dram_block_addr as u32
                } else {
                    0
                },
                ..Default::default()
            };

            let slot = ptrs.wptr & CMD_BUF_SIZE_MASK;
            Self::post_command(io, core, slot, &cmd)?;
            ptrs.advance();
            Self::publish_wptr(io, core, ptrs.wptr)?;

            if ptrs.is_full() {
                ptrs = read_ptrs(io, core)?;
                full = ptrs.is_full();
            }

            // The firmware bumps the response write pointer before the data is in place and sets
            // the flags last.
            self.poll("a read response", || {
                let resp_wptr = io.read_core32(core, RESPONSE_WPTR_ADDR)?;
                Ok((resp_wptr != resp_rptr).then_some(()))
            })?;
            let flags = self.poll("read response flags", || {
                let flags = io.read_core32(core, response_flags_addr(resp_slot))?;
                Ok((flags != 0).then_some(flags))
            })?;

            let block = &mut data[offset..offset + block_size];
            let result = check_response(flags, resp_flags).and_then(|()| {
                if block_size == 4 {
                    io.read_core(core, response_data_addr(resp_slot), block)?;
                } else if use_dram {
                    io.sysmem_read(HOST_DRAM_CHANNEL, host_dram_block_addr, block)?;
                } else {
                    let buf_address =
                        ETH_ROUTING_DATA_BUFFER_ADDR + resp_slot as u64 * max_block as u64;
                    io.read_core(core, buf_address, block)?;
                }
                Ok(())
            });

            // Hand the response slot back even when it carried an error.
            resp_rptr = (resp_rptr + 1) & CMD_BUF_PTR_MASK;
            io.write_core32(core, RESPONSE_RPTR_ADDR, resp_rptr)?;
            io.fence();

            if let Err(err) = result {
                tracing::error!("relay read of {:#x} failed: {err}", target.offset);
                return Err(err);
            }

            offset += block_size;
        }

        Ok(())
    }

    /// True when every relay queue is drained and every posted write was acknowledged.
    pub fn is_idle<E: EthCoreIo + ?Sized>(&self, io: &mut E) -> Result<bool, RelayError> {
        for &core in &self.cores {
            let ptrs = read_ptrs(io, core)?;
            if ptrs.wptr != ptrs.rptr {
                return Ok(false);
            }
        }
        for &core in &self.cores {
            if !Self::writes_acked(io, core)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn writes_acked<E: EthCoreIo + ?Sized>(io: &mut E, core: EthCore) -> Result<bool, PciError> {
        let issued = io.read_core32(core, REQUEST_CMD_QUEUE_BASE)?;
        let completed = io.read_core32(core, REQUEST_CMD_QUEUE_BASE + 4)?;
        Ok(issued == completed)
    }

    /// Block until every write posted since the last flush has landed.
    pub fn flush<E: EthCoreIo + ?Sized>(&self, io: &mut E) -> Result<(), RelayError> {
        if !self.flush_pending.load(Ordering::Acquire) {
            return Ok(());
        }

        for &core in &self.cores {
            self.poll("the relay queues to drain", || {
                let ptrs = read_ptrs(io, core)?;
                Ok((ptrs.wptr == ptrs.rptr).then_some(()))
            })?;
        }
        for &core in &self.cores {
            self.poll("write acknowledgements", || {
                Ok(Self::writes_acked(io, core)?.then_some(()))
            })?;
        }

        self.flush_pending.store(false, Ordering::Release);

        Ok(())
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_pending.load(Ordering::Acquire)
    }
}
