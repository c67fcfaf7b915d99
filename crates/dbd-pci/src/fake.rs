// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! An in-memory stand-in for an MMIO device.
//!
//! Accesses to the TLB window region are routed through whatever the window's config register
//! currently holds, so data written through one window can be read back through another. Every
//! BAR access is recorded so tests can assert on exactly what reached the device.

use std::collections::HashMap;

use dbd_core::Arch;

use crate::tlb::{self, TLB_BASE_16M, TLB_BASE_2M, TLB_COUNT_16M, TLB_SIZE_16M};
use crate::{BarIo, PciError};

const PAGE_SIZE: u64 = 4096;
const WINDOW_END: u64 = TLB_BASE_16M + TLB_COUNT_16M as u64 * TLB_SIZE_16M;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarEvent {
    TlbConfig { addr: u32, value: u64 },
    Write32 { addr: u32, value: u32 },
    Read32 { addr: u32 },
    BlockWrite { addr: u32, len: usize },
    BlockRead { addr: u32, len: usize },
}

/// Where a byte lives: the BAR register space or a core's NOC address space.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum Space {
    Bar,
    Noc(u8, u8),
}

#[derive(Default)]
struct SparseMemory {
    pages: HashMap<(Space, u64), Box<[u8]>>,
}

impl SparseMemory {
    fn write(&mut self, space: Space, addr: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let addr = addr + i as u64;
            let page = self
                .pages
                .entry((space, addr / PAGE_SIZE))
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page[(addr % PAGE_SIZE) as usize] = *byte;
        }
    }

    fn read(&self, space: Space, addr: u64, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            let addr = addr + i as u64;
            *byte = self
                .pages
                .get(&(space, addr / PAGE_SIZE))
                .map(|page| page[(addr % PAGE_SIZE) as usize])
                .unwrap_or(0);
        }
    }
}

/// Called after every `write32` with the address and value. Returns register writes to apply in
/// response, which is enough to play firmware that answers mailboxes.
pub type WriteHook = Box<dyn FnMut(u32, u32) -> Vec<(u32, u32)> + Send>;

pub struct FakeBar {
    id: usize,
    arch: Arch,
    memory: SparseMemory,
    sysmem: Vec<Vec<u8>>,
    events: Vec<BarEvent>,
    write_hook: Option<WriteHook>,
}

impl FakeBar {
    pub fn new(arch: Arch, id: usize) -> Self {
        Self {
            id,
            arch,
            memory: SparseMemory::default(),
            sysmem: vec![],
            events: vec![],
            write_hook: None,
        }
    }

    pub fn with_sysmem(mut self, channels: usize, size: usize) -> Self {
        self.sysmem = vec![vec![0u8; size]; channels];
        self
    }

    pub fn on_write32(&mut self, hook: impl FnMut(u32, u32) -> Vec<(u32, u32)> + Send + 'static) {
        self.write_hook = Some(Box::new(hook));
    }

    pub fn events(&self) -> &[BarEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<BarEvent> {
        std::mem::take(&mut self.events)
    }

    /// Read a core's memory without going through a window.
    pub fn noc_peek(&self, x: u8, y: u8, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        self.memory.read(Space::Noc(x, y), addr, &mut data);
        data
    }

    pub fn noc_poke(&mut self, x: u8, y: u8, addr: u64, data: &[u8]) {
        self.memory.write(Space::Noc(x, y), addr, data);
    }

    pub fn reg_peek(&self, addr: u32) -> u32 {
        let mut data = [0u8; 4];
        self.memory.read(Space::Bar, addr as u64, &mut data);
        u32::from_le_bytes(data)
    }

    pub fn reg_poke(&mut self, addr: u32, value: u32) {
        self.memory
            .write(Space::Bar, addr as u64, &value.to_le_bytes());
    }

    fn window_index(addr: u64) -> u32 {
        if addr < TLB_BASE_2M {
            (addr >> 20) as u32
        } else if addr < TLB_BASE_16M {
            tlb::TLB_BASE_INDEX_2M + ((addr - TLB_BASE_2M) >> 21) as u32
        } else {
            tlb::TLB_BASE_INDEX_16M + ((addr - TLB_BASE_16M) >> 24) as u32
        }
    }

    /// Resolve a BAR address to every location it currently reaches.
    fn targets(&self, addr: u32) -> Result<Vec<(Space, u64)>, PciError> {
        let addr = addr as u64;
        if addr >= WINDOW_END {
            return Ok(vec![(Space::Bar, addr)]);
        }

        let window = tlb::window(Self::window_index(addr))?;
        let mut config = [0u8; 8];
        self.memory
            .read(Space::Bar, window.config_addr as u64, &mut config);
        let tlb = tlb::decode(self.arch, &window, u64::from_le_bytes(config));

        let noc_addr = tlb.local_offset * window.size + (addr - window.bar_base);
        if tlb.mcast {
            let mut targets = vec![];
            for x in tlb.x_start..=tlb.x_end {
                for y in tlb.y_start..=tlb.y_end {
                    targets.push((Space::Noc(x, y), noc_addr));
                }
            }
            Ok(targets)
        } else {
            Ok(vec![(Space::Noc(tlb.x_end, tlb.y_end), noc_addr)])
        }
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), PciError> {
        for (space, addr) in self.targets(addr)? {
            self.memory.write(space, addr, data);
        }
        Ok(())
    }

    fn read_bytes(&mut self, addr: u32, data: &mut [u8]) -> Result<(), PciError> {
        if let Some((space, addr)) = self.targets(addr)?.first() {
            self.memory.read(*space, *addr, data);
        }
        Ok(())
    }

    fn sysmem_channel(&mut self, channel: usize, addr: u64, len: usize) -> Result<&mut [u8], PciError> {
        let id = self.id;
        let buffer = self
            .sysmem
            .get_mut(channel)
            .ok_or(PciError::NoSysmem { id, channel })?;

        let start = addr as usize;
        if start + len > buffer.len() {
            return Err(PciError::SysmemOutOfRange {
                channel,
                addr,
                size: len,
                channel_size: buffer.len() as u64,
            });
        }

        Ok(&mut buffer[start..start + len])
    }
}

impl BarIo for FakeBar {
    fn id(&self) -> usize {
        self.id
    }

    fn arch(&self) -> Arch {
        self.arch
    }

    fn read32(&mut self, addr: u32) -> Result<u32, PciError> {
        self.events.push(BarEvent::Read32 { addr });

        let mut data = [0u8; 4];
        self.read_bytes(addr, &mut data)?;
        Ok(u32::from_le_bytes(data))
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<(), PciError> {
        self.events.push(BarEvent::Write32 { addr, value });
        self.write_bytes(addr, &value.to_le_bytes())?;

        if let Some(hook) = self.write_hook.as_mut() {
            for (addr, value) in hook(addr, value) {
                self.write_bytes(addr, &value.to_le_bytes())?;
            }
        }

        Ok(())
    }

    fn write_tlb_reg(&mut self, addr: u32, value: u64) -> Result<(), PciError> {
        self.events.push(BarEvent::TlbConfig { addr, value });
        self.memory
            .write(Space::Bar, addr as u64, &value.to_le_bytes());
        Ok(())
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), PciError> {
        self.events.push(BarEvent::BlockWrite {
            addr,
            len: data.len(),
        });
        self.write_bytes(addr, data)
    }

    fn read_block(&mut self, addr: u32, data: &mut [u8]) -> Result<(), PciError> {
        self.events.push(BarEvent::BlockRead {
            addr,
            len: data.len(),
        });
        self.read_bytes(addr, data)
    }

    fn sysmem_write(&mut self, channel: usize, addr: u64, data: &[u8]) -> Result<(), PciError> {
        self.sysmem_channel(channel, addr, data.len())?
            .copy_from_slice(data);
        Ok(())
    }

    fn sysmem_read(&mut self, channel: usize, addr: u64, data: &mut [u8]) -> Result<(), PciError> {
        data.copy_from_slice(self.sysmem_channel(channel, addr, data.len())?);
        Ok(())
    }
}
