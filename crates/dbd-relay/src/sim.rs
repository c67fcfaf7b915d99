// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! A stand-in for the ethernet firmware that serves the relay queues.
//!
//! Commands are executed as soon as the host publishes a write pointer, unless the core has been
//! stalled in which case they pile up until it is released.

use std::collections::{HashMap, HashSet};

use dbd_pci::PciError;

use crate::queue::*;
use crate::{EthCore, EthCoreIo};

#[derive(Default)]
pub struct SimFirmware {
    l1: HashMap<(EthCore, u64), u8>,
    sysmem: HashMap<u64, u8>,
    remote: HashMap<(u16, u64), u8>,
    stalled: HashSet<EthCore>,
    posted: Vec<(EthCore, RoutingCmd)>,
    read_failure: u32,
}

fn peek(map: &HashMap<u64, u8>, addr: u64, len: usize) -> Vec<u8> {
    (0..len as u64)
        .map(|i| map.get(&(addr + i)).copied().unwrap_or(0))
        .collect()
}

impl SimFirmware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stall(&mut self, core: EthCore) {
        self.stalled.insert(core);
    }

    pub fn release(&mut self, core: EthCore) {
        self.stalled.remove(&core);
        self.process(core);
    }

    /// Answer every following read request with `flags`, 0 restores normal service.
    pub fn fail_reads_with(&mut self, flags: u32) {
        self.read_failure = flags;
    }

    pub fn take_posted(&mut self) -> Vec<(EthCore, RoutingCmd)> {
        std::mem::take(&mut self.posted)
    }

    pub fn remote_peek(&self, addr: &RemoteAddr, len: usize) -> Vec<u8> {
        let sys_addr = addr.sys_addr();
        (0..len as u64)
            .map(|i| {
                self.remote
                    .get(&(addr.rack(), sys_addr + i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    fn l1_read(&self, core: EthCore, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| self.l1.get(&(core, addr + i)).copied().unwrap_or(0))
            .collect()
    }

    fn l1_write(&mut self, core: EthCore, addr: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.l1.insert((core, addr + i as u64), *byte);
        }
    }

    pub fn core_peek32(&self, core: EthCore, addr: u64) -> u32 {
        let raw = self.l1_read(core, addr, 4);
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    fn core_poke32(&mut self, core: EthCore, addr: u64, value: u32) {
        self.l1_write(core, addr, &value.to_le_bytes());
    }

    fn bump(&mut self, core: EthCore, addr: u64) {
        let value = self.core_peek32(core, addr);
        self.core_poke32(core, addr, value.wrapping_add(1));
    }

    fn process(&mut self, core: EthCore) {
        loop {
            let wptr = self.core_peek32(core, REQUEST_WPTR_ADDR);
            let rptr = self.core_peek32(core, REQUEST_RPTR_ADDR);
            if wptr == rptr {
                break;
            }

            let slot = rptr & CMD_BUF_SIZE_MASK;
            let mut raw = [0u8; ROUTING_CMD_SIZE_BYTES as usize];
            let raw_len = raw.len();
            raw.copy_from_slice(&self.l1_read(core, request_slot_addr(slot), raw_len));
            let cmd = RoutingCmd::from_bytes(&raw);
            self.bump(core, REQUEST_CMD_QUEUE_BASE);

            if cmd.flags & CMD_WR_REQ != 0 {
                let payload = if cmd.flags & CMD_DATA_BLOCK == 0 {
                    cmd.data.to_le_bytes().to_vec()
                } else if cmd.flags & CMD_DATA_BLOCK_DRAM != 0 {
                    peek(&self.sysmem, cmd.src_addr_tag as u64, cmd.data as usize)
                } else {
                    let buf = ETH_ROUTING_DATA_BUFFER_ADDR + slot as u64 * MAX_BLOCK_SIZE as u64;
                    self.l1_read(core, buf, cmd.data as usize)
                };
                for (i, byte) in payload.iter().enumerate() {
                    self.remote.insert((cmd.rack, cmd.sys_addr + i as u64), *byte);
                }
            } else if cmd.flags & CMD_RD_REQ != 0 {
                let resp_wptr = self.core_peek32(core, RESPONSE_WPTR_ADDR);
                let resp_slot = resp_wptr & CMD_BUF_SIZE_MASK;

                let len = if cmd.flags & CMD_DATA_BLOCK != 0 {
                    cmd.data as usize
                } else {
                    4
                };
                let payload = (0..len as u64)
                    .map(|i| {
                        self.remote
                            .get(&(cmd.rack, cmd.sys_addr + i))
                            .copied()
                            .unwrap_or(0)
                    })
                    .collect::<Vec<_>>();

                let mut resp = RoutingCmd {
                    flags: CMD_RD_DATA | (cmd.flags & (CMD_DATA_BLOCK | CMD_DATA_BLOCK_DRAM)),
                    ..cmd
                };
                if self.read_failure != 0 {
                    resp.flags = self.read_failure;
                } else if cmd.flags & CMD_DATA_BLOCK == 0 {
                    resp.data = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                } else if cmd.flags & CMD_DATA_BLOCK_DRAM != 0 {
                    for (i, byte) in payload.iter().enumerate() {
                        self.sysmem.insert(cmd.src_addr_tag as u64 + i as u64, *byte);
                    }
                } else {
                    let buf =
                        ETH_ROUTING_DATA_BUFFER_ADDR + resp_slot as u64 * MAX_BLOCK_SIZE as u64;
                    self.l1_write(core, buf, &payload);
                }

                self.l1_write(core, response_slot_addr(resp_slot), &resp.to_bytes());
                self.core_poke32(core, RESPONSE_WPTR_ADDR, (resp_wptr + 1) & CMD_BUF_PTR_MASK);
            }

            self.bump(core, REQUEST_CMD_QUEUE_BASE + 4);
            self.core_poke32(core, REQUEST_RPTR_ADDR, (rptr + 1) & CMD_BUF_PTR_MASK);
        }
    }
}

impl EthCoreIo for SimFirmware {
    fn read_core(&mut self, core: EthCore, addr: u64, data: &mut [u8]) -> Result<(), PciError> {
        data.copy_from_slice(&self.l1_read(core, addr, data.len()));
        Ok(())
    }

    fn write_core(&mut self, core: EthCore, addr: u64, data: &[u8]) -> Result<(), PciError> {
        self.l1_write(core, addr, data);

        let slots = request_slot_addr(0)..request_slot_addr(CMD_BUF_SIZE);
        if slots.contains(&addr) && data.len() == ROUTING_CMD_SIZE_BYTES as usize {
            let mut raw = [0u8; ROUTING_CMD_SIZE_BYTES as usize];
            raw.copy_from_slice(data);
            self.posted.push((core, RoutingCmd::from_bytes(&raw)));
        }

        if addr == REQUEST_WPTR_ADDR && !self.stalled.contains(&core) {
            self.process(core);
        }

        Ok(())
    }

    fn sysmem_write(&mut self, _channel: usize, addr: u64, data: &[u8]) -> Result<(), PciError> {
        for (i, byte) in data.iter().enumerate() {
            self.sysmem.insert(addr + i as u64, *byte);
        }
        Ok(())
    }

    fn sysmem_read(&mut self, _channel: usize, addr: u64, data: &mut [u8]) -> Result<(), PciError> {
        data.copy_from_slice(&peek(&self.sysmem, addr, data.len()));
        Ok(())
    }
}
