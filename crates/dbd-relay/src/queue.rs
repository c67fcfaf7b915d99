// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Layout of the command queues the ethernet firmware exposes in its L1.
//!
//! Each queue is a block of transaction counters, a write/read pointer pair and four 32 byte
//! command slots. Pointers run modulo 8 while slots are indexed modulo 4 so a full queue can be
//! told apart from an empty one.

use dbd_core::EthCoord;

pub const CMD_BUF_SIZE: u32 = 4;
pub const CMD_BUF_SIZE_MASK: u32 = 0x3;
pub const CMD_BUF_PTR_MASK: u32 = 0x7;

pub const CMD_WR_REQ: u32 = 0x1;
pub const CMD_WR_ACK: u32 = 0x2;
pub const CMD_RD_REQ: u32 = 0x4;
pub const CMD_RD_DATA: u32 = 0x8;
pub const CMD_DATA_BLOCK_DRAM: u32 = 0x1 << 4;
pub const CMD_DATA_BLOCK: u32 = 0x1 << 6;
pub const CMD_DATA_BLOCK_UNAVAILABLE: u32 = 0x1 << 30;
pub const CMD_DEST_UNREACHABLE: u32 = 0x1 << 31;

pub const CMD_COUNTERS_SIZE_BYTES: u64 = 32;
pub const REMOTE_UPDATE_PTR_SIZE_BYTES: u64 = 16;
pub const ROUTING_CMD_SIZE_BYTES: u64 = 32;

pub const REQUEST_CMD_QUEUE_BASE: u64 = 0x11080;
pub const RESPONSE_CMD_QUEUE_BASE: u64 = REQUEST_CMD_QUEUE_BASE + 2 * 192;

pub const REQUEST_WPTR_ADDR: u64 = REQUEST_CMD_QUEUE_BASE + CMD_COUNTERS_SIZE_BYTES;
pub const REQUEST_RPTR_ADDR: u64 = REQUEST_WPTR_ADDR + REMOTE_UPDATE_PTR_SIZE_BYTES;
pub const RESPONSE_WPTR_ADDR: u64 = RESPONSE_CMD_QUEUE_BASE + CMD_COUNTERS_SIZE_BYTES;
pub const RESPONSE_RPTR_ADDR: u64 = RESPONSE_WPTR_ADDR + REMOTE_UPDATE_PTR_SIZE_BYTES;

pub const REQUEST_ROUTING_CMD_QUEUE_BASE: u64 =
    REQUEST_WPTR_ADDR + 2 * REMOTE_UPDATE_PTR_SIZE_BYTES;
pub const RESPONSE_ROUTING_CMD_QUEUE_BASE: u64 =
    RESPONSE_WPTR_ADDR + 2 * REMOTE_UPDATE_PTR_SIZE_BYTES;

const DATA_OFFSET: u64 = 8;
const FLAGS_OFFSET: u64 = 12;

/// Largest payload staged in the ethernet core's own buffer.
pub const MAX_BLOCK_SIZE: usize = 1024;
pub const ETH_ROUTING_DATA_BUFFER_ADDR: u64 = 0x12000;

/// Larger payloads are staged in host memory channel 0.
pub const ETH_ROUTING_BLOCK_SIZE: usize = 32 * 1024;
pub const ETH_ROUTING_BUFFERS_START: u64 = 0x3800_0000;
pub const HOST_DRAM_CHANNEL: usize = 0;

pub fn is_full(wptr: u32, rptr: u32) -> bool {
    (wptr != rptr) && ((wptr & CMD_BUF_SIZE_MASK) == (rptr & CMD_BUF_SIZE_MASK))
}

pub fn request_slot_addr(slot: u32) -> u64 {
    REQUEST_ROUTING_CMD_QUEUE_BASE + ROUTING_CMD_SIZE_BYTES * slot as u64
}

pub fn response_slot_addr(slot: u32) -> u64 {
    RESPONSE_ROUTING_CMD_QUEUE_BASE + ROUTING_CMD_SIZE_BYTES * slot as u64
}

pub fn response_flags_addr(slot: u32) -> u64 {
    response_slot_addr(slot) + FLAGS_OFFSET
}

pub fn response_data_addr(slot: u32) -> u64 {
    response_slot_addr(slot) + DATA_OFFSET
}

/// A NOC address on a chip identified by its place in the ethernet mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteAddr {
    pub chip: EthCoord,
    pub noc_x: u8,
    pub noc_y: u8,
    pub offset: u64,
}

impl RemoteAddr {
    /// Width of the offset field in a system address.
    pub const OFFSET_BITS: u32 = 36;

    pub fn new(chip: EthCoord, noc_x: u8, noc_y: u8, offset: u64) -> Self {
        Self {
            chip,
            noc_x,
            noc_y,
            offset,
        }
    }

    pub fn sys_addr(&self) -> u64 {
        let mut addr = self.chip.y as u64;
        addr = (addr << 6) | (self.chip.x as u64);
        addr = (addr << 6) | (self.noc_y as u64);
        addr = (addr << 6) | (self.noc_x as u64);
        addr = (addr << 36) | self.offset;

        addr
    }

    pub fn rack(&self) -> u16 {
        ((self.chip.rack_y as u16) << 8) | (self.chip.rack_x as u16)
    }

    pub fn add(&self, delta: u64) -> Self {
        Self {
            offset: self.offset + delta,
            ..*self
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoutingCmd {
    pub sys_addr: u64,
    pub data: u32,
    pub flags: u32,
    pub rack: u16,
    pub src_resp_buf_index: u16,
    pub local_buf_index: u32,
    pub src_resp_q_id: u8,
    pub host_mem_txn_id: u8,
    pub src_addr_tag: u32,
}

impl RoutingCmd {
    pub fn to_bytes(&self) -> [u8; ROUTING_CMD_SIZE_BYTES as usize] {
        let mut out = [0u8; ROUTING_CMD_SIZE_BYTES as usize];
        out[0..8].copy_from_slice(&self.sys_addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.data.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out[16..18].copy_from_slice(&self.rack.to_le_bytes());
        out[18..20].copy_from_slice(&self.src_resp_buf_index.to_le_bytes());
        out[20..24].copy_from_slice(&self.local_buf_index.to_le_bytes());
        out[24] = self.src_resp_q_id;
        out[25] = self.host_mem_txn_id;
        // 26..28 is padding
        out[28..32].copy_from_slice(&self.src_addr_tag.to_le_bytes());

        out
    }

    pub fn from_bytes(raw: &[u8; ROUTING_CMD_SIZE_BYTES as usize]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let u32_at = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);

        Self {
            sys_addr: u32_at(0) as u64 | ((u32_at(4) as u64) << 32),
            data: u32_at(8),
            flags: u32_at(12),
            rack: u16_at(16),
            src_resp_buf_index: u16_at(18),
            local_buf_index: u32_at(20),
            src_resp_q_id: raw[24],
            host_mem_txn_id: raw[25],
            src_addr_tag: u32_at(28),
        }
    }
}
