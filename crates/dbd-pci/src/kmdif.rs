// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

pub const MAX_DMA_BYTES: u32 = 4 * 1024 * 1024;
pub const BAR0_WC_MAPPING_SIZE: u64 = (156 << 20) + (10 << 21) + (18 << 24);

pub const ARC_SCRATCH6_ADDR: u32 = 0x1ff30078;

pub const CSM_PCIE_CTRL_DMA_REQUEST_OFFSET: u32 = 0x1fef84c0;
pub const ARC_MISC_CNTL_ADDR: u32 = 0x1ff30100;

/// Value written to the completion flag by the ARC DMA handler.
pub const DMA_COMPLETION_VALUE: u32 = 0xfaca;

#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum MappingId {
    Unused = 0,
    Resource0Uc = 1,
    Resource0Wc = 2,
    Resource1Uc = 3,
    Resource1Wc = 4,
    Resource2Uc = 5,
    Resource2Wc = 6,
    Unknown(u32),
}

impl MappingId {
    pub fn from_u32(value: u32) -> MappingId {
        match value {
            0 => MappingId::Unused,
            1 => MappingId::Resource0Uc,
            2 => MappingId::Resource0Wc,
            3 => MappingId::Resource1Uc,
            4 => MappingId::Resource1Wc,
            5 => MappingId::Resource2Uc,
            6 => MappingId::Resource2Wc,
            v => MappingId::Unknown(v),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            MappingId::Unused => 0,
            MappingId::Resource0Uc => 1,
            MappingId::Resource0Wc => 2,
            MappingId::Resource1Uc => 3,
            MappingId::Resource1Wc => 4,
            MappingId::Resource2Uc => 5,
            MappingId::Resource2Wc => 6,
            MappingId::Unknown(v) => *v,
        }
    }
}

pub fn getpagesize() -> Option<i64> {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
}

#[bitfield_struct::bitfield(u32)]
pub struct DmaPack {
    #[bits(28)]
    pub size_bytes: u32,
    /// 0 = chip to host, 1 = host to chip
    pub write: bool,
    pub pcie_msi_on_done: bool,
    /// Write the completion flag instead of raising an MSI.
    pub pcie_write_on_done: bool,
    /// Cleared by the ARC handler once the transfer starts.
    pub trigger: bool,
}

#[repr(C)]
pub struct ArcPcieCtrlDmaRequest {
    pub chip_addr: u32,
    pub host_phys_addr_lo: u32,
    pub completion_flag_phys_addr: u32,
    pub dma_pack: DmaPack,
    /// bit31 marks a 64-bit transfer
    pub repeat: u32,
}

impl ArcPcieCtrlDmaRequest {
    pub fn to_words(&self) -> [u32; 5] {
        [
            self.chip_addr,
            self.host_phys_addr_lo,
            self.completion_flag_phys_addr,
            self.dma_pack.0,
            self.repeat,
        ]
    }
}
