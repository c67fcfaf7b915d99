// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use dbd_core::Arch;

use crate::{BarIo, PciError};

mod grayskull;
mod wormhole;

pub const TLB_CONFIG_BASE: u32 = 0x1FC00000;

pub const TLB_COUNT_1M: u32 = 156;
pub const TLB_COUNT_2M: u32 = 10;
pub const TLB_COUNT_16M: u32 = 20;
pub const TLB_COUNT: u32 = TLB_COUNT_1M + TLB_COUNT_2M + TLB_COUNT_16M;

pub const TLB_BASE_INDEX_2M: u32 = TLB_COUNT_1M;
pub const TLB_BASE_INDEX_16M: u32 = TLB_BASE_INDEX_2M + TLB_COUNT_2M;

pub const TLB_SIZE_1M: u64 = 1 << 20;
pub const TLB_SIZE_2M: u64 = 1 << 21;
pub const TLB_SIZE_16M: u64 = 1 << 24;

pub const TLB_BASE_1M: u64 = 0;
pub const TLB_BASE_2M: u64 = TLB_COUNT_1M as u64 * TLB_SIZE_1M;
pub const TLB_BASE_16M: u64 = TLB_BASE_2M + TLB_COUNT_2M as u64 * TLB_SIZE_2M;

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
#[repr(u8)]
pub enum Ordering {
    #[default]
    Relaxed = 0,
    Strict = 1,
    Posted = 2,
    Unknown(u8),
}

impl From<u8> for Ordering {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Relaxed,
            1 => Self::Strict,
            2 => Self::Posted,
            val => Self::Unknown(val),
        }
    }
}

impl From<Ordering> for u8 {
    fn from(value: Ordering) -> Self {
        match value {
            Ordering::Relaxed => 0,
            Ordering::Strict => 1,
            Ordering::Posted => 2,
            Ordering::Unknown(val) => val,
        }
    }
}

/// Target of a TLB window.
///
/// Before programming `local_offset` is the full NOC address, after decoding a config register
/// it holds the window-aligned upper bits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tlb {
    pub local_offset: u64,
    pub x_end: u8,
    pub y_end: u8,
    pub x_start: u8,
    pub y_start: u8,
    pub noc_sel: u8,
    pub mcast: bool,
    pub ordering: Ordering,
    pub linked: bool,
    pub static_vc: bool,
}

impl Tlb {
    /// Unicast to a single core with the settings used for all host accesses.
    pub fn unicast(x: u8, y: u8, addr: u64, posted: bool) -> Self {
        Tlb {
            local_offset: addr,
            x_end: x,
            y_end: y,
            ordering: if posted {
                Ordering::Posted
            } else {
                Ordering::Relaxed
            },
            static_vc: true,
            ..Default::default()
        }
    }

    /// Multicast to the rectangle `start..=end`.
    pub fn multicast(start: (u8, u8), end: (u8, u8), addr: u64, posted: bool) -> Self {
        Tlb {
            x_start: start.0,
            y_start: start.1,
            mcast: true,
            ..Self::unicast(end.0, end.1, addr, posted)
        }
    }
}

/// Location of one TLB window in the BAR and its config register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbWindow {
    pub index: u32,
    pub config_addr: u32,
    pub bar_base: u64,
    pub size: u64,
}

pub fn window(index: u32) -> Result<TlbWindow, PciError> {
    let (bar_base, size) = match index {
        0..=155 => (TLB_BASE_1M + TLB_SIZE_1M * index as u64, TLB_SIZE_1M),
        156..=165 => (
            TLB_BASE_2M + TLB_SIZE_2M * (index - TLB_BASE_INDEX_2M) as u64,
            TLB_SIZE_2M,
        ),
        166..=185 => (
            TLB_BASE_16M + TLB_SIZE_16M * (index - TLB_BASE_INDEX_16M) as u64,
            TLB_SIZE_16M,
        ),
        _ => {
            return Err(PciError::TlbOutOfRange {
                id: index as usize,
            })
        }
    };

    Ok(TlbWindow {
        index,
        config_addr: TLB_CONFIG_BASE + index * 8,
        bar_base,
        size,
    })
}

/// Pack `tlb` into the config register format of `arch`.
/// `tlb.local_offset` must already be divided by the window size.
pub fn encode(arch: Arch, window: &TlbWindow, tlb: &Tlb) -> u64 {
    match arch {
        Arch::Grayskull => grayskull::encode(window.size, tlb),
        Arch::Wormhole | Arch::WormholeB0 => wormhole::encode(window.size, tlb),
    }
}

pub fn decode(arch: Arch, window: &TlbWindow, value: u64) -> Tlb {
    match arch {
        Arch::Grayskull => grayskull::decode(window.size, value),
        Arch::Wormhole | Arch::WormholeB0 => wormhole::decode(window.size, value),
    }
}

/// Point window `index` at `tlb`.
///
/// Returns the BAR offset that maps to `tlb.local_offset` and the number of bytes left in the
/// window from that offset.
pub fn setup_tlb<B: BarIo + ?Sized>(
    device: &mut B,
    index: u32,
    mut tlb: Tlb,
) -> Result<(u64, u64), PciError> {
    let window = window(index)?;

    let local_offset = tlb.local_offset % window.size;
    tlb.local_offset /= window.size;

    let value = encode(device.arch(), &window, &tlb);
    tracing::trace!(
        "tlb {index}: cfg {:#x} <- {value:#x} ({}, {}) offset {local_offset:#x}",
        window.config_addr,
        tlb.x_end,
        tlb.y_end
    );
    device.write_tlb_reg(window.config_addr, value)?;

    Ok((window.bar_base + local_offset, window.size - local_offset))
}

pub fn get_tlb<B: BarIo + ?Sized>(device: &mut B, index: u32) -> Result<Tlb, PciError> {
    let window = window(index)?;

    let value = ((device.read32(window.config_addr + 4)? as u64) << 32)
        | device.read32(window.config_addr)? as u64;

    Ok(decode(device.arch(), &window, value))
}

macro_rules! tlb_format {
    ($name:ident, $offset_bits:tt, $padding_bits:tt) => {
        #[bitfield_struct::bitfield(u64)]
        pub struct $name {
            #[bits($offset_bits)]
            local_offset: u16,
            #[bits(6)]
            x_end: u8,
            #[bits(6)]
            y_end: u8,
            #[bits(6)]
            x_start: u8,
            #[bits(6)]
            y_start: u8,
            #[bits(1)]
            noc_sel: u8,
            mcast: bool,
            #[bits(2)]
            ordering: u8,
            linked: bool,
            static_vc: bool,
            #[bits($padding_bits)]
            padding: u64,
        }

        impl From<&$crate::tlb::Tlb> for $name {
            fn from(value: &$crate::tlb::Tlb) -> Self {
                const OFFSET_MASK: u64 = (1 << $offset_bits) - 1;

                Self::new()
                    .with_local_offset((value.local_offset & OFFSET_MASK) as u16)
                    .with_x_end(value.x_end & 0x3f)
                    .with_y_end(value.y_end & 0x3f)
                    .with_x_start(value.x_start & 0x3f)
                    .with_y_start(value.y_start & 0x3f)
                    .with_noc_sel(value.noc_sel & 0x1)
                    .with_mcast(value.mcast)
                    .with_ordering(u8::from(value.ordering) & 0x3)
                    .with_linked(value.linked)
                    .with_static_vc(value.static_vc)
            }
        }

        impl From<$name> for $crate::tlb::Tlb {
            fn from(value: $name) -> Self {
                $crate::tlb::Tlb {
                    local_offset: value.local_offset() as u64,
                    x_end: value.x_end(),
                    y_end: value.y_end(),
                    x_start: value.x_start(),
                    y_start: value.y_start(),
                    noc_sel: value.noc_sel(),
                    mcast: value.mcast(),
                    ordering: $crate::tlb::Ordering::from(value.ordering()),
                    linked: value.linked(),
                    static_vc: value.static_vc(),
                }
            }
        }
    };
}

pub(crate) use tlb_format;
