// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{tlb_format, Tlb, TLB_SIZE_1M, TLB_SIZE_2M};

tlb_format!(Tlb1M, 16, 18);
tlb_format!(Tlb2M, 15, 19);
tlb_format!(Tlb16M, 12, 22);

pub fn encode(size: u64, tlb: &Tlb) -> u64 {
    match size {
        TLB_SIZE_1M => Tlb1M::from(tlb).into(),
        TLB_SIZE_2M => Tlb2M::from(tlb).into(),
        _ => Tlb16M::from(tlb).into(),
    }
}

pub fn decode(size: u64, value: u64) -> Tlb {
    match size {
        TLB_SIZE_1M => Tlb1M::from(value).into(),
        TLB_SIZE_2M => Tlb2M::from(value).into(),
        _ => Tlb16M::from(value).into(),
    }
}
