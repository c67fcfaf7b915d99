// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Harvested rows and the logical to NOC coordinate translation they imply.

use std::collections::BTreeMap;

use dbd_core::Arch;

use crate::soc::{Core, SocDescriptor};

/// NOC row of every bit in the harvesting fuse word.
pub const HARVESTING_NOC_LOCATIONS_WH: [u8; 10] = [11, 1, 10, 2, 9, 3, 8, 4, 7, 5];
pub const HARVESTING_NOC_LOCATIONS_GS: [u8; 10] = [5, 7, 4, 8, 3, 9, 2, 10, 1, 11];

/// Overrides the fused harvesting word, parsed as hex.
pub const HARVESTING_OVERRIDE_ENV: &str = "T6PY_HARVESTING_OVERRIDE";

/// Fold the memory and logic halves of a raw fuse word into one row mask.
pub fn row_mask(raw: u32) -> u32 {
    if raw == 0xffff_ffff {
        tracing::warn!("Invalid harvesting info, incorrect offset or fuses");
        return 0;
    }

    let memory = raw & 0x3ff;
    let logic = (raw >> 10) & 0x3ff;
    tracing::debug!("harvesting {raw:#x} (memory: {memory:#x} logic: {logic:#x})");

    memory | logic
}

pub fn harvested_rows(arch: Arch, mask: u32) -> Vec<u8> {
    let locations = match arch {
        Arch::Grayskull => &HARVESTING_NOC_LOCATIONS_GS,
        Arch::Wormhole | Arch::WormholeB0 => &HARVESTING_NOC_LOCATIONS_WH,
    };

    let mut rows = locations
        .iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1 << bit) != 0)
        .map(|(_, row)| *row)
        .collect::<Vec<_>>();
    rows.sort_unstable();

    rows
}

pub fn harvesting_override() -> Option<u32> {
    let value = std::env::var(HARVESTING_OVERRIDE_ENV).ok()?;
    let value = value.trim();
    let value = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    match u32::from_str_radix(value, 16) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {HARVESTING_OVERRIDE_ENV}={value}, it is not a hex number");
            None
        }
    }
}

fn wormhole_column(x: u8) -> Option<u8> {
    match x {
        1..=4 => Some(x + 17),
        6..=9 => Some(x + 16),
        _ => None,
    }
}

/// Per chip map from the coordinates software uses to the ones programmed into a TLB.
///
/// Built once when the chip is brought up and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    map: BTreeMap<Core, Core>,
}

impl Translation {
    pub fn identity(soc: &SocDescriptor) -> Self {
        Self {
            map: soc.grid().map(|core| (core, core)).collect(),
        }
    }

    /// The wormhole NOC translation tables move tensix and ethernet cores to a block of
    /// coordinates above the physical grid, everything else is left where it is.
    pub fn wormhole(soc: &SocDescriptor) -> Self {
        let map = soc
            .grid()
            .map(|(x, y)| {
                let translated = if soc.is_worker_location(x, y) {
                    let y = match y {
                        1..=5 => Some(y + 17),
                        7..=11 => Some(y + 16),
                        _ => None,
                    };
                    wormhole_column(x).zip(y)
                } else if soc.is_eth(x, y) {
                    let y = match y {
                        0 => Some(16),
                        6 => Some(17),
                        _ => None,
                    };
                    wormhole_column(x).zip(y)
                } else {
                    None
                };

                ((x, y), translated.unwrap_or((x, y)))
            })
            .collect();

        Self { map }
    }

    pub fn translate(&self, x: u8, y: u8) -> Option<Core> {
        self.map.get(&(x, y)).copied()
    }

    pub fn is_identity(&self) -> bool {
        self.map.iter().all(|(from, to)| from == to)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Core, Core)> + '_ {
        self.map.iter().map(|(from, to)| (*from, *to))
    }

    /// `{ (x,y) : (x,y), ... }` as shown by the debugger.
    pub fn describe(&self) -> String {
        let mut output = String::from("{ ");
        for ((x, y), (px, py)) in self.iter() {
            output.push_str(&format!("({x},{y}) : ({px},{py}), "));
        }
        output.push('}');

        output
    }
}
