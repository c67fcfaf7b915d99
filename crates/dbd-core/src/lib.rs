// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical chip id as used by the cluster descriptor and the debug protocol.
pub type ChipId = u8;

#[derive(Clone, Hash, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    Grayskull,
    Wormhole,
    WormholeB0,
}

impl Default for Arch {
    fn default() -> Self {
        Self::Grayskull
    }
}

impl Arch {
    /// True for both wormhole steppings.
    pub fn is_wormhole(&self) -> bool {
        matches!(self, Arch::Wormhole | Arch::WormholeB0)
    }

    pub fn is_grayskull(&self) -> bool {
        matches!(self, Arch::Grayskull)
    }

    /// Name used by descriptor files.
    pub fn as_upper_str(&self) -> &'static str {
        match self {
            Arch::Grayskull => "GRAYSKULL",
            Arch::Wormhole => "WORMHOLE",
            Arch::WormholeB0 => "WORMHOLE_B0",
        }
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grayskull" => Ok(Arch::Grayskull),
            "wormhole" => Ok(Arch::Wormhole),
            "wormhole_b0" => Ok(Arch::WormholeB0),
            _ => Err(s.to_string()),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Grayskull => write!(f, "grayskull"),
            Arch::Wormhole => write!(f, "wormhole"),
            Arch::WormholeB0 => write!(f, "wormhole_b0"),
        }
    }
}

/// A NOC addressable core on a chip.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CoreCoord {
    pub chip: ChipId,
    pub x: u8,
    pub y: u8,
}

impl CoreCoord {
    pub fn new(chip: ChipId, x: u8, y: u8) -> Self {
        Self { chip, x, y }
    }

    pub fn xy(&self) -> (u8, u8) {
        (self.x, self.y)
    }
}

impl fmt::Display for CoreCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.chip, self.x, self.y)
    }
}

/// Location of a chip in the ethernet mesh.
///
/// Serialized as `[x, y, rack_x, rack_y]` which is the layout used in the cluster descriptor.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u8; 4]", into = "[u8; 4]")]
pub struct EthCoord {
    pub x: u8,
    pub y: u8,
    pub rack_x: u8,
    pub rack_y: u8,
}

impl From<[u8; 4]> for EthCoord {
    fn from(value: [u8; 4]) -> Self {
        Self {
            x: value[0],
            y: value[1],
            rack_x: value[2],
            rack_y: value[3],
        }
    }
}

impl From<EthCoord> for [u8; 4] {
    fn from(value: EthCoord) -> Self {
        [value.x, value.y, value.rack_x, value.rack_y]
    }
}
