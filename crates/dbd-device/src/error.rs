// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use dbd_core::{Arch, ChipId};
use dbd_pci::{PciError, PciOpenError};
use dbd_relay::{RelayError, RemoteAddr};
use thiserror::Error;

use crate::arc::PowerState;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Pci(#[from] PciError),

    #[error(transparent)]
    PciOpen(#[from] PciOpenError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Chip {0} is not part of the opened cluster")]
    ChipNotFound(ChipId),

    #[error("Chip {0} has no path to an MMIO capable chip")]
    NoMmioPath(ChipId),

    #[error("Core {x}-{y} on chip {chip} has no entry in the coordinate translation table")]
    UntranslatedCore { chip: ChipId, x: u8, y: u8 },

    #[error("Chip {chip} is a {found} but the cluster is {expected}")]
    ArchMismatch {
        chip: ChipId,
        expected: Arch,
        found: Arch,
    },

    #[error("Cluster uses NOC translation tables inconsistently across chips.")]
    InconsistentTranslation,

    #[error("Timed out after waiting {} seconds for device {chip} ARC to respond to message 0x{msg:x}", .timeout.as_secs())]
    ArcTimeout {
        chip: ChipId,
        msg: u16,
        timeout: Duration,
    },

    #[error("Failed to set power state to {state:?} with exit code {code}")]
    PowerState { state: PowerState, code: u32 },

    #[error("Access of {len} bytes at {addr:#x} on chip {chip} does not fit the {} bit remote address", RemoteAddr::OFFSET_BITS)]
    AddressOverflow { chip: ChipId, addr: u64, len: usize },

    #[error("Chip {0} is remote, it has no BAR or host memory of its own")]
    NotMmio(ChipId),

    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid cluster descriptor: {0}")]
    Descriptor(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to lock {name}: {source}")]
    Lock { name: String, source: nix::Error },
}
