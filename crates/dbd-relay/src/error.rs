// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use dbd_pci::PciError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Destination Unreachable.")]
    DestinationUnreachable,

    #[error("Unable to reserve data block on destination route.")]
    DataBlockUnavailable,

    #[error("Unexpected ERISC response flags {flags:#x}, expected {expected:#x}")]
    UnexpectedResponse { flags: u32, expected: u32 },

    #[error("The epoch command queue is already in use by another caller")]
    EpochConcurrentUse,

    #[error("Epoch command of {size} bytes to {addr:#x} does not fit in a single block")]
    EpochTooLarge { addr: u64, size: usize },

    #[error("Block mode address {addr:#x} must be 32-byte aligned")]
    Unaligned { addr: u64 },

    #[error("Relay transfers move whole words, {len} bytes is not a multiple of 4")]
    PartialWord { len: usize },

    #[error("Rolled block of {size} bytes does not fit in a {max} byte host buffer")]
    RolledBlockTooLarge { size: usize, max: usize },

    #[error("Need {needed} ethernet cores to relay through, found {found}")]
    NotEnoughRelayCores { needed: usize, found: usize },

    #[error("Ethernet timeout while waiting for {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    Pci(#[from] PciError),
}
