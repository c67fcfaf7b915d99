// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use dbd_core::ChipId;
use dbd_device::DeviceError;
use dbd_pci::PciOpenError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    PciOpen(#[from] PciOpenError),

    #[error("No Tenstorrent devices were detected on this system.")]
    NoDevices,

    #[error("Not all devices have the same architecture.")]
    MixedArch,

    #[error("Couldn't find create-ethernet-map at {}.", .0.display())]
    MissingEthernetMap(PathBuf),

    #[error("Call to create-ethernet-map failed. Fallback not implemented...")]
    EthernetMapFailed,

    #[error("Device {0} is not available.")]
    DeviceUnavailable(ChipId),

    #[error("Address 0x{0:x} is outside of the BAR")]
    BarAddress(u64),

    #[error("Empty request")]
    EmptyRequest,

    #[error("Unknown request type {0}")]
    UnknownOpcode(u8),

    #[error("Request type {opcode} does not fit in {len} bytes")]
    MalformedRequest { opcode: u8, len: usize },

    #[error("Request for {size} bytes is above the limit of {max} bytes")]
    RequestTooLarge { size: u64, max: u64 },

    #[error("Could not bind to port {port}: {source}")]
    Bind { port: u16, source: zmq::Error },

    #[error(transparent)]
    Zmq(#[from] zmq::Error),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}
