// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Debug server for Tenstorrent accelerators.
//!
//! The debugger talks to [`server::Server`] over ZeroMQ, every request is decoded by [`protocol`]
//! and answered by a [`DebugImplementation`] backed by an opened [`dbd_device::Device`].

mod error;
pub mod implementation;
pub mod protocol;
pub mod server;

pub use dbd_core;
pub use dbd_device;

pub use error::ServerError;
pub use implementation::{
    DebugImplementation, NotImplemented, OpenOptions, UmdImplementation, UmdWithOpen,
};
pub use server::Server;
