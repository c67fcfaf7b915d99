// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mutexes shared by every process driving the same PCI device.
//!
//! Each one is an advisory lock on a file named after the resource and the PCI interface. The
//! file lock only excludes other open file descriptions, so threads of this process are kept
//! apart by an ordinary mutex taken first.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::fcntl::{flock, FlockArg};

use crate::DeviceError;

pub const DEFAULT_MUTEX_DIR: &str = "/dev/shm";

pub const ARC_MSG: &str = "ARC_MSG";
pub const NON_MMIO: &str = "NON_MMIO";
pub const LARGE_READ_TLB: &str = "LARGE_READ_TLB";
pub const LARGE_WRITE_TLB: &str = "LARGE_WRITE_TLB";
pub const SMALL_READ_WRITE_TLB: &str = "SMALL_READ_WRITE_TLB";
pub const REG_TLB: &str = "REG_TLB";

/// Every named resource of an MMIO chip.
pub const ALL: [&str; 6] = [
    ARC_MSG,
    NON_MMIO,
    LARGE_READ_TLB,
    LARGE_WRITE_TLB,
    SMALL_READ_WRITE_TLB,
    REG_TLB,
];

pub struct NamedMutex {
    name: String,
    path: PathBuf,
    file: File,
    local: Mutex<()>,
}

pub struct NamedMutexGuard<'a> {
    mutex: &'a NamedMutex,
    _local: MutexGuard<'a, ()>,
}

impl NamedMutex {
    pub fn open(dir: &Path, name: &str, pci_id: usize) -> Result<Self, DeviceError> {
        let name = format!("{name}{pci_id}");
        let path = dir.join(&name);

        let io_err = |source| DeviceError::Io {
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(io_err)?;

        // Other users may run the tools as a different user.
        if let Err(err) = file.set_permissions(std::fs::Permissions::from_mode(0o666)) {
            tracing::debug!("could not open up permissions of {}: {err}", path.display());
        }

        Ok(Self {
            name,
            path,
            file,
            local: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> Result<NamedMutexGuard<'_>, DeviceError> {
        let local = self.local.lock().unwrap_or_else(PoisonError::into_inner);

        flock(self.file.as_raw_fd(), FlockArg::LockExclusive).map_err(|source| {
            DeviceError::Lock {
                name: self.name.clone(),
                source,
            }
        })?;

        Ok(NamedMutexGuard {
            mutex: self,
            _local: local,
        })
    }

    /// Delete the lock file. Someone else having removed it already is fine.
    pub fn remove(&self) -> Result<(), DeviceError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DeviceError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for NamedMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = flock(self.mutex.file.as_raw_fd(), FlockArg::Unlock) {
            tracing::error!("Failed to unlock {}: {err}", self.mutex.name);
        }
    }
}
