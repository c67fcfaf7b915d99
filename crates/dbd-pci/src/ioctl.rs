// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Requests understood by the tenstorrent kernel driver.
//!
//! Every request is an input block followed by an output block, passed by pointer. Inputs that
//! start with `output_size_bytes` tell the driver how much of the output it may fill.

use nix::request_code_none;

const TENSTORRENT_IOCTL_MAGIC: usize = 0xFA;

/// Declares the combined in/out block of a request and the unsafe call issuing it.
macro_rules! driver_request {
    ($(#[$meta:meta])* $call:ident($number:expr) => $name:ident { $input:ty, $output:ty }) => {
        $(#[$meta])*
        #[derive(Default)]
        #[repr(C)]
        pub struct $name {
            pub input: $input,
            pub output: $output,
        }

        nix::ioctl_readwrite_bad!(
            $call,
            request_code_none!(TENSTORRENT_IOCTL_MAGIC, $number),
            $name
        );
    };
}

/// Inputs holding nothing but the size of the output they ask for.
macro_rules! sized_input {
    ($name:ident => $output:ty $(, $field:ident: $ty:ty = $value:expr)*) => {
        #[derive(Debug)]
        #[repr(C)]
        pub struct $name {
            pub output_size_bytes: u32,
            $(pub $field: $ty,)*
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    output_size_bytes: std::mem::size_of::<$output>() as u32,
                    $($field: $value,)*
                }
            }
        }
    };
}

sized_input!(GetDeviceInfoIn => GetDeviceInfoOut);

#[derive(Default, Debug)]
#[repr(C)]
pub struct GetDeviceInfoOut {
    pub output_size_bytes: u32,
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    /// Function in bits 0..3, device in 3..8, bus in 8..16.
    pub bus_dev_fn: u16,
    pub max_dma_buf_size_log2: u16,
    /// Zero on drivers older than 1.23.
    pub pci_domain: u16,
}

driver_request!(
    #[derive(Debug)]
    get_device_info(0) => GetDeviceInfo { GetDeviceInfoIn, GetDeviceInfoOut }
);

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct Mapping {
    pub mapping_id: u32,
    _reserved: u32,
    pub mapping_base: u64,
    pub mapping_size: u64,
}

#[derive(Debug, Default)]
#[repr(C)]
pub struct QueryMappingsIn {
    pub output_mapping_count: u32,
    _reserved: u32,
}

/// The driver fills at most `N` mappings.
#[derive(Debug)]
#[repr(C)]
pub struct QueryMappings<const N: usize> {
    pub input: QueryMappingsIn,
    pub output: [Mapping; N],
}

impl<const N: usize> Default for QueryMappings<N> {
    fn default() -> Self {
        Self {
            input: QueryMappingsIn {
                output_mapping_count: N as u32,
                _reserved: 0,
            },
            output: [Mapping::default(); N],
        }
    }
}

/// Generic over the mapping count, which the nix macros cannot express.
///
/// # Safety
///
/// `fd` must be an open tenstorrent device and `data` must point to a live `QueryMappings`.
pub unsafe fn query_mappings<const N: usize>(
    fd: nix::libc::c_int,
    data: *mut QueryMappings<N>,
) -> nix::Result<nix::libc::c_int> {
    nix::convert_ioctl_res!(nix::libc::ioctl(
        fd,
        request_code_none!(TENSTORRENT_IOCTL_MAGIC, 2) as nix::sys::ioctl::ioctl_num_type,
        data
    ))
}

#[derive(Default)]
#[repr(C)]
pub struct AllocateDmaBufferIn {
    pub requested_size: u32,
    /// Below the driver's buffer count, 4 on current drivers.
    pub buf_index: u8,
    _reserved0: [u8; 3],
    _reserved1: [u64; 2],
}

#[derive(Default)]
#[repr(C)]
pub struct AllocateDmaBufferOut {
    pub physical_address: u64,
    pub mapping_offset: u64,
    pub size: u32,
    _reserved0: u32,
    _reserved1: [u64; 2],
}

driver_request!(
    allocate_dma_buffer(3) => AllocateDmaBuffer { AllocateDmaBufferIn, AllocateDmaBufferOut }
);

sized_input!(GetDriverInfoIn => GetDriverInfoOut);

#[derive(Default, Debug)]
#[repr(C)]
pub struct GetDriverInfoOut {
    pub output_size_bytes: u32,
    pub driver_version: u32,
}

driver_request!(get_driver_info(5) => GetDriverInfo { GetDriverInfoIn, GetDriverInfoOut });

pub const RESET_DEVICE_RESTORE_STATE: u32 = 0;

sized_input!(ResetDeviceIn => ResetDeviceOut, flags: u32 = RESET_DEVICE_RESTORE_STATE);

#[derive(Default, Debug)]
#[repr(C)]
pub struct ResetDeviceOut {
    pub output_size_bytes: u32,
    pub result: u32,
}

driver_request!(reset_device(6) => ResetDevice { ResetDeviceIn, ResetDeviceOut });

pub const PIN_PAGES_CONTIGUOUS: u32 = 1;

sized_input!(
    PinPagesIn => PinPagesOut,
    flags: u32 = 0,
    virtual_address: u64 = 0,
    size: u64 = 0
);

#[derive(Default, Debug)]
#[repr(C)]
pub struct PinPagesOut {
    pub output_size_bytes: u32,
    _reserved: u32,
    pub physical_address: u64,
}

driver_request!(pin_pages(7) => PinPages { PinPagesIn, PinPagesOut });

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn block_sizes_match_the_driver() {
        assert_eq!(std::mem::size_of::<GetDeviceInfoOut>(), 20);
        assert_eq!(std::mem::size_of::<AllocateDmaBufferIn>(), 24);
        assert_eq!(std::mem::size_of::<AllocateDmaBufferOut>(), 40);
        assert_eq!(std::mem::size_of::<PinPagesIn>(), 24);
        assert_eq!(std::mem::size_of::<QueryMappings<8>>(), 8 + 8 * 24);

        assert_eq!(PinPagesIn::default().output_size_bytes, 16);
        assert_eq!(ResetDeviceIn::default().flags, RESET_DEVICE_RESTORE_STATE);
    }
}
