// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Requests from the debugger and the answers to them.
//!
//! A request is one opcode byte followed by a fixed set of packed fields in host byte order.
//! Only `pci_write` carries a payload after its fields. A message whose length does not match
//! its opcode exactly is answered with `BAD_REQUEST` and never reaches the backend.

use dbd_core::ChipId;

use crate::implementation::DebugImplementation;
use crate::ServerError;

pub const BAD_REQUEST: &[u8] = b"BAD_REQUEST";
pub const NOT_SUPPORTED: &[u8] = b"NOT_SUPPORTED";
pub const PONG: &[u8] = b"PONG";

pub mod opcode {
    pub const PING: u8 = 1;
    pub const PCI_READ4: u8 = 10;
    pub const PCI_WRITE4: u8 = 11;
    pub const PCI_READ: u8 = 12;
    pub const PCI_WRITE: u8 = 13;
    pub const PCI_READ4_RAW: u8 = 14;
    pub const PCI_WRITE4_RAW: u8 = 15;
    pub const DMA_BUFFER_READ4: u8 = 16;
    pub const PCI_READ_TILE: u8 = 100;
    pub const GET_RUNTIME_DATA: u8 = 101;
    pub const GET_CLUSTER_DESCRIPTION: u8 = 102;
    pub const GET_HARVESTER_COORDINATE_TRANSLATION: u8 = 103;
    pub const GET_DEVICE_IDS: u8 = 104;
    pub const GET_DEVICE_ARCH: u8 = 105;
    pub const GET_DEVICE_SOC_DESCRIPTION: u8 = 106;

    pub const ALL: [u8; 15] = [
        PING,
        PCI_READ4,
        PCI_WRITE4,
        PCI_READ,
        PCI_WRITE,
        PCI_READ4_RAW,
        PCI_WRITE4_RAW,
        DMA_BUFFER_READ4,
        PCI_READ_TILE,
        GET_RUNTIME_DATA,
        GET_CLUSTER_DESCRIPTION,
        GET_HARVESTER_COORDINATE_TRANSLATION,
        GET_DEVICE_IDS,
        GET_DEVICE_ARCH,
        GET_DEVICE_SOC_DESCRIPTION,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    Ping,
    Read4 {
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
    },
    Write4 {
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        data: u32,
    },
    Read {
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        size: u32,
    },
    Write {
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        data: &'a [u8],
    },
    Read4Raw {
        chip: ChipId,
        addr: u64,
    },
    Write4Raw {
        chip: ChipId,
        addr: u64,
        data: u32,
    },
    DmaBufferRead4 {
        chip: ChipId,
        addr: u64,
        channel: u16,
    },
    ReadTile {
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        size: u32,
        data_format: u8,
    },
    GetRuntimeData,
    GetClusterDescription,
    GetHarvesterCoordinateTranslation {
        chip: ChipId,
    },
    GetDeviceIds,
    GetDeviceArch {
        chip: ChipId,
    },
    GetDeviceSocDescription {
        chip: ChipId,
    },
}

/// Packed fields of a request, consumed front to back.
struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.rest.len() < len {
            return None;
        }
        let (head, rest) = self.rest.split_at(len);
        self.rest = rest;

        Some(head)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.bytes(N)?.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        Some(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_ne_bytes(self.array()?))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_ne_bytes(self.array()?))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_ne_bytes(self.array()?))
    }

    /// chip, noc x, noc y and address, the head of every core access.
    fn core(&mut self) -> Option<(ChipId, u8, u8, u64)> {
        Some((self.u8()?, self.u8()?, self.u8()?, self.u64()?))
    }
}

impl<'a> Request<'a> {
    /// Decode a whole message. Fails unless the message is exactly as long as its opcode needs.
    pub fn parse(message: &'a [u8]) -> Result<Self, ServerError> {
        let (&code, rest) = message.split_first().ok_or(ServerError::EmptyRequest)?;
        if !opcode::ALL.contains(&code) {
            return Err(ServerError::UnknownOpcode(code));
        }

        let mut fields = Fields { rest };
        match Self::parse_fields(code, &mut fields) {
            Some(request) if fields.rest.is_empty() => Ok(request),
            _ => Err(ServerError::MalformedRequest {
                opcode: code,
                len: message.len(),
            }),
        }
    }

    fn parse_fields(code: u8, fields: &mut Fields<'a>) -> Option<Self> {
        let request = match code {
            opcode::PING => Request::Ping,
            opcode::PCI_READ4 => {
                let (chip, x, y, addr) = fields.core()?;
                Request::Read4 { chip, x, y, addr }
            }
            opcode::PCI_WRITE4 => {
                let (chip, x, y, addr) = fields.core()?;
                Request::Write4 {
                    chip,
                    x,
                    y,
                    addr,
                    data: fields.u32()?,
                }
            }
            opcode::PCI_READ => {
                let (chip, x, y, addr) = fields.core()?;
                Request::Read {
                    chip,
                    x,
                    y,
                    addr,
                    size: fields.u32()?,
                }
            }
            opcode::PCI_WRITE => {
                let (chip, x, y, addr) = fields.core()?;
                let size = fields.u32()?;
                Request::Write {
                    chip,
                    x,
                    y,
                    addr,
                    data: fields.bytes(size as usize)?,
                }
            }
            opcode::PCI_READ4_RAW => Request::Read4Raw {
                chip: fields.u8()?,
                addr: fields.u64()?,
            },
            opcode::PCI_WRITE4_RAW => Request::Write4Raw {
                chip: fields.u8()?,
                addr: fields.u64()?,
                data: fields.u32()?,
            },
            opcode::DMA_BUFFER_READ4 => Request::DmaBufferRead4 {
                chip: fields.u8()?,
                addr: fields.u64()?,
                channel: fields.u16()?,
            },
            opcode::PCI_READ_TILE => {
                let (chip, x, y, addr) = fields.core()?;
                Request::ReadTile {
                    chip,
                    x,
                    y,
                    addr,
                    size: fields.u32()?,
                    data_format: fields.u8()?,
                }
            }
            opcode::GET_RUNTIME_DATA => Request::GetRuntimeData,
            opcode::GET_CLUSTER_DESCRIPTION => Request::GetClusterDescription,
            opcode::GET_HARVESTER_COORDINATE_TRANSLATION => {
                Request::GetHarvesterCoordinateTranslation { chip: fields.u8()? }
            }
            opcode::GET_DEVICE_IDS => Request::GetDeviceIds,
            opcode::GET_DEVICE_ARCH => Request::GetDeviceArch { chip: fields.u8()? },
            opcode::GET_DEVICE_SOC_DESCRIPTION => {
                Request::GetDeviceSocDescription { chip: fields.u8()? }
            }
            _ => return None,
        };

        Some(request)
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Request::Ping => opcode::PING,
            Request::Read4 { .. } => opcode::PCI_READ4,
            Request::Write4 { .. } => opcode::PCI_WRITE4,
            Request::Read { .. } => opcode::PCI_READ,
            Request::Write { .. } => opcode::PCI_WRITE,
            Request::Read4Raw { .. } => opcode::PCI_READ4_RAW,
            Request::Write4Raw { .. } => opcode::PCI_WRITE4_RAW,
            Request::DmaBufferRead4 { .. } => opcode::DMA_BUFFER_READ4,
            Request::ReadTile { .. } => opcode::PCI_READ_TILE,
            Request::GetRuntimeData => opcode::GET_RUNTIME_DATA,
            Request::GetClusterDescription => opcode::GET_CLUSTER_DESCRIPTION,
            Request::GetHarvesterCoordinateTranslation { .. } => {
                opcode::GET_HARVESTER_COORDINATE_TRANSLATION
            }
            Request::GetDeviceIds => opcode::GET_DEVICE_IDS,
            Request::GetDeviceArch { .. } => opcode::GET_DEVICE_ARCH,
            Request::GetDeviceSocDescription { .. } => opcode::GET_DEVICE_SOC_DESCRIPTION,
        }
    }

    /// The message a client sends for this request.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];

        let core = |out: &mut Vec<u8>, chip: u8, x: u8, y: u8, addr: u64| {
            out.extend_from_slice(&[chip, x, y]);
            out.extend_from_slice(&addr.to_ne_bytes());
        };

        match *self {
            Request::Ping
            | Request::GetRuntimeData
            | Request::GetClusterDescription
            | Request::GetDeviceIds => {}
            Request::Read4 { chip, x, y, addr } => core(&mut out, chip, x, y, addr),
            Request::Write4 {
                chip,
                x,
                y,
                addr,
                data,
            } => {
                core(&mut out, chip, x, y, addr);
                out.extend_from_slice(&data.to_ne_bytes());
            }
            Request::Read {
                chip,
                x,
                y,
                addr,
                size,
            } => {
                core(&mut out, chip, x, y, addr);
                out.extend_from_slice(&size.to_ne_bytes());
            }
            Request::Write {
                chip,
                x,
                y,
                addr,
                data,
            } => {
                core(&mut out, chip, x, y, addr);
                out.extend_from_slice(&(data.len() as u32).to_ne_bytes());
                out.extend_from_slice(data);
            }
            Request::Read4Raw { chip, addr } => {
                out.push(chip);
                out.extend_from_slice(&addr.to_ne_bytes());
            }
            Request::Write4Raw { chip, addr, data } => {
                out.push(chip);
                out.extend_from_slice(&addr.to_ne_bytes());
                out.extend_from_slice(&data.to_ne_bytes());
            }
            Request::DmaBufferRead4 {
                chip,
                addr,
                channel,
            } => {
                out.push(chip);
                out.extend_from_slice(&addr.to_ne_bytes());
                out.extend_from_slice(&channel.to_ne_bytes());
            }
            Request::ReadTile {
                chip,
                x,
                y,
                addr,
                size,
                data_format,
            } => {
                core(&mut out, chip, x, y, addr);
                out.extend_from_slice(&size.to_ne_bytes());
                out.push(data_format);
            }
            Request::GetHarvesterCoordinateTranslation { chip }
            | Request::GetDeviceArch { chip }
            | Request::GetDeviceSocDescription { chip } => out.push(chip),
        }

        out
    }

    /// Run the request on `backend`. Unsupported operations answer `NOT_SUPPORTED`.
    pub fn dispatch(&self, backend: &mut dyn DebugImplementation) -> Result<Vec<u8>, ServerError> {
        let word = |value: Option<u32>| value.map(|value| value.to_ne_bytes().to_vec());
        let text = |value: Option<String>| value.map(String::into_bytes);

        let response = match *self {
            Request::Ping => Some(PONG.to_vec()),
            Request::Read4 { chip, x, y, addr } => word(backend.read4(chip, x, y, addr)?),
            Request::Write4 {
                chip,
                x,
                y,
                addr,
                data,
            } => word(backend.write4(chip, x, y, addr, data)?),
            Request::Read {
                chip,
                x,
                y,
                addr,
                size,
            } => backend.read(chip, x, y, addr, size)?,
            Request::Write {
                chip,
                x,
                y,
                addr,
                data,
            } => word(backend.write(chip, x, y, addr, data)?),
            Request::Read4Raw { chip, addr } => word(backend.read4_raw(chip, addr)?),
            Request::Write4Raw { chip, addr, data } => {
                word(backend.write4_raw(chip, addr, data)?)
            }
            Request::DmaBufferRead4 {
                chip,
                addr,
                channel,
            } => word(backend.dma_buffer_read4(chip, addr, channel)?),
            Request::ReadTile {
                chip,
                x,
                y,
                addr,
                size,
                data_format,
            } => text(backend.read_tile(chip, x, y, addr, size, data_format)?),
            Request::GetRuntimeData => text(backend.get_runtime_data()?),
            Request::GetClusterDescription => text(backend.get_cluster_description()?),
            Request::GetHarvesterCoordinateTranslation { chip } => {
                text(backend.get_harvester_coordinate_translation(chip)?)
            }
            Request::GetDeviceIds => backend.get_device_ids()?,
            Request::GetDeviceArch { chip } => text(backend.get_device_arch(chip)?),
            Request::GetDeviceSocDescription { chip } => {
                text(backend.get_device_soc_description(chip)?)
            }
        };

        Ok(response.unwrap_or_else(|| NOT_SUPPORTED.to_vec()))
    }
}

/// Answer one message. Malformed messages get `BAD_REQUEST`, errors from the backend are
/// returned for the caller to abandon the exchange.
pub fn handle(backend: &mut dyn DebugImplementation, message: &[u8]) -> Result<Vec<u8>, ServerError> {
    match Request::parse(message) {
        Ok(request) => {
            tracing::trace!("{request:?}");
            request.dispatch(backend)
        }
        Err(err) => {
            tracing::debug!("Rejected request: {err}");
            Ok(BAD_REQUEST.to_vec())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::implementation::{DebugResult, NotImplemented};

    /// Answers every call with values derived from its arguments and remembers the last call.
    #[derive(Default)]
    struct Echo {
        calls: Vec<String>,
    }

    impl DebugImplementation for Echo {
        fn read4(&mut self, chip: ChipId, x: u8, y: u8, addr: u64) -> DebugResult<u32> {
            self.calls.push(format!("read4 {chip} {x} {y} {addr}"));
            Ok(Some(chip as u32))
        }

        fn write4(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, data: u32) -> DebugResult<u32> {
            self.calls.push(format!("write4 {chip} {x} {y} {addr} {data}"));
            Ok(Some(data))
        }

        fn read(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, size: u32) -> DebugResult<Vec<u8>> {
            self.calls.push(format!("read {chip} {x} {y} {addr} {size}"));
            Ok(Some((0..size).map(|i| i as u8).collect()))
        }

        fn write(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, data: &[u8]) -> DebugResult<u32> {
            self.calls.push(format!("write {chip} {x} {y} {addr} {data:?}"));
            Ok(Some(data.len() as u32))
        }

        fn read4_raw(&mut self, chip: ChipId, addr: u64) -> DebugResult<u32> {
            self.calls.push(format!("read4_raw {chip} {addr}"));
            Ok(Some(addr as u32))
        }

        fn write4_raw(&mut self, chip: ChipId, addr: u64, data: u32) -> DebugResult<u32> {
            self.calls.push(format!("write4_raw {chip} {addr} {data}"));
            Ok(Some(data))
        }

        fn dma_buffer_read4(&mut self, chip: ChipId, addr: u64, channel: u16) -> DebugResult<u32> {
            self.calls
                .push(format!("dma_buffer_read4 {chip} {addr} {channel}"));
            Ok(Some(channel as u32))
        }

        fn read_tile(
            &mut self,
            chip: ChipId,
            x: u8,
            y: u8,
            addr: u64,
            size: u32,
            data_format: u8,
        ) -> DebugResult<String> {
            self.calls.push(format!(
                "read_tile {chip} {x} {y} {addr} {size} {data_format}"
            ));
            Ok(Some(format!("tile {data_format}")))
        }

        fn get_runtime_data(&mut self) -> DebugResult<String> {
            Ok(Some("runtime".to_string()))
        }

        fn get_cluster_description(&mut self) -> DebugResult<String> {
            Ok(Some("cluster".to_string()))
        }

        fn get_harvester_coordinate_translation(&mut self, chip: ChipId) -> DebugResult<String> {
            Ok(Some(format!("translation {chip}")))
        }

        fn get_device_ids(&mut self) -> DebugResult<Vec<u8>> {
            Ok(Some(vec![0, 1, 4]))
        }

        fn get_device_arch(&mut self, chip: ChipId) -> DebugResult<String> {
            Ok(Some(format!("arch {chip}")))
        }

        fn get_device_soc_description(&mut self, chip: ChipId) -> DebugResult<String> {
            Ok(Some(format!("soc {chip}")))
        }
    }

    fn every_request() -> Vec<Request<'static>> {
        vec![
            Request::Ping,
            Request::Read4 {
                chip: 1,
                x: 2,
                y: 3,
                addr: 123456,
            },
            Request::Write4 {
                chip: 1,
                x: 2,
                y: 3,
                addr: 123456,
                data: 987654,
            },
            Request::Read {
                chip: 1,
                x: 2,
                y: 3,
                addr: 123456,
                size: 1024,
            },
            Request::Write {
                chip: 1,
                x: 2,
                y: 3,
                addr: 123456,
                data: &[10, 11, 12, 13, 14, 15, 16, 17],
            },
            Request::Read4Raw {
                chip: 1,
                addr: 123456,
            },
            Request::Write4Raw {
                chip: 1,
                addr: 123456,
                data: 987654,
            },
            Request::DmaBufferRead4 {
                chip: 1,
                addr: 123456,
                channel: 456,
            },
            Request::ReadTile {
                chip: 1,
                x: 2,
                y: 3,
                addr: 123456,
                size: 1024,
                data_format: 14,
            },
            Request::GetRuntimeData,
            Request::GetClusterDescription,
            Request::GetHarvesterCoordinateTranslation { chip: 1 },
            Request::GetDeviceIds,
            Request::GetDeviceArch { chip: 1 },
            Request::GetDeviceSocDescription { chip: 1 },
        ]
    }

    #[test]
    fn message_sizes() {
        let sizes = every_request()
            .iter()
            .map(|request| (request.opcode(), request.encode().len()))
            .collect::<Vec<_>>();

        assert_eq!(
            sizes,
            vec![
                (1, 1),
                (10, 12),
                (11, 16),
                (12, 16),
                (13, 24),
                (14, 10),
                (15, 14),
                (16, 12),
                (100, 17),
                (101, 1),
                (102, 1),
                (103, 2),
                (104, 1),
                (105, 2),
                (106, 2),
            ]
        );
    }

    #[test]
    fn write4_echoes_data() {
        let mut message = vec![opcode::PCI_WRITE4, 1, 2, 3];
        message.extend_from_slice(&123456u64.to_ne_bytes());
        message.extend_from_slice(&987654u32.to_ne_bytes());

        let mut backend = Echo::default();
        let response = handle(&mut backend, &message).unwrap();

        assert_eq!(response, 987654u32.to_ne_bytes());
        assert_eq!(backend.calls, vec!["write4 1 2 3 123456 987654"]);
    }

    #[test]
    fn every_opcode_reaches_its_method() {
        let mut backend = Echo::default();

        let responses = every_request()
            .iter()
            .map(|request| handle(&mut backend, &request.encode()).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(
            responses,
            vec![
                b"PONG".to_vec(),
                1u32.to_ne_bytes().to_vec(),
                987654u32.to_ne_bytes().to_vec(),
                (0..1024u32).map(|i| i as u8).collect(),
                8u32.to_ne_bytes().to_vec(),
                123456u32.to_ne_bytes().to_vec(),
                987654u32.to_ne_bytes().to_vec(),
                456u32.to_ne_bytes().to_vec(),
                b"tile 14".to_vec(),
                b"runtime".to_vec(),
                b"cluster".to_vec(),
                b"translation 1".to_vec(),
                vec![0, 1, 4],
                b"arch 1".to_vec(),
                b"soc 1".to_vec(),
            ]
        );

        assert_eq!(
            backend.calls,
            vec![
                "read4 1 2 3 123456",
                "write4 1 2 3 123456 987654",
                "read 1 2 3 123456 1024",
                "write 1 2 3 123456 [10, 11, 12, 13, 14, 15, 16, 17]",
                "read4_raw 1 123456",
                "write4_raw 1 123456 987654",
                "dma_buffer_read4 1 123456 456",
                "read_tile 1 2 3 123456 1024 14",
            ]
        );
    }

    #[test]
    fn unsupported_operations() {
        let mut backend = NotImplemented;

        for request in every_request() {
            let response = handle(&mut backend, &request.encode()).unwrap();
            if request == Request::Ping {
                assert_eq!(response, PONG);
            } else {
                assert_eq!(response, NOT_SUPPORTED, "{request:?}");
            }
        }
    }

    #[test]
    fn malformed_messages() {
        let mut backend = Echo::default();

        // Every request one byte short and one byte long.
        for request in every_request() {
            let message = request.encode();
            if message.len() > 1 {
                assert_eq!(
                    handle(&mut backend, &message[..message.len() - 1]).unwrap(),
                    BAD_REQUEST,
                    "{request:?}"
                );
            }

            let mut long = message.clone();
            long.push(0);
            assert_eq!(handle(&mut backend, &long).unwrap(), BAD_REQUEST, "{request:?}");
        }

        // pci_read4 missing its address.
        assert_eq!(
            handle(&mut backend, &[opcode::PCI_READ4, 5, 1, 1]).unwrap(),
            BAD_REQUEST
        );
        assert!(matches!(
            Request::parse(&[opcode::PCI_READ4, 5, 1, 1]),
            Err(ServerError::MalformedRequest { opcode: 10, len: 4 })
        ));

        assert_eq!(handle(&mut backend, &[]).unwrap(), BAD_REQUEST);
        assert_eq!(handle(&mut backend, &[0]).unwrap(), BAD_REQUEST);
        assert_eq!(handle(&mut backend, &[2, 0, 0]).unwrap(), BAD_REQUEST);
        assert_eq!(handle(&mut backend, &[255]).unwrap(), BAD_REQUEST);

        assert!(backend.calls.is_empty());
    }

    #[test]
    fn write_payload_must_match_size() {
        let request = Request::Write {
            chip: 0,
            x: 1,
            y: 1,
            addr: 0x100,
            data: &[1, 2, 3, 4],
        };
        let mut message = request.encode();
        assert_eq!(Request::parse(&message).unwrap(), request);

        // Declare more bytes than are sent.
        message[12..16].copy_from_slice(&8u32.to_ne_bytes());
        assert!(Request::parse(&message).is_err());

        // An empty write is still a valid message.
        let empty = Request::Write {
            chip: 0,
            x: 1,
            y: 1,
            addr: 0x100,
            data: &[],
        };
        assert_eq!(empty.encode().len(), 16);
        assert_eq!(Request::parse(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn backend_errors_are_returned() {
        struct Failing;
        impl DebugImplementation for Failing {
            fn read4(&mut self, chip: ChipId, _x: u8, _y: u8, _addr: u64) -> DebugResult<u32> {
                Err(ServerError::DeviceUnavailable(chip))
            }
        }

        let message = Request::Read4 {
            chip: 7,
            x: 1,
            y: 1,
            addr: 0,
        }
        .encode();
        assert!(matches!(
            handle(&mut Failing, &message),
            Err(ServerError::DeviceUnavailable(7))
        ));
    }
}
