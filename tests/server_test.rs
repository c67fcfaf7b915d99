// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};

use dbd_server::dbd_core::ChipId;
use dbd_server::implementation::{DebugImplementation, DebugResult};
use dbd_server::protocol::{Request, BAD_REQUEST, NOT_SUPPORTED};
use dbd_server::Server;
use serial_test::serial;

const PORT: u16 = 6668;

/// Every core reads back the id of its chip, writes are remembered.
#[derive(Clone, Default)]
struct ChipIdBackend {
    writes: Arc<Mutex<Vec<(ChipId, u64, Vec<u8>)>>>,
}

impl DebugImplementation for ChipIdBackend {
    fn read4(&mut self, chip: ChipId, _x: u8, _y: u8, _addr: u64) -> DebugResult<u32> {
        Ok(Some(chip as u32))
    }

    fn write(&mut self, chip: ChipId, _x: u8, _y: u8, addr: u64, data: &[u8]) -> DebugResult<u32> {
        self.writes.lock().unwrap().push((chip, addr, data.to_vec()));
        Ok(Some(data.len() as u32))
    }

    fn get_runtime_data(&mut self) -> DebugResult<String> {
        Ok(Some("arch_name: wormhole_b0\n".to_string()))
    }
}

fn connect(context: &zmq::Context) -> zmq::Socket {
    let socket = context.socket(zmq::REQ).unwrap();
    socket.set_rcvtimeo(5000).unwrap();
    socket.set_linger(0).unwrap();
    socket.connect(&format!("tcp://127.0.0.1:{PORT}")).unwrap();
    socket
}

fn exchange(socket: &mut zmq::Socket, message: &[u8]) -> Vec<u8> {
    socket.send(message, 0).unwrap();
    socket.recv_bytes(0).unwrap()
}

#[test]
#[serial]
fn read4_over_zmq() {
    let context = zmq::Context::new();
    let mut server = Server::new(PORT, Box::new(ChipIdBackend::default()));
    server.start().unwrap();

    let mut stream = connect(&context);
    let response = exchange(
        &mut stream,
        &Request::Read4 {
            chip: 5,
            x: 1,
            y: 1,
            addr: 0x100,
        }
        .encode(),
    );

    if cfg!(target_endian = "little") {
        assert_eq!(response, [5, 0, 0, 0]);
    }
    assert_eq!(response, 5u32.to_ne_bytes());

    server.stop();
}

#[test]
#[serial]
fn conversation() {
    let context = zmq::Context::new();
    let backend = ChipIdBackend::default();
    let writes = backend.writes.clone();

    let mut server = Server::new(PORT, Box::new(backend));
    server.start().unwrap();

    let mut stream = connect(&context);

    assert_eq!(exchange(&mut stream, &Request::Ping.encode()), b"PONG");

    let payload = (0..100).map(|_| rand::random::<u8>()).collect::<Vec<_>>();
    let response = exchange(
        &mut stream,
        &Request::Write {
            chip: 2,
            x: 18,
            y: 18,
            addr: 0x1000,
            data: &payload,
        }
        .encode(),
    );
    assert_eq!(response, 100u32.to_ne_bytes());
    assert_eq!(*writes.lock().unwrap(), vec![(2, 0x1000, payload)]);

    // Short, unknown and unsupported requests keep the connection usable.
    assert_eq!(exchange(&mut stream, &[10, 5, 1, 1]), BAD_REQUEST);
    assert_eq!(exchange(&mut stream, &[42]), BAD_REQUEST);
    assert_eq!(
        exchange(&mut stream, &Request::GetDeviceIds.encode()),
        NOT_SUPPORTED
    );
    assert_eq!(
        exchange(&mut stream, &Request::GetRuntimeData.encode()),
        b"arch_name: wormhole_b0\n"
    );

    // A second client is served while the first one stays connected.
    let mut other = connect(&context);
    assert_eq!(exchange(&mut other, &Request::Ping.encode()), b"PONG");
    assert_eq!(exchange(&mut stream, &Request::Ping.encode()), b"PONG");
    drop(other);
    drop(stream);

    server.stop();
}

#[test]
#[serial]
fn restart_on_the_same_port() {
    let context = zmq::Context::new();
    let mut server = Server::new(PORT, Box::new(ChipIdBackend::default()));

    for _ in 0..3 {
        server.start().unwrap();
        let mut stream = connect(&context);
        assert_eq!(exchange(&mut stream, &Request::Ping.encode()), b"PONG");
    }

    server.stop();
    assert!(!server.is_running());

    // The port is free again once stopped.
    std::net::TcpListener::bind(("0.0.0.0", PORT)).unwrap();
}
