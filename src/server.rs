// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Network front end of the debug server.
//!
//! The debugger holds a ZeroMQ request socket, the server answers on a reply socket bound to
//! `tcp://*:<port>`. Each request is one message and gets exactly one message back. Requests from
//! every connected client are queued by the socket and answered one at a time on a single
//! background thread.

use std::any::Any;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::implementation::DebugImplementation;
use crate::protocol::{self, BAD_REQUEST};
use crate::ServerError;

pub const DEFAULT_PORT: u16 = 5555;

/// Peers sending messages above this size are disconnected by the socket.
pub const MAX_MESSAGE_SIZE: usize = 1 << 30;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

type SharedBackend = Arc<Mutex<Box<dyn DebugImplementation>>>;

struct Running {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct Server {
    port: u16,
    backend: SharedBackend,
    running: Option<Running>,
}

/// `tcp://*:<port>`, port 0 asks for any free port.
pub fn endpoint(port: u16) -> String {
    if port == 0 {
        "tcp://*:*".to_string()
    } else {
        format!("tcp://*:{port}")
    }
}

fn reply_socket(context: &zmq::Context, port: u16) -> Result<zmq::Socket, ServerError> {
    let socket = context.socket(zmq::REP)?;
    // recv() cannot be interrupted, time out instead so stop() is noticed.
    socket.set_rcvtimeo(POLL_INTERVAL.as_millis() as i32)?;
    socket.set_linger(0)?;
    socket.set_maxmsgsize(MAX_MESSAGE_SIZE as i64)?;
    socket
        .bind(&endpoint(port))
        .map_err(|source| ServerError::Bind { port, source })?;

    Ok(socket)
}

fn bound_address(socket: &zmq::Socket, port: u16) -> SocketAddr {
    socket
        .get_last_endpoint()
        .ok()
        .and_then(Result::ok)
        .and_then(|endpoint| {
            endpoint
                .strip_prefix("tcp://")
                .and_then(|addr| addr.parse().ok())
        })
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
}

impl Server {
    pub fn new(port: u16, backend: Box<dyn DebugImplementation>) -> Self {
        Self {
            port,
            backend: Arc::new(Mutex::new(backend)),
            running: None,
        }
    }

    /// Listen on every interface and serve from a background thread. Restarts a running server.
    pub fn start(&mut self) -> Result<(), ServerError> {
        self.stop();

        // One context per run, dropping it waits until the port is released.
        let context = zmq::Context::new();
        let socket = reply_socket(&context, self.port)?;
        let local_addr = bound_address(&socket, self.port);

        let stop = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name("dbd-server".to_string())
            .spawn({
                let stop = stop.clone();
                let backend = self.backend.clone();
                move || {
                    serve(&socket, &backend, &stop);
                    drop(socket);
                    drop(context);
                }
            })?;

        tracing::info!("Debug server listening on {local_addr}");
        self.running = Some(Running {
            stop,
            thread,
            local_addr,
        });

        Ok(())
    }

    /// Stop serving and wait for the background thread. Does nothing if not running.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.store(true, Ordering::SeqCst);
            if running.thread.join().is_err() {
                tracing::error!("Debug server thread panicked");
            }
            tracing::info!("Debug server on {} stopped", running.local_addr);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Where the server listens, useful when started on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Answer one request. Never fails, the reply socket must send something back for every message.
fn respond(backend: &SharedBackend, message: &[u8]) -> Vec<u8> {
    let handled = catch_unwind(AssertUnwindSafe(|| {
        let mut backend = backend.lock().unwrap_or_else(PoisonError::into_inner);
        protocol::handle(&mut **backend, message)
    }));

    match handled {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            tracing::warn!("Request failed: {err}");
            BAD_REQUEST.to_vec()
        }
        Err(panic) => {
            tracing::error!("Request panicked: {}", panic_message(panic.as_ref()));
            BAD_REQUEST.to_vec()
        }
    }
}

fn serve(socket: &zmq::Socket, backend: &SharedBackend, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        let message = match socket.recv_bytes(0) {
            Ok(message) => message,
            Err(zmq::Error::EAGAIN) | Err(zmq::Error::EINTR) => continue,
            Err(err) => {
                tracing::error!("Failed to receive a request: {err}");
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
        };

        let response = respond(backend, &message);
        if let Err(err) = socket.send(response, 0) {
            tracing::warn!("Failed to send a response: {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::implementation::{DebugResult, NotImplemented};
    use crate::protocol::{Request, NOT_SUPPORTED, PONG};
    use dbd_core::ChipId;

    /// Reads past the end of the address space, as a buggy backend might.
    struct Overflowing;

    impl DebugImplementation for Overflowing {
        fn read4_raw(&mut self, _chip: ChipId, addr: u64) -> DebugResult<u32> {
            let end = addr.checked_add(8).expect("address overflow");
            Ok(Some(end as u32))
        }

        fn write4_raw(&mut self, chip: ChipId, _addr: u64, _data: u32) -> DebugResult<u32> {
            Err(ServerError::DeviceUnavailable(chip))
        }
    }

    fn client(context: &zmq::Context, addr: SocketAddr) -> zmq::Socket {
        let socket = context.socket(zmq::REQ).unwrap();
        socket.set_rcvtimeo(5000).unwrap();
        socket.set_linger(0).unwrap();
        socket
            .connect(&format!("tcp://127.0.0.1:{}", addr.port()))
            .unwrap();
        socket
    }

    fn exchange(socket: &zmq::Socket, message: &[u8]) -> Vec<u8> {
        socket.send(message, 0).unwrap();
        socket.recv_bytes(0).unwrap()
    }

    fn read4_raw(addr: u64) -> Vec<u8> {
        Request::Read4Raw { chip: 0, addr }.encode()
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let context = zmq::Context::new();
        let mut server = Server::new(0, Box::new(NotImplemented));
        assert!(!server.is_running());
        server.stop();

        server.start().unwrap();
        let first = server.local_addr().unwrap();
        assert_ne!(first.port(), 0);
        assert_eq!(exchange(&client(&context, first), &[1]), PONG);

        // Starting again restarts on a fresh socket.
        server.start().unwrap();
        let second = server.local_addr().unwrap();
        assert_eq!(
            exchange(&client(&context, second), &[10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            NOT_SUPPORTED
        );

        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn idle_client_does_not_block_others() {
        let context = zmq::Context::new();
        let mut server = Server::new(0, Box::new(NotImplemented));
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let idle = client(&context, addr);
        assert_eq!(exchange(&idle, &[1]), PONG);

        let busy = client(&context, addr);
        for _ in 0..3 {
            assert_eq!(exchange(&busy, &[1]), PONG);
        }

        // The idle client is still served afterwards.
        assert_eq!(exchange(&idle, &[1]), PONG);

        // Stop does not wait for connected clients.
        server.stop();
    }

    #[test]
    fn backend_failures_keep_the_server_alive() {
        let context = zmq::Context::new();
        let mut server = Server::new(0, Box::new(Overflowing));
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let socket = client(&context, addr);
        assert_eq!(exchange(&socket, &read4_raw(u64::MAX)), BAD_REQUEST);
        assert_eq!(exchange(&socket, &read4_raw(0x100)), 0x108u32.to_ne_bytes());

        let write = Request::Write4Raw {
            chip: 3,
            addr: 0,
            data: 0,
        }
        .encode();
        assert_eq!(exchange(&socket, &write), BAD_REQUEST);

        // Another client still gets through after the panic.
        assert_eq!(exchange(&client(&context, addr), &[1]), PONG);
        assert!(server.is_running());
    }

    #[test]
    fn panic_becomes_bad_request() {
        let backend: SharedBackend = Arc::new(Mutex::new(Box::new(Overflowing)));

        assert_eq!(respond(&backend, &read4_raw(u64::MAX)), BAD_REQUEST);
        // The poisoned lock is still usable.
        assert_eq!(respond(&backend, &read4_raw(0)), 8u32.to_ne_bytes());
        assert_eq!(respond(&backend, &[]), BAD_REQUEST);
    }

    #[test]
    fn endpoints() {
        assert_eq!(endpoint(5555), "tcp://*:5555");
        assert_eq!(endpoint(0), "tcp://*:*");
    }
}
