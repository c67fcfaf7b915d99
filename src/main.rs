// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use std::io::BufRead;
use std::path::PathBuf;

use clap::Parser;
use dbd_server::implementation::DebugImplementation;
use dbd_server::server::DEFAULT_PORT;
use dbd_server::{NotImplemented, OpenOptions, Server, ServerError, UmdWithOpen};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Serves device memory and metadata to the debugger")]
pub struct CmdArgs {
    /// Port to listen on.
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Runtime data yaml handed to the debugger as is.
    #[arg(short = 'y', long)]
    runtime_yaml: Option<PathBuf>,

    /// Chips to open, every detected chip if not given.
    #[arg(short, long, num_args = 1..)]
    devices: Vec<u8>,

    /// Start without touching hardware. Every request but ping is answered NOT_SUPPORTED.
    #[arg(long)]
    test: bool,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), ServerError> {
    let args = CmdArgs::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let backend: Box<dyn DebugImplementation> = if args.test {
        Box::new(NotImplemented)
    } else {
        Box::new(UmdWithOpen::open(OpenOptions {
            runtime_yaml: args.runtime_yaml,
            wanted_devices: args.devices,
            ..Default::default()
        })?)
    };

    let mut server = Server::new(args.port, backend);
    server.start()?;
    println!("Debug server started on port {}, type 'exit' to stop.", args.port);

    for line in std::io::stdin().lock().lines() {
        match line?.trim() {
            "exit" | "quit" => {
                server.stop();
                return Ok(());
            }
            _ => {}
        }
    }

    // No terminal to read from, keep serving until killed.
    loop {
        std::thread::park();
    }
}
