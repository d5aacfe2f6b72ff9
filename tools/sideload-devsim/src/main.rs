#![forbid(unsafe_code)]

//! TCP-serving simulator device.
//!
//! Bridges socket bytes through the runtime service over a hosted platform
//! so host tooling can be developed against the exact wire behavior without
//! hardware. One connection is served at a time (the real device is a
//! single synchronous peer) and the simulated device state (allocations,
//! heap) survives reconnects the way a powered device would.
//!
//! EXEC follows the hosted loopback convention: the return value is the
//! little-endian word at the entry point.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use anyhow::Context;
use clap::Parser;
use sideload_protocol::Limits;
use sideload_runtime::hosted::{HostedConfig, HostedPlatform};
use sideload_runtime::{RuntimeConfig, Service, Transport};

#[derive(Parser, Debug)]
#[command(
    name = "sideload-devsim",
    about = "Serve the sideload protocol over TCP against a simulated device."
)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7450")]
    listen: SocketAddr,

    /// Simulated external RAM size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 4 * 1024 * 1024)]
    external_size: u32,

    /// Simulated internal SRAM size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 512 * 1024)]
    internal_size: u32,

    /// Maximum packet payload size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 16 * 1024)]
    max_payload: usize,

    /// Maximum number of live allocations
    #[arg(long, default_value_t = 64)]
    max_records: usize,
}

struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    fn recv(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = [0u8; 4096];
        let n = self.stream.read(&mut buf)?;
        Ok(buf[..n].to_vec())
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }
}

fn serve_connection(service: &mut Service<HostedPlatform>, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    tracing::info!(?peer, "host connected");
    let mut transport = TcpTransport { stream };

    loop {
        match service.poll(&mut transport) {
            // A blocking socket read returning no bytes means the peer hung
            // up.
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                tracing::warn!(?peer, "connection error: {err}");
                break;
            }
        }
    }
    tracing::info!(?peer, "host disconnected");
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let platform = HostedPlatform::with_config(HostedConfig {
        external_size: args.external_size,
        internal_size: args.internal_size,
    });
    let config = RuntimeConfig {
        max_records: args.max_records,
        limits: Limits {
            max_payload_len: args.max_payload,
        },
    };
    let mut service = Service::new(platform, config);

    let listener = TcpListener::bind(args.listen)
        .with_context(|| format!("bind {}", args.listen))?;
    tracing::info!(
        "sideload-devsim listening on {}",
        listener.local_addr().unwrap_or(args.listen)
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => serve_connection(&mut service, stream),
            Err(err) => tracing::warn!("accept failed: {err}"),
        }
    }
    Ok(())
}
