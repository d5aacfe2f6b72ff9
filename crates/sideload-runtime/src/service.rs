use std::io;

use sideload_protocol::{
    encode_packet_with_limits, encode_status, Limits, Packet, ParseEvent, Status, StreamParser,
};

use crate::dispatch::{Dispatcher, RuntimeConfig};
use crate::platform::Platform;

/// The byte boundary to the outside world. Framing below the byte level is
/// the transport's business; framing above it is entirely [`Service`]'s.
pub trait Transport {
    /// Returns whatever bytes are available, possibly none. An empty buffer
    /// means "nothing right now", not end of stream; signaling stream end
    /// is transport-specific and surfaces as an error.
    fn recv(&mut self) -> io::Result<Vec<u8>>;

    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// One worker owning the whole pipeline: parser → dispatcher → platform.
///
/// Packets are processed to completion in arrival order and responses are
/// emitted in the same order; there is no pipelining. While EXEC runs its
/// foreign call the worker is gone for the duration: no other traffic is
/// serviced and an external watchdog will see no progress. That trade-off
/// (simplicity over responsiveness) is deliberate; cancellation does not
/// exist at this layer.
pub struct Service<P: Platform> {
    parser: StreamParser,
    dispatcher: Dispatcher<P>,
    limits: Limits,
}

impl<P: Platform> Service<P> {
    pub fn new(platform: P, config: RuntimeConfig) -> Self {
        Self {
            parser: StreamParser::with_limits(config.limits),
            dispatcher: Dispatcher::new(platform, config),
            limits: config.limits,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<P> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<P> {
        &mut self.dispatcher
    }

    /// Pushes raw inbound bytes through the pipeline and returns the raw
    /// outbound bytes they produced. Sans-IO core of the runtime: every
    /// well-formed packet in `bytes` yields exactly one response here, in
    /// order; noise yields nothing.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for event in self.parser.push(bytes) {
            let response = match event {
                ParseEvent::Packet(packet) => self.dispatcher.handle(&packet),
                ParseEvent::ChecksumMismatch {
                    command,
                    expected,
                    got,
                } => {
                    tracing::warn!(command, expected, got, "dropping corrupt packet");
                    Packet::error(command, encode_status(Status::Checksum))
                }
            };
            match encode_packet_with_limits(&response, &self.limits) {
                Ok(wire) => out.extend_from_slice(&wire),
                // Responses are bounded by the same limits as requests, so
                // this only fires on a dispatcher bug.
                Err(err) => {
                    tracing::error!(command = response.command, "unencodable response: {err}");
                }
            }
        }
        out
    }

    /// One transport round: receive available bytes, process them, send any
    /// responses. Returns the number of bytes received (zero when the
    /// transport had nothing).
    pub fn poll<T: Transport>(&mut self, transport: &mut T) -> io::Result<usize> {
        let bytes = transport.recv()?;
        if bytes.is_empty() {
            return Ok(0);
        }
        let responses = self.feed(&bytes);
        if !responses.is_empty() {
            transport.send(&responses)?;
        }
        Ok(bytes.len())
    }
}
