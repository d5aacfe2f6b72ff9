#![forbid(unsafe_code)]

//! Host-side client for the sideload protocol.
//!
//! Blocking, strictly one request in flight: every method sends one request
//! packet and reads transport bytes through the streaming parser until the
//! response arrives. Retransmission on timeout or corruption is the
//! caller's policy, not this crate's: a lost or corrupt exchange surfaces
//! as an error and the next call starts clean.

use std::io::{self, Read, Write};

use sideload_protocol::{
    decode_alloc_response, decode_exec_response, decode_heap_info, decode_status,
    decode_write_mem_response, encode_alloc_request, encode_exec_request, encode_free_request,
    encode_packet_with_limits, encode_read_mem_request, encode_write_mem_request, AllocRequest,
    CommandId, EncodeError, HeapInfo, Limits, MemCaps, Packet, ParseEvent, PayloadError, Status,
    StreamParser, FLAGS_ERROR,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("transport closed mid-response")]
    Disconnected,
    #[error("device reported: {status}")]
    Device { status: Status },
    #[error("device reported unknown status code {code:#010x}")]
    UnknownStatus { code: u32 },
    #[error("response carries command {got:#04x}, expected {expected:#04x}")]
    CommandMismatch { expected: u8, got: u8 },
    #[error("response for command {command:#04x} arrived corrupt")]
    CorruptResponse { command: u8 },
    #[error("malformed response payload: {0}")]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

fn status_error(code: u32) -> ClientError {
    match Status::from_u32(code) {
        Some(status) => ClientError::Device { status },
        None => ClientError::UnknownStatus { code },
    }
}

/// Blocking protocol client over any byte stream.
pub struct Client<S> {
    stream: S,
    parser: StreamParser,
    limits: Limits,
}

impl<S: Read + Write> Client<S> {
    pub fn new(stream: S) -> Self {
        Self::with_limits(stream, Limits::default())
    }

    pub fn with_limits(stream: S, limits: Limits) -> Self {
        Self {
            stream,
            parser: StreamParser::with_limits(limits),
            limits,
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Sends `request` and blocks until the correlated response packet is
    /// parsed off the stream.
    fn request(&mut self, request: Packet) -> Result<Packet, ClientError> {
        let expected = request.command;
        let wire = encode_packet_with_limits(&request, &self.limits)?;
        self.stream.write_all(&wire)?;
        self.stream.flush()?;

        let mut buf = [0u8; 4096];
        loop {
            let n = self.stream.read(&mut buf)?;
            if n == 0 {
                return Err(ClientError::Disconnected);
            }
            // One request in flight means at most one event per exchange.
            // Anything a misbehaving device sends beyond the first event is
            // dropped here; the next exchange starts from a clean parse.
            if let Some(event) = self.parser.push(&buf[..n]).into_iter().next() {
                return match event {
                    ParseEvent::Packet(packet) if packet.command == expected => Ok(packet),
                    ParseEvent::Packet(packet) => Err(ClientError::CommandMismatch {
                        expected,
                        got: packet.command,
                    }),
                    ParseEvent::ChecksumMismatch { command, .. } => {
                        Err(ClientError::CorruptResponse { command })
                    }
                };
            }
        }
    }

    /// Error-shape responses carry their code in a bare `status(4)` payload.
    fn bare_status_error(response: &Packet) -> ClientError {
        match decode_status(&response.payload) {
            Ok(code) => status_error(code),
            Err(err) => ClientError::Payload(err),
        }
    }

    pub fn ping(&mut self, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        let response = self.request(Packet::request(CommandId::Ping, payload.to_vec()))?;
        if response.flags == FLAGS_ERROR {
            return Err(Self::bare_status_error(&response));
        }
        Ok(response.payload)
    }

    pub fn alloc(&mut self, size: u32, caps: MemCaps, align: u32) -> Result<u32, ClientError> {
        let request = Packet::request(
            CommandId::Alloc,
            encode_alloc_request(&AllocRequest { size, caps, align }),
        );
        let response = self.request(request)?;
        let body = decode_alloc_response(&response.payload)?;
        if response.flags == FLAGS_ERROR || body.status != Status::Ok.code() {
            return Err(status_error(body.status));
        }
        Ok(body.address)
    }

    pub fn free(&mut self, addr: u32) -> Result<(), ClientError> {
        let response = self.request(Packet::request(CommandId::Free, encode_free_request(addr)))?;
        let code = decode_status(&response.payload)?;
        if response.flags == FLAGS_ERROR || code != Status::Ok.code() {
            return Err(status_error(code));
        }
        Ok(())
    }

    /// Returns the number of bytes the device wrote.
    pub fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<u32, ClientError> {
        let request = Packet::request(CommandId::WriteMem, encode_write_mem_request(addr, data));
        let response = self.request(request)?;
        let body = decode_write_mem_response(&response.payload)?;
        if response.flags == FLAGS_ERROR || body.status != Status::Ok.code() {
            return Err(status_error(body.status));
        }
        Ok(body.bytes_written)
    }

    pub fn read_mem(&mut self, addr: u32, size: u32) -> Result<Vec<u8>, ClientError> {
        let request = Packet::request(CommandId::ReadMem, encode_read_mem_request(addr, size));
        let response = self.request(request)?;
        if response.flags == FLAGS_ERROR {
            return Err(Self::bare_status_error(&response));
        }
        Ok(response.payload)
    }

    pub fn exec(&mut self, entry: u32) -> Result<i32, ClientError> {
        let response = self.request(Packet::request(CommandId::Exec, encode_exec_request(entry)))?;
        if response.flags == FLAGS_ERROR {
            return Err(Self::bare_status_error(&response));
        }
        Ok(decode_exec_response(&response.payload)?)
    }

    pub fn heap_info(&mut self) -> Result<HeapInfo, ClientError> {
        let response = self.request(Packet::request(CommandId::HeapInfo, Vec::new()))?;
        if response.flags == FLAGS_ERROR {
            return Err(Self::bare_status_error(&response));
        }
        Ok(decode_heap_info(&response.payload)?)
    }
}
