#![forbid(unsafe_code)]

//! Sideload wire protocol codec.
//!
//! This crate is the canonical implementation of the packet framing spoken
//! between the host tooling and the on-device runtime. Both sides of the
//! link (`sideload-runtime`, `sideload-client`) build on it.
//!
//! Wire format (all integer fields little-endian):
//!
//! ```text
//! 0        2         3        4          8                8+len
//! +--------+---------+--------+----------+----------------+-------------+
//! | magic  | command | flags  | len(u32) | payload        | checksum    |
//! | A5 5A  |  (u8)   |  (u8)  |          | (len bytes)    | (u16)       |
//! +--------+---------+--------+----------+----------------+-------------+
//! ```
//!
//! The checksum is the low 16 bits of the byte-sum of everything before it,
//! magic included. It is verified before the payload is interpreted; a
//! packet with a good checksum but an unknown command byte is structurally
//! valid and is rejected at dispatch, not here.

use core::fmt;

use bitflags::bitflags;

pub const PACKET_MAGIC: [u8; 2] = [0xA5, 0x5A];

/// magic(2) + command(1) + flags(1) + length(4)
pub const PACKET_HEADER_LEN: usize = 8;

pub const PACKET_CHECKSUM_LEN: usize = 2;

/// Default cap on `length`. A header claiming more than this is treated as
/// stream desync, not as a large packet.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024;

pub const FLAGS_REQUEST: u8 = 0x00;
pub const FLAGS_OK: u8 = 0x01;
pub const FLAGS_ERROR: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_payload_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    Ping = 0x01,
    Alloc = 0x10,
    Free = 0x11,
    WriteMem = 0x20,
    ReadMem = 0x21,
    Exec = 0x30,
    HeapInfo = 0x40,
}

impl CommandId {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Ping),
            0x10 => Some(Self::Alloc),
            0x11 => Some(Self::Free),
            0x20 => Some(Self::WriteMem),
            0x21 => Some(Self::ReadMem),
            0x30 => Some(Self::Exec),
            0x40 => Some(Self::HeapInfo),
            _ => None,
        }
    }
}

/// Codes carried in the 4-byte `status`/`error` response slots.
///
/// `0x00..=0x03` are the codes the original protocol documents; the rest are
/// this implementation's extension in the same field, kept additive so a
/// host that only knows the documented set still reads nonzero as failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0x00,
    Checksum = 0x01,
    UnknownCommand = 0x02,
    AllocFailed = 0x03,
    InvalidAddress = 0x04,
    OutOfBounds = 0x05,
    NotExecutable = 0x06,
    CacheSync = 0x07,
}

impl Status {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x00 => Some(Self::Ok),
            0x01 => Some(Self::Checksum),
            0x02 => Some(Self::UnknownCommand),
            0x03 => Some(Self::AllocFailed),
            0x04 => Some(Self::InvalidAddress),
            0x05 => Some(Self::OutOfBounds),
            0x06 => Some(Self::NotExecutable),
            0x07 => Some(Self::CacheSync),
            _ => None,
        }
    }

    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Checksum => "checksum mismatch",
            Status::UnknownCommand => "unknown command",
            Status::AllocFailed => "allocation failed",
            Status::InvalidAddress => "invalid address",
            Status::OutOfBounds => "out of bounds",
            Status::NotExecutable => "not executable",
            Status::CacheSync => "cache sync failed",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// Memory capability mask carried in ALLOC requests.
    ///
    /// Values follow the original device heap-caps convention, so the
    /// defined bits are sparse.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemCaps: u32 {
        const EXECUTABLE = 1 << 0;
        const BYTE_ADDRESSABLE = 1 << 2;
        const DMA = 1 << 3;
        const EXTERNAL = 1 << 10;
        const INTERNAL = 1 << 11;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn request(command: CommandId, payload: Vec<u8>) -> Self {
        Self {
            command: command as u8,
            flags: FLAGS_REQUEST,
            payload,
        }
    }

    pub fn ok(command: u8, payload: Vec<u8>) -> Self {
        Self {
            command,
            flags: FLAGS_OK,
            payload,
        }
    }

    pub fn error(command: u8, payload: Vec<u8>) -> Self {
        Self {
            command,
            flags: FLAGS_ERROR,
            payload,
        }
    }
}

/// Low 16 bits of the byte-sum of header + payload.
pub fn packet_checksum(command: u8, flags: u8, payload: &[u8]) -> u16 {
    let mut sum: u32 = u32::from(PACKET_MAGIC[0]) + u32::from(PACKET_MAGIC[1]);
    sum = sum.wrapping_add(u32::from(command));
    sum = sum.wrapping_add(u32::from(flags));
    for b in (payload.len() as u32).to_le_bytes() {
        sum = sum.wrapping_add(u32::from(b));
    }
    for &b in payload {
        sum = sum.wrapping_add(u32::from(b));
    }
    (sum & 0xFFFF) as u16
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    PayloadTooLarge { len: usize, max: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {len} > {max}")
            }
        }
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    TooShort { len: usize },
    BadMagic { got: [u8; 2] },
    PayloadTooLarge { len: usize, max: usize },
    TruncatedPayload { expected: usize, got: usize },
    TrailingBytes { trailing: usize },
    ChecksumMismatch { expected: u16, got: u16 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort { len } => write!(
                f,
                "packet too short: {len} < {} (truncated header)",
                PACKET_HEADER_LEN + PACKET_CHECKSUM_LEN
            ),
            DecodeError::BadMagic { got } => {
                write!(f, "bad magic: {:02x} {:02x}", got[0], got[1])
            }
            DecodeError::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {len} > {max}")
            }
            DecodeError::TruncatedPayload { expected, got } => {
                write!(f, "truncated packet: expected {expected} bytes, got {got}")
            }
            DecodeError::TrailingBytes { trailing } => {
                write!(f, "packet has trailing bytes: {trailing}")
            }
            DecodeError::ChecksumMismatch { expected, got } => {
                write!(f, "checksum mismatch: expected {expected:#06x}, got {got:#06x}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

pub fn encode_packet_with_limits(packet: &Packet, limits: &Limits) -> Result<Vec<u8>, EncodeError> {
    if packet.payload.len() > limits.max_payload_len {
        return Err(EncodeError::PayloadTooLarge {
            len: packet.payload.len(),
            max: limits.max_payload_len,
        });
    }

    let total = PACKET_HEADER_LEN + packet.payload.len() + PACKET_CHECKSUM_LEN;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&PACKET_MAGIC);
    out.push(packet.command);
    out.push(packet.flags);
    out.extend_from_slice(&(packet.payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&packet.payload);
    let checksum = packet_checksum(packet.command, packet.flags, &packet.payload);
    out.extend_from_slice(&checksum.to_le_bytes());
    Ok(out)
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    encode_packet_with_limits(packet, &Limits::default())
}

/// Decodes exactly one packet occupying the whole buffer.
///
/// This is the strict single-buffer form; fragmented or noisy input goes
/// through [`StreamParser`] instead.
pub fn decode_packet_with_limits(buf: &[u8], limits: &Limits) -> Result<Packet, DecodeError> {
    if buf.len() < PACKET_HEADER_LEN + PACKET_CHECKSUM_LEN {
        return Err(DecodeError::TooShort { len: buf.len() });
    }
    if buf[0] != PACKET_MAGIC[0] || buf[1] != PACKET_MAGIC[1] {
        return Err(DecodeError::BadMagic {
            got: [buf[0], buf[1]],
        });
    }

    let command = buf[2];
    let flags = buf[3];
    let payload_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

    if payload_len > limits.max_payload_len {
        return Err(DecodeError::PayloadTooLarge {
            len: payload_len,
            max: limits.max_payload_len,
        });
    }

    let expected_total = PACKET_HEADER_LEN + payload_len + PACKET_CHECKSUM_LEN;
    if buf.len() < expected_total {
        return Err(DecodeError::TruncatedPayload {
            expected: expected_total,
            got: buf.len(),
        });
    }
    if buf.len() > expected_total {
        return Err(DecodeError::TrailingBytes {
            trailing: buf.len() - expected_total,
        });
    }

    let payload = &buf[PACKET_HEADER_LEN..PACKET_HEADER_LEN + payload_len];
    let expected = packet_checksum(command, flags, payload);
    let got = u16::from_le_bytes([buf[expected_total - 2], buf[expected_total - 1]]);
    if expected != got {
        return Err(DecodeError::ChecksumMismatch { expected, got });
    }

    Ok(Packet {
        command,
        flags,
        payload: payload.to_vec(),
    })
}

pub fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    decode_packet_with_limits(buf, &Limits::default())
}

/// Events produced by [`StreamParser::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// A fully validated packet.
    Packet(Packet),
    /// A framed packet whose checksum did not verify. The command byte is
    /// echoed so the receiver can answer with a correlated error response.
    /// No payload is surfaced; the packet has no effect.
    ChecksumMismatch {
        command: u8,
        expected: u16,
        got: u16,
    },
}

/// Streaming parser for the sideload packet format.
///
/// The parser is incremental and accepts arbitrary chunk boundaries,
/// including single bytes. It never fails: bytes that cannot be part of a
/// packet are silently discarded until the next magic sequence, which is how
/// resynchronization after line noise works. A header whose length field
/// exceeds the configured limit is likewise treated as desync and dropped.
#[derive(Debug, Clone)]
pub struct StreamParser {
    limits: Limits,
    state: ParserState,
}

#[derive(Debug, Clone)]
enum ParserState {
    Seek {
        matched_first: bool,
    },
    Header {
        buf: [u8; PACKET_HEADER_LEN - 2],
        filled: usize,
    },
    Payload {
        command: u8,
        flags: u8,
        payload_len: usize,
        buf: Vec<u8>,
    },
    Checksum {
        command: u8,
        flags: u8,
        payload: Vec<u8>,
        buf: [u8; PACKET_CHECKSUM_LEN],
        filled: usize,
    },
}

const SEEK: ParserState = ParserState::Seek {
    matched_first: false,
};

impl StreamParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits,
            state: SEEK,
        }
    }

    /// True when no partially accumulated packet is pending.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ParserState::Seek { matched_first: false })
    }

    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<ParseEvent> {
        let mut events = Vec::new();

        while !chunk.is_empty() {
            match &mut self.state {
                ParserState::Seek { matched_first } => {
                    let b = chunk[0];
                    chunk = &chunk[1..];
                    if *matched_first && b == PACKET_MAGIC[1] {
                        self.state = ParserState::Header {
                            buf: [0u8; PACKET_HEADER_LEN - 2],
                            filled: 0,
                        };
                    } else {
                        // An 0xA5 run must keep the last byte as a magic
                        // candidate: ... A5 A5 5A frames a packet.
                        *matched_first = b == PACKET_MAGIC[0];
                    }
                }
                ParserState::Header { buf, filled } => {
                    let need = buf.len() - *filled;
                    let take = need.min(chunk.len());
                    buf[*filled..*filled + take].copy_from_slice(&chunk[..take]);
                    *filled += take;
                    chunk = &chunk[take..];

                    if *filled < buf.len() {
                        continue;
                    }

                    let command = buf[0];
                    let flags = buf[1];
                    let payload_len =
                        u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;

                    if payload_len > self.limits.max_payload_len {
                        // An absurd length means we framed on noise. There is
                        // no packet to answer, so drop and rescan.
                        self.state = SEEK;
                        continue;
                    }

                    if payload_len == 0 {
                        self.state = ParserState::Checksum {
                            command,
                            flags,
                            payload: Vec::new(),
                            buf: [0u8; PACKET_CHECKSUM_LEN],
                            filled: 0,
                        };
                    } else {
                        self.state = ParserState::Payload {
                            command,
                            flags,
                            payload_len,
                            buf: Vec::with_capacity(payload_len),
                        };
                    }
                }
                ParserState::Payload {
                    command,
                    flags,
                    payload_len,
                    buf,
                } => {
                    let need = *payload_len - buf.len();
                    let take = need.min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if buf.len() < *payload_len {
                        continue;
                    }

                    let command = *command;
                    let flags = *flags;
                    let payload = core::mem::take(buf);
                    self.state = ParserState::Checksum {
                        command,
                        flags,
                        payload,
                        buf: [0u8; PACKET_CHECKSUM_LEN],
                        filled: 0,
                    };
                }
                ParserState::Checksum {
                    command,
                    flags,
                    payload,
                    buf,
                    filled,
                } => {
                    let need = buf.len() - *filled;
                    let take = need.min(chunk.len());
                    buf[*filled..*filled + take].copy_from_slice(&chunk[..take]);
                    *filled += take;
                    chunk = &chunk[take..];

                    if *filled < buf.len() {
                        continue;
                    }

                    let command = *command;
                    let flags = *flags;
                    let payload = core::mem::take(payload);
                    let expected = packet_checksum(command, flags, &payload);
                    let got = u16::from_le_bytes(*buf);
                    let event = if expected == got {
                        ParseEvent::Packet(Packet {
                            command,
                            flags,
                            payload,
                        })
                    } else {
                        ParseEvent::ChecksumMismatch {
                            command,
                            expected,
                            got,
                        }
                    };
                    self.state = SEEK;
                    events.push(event);
                }
            }
        }

        events
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------------------------------------------------------------------
// Command payload codecs
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    TooShort { len: usize, min: usize },
    WrongLen { expected: usize, got: usize },
    UnknownCapBits { bits: u32 },
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::TooShort { len, min } => {
                write!(f, "payload too short: {len} < {min}")
            }
            PayloadError::WrongLen { expected, got } => {
                write!(f, "payload length mismatch: expected {expected}, got {got}")
            }
            PayloadError::UnknownCapBits { bits } => {
                write!(f, "unknown capability bits: {bits:#010x}")
            }
        }
    }
}

impl std::error::Error for PayloadError {}

fn expect_len(buf: &[u8], expected: usize) -> Result<(), PayloadError> {
    if buf.len() != expected {
        return Err(PayloadError::WrongLen {
            expected,
            got: buf.len(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub size: u32,
    pub caps: MemCaps,
    pub align: u32,
}

pub fn encode_alloc_request(req: &AllocRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&req.size.to_le_bytes());
    out.extend_from_slice(&req.caps.bits().to_le_bytes());
    out.extend_from_slice(&req.align.to_le_bytes());
    out
}

pub fn decode_alloc_request(buf: &[u8]) -> Result<AllocRequest, PayloadError> {
    expect_len(buf, 12)?;
    let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let raw_caps = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let align = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let caps = MemCaps::from_bits(raw_caps).ok_or(PayloadError::UnknownCapBits {
        bits: raw_caps & !MemCaps::all().bits(),
    })?;
    Ok(AllocRequest { size, caps, align })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocResponse {
    pub address: u32,
    /// Raw status code; see [`Status::from_u32`].
    pub status: u32,
}

pub fn encode_alloc_response(address: u32, status: Status) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&address.to_le_bytes());
    out.extend_from_slice(&status.code().to_le_bytes());
    out
}

pub fn decode_alloc_response(buf: &[u8]) -> Result<AllocResponse, PayloadError> {
    expect_len(buf, 8)?;
    Ok(AllocResponse {
        address: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        status: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
    })
}

pub fn encode_free_request(address: u32) -> Vec<u8> {
    address.to_le_bytes().to_vec()
}

pub fn decode_free_request(buf: &[u8]) -> Result<u32, PayloadError> {
    expect_len(buf, 4)?;
    Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

/// Bare `status(4)` payload, used by FREE responses and by every ERROR
/// response whose command has no wider documented error shape.
pub fn encode_status(status: Status) -> Vec<u8> {
    status.code().to_le_bytes().to_vec()
}

pub fn decode_status(buf: &[u8]) -> Result<u32, PayloadError> {
    expect_len(buf, 4)?;
    Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMemRequest<'a> {
    pub address: u32,
    pub data: &'a [u8],
}

pub fn encode_write_mem_request(address: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    out.extend_from_slice(&address.to_le_bytes());
    out.extend_from_slice(data);
    out
}

pub fn decode_write_mem_request(buf: &[u8]) -> Result<WriteMemRequest<'_>, PayloadError> {
    if buf.len() < 4 {
        return Err(PayloadError::TooShort {
            len: buf.len(),
            min: 4,
        });
    }
    Ok(WriteMemRequest {
        address: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        data: &buf[4..],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMemResponse {
    pub bytes_written: u32,
    pub status: u32,
}

pub fn encode_write_mem_response(bytes_written: u32, status: Status) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&bytes_written.to_le_bytes());
    out.extend_from_slice(&status.code().to_le_bytes());
    out
}

pub fn decode_write_mem_response(buf: &[u8]) -> Result<WriteMemResponse, PayloadError> {
    expect_len(buf, 8)?;
    Ok(WriteMemResponse {
        bytes_written: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        status: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadMemRequest {
    pub address: u32,
    pub size: u32,
}

pub fn encode_read_mem_request(address: u32, size: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&address.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out
}

pub fn decode_read_mem_request(buf: &[u8]) -> Result<ReadMemRequest, PayloadError> {
    expect_len(buf, 8)?;
    Ok(ReadMemRequest {
        address: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
    })
}

pub fn encode_exec_request(address: u32) -> Vec<u8> {
    address.to_le_bytes().to_vec()
}

pub fn decode_exec_request(buf: &[u8]) -> Result<u32, PayloadError> {
    expect_len(buf, 4)?;
    Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

pub fn encode_exec_response(return_value: i32) -> Vec<u8> {
    return_value.to_le_bytes().to_vec()
}

pub fn decode_exec_response(buf: &[u8]) -> Result<i32, PayloadError> {
    expect_len(buf, 4)?;
    Ok(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

/// HEAP_INFO response body: free/total per memory class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapInfo {
    pub free_external: u32,
    pub total_external: u32,
    pub free_internal: u32,
    pub total_internal: u32,
}

pub fn encode_heap_info(info: &HeapInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&info.free_external.to_le_bytes());
    out.extend_from_slice(&info.total_external.to_le_bytes());
    out.extend_from_slice(&info.free_internal.to_le_bytes());
    out.extend_from_slice(&info.total_internal.to_le_bytes());
    out
}

pub fn decode_heap_info(buf: &[u8]) -> Result<HeapInfo, PayloadError> {
    expect_len(buf, 16)?;
    Ok(HeapInfo {
        free_external: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        total_external: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        free_internal: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        total_internal: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
    })
}
