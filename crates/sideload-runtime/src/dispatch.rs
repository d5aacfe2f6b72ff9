use sideload_protocol::{
    decode_alloc_request, decode_exec_request, decode_free_request, decode_read_mem_request,
    decode_write_mem_request, encode_alloc_response, encode_exec_response, encode_heap_info,
    encode_status, encode_write_mem_response, CommandId, Limits, MemCaps, Packet, Status,
};

use crate::cache;
use crate::exec::{self, ExecError};
use crate::memory::MemoryManager;
use crate::platform::Platform;
use crate::table::AccessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Shadow table capacity; ALLOC fails once this many records are live.
    pub max_records: usize,
    pub limits: Limits,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_records: 64,
            limits: Limits::default(),
        }
    }
}

/// Executes one validated packet against the platform and produces exactly
/// one response.
///
/// The dispatcher holds no per-request state: all side effects live in the
/// memory manager's table and the platform heap. The flags byte of inbound
/// packets is not interpreted, since the device only ever receives requests
/// from its single trusted peer.
pub struct Dispatcher<P: Platform> {
    platform: P,
    memory: MemoryManager,
    limits: Limits,
}

impl<P: Platform> Dispatcher<P> {
    pub fn new(platform: P, config: RuntimeConfig) -> Self {
        Self {
            platform,
            memory: MemoryManager::new(config.max_records),
            limits: config.limits,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn handle(&mut self, packet: &Packet) -> Packet {
        let Some(command) = CommandId::from_u8(packet.command) else {
            tracing::warn!(command = packet.command, "unknown command id");
            return Packet::error(packet.command, encode_status(Status::UnknownCommand));
        };

        match command {
            CommandId::Ping => Packet::ok(packet.command, packet.payload.clone()),
            CommandId::Alloc => self.handle_alloc(packet),
            CommandId::Free => self.handle_free(packet),
            CommandId::WriteMem => self.handle_write_mem(packet),
            CommandId::ReadMem => self.handle_read_mem(packet),
            CommandId::Exec => self.handle_exec(packet),
            CommandId::HeapInfo => {
                Packet::ok(packet.command, encode_heap_info(&self.platform.heap_info()))
            }
        }
    }

    fn handle_alloc(&mut self, packet: &Packet) -> Packet {
        let fail = |packet: &Packet| {
            Packet::error(packet.command, encode_alloc_response(0, Status::AllocFailed))
        };

        let Ok(req) = decode_alloc_request(&packet.payload) else {
            tracing::warn!("malformed ALLOC payload");
            return fail(packet);
        };
        match self
            .memory
            .allocate(&mut self.platform, req.size, req.caps, req.align)
        {
            Ok(addr) => {
                tracing::debug!(addr, size = req.size, caps = ?req.caps, "alloc");
                Packet::ok(packet.command, encode_alloc_response(addr, Status::Ok))
            }
            Err(err) => {
                tracing::warn!(size = req.size, caps = ?req.caps, "alloc failed: {err}");
                fail(packet)
            }
        }
    }

    fn handle_free(&mut self, packet: &Packet) -> Packet {
        let Ok(addr) = decode_free_request(&packet.payload) else {
            tracing::warn!("malformed FREE payload");
            return Packet::error(packet.command, encode_status(Status::InvalidAddress));
        };
        match self.memory.free(&mut self.platform, addr) {
            Ok(()) => {
                tracing::debug!(addr, "free");
                Packet::ok(packet.command, encode_status(Status::Ok))
            }
            Err(err) => {
                tracing::warn!(addr, "free rejected: {err}");
                Packet::error(packet.command, encode_status(access_status(&err)))
            }
        }
    }

    fn handle_write_mem(&mut self, packet: &Packet) -> Packet {
        let error = |packet: &Packet, status: Status| {
            Packet::error(packet.command, encode_write_mem_response(0, status))
        };

        let Ok(req) = decode_write_mem_request(&packet.payload) else {
            tracing::warn!("malformed WRITE_MEM payload");
            return error(packet, Status::InvalidAddress);
        };
        let len = req.data.len() as u32;
        let record = match self.memory.validate_range(req.address, len, MemCaps::empty()) {
            Ok(record) => *record,
            Err(err) => {
                tracing::warn!(addr = req.address, len, "write rejected: {err}");
                return error(packet, access_status(&err));
            }
        };

        if self.platform.write_from(req.address, req.data).is_err() {
            // The table approved the range but the platform did not; see
            // DESIGN.md on this disagreement.
            tracing::warn!(addr = req.address, len, "platform rejected tracked write");
            return error(packet, Status::InvalidAddress);
        }

        // Bytes destined for the instruction path or a DMA master are not
        // trusted until the cache hierarchy agrees with memory.
        if record.caps.intersects(MemCaps::EXECUTABLE | MemCaps::DMA) {
            if let Err(fault) =
                cache::sync_after_write(&mut self.platform, &record, req.address, len)
            {
                tracing::error!(addr = req.address, len, "cache sync failed: {fault}");
                return error(packet, Status::CacheSync);
            }
        }

        tracing::debug!(addr = req.address, len, "write");
        Packet::ok(
            packet.command,
            encode_write_mem_response(len, Status::Ok),
        )
    }

    fn handle_read_mem(&mut self, packet: &Packet) -> Packet {
        let error = |packet: &Packet, status: Status| {
            Packet::error(packet.command, encode_status(status))
        };

        let Ok(req) = decode_read_mem_request(&packet.payload) else {
            tracing::warn!("malformed READ_MEM payload");
            return error(packet, Status::InvalidAddress);
        };
        // The data must come back in one response packet.
        if req.size as usize > self.limits.max_payload_len {
            tracing::warn!(addr = req.address, size = req.size, "read exceeds payload limit");
            return error(packet, Status::OutOfBounds);
        }
        if let Err(err) = self
            .memory
            .validate_range(req.address, req.size, MemCaps::empty())
        {
            tracing::warn!(addr = req.address, size = req.size, "read rejected: {err}");
            return error(packet, access_status(&err));
        }

        let mut data = vec![0u8; req.size as usize];
        if self.platform.read_into(req.address, &mut data).is_err() {
            tracing::warn!(addr = req.address, size = req.size, "platform rejected tracked read");
            return error(packet, Status::InvalidAddress);
        }
        Packet::ok(packet.command, data)
    }

    fn handle_exec(&mut self, packet: &Packet) -> Packet {
        let error = |packet: &Packet, status: Status| {
            Packet::error(packet.command, encode_status(status))
        };

        let Ok(entry) = decode_exec_request(&packet.payload) else {
            tracing::warn!("malformed EXEC payload");
            return error(packet, Status::InvalidAddress);
        };
        match exec::execute(&mut self.platform, self.memory.table(), entry) {
            Ok(value) => {
                tracing::debug!(entry, value, "exec");
                Packet::ok(packet.command, encode_exec_response(value))
            }
            Err(ExecError::Access(err)) => {
                tracing::warn!(entry, "exec rejected: {err}");
                error(packet, access_status(&err))
            }
            Err(ExecError::Cache(fault)) => {
                tracing::error!(entry, "exec cache sync failed: {fault}");
                error(packet, Status::CacheSync)
            }
        }
    }
}

fn access_status(err: &AccessError) -> Status {
    match err {
        AccessError::InvalidAddress { .. } => Status::InvalidAddress,
        AccessError::OutOfBounds { .. } => Status::OutOfBounds,
        AccessError::MissingCaps { .. } => Status::NotExecutable,
    }
}
