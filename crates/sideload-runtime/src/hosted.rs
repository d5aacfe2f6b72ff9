//! RAM-backed [`Platform`] for tests and the simulator.
//!
//! Models the device's two memory classes as flat pools with a first-fit
//! free-list allocator, journals every cache maintenance operation so tests
//! can assert coherency behavior, and routes EXEC to a pluggable call
//! handler. The default handler implements the simulator's loopback
//! convention: return the little-endian `i32` stored at the entry point.

use core::fmt;
use std::collections::BTreeMap;

use sideload_protocol::{HeapInfo, MemCaps};

use crate::platform::{CacheFault, DeviceAddr, HeapError, MemAccessError, Platform};

/// Base of the pool modeling external (SPI-attached) RAM.
pub const EXTERNAL_BASE: DeviceAddr = 0x6000_0000;
/// Base of the pool modeling on-chip SRAM.
pub const INTERNAL_BASE: DeviceAddr = 0x2000_0000;

pub const HOSTED_CACHE_LINE: u32 = 128;
pub const HOSTED_MIN_ALIGNMENT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostedConfig {
    pub external_size: u32,
    pub internal_size: u32,
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            external_size: 4 * 1024 * 1024,
            internal_size: 512 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOpKind {
    WriteBack,
    Invalidate,
}

/// One journaled cache maintenance operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOp {
    pub kind: CacheOpKind,
    pub addr: DeviceAddr,
    pub len: u32,
}

/// Flat memory pool with a sorted free list and live-block registry.
#[derive(Debug)]
struct Pool {
    base: DeviceAddr,
    data: Vec<u8>,
    /// Sorted, non-adjacent `(addr, len)` free ranges.
    free: Vec<(DeviceAddr, u32)>,
    /// Live block base -> size.
    blocks: BTreeMap<DeviceAddr, u32>,
}

impl Pool {
    fn new(base: DeviceAddr, size: u32) -> Self {
        Self {
            base,
            data: vec![0u8; size as usize],
            free: vec![(base, size)],
            blocks: BTreeMap::new(),
        }
    }

    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn contains_range(&self, addr: DeviceAddr, len: usize) -> bool {
        let start = u64::from(addr);
        let end = start + len as u64;
        start >= u64::from(self.base) && end <= u64::from(self.base) + u64::from(self.size())
    }

    fn free_bytes(&self) -> u32 {
        self.free.iter().map(|&(_, len)| len).sum()
    }

    fn alloc(&mut self, size: u32, align: u32) -> Option<DeviceAddr> {
        for i in 0..self.free.len() {
            let (start, len) = self.free[i];
            let aligned = (start + align - 1) & !(align - 1);
            let pad = aligned - start;
            if u64::from(pad) + u64::from(size) > u64::from(len) {
                continue;
            }

            self.free.remove(i);
            if pad > 0 {
                self.free.push((start, pad));
            }
            let rem = len - pad - size;
            if rem > 0 {
                self.free.push((aligned + size, rem));
            }
            self.free.sort_unstable_by_key(|&(addr, _)| addr);
            self.blocks.insert(aligned, size);
            return Some(aligned);
        }
        None
    }

    fn free_block(&mut self, addr: DeviceAddr) -> bool {
        let Some(size) = self.blocks.remove(&addr) else {
            return false;
        };
        self.free.push((addr, size));
        self.free.sort_unstable_by_key(|&(a, _)| a);

        // Coalesce adjacent ranges so the pool does not fragment forever.
        let mut merged: Vec<(DeviceAddr, u32)> = Vec::with_capacity(self.free.len());
        for &(addr, len) in &self.free {
            match merged.last_mut() {
                Some((prev_addr, prev_len)) if *prev_addr + *prev_len == addr => {
                    *prev_len += len;
                }
                _ => merged.push((addr, len)),
            }
        }
        self.free = merged;
        true
    }

    fn block_containing(&self, addr: DeviceAddr) -> Option<(DeviceAddr, u32)> {
        let (&base, &size) = self.blocks.range(..=addr).next_back()?;
        if u64::from(addr) < u64::from(base) + u64::from(size) {
            Some((base, size))
        } else {
            None
        }
    }

    fn read(&self, addr: DeviceAddr, dst: &mut [u8]) {
        let at = (addr - self.base) as usize;
        dst.copy_from_slice(&self.data[at..at + dst.len()]);
    }

    fn write(&mut self, addr: DeviceAddr, src: &[u8]) {
        let at = (addr - self.base) as usize;
        self.data[at..at + src.len()].copy_from_slice(src);
    }
}

type CallHandler = Box<dyn FnMut(DeviceAddr, &[u8]) -> i32>;

/// Default loopback convention: the entry point starts with the 4-byte LE
/// value to return.
fn word_echo(_entry: DeviceAddr, bytes: &[u8]) -> i32 {
    match bytes {
        [a, b, c, d, ..] => i32::from_le_bytes([*a, *b, *c, *d]),
        _ => 0,
    }
}

pub struct HostedPlatform {
    external: Pool,
    internal: Pool,
    cache_ops: Vec<CacheOp>,
    fail_cache: bool,
    call_handler: CallHandler,
}

impl fmt::Debug for HostedPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedPlatform")
            .field("external", &self.external)
            .field("internal", &self.internal)
            .field("cache_ops", &self.cache_ops.len())
            .field("fail_cache", &self.fail_cache)
            .finish_non_exhaustive()
    }
}

impl Default for HostedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl HostedPlatform {
    pub fn new() -> Self {
        Self::with_config(HostedConfig::default())
    }

    pub fn with_config(config: HostedConfig) -> Self {
        Self {
            external: Pool::new(EXTERNAL_BASE, config.external_size),
            internal: Pool::new(INTERNAL_BASE, config.internal_size),
            cache_ops: Vec::new(),
            fail_cache: false,
            call_handler: Box::new(word_echo),
        }
    }

    /// Replaces the EXEC handler. The handler receives the entry address
    /// and the owning block's bytes from the entry to the block's end.
    pub fn set_call_handler(
        &mut self,
        handler: impl FnMut(DeviceAddr, &[u8]) -> i32 + 'static,
    ) {
        self.call_handler = Box::new(handler);
    }

    /// All cache maintenance operations journaled so far, in issue order.
    pub fn cache_ops(&self) -> &[CacheOp] {
        &self.cache_ops
    }

    pub fn clear_cache_ops(&mut self) {
        self.cache_ops.clear();
    }

    /// Makes every subsequent cache maintenance operation fail.
    pub fn fail_cache_maintenance(&mut self, fail: bool) {
        self.fail_cache = fail;
    }

    /// Reads raw pool bytes without any table policing. Test-side window
    /// into memory the protocol should not have touched.
    pub fn peek(&self, addr: DeviceAddr, len: usize) -> Option<Vec<u8>> {
        let pool = self.pool_for(addr, len)?;
        let mut out = vec![0u8; len];
        pool.read(addr, &mut out);
        Some(out)
    }

    fn pool_for(&self, addr: DeviceAddr, len: usize) -> Option<&Pool> {
        [&self.external, &self.internal]
            .into_iter()
            .find(|pool| pool.contains_range(addr, len))
    }

    fn pool_for_mut(&mut self, addr: DeviceAddr, len: usize) -> Option<&mut Pool> {
        [&mut self.external, &mut self.internal]
            .into_iter()
            .find(|pool| pool.contains_range(addr, len))
    }

    fn block_bytes_from(&self, entry: DeviceAddr) -> Option<Vec<u8>> {
        let pool = self.pool_for(entry, 0)?;
        let (base, size) = pool.block_containing(entry)?;
        let len = (u64::from(base) + u64::from(size) - u64::from(entry)) as usize;
        let mut out = vec![0u8; len];
        pool.read(entry, &mut out);
        Some(out)
    }
}

impl Platform for HostedPlatform {
    fn cache_line_size(&self) -> u32 {
        HOSTED_CACHE_LINE
    }

    fn min_alignment(&self) -> u32 {
        HOSTED_MIN_ALIGNMENT
    }

    fn alloc(&mut self, size: u32, caps: MemCaps, align: u32) -> Result<DeviceAddr, HeapError> {
        let both = MemCaps::INTERNAL | MemCaps::EXTERNAL;
        if caps.contains(both) {
            return Err(HeapError::UnsupportedCaps { caps });
        }

        let addr = if caps.contains(MemCaps::INTERNAL) {
            self.internal.alloc(size, align)
        } else if caps.contains(MemCaps::EXTERNAL) {
            self.external.alloc(size, align)
        } else {
            // No class requested: prefer on-chip memory, fall back to the
            // big pool.
            self.internal
                .alloc(size, align)
                .or_else(|| self.external.alloc(size, align))
        };
        addr.ok_or(HeapError::OutOfMemory { size, caps })
    }

    fn free(&mut self, addr: DeviceAddr) -> Result<(), HeapError> {
        if self.internal.free_block(addr) || self.external.free_block(addr) {
            Ok(())
        } else {
            Err(HeapError::UnknownBlock { addr })
        }
    }

    fn read_into(&self, addr: DeviceAddr, dst: &mut [u8]) -> Result<(), MemAccessError> {
        match self.pool_for(addr, dst.len()) {
            Some(pool) => {
                pool.read(addr, dst);
                Ok(())
            }
            None => Err(MemAccessError {
                addr,
                len: dst.len(),
            }),
        }
    }

    fn write_from(&mut self, addr: DeviceAddr, src: &[u8]) -> Result<(), MemAccessError> {
        match self.pool_for_mut(addr, src.len()) {
            Some(pool) => {
                pool.write(addr, src);
                Ok(())
            }
            None => Err(MemAccessError {
                addr,
                len: src.len(),
            }),
        }
    }

    fn cache_writeback(&mut self, addr: DeviceAddr, len: u32) -> Result<(), CacheFault> {
        if self.fail_cache {
            return Err(CacheFault { addr, len });
        }
        self.cache_ops.push(CacheOp {
            kind: CacheOpKind::WriteBack,
            addr,
            len,
        });
        Ok(())
    }

    fn cache_invalidate(&mut self, addr: DeviceAddr, len: u32) -> Result<(), CacheFault> {
        if self.fail_cache {
            return Err(CacheFault { addr, len });
        }
        self.cache_ops.push(CacheOp {
            kind: CacheOpKind::Invalidate,
            addr,
            len,
        });
        Ok(())
    }

    fn call(&mut self, entry: DeviceAddr) -> i32 {
        let bytes = self.block_bytes_from(entry).unwrap_or_default();
        (self.call_handler)(entry, &bytes)
    }

    fn heap_info(&self) -> HeapInfo {
        HeapInfo {
            free_external: self.external.free_bytes(),
            total_external: self.external.size(),
            free_internal: self.internal.free_bytes(),
            total_internal: self.internal.size(),
        }
    }
}
