use sideload_protocol::MemCaps;
use thiserror::Error;

use crate::platform::{DeviceAddr, HeapError, Platform};
use crate::table::{AccessError, AllocationRecord, ShadowTable};

/// Why an ALLOC could not be satisfied. Every variant collapses to the
/// single ALLOC_FAIL wire code; the distinctions exist for logging and
/// tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("zero-size allocation")]
    ZeroSize,
    #[error("alignment {align} is not a power of two")]
    BadAlignment { align: u32 },
    #[error("allocation table full ({max} records)")]
    TableFull { max: usize },
    #[error(transparent)]
    Heap(#[from] HeapError),
}

/// Owns the shadow table and keeps it in lock-step with the platform heap.
///
/// Allocation and bookkeeping are one atomic unit: a record is inserted
/// before success is reported, and if the insertion fails the fresh block
/// is released on the spot. Nothing else in the runtime mutates the table.
#[derive(Debug)]
pub struct MemoryManager {
    table: ShadowTable,
    max_records: usize,
}

impl MemoryManager {
    pub fn new(max_records: usize) -> Self {
        Self {
            table: ShadowTable::new(max_records),
            max_records,
        }
    }

    pub fn table(&self) -> &ShadowTable {
        &self.table
    }

    pub fn allocate<P: Platform>(
        &mut self,
        platform: &mut P,
        size: u32,
        caps: MemCaps,
        align: u32,
    ) -> Result<DeviceAddr, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let align = if align == 0 {
            platform.min_alignment()
        } else {
            align
        };
        if !align.is_power_of_two() {
            return Err(AllocError::BadAlignment { align });
        }

        // Executable and DMA memory is maintained line-by-line later, so the
        // block itself must not share a line with foreign memory.
        let mut align = align.max(platform.min_alignment());
        if caps.intersects(MemCaps::EXECUTABLE | MemCaps::DMA) {
            align = align.max(platform.cache_line_size());
        }

        let addr = platform.alloc(size, caps, align)?;
        let record = AllocationRecord {
            addr,
            size,
            caps,
            align,
        };
        if let Err(err) = self.table.insert(record) {
            // Keep the atomic contract: no record, no memory.
            if platform.free(addr).is_err() {
                tracing::warn!(addr, "leaked block after failed table insert");
            }
            tracing::warn!(addr, size, "table rejected allocation: {err}");
            return Err(AllocError::TableFull {
                max: self.max_records,
            });
        }
        Ok(addr)
    }

    /// Frees by exact base address; interior addresses are rejected, not
    /// rounded down.
    pub fn free<P: Platform>(
        &mut self,
        platform: &mut P,
        addr: DeviceAddr,
    ) -> Result<(), AccessError> {
        if self.table.get(addr).is_none() {
            return Err(AccessError::InvalidAddress { addr });
        }
        if let Err(err) = platform.free(addr) {
            // The table said this block is ours but the platform disagrees.
            // Keep the record; the table stays authoritative and the host
            // sees a failure instead of a silently forgotten block.
            tracing::warn!(addr, "platform refused free of tracked block: {err}");
            return Err(AccessError::InvalidAddress { addr });
        }
        self.table.remove(addr);
        Ok(())
    }

    pub fn validate_range(
        &self,
        addr: DeviceAddr,
        len: u32,
        required: MemCaps,
    ) -> Result<&AllocationRecord, AccessError> {
        self.table.validate_range(addr, len, required)
    }
}
