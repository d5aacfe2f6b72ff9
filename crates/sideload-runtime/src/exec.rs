use sideload_protocol::MemCaps;
use thiserror::Error;

use crate::cache;
use crate::platform::{CacheFault, DeviceAddr, Platform};
use crate::table::{AccessError, ShadowTable};

/// Fewest addressable bytes required at an EXEC entry point. Keeps a stub
/// entry from sitting at the very last byte of its allocation.
pub const EXEC_ENTRY_MIN_BYTES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Cache(#[from] CacheFault),
}

/// Validates `entry`, forces coherency over the whole owning allocation,
/// and performs the foreign call.
///
/// The callee is a zero-argument function returning 4 bytes; anything
/// richer lives in the convention between the host toolchain and its
/// generated wrapper code, which this function neither knows nor checks.
pub fn execute<P: Platform>(
    platform: &mut P,
    table: &ShadowTable,
    entry: DeviceAddr,
) -> Result<i32, ExecError> {
    let record = *table.validate_range(entry, EXEC_ENTRY_MIN_BYTES, MemCaps::EXECUTABLE)?;
    cache::sync_for_execution(platform, &record)?;
    Ok(platform.call(entry))
}
