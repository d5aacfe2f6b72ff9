#![forbid(unsafe_code)]

//! Device-side runtime for pushing and executing host-compiled code.
//!
//! The runtime owns the whole protocol pipeline: a [`StreamParser`] turns
//! transport bytes into packets, the [`Dispatcher`] executes each command
//! against the memory manager / cache manager / executor, and the
//! [`Service`] pumps bytes in and responses out. Everything runs on one
//! worker, run-to-completion: a packet is fully processed (including the
//! foreign call of EXEC, which blocks for its whole duration) before the
//! next byte is read, so no locking exists anywhere in this crate.
//!
//! The platform underneath (heap, raw memory, cache maintenance, the
//! foreign call itself) is reached only through the [`Platform`] trait; a
//! RAM-backed [`hosted::HostedPlatform`] serves tests and the simulator.
//!
//! [`StreamParser`]: sideload_protocol::StreamParser

pub mod cache;
mod dispatch;
mod exec;
pub mod hosted;
mod memory;
mod platform;
mod service;
mod table;

pub use dispatch::{Dispatcher, RuntimeConfig};
pub use exec::{ExecError, EXEC_ENTRY_MIN_BYTES};
pub use memory::{AllocError, MemoryManager};
pub use platform::{CacheFault, DeviceAddr, HeapError, MemAccessError, Platform};
pub use service::{Service, Transport};
pub use table::{AccessError, AllocationRecord, InsertError, ShadowTable};
