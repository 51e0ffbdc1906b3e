//! # pmem-map: persistent-memory mappings with durability granularity
//!
//! This crate maps files, block devices and device-DAX character devices into
//! the address space and tells the caller how small a unit of data can be
//! made durable on its own. Every mapping carries flush, drain and persist
//! functions chosen for its granularity when it is created.
//!
//! ## Features
//!
//! - **Granularity resolution**: device DAX honours byte or cache-line
//!   requests; page-cache backed media are always mapped at page granularity
//! - **Bound persist functions**: `flush`, `drain`, `persist` and the
//!   write-and-persist `copy`, `move` and `set` functions
//! - **Deep sync**: pushes a range past the platform's write-pending queues
//! - **Lookup by address**: find the mapping behind a raw pointer, or ask
//!   whether a range is persistent memory
//! - **Injectable platform**: swap the flush primitives or the sysfs topology
//!   for testing
//! - **Async support**: optional Tokio helpers that run syncs off the executor
//!
//! ## Quick Start
//!
//! ```no_run
//! use pmem_map::{open_and_map, CopyFlags, Granularity, MapConfig};
//!
//! // Ask for cache-line granularity; a regular file will give page granularity.
//! let map = open_and_map("pool.bin", &MapConfig::new(Granularity::CacheLine))?;
//! println!("mapped {} bytes at {:p} ({})", map.size(), map.address(), map.granularity());
//!
//! map.copy_fn().call(0, b"Hello, pmem!", CopyFlags::empty())?;
//! map.deep_sync_range(0, 12)?;
//! # Ok::<(), pmem_map::PmemError>(())
//! ```
//!
//! ## Modules
//!
//! - [`errors`]: Error type and classification
//! - [`config`]: Mapping configuration
//! - [`source`]: Sources and media classification
//! - [`topology`]: Device DAX topology and the deep-flush trigger
//! - [`granularity`]: Granularity ordering and resolution
//! - [`mmap`]: The `Mapping` type
//! - [`persist`]: Bound flush/drain/persist and write functions
//! - [`deep_sync`]: Deep sync
//! - [`arch`]: CPU flush instructions and OS page sync
//! - [`probe`]: Signal-free access probing
//! - [`manager`]: High-level convenience functions
//!
//! ## Feature Flags
//!
//! - `async`: Enables Tokio-based async persist and deep sync

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![deny(missing_docs)]

#[cfg(not(unix))]
compile_error!("pmem-map supports unix targets only");

pub mod arch;
pub mod config;
pub mod deep_sync;
pub mod errors;
pub mod granularity;
pub mod manager;
pub mod mmap;
pub mod persist;
pub mod platform;
pub mod probe;
mod registry;
pub mod source;
pub mod topology;
pub mod utils;

pub use arch::{FlushInstruction, NativeOps, PersistOps, CACHE_LINE_SIZE};
pub use config::{MapConfig, Protection, Sharing};
pub use errors::{ErrorKind, PmemError, Result};
pub use granularity::Granularity;
pub use manager::{deep_sync, deep_sync_at, find_mapping, is_pmem, map, open_and_map, unmap};
pub use mmap::Mapping;
pub use persist::{CopyFlags, CopyFn, DrainFn, FlushFn, MoveFn, PersistFn, SetFn};
pub use platform::Platform;
pub use source::{AccessMode, MediaDescriptor, MediaKind, Source};
pub use topology::{DeepFlushOutcome, DeviceId, DeviceTopology, SysfsTopology};
