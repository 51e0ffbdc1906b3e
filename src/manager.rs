//! High-level API for mapping sources and syncing them.
//!
//! Provides convenience functions over [`Platform::native`] and the
//! process-wide mapping table.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::config::{MapConfig, Protection, Sharing};
use crate::errors::Result;
use crate::mmap::Mapping;
use crate::platform::Platform;
use crate::registry;
use crate::source::Source;

/// Map `source` with the native platform.
///
/// # Errors
///
/// Returns errors from [`Platform::map`].
pub fn map(cfg: &MapConfig, source: &Source<'_>) -> Result<Mapping> {
    Platform::native().map(cfg, source)
}

/// Open the file at `path` with the access `cfg` needs and map it.
///
/// The file is opened read-write only for a shared mapping with write
/// protection. The descriptor is closed again before returning; the mapping
/// stays valid.
///
/// # Errors
///
/// Returns `PmemError::Io` if the file cannot be opened, otherwise errors from
/// [`Platform::map`].
pub fn open_and_map<P: AsRef<Path>>(path: P, cfg: &MapConfig) -> Result<Mapping> {
    let needs_write =
        cfg.sharing() == Sharing::Shared && cfg.protection().contains(Protection::WRITE);
    let file: File = OpenOptions::new()
        .read(true)
        .write(needs_write)
        .open(path.as_ref())?;
    let source = Source::from_file(&file)?;
    map(cfg, &source)
}

/// Remove `mapping` from the lookup table and release it.
pub fn unmap(mapping: Mapping) {
    mapping.unmap();
}

/// Deep-sync `[addr, addr + len)` of `mapping`.
///
/// # Errors
///
/// Returns errors from [`crate::deep_sync::deep_sync`].
pub fn deep_sync(mapping: &Mapping, addr: *const u8, len: usize) -> Result<()> {
    crate::deep_sync::deep_sync(mapping, addr, len)
}

/// Deep-sync a raw range of whichever live mapping contains it.
///
/// # Errors
///
/// Returns errors from [`crate::deep_sync::deep_sync_at`].
pub fn deep_sync_at(addr: *const u8, len: usize) -> Result<()> {
    crate::deep_sync::deep_sync_at(addr, len)
}

/// Live mapping containing `[addr, addr + len)`, if any.
#[must_use]
pub fn find_mapping(addr: *const u8, len: usize) -> Option<Mapping> {
    registry::find(addr, len)
}

/// Whether `[addr, addr + len)` is entirely persistent memory mapped with
/// cache-line or byte granularity.
#[must_use]
pub fn is_pmem(addr: *const u8, len: usize) -> bool {
    registry::is_pmem(addr, len)
}

#[cfg(feature = "async")]
pub mod r#async {
    //! Async helpers (Tokio) that run blocking syncs off the async executor.
    use std::io;

    use crate::errors::{PmemError, Result};
    use crate::mmap::Mapping;

    fn join_error(e: tokio::task::JoinError) -> PmemError {
        PmemError::Io(io::Error::other(e))
    }

    /// Persist `[offset, offset + len)` of `mapping` on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns errors from [`Mapping::persist`], or `PmemError::Io` if the
    /// blocking task panicked or was cancelled.
    pub async fn persist_async(mapping: Mapping, offset: usize, len: usize) -> Result<()> {
        tokio::task::spawn_blocking(move || mapping.persist(offset, len))
            .await
            .map_err(join_error)?
    }

    /// Deep-sync `[offset, offset + len)` of `mapping` on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns errors from [`Mapping::deep_sync_range`], or `PmemError::Io` if
    /// the blocking task panicked or was cancelled.
    pub async fn deep_sync_async(mapping: Mapping, offset: usize, len: usize) -> Result<()> {
        tokio::task::spawn_blocking(move || mapping.deep_sync_range(offset, len))
            .await
            .map_err(join_error)?
    }
}
