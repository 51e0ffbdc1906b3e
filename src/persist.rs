//! Flush/drain/persist dispatch and the write-and-persist functions bound to a mapping.
//!
//! The strategy is chosen once from the effective granularity and never
//! changes for the life of the mapping:
//!
//! | granularity | flush            | drain        |
//! |-------------|------------------|--------------|
//! | byte        | cache-line flush | store fence  |
//! | cache line  | cache-line flush | store fence  |
//! | page        | OS page sync     | nothing      |

use bitflags::bitflags;

use crate::arch::PersistOps;
use crate::config::Protection;
use crate::errors::{PmemError, Result};
use crate::granularity::Granularity;
use crate::mmap::Mapping;
use crate::utils::slice_range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Strategy {
    Page,
    CacheLine,
    Byte,
}

impl Strategy {
    pub(crate) fn for_granularity(granularity: Granularity) -> Self {
        match granularity {
            Granularity::Page => Strategy::Page,
            Granularity::CacheLine => Strategy::CacheLine,
            Granularity::Byte => Strategy::Byte,
        }
    }

    pub(crate) fn flush(self, ops: &dyn PersistOps, addr: *const u8, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        match self {
            Strategy::Page => ops.sync_pages(addr, len).map_err(PmemError::SyncFailed),
            Strategy::CacheLine | Strategy::Byte => {
                ops.flush(addr, len);
                Ok(())
            }
        }
    }

    pub(crate) fn drain(self, ops: &dyn PersistOps) {
        match self {
            Strategy::Page => {}
            Strategy::CacheLine | Strategy::Byte => ops.drain(),
        }
    }

    pub(crate) fn persist(self, ops: &dyn PersistOps, addr: *const u8, len: usize) -> Result<()> {
        self.flush(ops, addr, len)?;
        self.drain(ops);
        Ok(())
    }
}

bitflags! {
    /// Modifiers for the bound copy, move and set functions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CopyFlags: u32 {
        /// Skip flush and drain; the caller persists the range later.
        const NO_FLUSH = 1 << 0;
        /// Flush but skip the drain, so several writes can share one barrier.
        const NO_DRAIN = 1 << 1;
    }
}

impl Mapping {
    /// Flush `[offset, offset + len)` of the mapping with its bound strategy.
    ///
    /// # Errors
    ///
    /// Returns `PmemError::OutOfBounds` if the range exceeds the mapping and
    /// `PmemError::SyncFailed` if a page-granularity sync fails.
    pub fn flush(&self, offset: usize, len: usize) -> Result<()> {
        let (start, _) = slice_range(offset, len, self.size())?;
        self.flush_raw(self.ptr_at(start), len)
    }

    /// Wait for earlier flushes to complete. A no-op at page granularity.
    pub fn drain(&self) {
        self.strategy().drain(self.ops());
    }

    /// Flush `[offset, offset + len)` and drain.
    ///
    /// # Errors
    ///
    /// Same as [`Mapping::flush`].
    pub fn persist(&self, offset: usize, len: usize) -> Result<()> {
        let (start, _) = slice_range(offset, len, self.size())?;
        self.persist_raw(self.ptr_at(start), len)
    }

    // Inaccessible pages hold nothing to flush, and touching them with a
    // cache-line flush would fault.
    pub(crate) fn flush_raw(&self, addr: *const u8, len: usize) -> Result<()> {
        if self.protection().is_empty() {
            return Ok(());
        }
        log::trace!("flush {addr:p}+{len} ({:?})", self.strategy());
        self.strategy().flush(self.ops(), addr, len)
    }

    pub(crate) fn persist_raw(&self, addr: *const u8, len: usize) -> Result<()> {
        if self.protection().is_empty() {
            return Ok(());
        }
        log::trace!("persist {addr:p}+{len} ({:?})", self.strategy());
        self.strategy().persist(self.ops(), addr, len)
    }

    fn finish_write(&self, addr: *const u8, len: usize, flags: CopyFlags) -> Result<()> {
        if flags.contains(CopyFlags::NO_FLUSH) {
            return Ok(());
        }
        self.flush_raw(addr, len)?;
        if !flags.contains(CopyFlags::NO_DRAIN) {
            self.drain();
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.protection().contains(Protection::WRITE) {
            Ok(())
        } else {
            Err(PmemError::InvalidMode("mapping is not writable"))
        }
    }

    /// Copy `src` into the mapping at `offset`, then persist it according to `flags`.
    ///
    /// # Errors
    ///
    /// Returns `PmemError::InvalidMode` if the mapping lacks write protection,
    /// `PmemError::OutOfBounds` if the range exceeds the mapping, and
    /// `PmemError::SyncFailed` if persisting fails.
    pub fn copy_from_slice(&self, offset: usize, src: &[u8], flags: CopyFlags) -> Result<()> {
        self.ensure_writable()?;
        let (start, _) = slice_range(offset, src.len(), self.size())?;
        if src.is_empty() {
            return Ok(());
        }
        let dst = self.ptr_at(start);
        {
            let _guard = self.inner.latch.write();
            // SAFETY: the destination lies inside the writable mapping and
            // `src` is an ordinary borrowed slice, so they cannot overlap.
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        }
        self.finish_write(dst, src.len(), flags)
    }

    /// Move `len` bytes from offset `src` to offset `dst` inside the mapping.
    /// The ranges may overlap.
    ///
    /// # Errors
    ///
    /// Same as [`Mapping::copy_from_slice`]; both ranges are bounds-checked.
    pub fn move_within(&self, dst: usize, src: usize, len: usize, flags: CopyFlags) -> Result<()> {
        self.ensure_writable()?;
        let (to, _) = slice_range(dst, len, self.size())?;
        let (from, _) = slice_range(src, len, self.size())?;
        if len == 0 {
            return Ok(());
        }
        if !self.protection().contains(Protection::READ) {
            return Err(PmemError::InvalidMode("mapping is not readable"));
        }
        let dst_ptr = self.ptr_at(to);
        {
            let _guard = self.inner.latch.write();
            // SAFETY: both ranges were validated against the mapping; `copy`
            // handles overlap.
            unsafe { std::ptr::copy(self.ptr_at(from), dst_ptr, len) };
        }
        self.finish_write(dst_ptr, len, flags)
    }

    /// Set `len` bytes at `offset` to `value`, then persist them according to `flags`.
    ///
    /// # Errors
    ///
    /// Same as [`Mapping::copy_from_slice`].
    pub fn fill(&self, offset: usize, value: u8, len: usize, flags: CopyFlags) -> Result<()> {
        self.ensure_writable()?;
        let (start, _) = slice_range(offset, len, self.size())?;
        if len == 0 {
            return Ok(());
        }
        let dst = self.ptr_at(start);
        {
            let _guard = self.inner.latch.write();
            // SAFETY: the range lies inside the writable mapping.
            unsafe { std::ptr::write_bytes(dst, value, len) };
        }
        self.finish_write(dst, len, flags)
    }

    /// Bound flush function of this mapping.
    #[must_use]
    pub fn flush_fn(&self) -> FlushFn<'_> {
        FlushFn { map: self }
    }

    /// Bound drain function of this mapping.
    #[must_use]
    pub fn drain_fn(&self) -> DrainFn<'_> {
        DrainFn { map: self }
    }

    /// Bound persist function of this mapping.
    #[must_use]
    pub fn persist_fn(&self) -> PersistFn<'_> {
        PersistFn { map: self }
    }

    /// Bound copy-and-persist function of this mapping.
    #[must_use]
    pub fn copy_fn(&self) -> CopyFn<'_> {
        CopyFn { map: self }
    }

    /// Bound move-and-persist function of this mapping.
    #[must_use]
    pub fn move_fn(&self) -> MoveFn<'_> {
        MoveFn { map: self }
    }

    /// Bound fill-and-persist function of this mapping.
    #[must_use]
    pub fn set_fn(&self) -> SetFn<'_> {
        SetFn { map: self }
    }
}

/// Flush function bound to a mapping. See [`Mapping::flush`].
#[derive(Debug, Clone, Copy)]
pub struct FlushFn<'m> {
    map: &'m Mapping,
}

impl FlushFn<'_> {
    /// Flush `[offset, offset + len)`.
    ///
    /// # Errors
    ///
    /// See [`Mapping::flush`].
    pub fn call(&self, offset: usize, len: usize) -> Result<()> {
        self.map.flush(offset, len)
    }
}

/// Drain function bound to a mapping. See [`Mapping::drain`].
#[derive(Debug, Clone, Copy)]
pub struct DrainFn<'m> {
    map: &'m Mapping,
}

impl DrainFn<'_> {
    /// Wait for earlier flushes.
    pub fn call(&self) {
        self.map.drain();
    }
}

/// Persist function bound to a mapping. See [`Mapping::persist`].
#[derive(Debug, Clone, Copy)]
pub struct PersistFn<'m> {
    map: &'m Mapping,
}

impl PersistFn<'_> {
    /// Flush and drain `[offset, offset + len)`.
    ///
    /// # Errors
    ///
    /// See [`Mapping::persist`].
    pub fn call(&self, offset: usize, len: usize) -> Result<()> {
        self.map.persist(offset, len)
    }
}

/// Copy function bound to a mapping. See [`Mapping::copy_from_slice`].
#[derive(Debug, Clone, Copy)]
pub struct CopyFn<'m> {
    map: &'m Mapping,
}

impl CopyFn<'_> {
    /// Copy `src` to `offset` and persist it.
    ///
    /// # Errors
    ///
    /// See [`Mapping::copy_from_slice`].
    pub fn call(&self, offset: usize, src: &[u8], flags: CopyFlags) -> Result<()> {
        self.map.copy_from_slice(offset, src, flags)
    }
}

/// Move function bound to a mapping. See [`Mapping::move_within`].
#[derive(Debug, Clone, Copy)]
pub struct MoveFn<'m> {
    map: &'m Mapping,
}

impl MoveFn<'_> {
    /// Move `len` bytes from `src` to `dst` and persist the destination.
    ///
    /// # Errors
    ///
    /// See [`Mapping::move_within`].
    pub fn call(&self, dst: usize, src: usize, len: usize, flags: CopyFlags) -> Result<()> {
        self.map.move_within(dst, src, len, flags)
    }
}

/// Fill function bound to a mapping. See [`Mapping::fill`].
#[derive(Debug, Clone, Copy)]
pub struct SetFn<'m> {
    map: &'m Mapping,
}

impl SetFn<'_> {
    /// Fill `len` bytes at `offset` with `value` and persist them.
    ///
    /// # Errors
    ///
    /// See [`Mapping::fill`].
    pub fn call(&self, offset: usize, value: u8, len: usize, flags: CopyFlags) -> Result<()> {
        self.map.fill(offset, value, len, flags)
    }
}
