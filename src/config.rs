//! Mapping configuration: range, requested granularity, protection and sharing.

use bitflags::bitflags;

use crate::granularity::Granularity;

bitflags! {
    /// Page protection of a mapping. The empty set maps the range inaccessible.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// Pages may be read.
        const READ = 1 << 0;
        /// Pages may be written.
        const WRITE = 1 << 1;
        /// Pages may be executed.
        const EXEC = 1 << 2;
    }
}

impl Protection {
    /// No access at all.
    pub const NONE: Protection = Protection::empty();

    pub(crate) fn to_libc(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Protection::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Protection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Protection::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

impl Default for Protection {
    fn default() -> Self {
        Protection::READ | Protection::WRITE
    }
}

/// Whether stores reach the underlying source or stay private to this mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Sharing {
    /// Stores are visible to other mappings of the source and are written back.
    #[default]
    Shared,
    /// Copy-on-write; the source is never modified.
    Private,
}

/// Parameters for [`crate::Platform::map`].
///
/// # Examples
///
/// ```
/// use pmem_map::{Granularity, MapConfig, Protection, Sharing};
///
/// let cfg = MapConfig::new(Granularity::Page)
///     .with_offset(4096)
///     .with_length(64 * 1024)
///     .with_protection(Protection::READ)
///     .with_sharing(Sharing::Private);
/// assert_eq!(cfg.length(), 64 * 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapConfig {
    offset: u64,
    length: usize,
    requested_max_granularity: Granularity,
    protection: Protection,
    sharing: Sharing,
}

impl MapConfig {
    /// New configuration mapping the whole source, read-write and shared.
    ///
    /// `requested_max_granularity` is the coarsest granularity the caller can
    /// cope with. Device DAX keeps it; page-cache backed media fall back to
    /// [`Granularity::Page`].
    #[must_use]
    pub fn new(requested_max_granularity: Granularity) -> Self {
        Self {
            offset: 0,
            length: 0,
            requested_max_granularity,
            protection: Protection::default(),
            sharing: Sharing::default(),
        }
    }

    /// Builder form of [`MapConfig::set_offset`].
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Builder form of [`MapConfig::set_length`].
    #[must_use]
    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Builder form of [`MapConfig::set_protection`].
    #[must_use]
    pub fn with_protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    /// Builder form of [`MapConfig::set_sharing`].
    #[must_use]
    pub fn with_sharing(mut self, sharing: Sharing) -> Self {
        self.sharing = sharing;
        self
    }

    /// Offset into the source; must be a multiple of the source alignment.
    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Length to map; 0 maps everything from the offset to the end of the source.
    pub fn set_length(&mut self, length: usize) {
        self.length = length;
    }

    /// Protection of the mapped pages.
    pub fn set_protection(&mut self, protection: Protection) {
        self.protection = protection;
    }

    /// Sharing mode of the mapping.
    pub fn set_sharing(&mut self, sharing: Sharing) {
        self.sharing = sharing;
    }

    /// Replace the requested maximum granularity.
    pub fn set_requested_max_granularity(&mut self, granularity: Granularity) {
        self.requested_max_granularity = granularity;
    }

    /// Offset into the source.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested length (0 = to end of source).
    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Coarsest granularity acceptable to the caller.
    #[must_use]
    pub fn requested_max_granularity(&self) -> Granularity {
        self.requested_max_granularity
    }

    /// Requested protection.
    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Requested sharing mode.
    #[must_use]
    pub fn sharing(&self) -> Sharing {
        self.sharing
    }
}
