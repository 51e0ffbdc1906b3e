//! Crate-specific error types for pmem-map.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::{Protection, Sharing};
use crate::source::AccessMode;

/// Result alias for pmem-map operations.
pub type Result<T> = std::result::Result<T, PmemError>;

/// Broad class of a [`PmemError`], used by callers to decide whether a retry can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or conflicting mapping configuration. Never transient.
    Config,
    /// Address or offset range outside a mapping. Never transient.
    Range,
    /// Failure reported by the OS while syncing or writing a control file.
    Io,
    /// Device topology (sysfs) could not be resolved for a DAX device.
    Topology,
    /// A hardware protection fault reported by the access probe.
    Access,
}

/// Error type covering configuration, range, I/O and topology failures.
#[derive(Debug, Error)]
pub enum PmemError {
    /// Wrapper for `std::io::Error` raised while establishing or changing a mapping.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error returned when attempting an operation the mapping's protection does not allow.
    #[error("invalid access mode: {0}")]
    InvalidMode(&'static str),

    /// Requested protection/sharing needs more access than the source was opened with.
    #[error("access denied: {protection:?} with {sharing:?} sharing is not allowed on a {access:?} source")]
    AccessDenied {
        /// Requested protection.
        protection: Protection,
        /// Requested sharing mode.
        sharing: Sharing,
        /// Access mode of the source descriptor.
        access: AccessMode,
    },

    /// Mapping offset is not a multiple of the source alignment.
    #[error("offset {offset} is not aligned to {alignment}")]
    OffsetUnaligned {
        /// Requested offset.
        offset: u64,
        /// Required alignment.
        alignment: u64,
    },

    /// Mapping length is not a multiple of the source alignment (device DAX only).
    #[error("length {len} is not aligned to {alignment}")]
    LengthUnaligned {
        /// Requested length.
        len: u64,
        /// Required alignment.
        alignment: u64,
    },

    /// Requested mapping range extends past the end of the source.
    #[error("map range beyond source: offset={offset}, len={len}, size={size}")]
    MapRange {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Usable size of the source.
        size: u64,
    },

    /// The source has no mappable content.
    #[error("source is empty")]
    SourceEmpty,

    /// The source descriptor is of a type that cannot be mapped.
    #[error("invalid file type: {0}")]
    InvalidFileType(&'static str),

    /// Error when a requested offset/length pair is out of bounds.
    #[error("range out of bounds: offset={offset}, len={len}, total={total}")]
    OutOfBounds {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Content length of the mapping.
        total: u64,
    },

    /// An address range does not lie within `[start, end)` of the mapping.
    #[error("range {addr:#x}+{len} beyond mapping [{start:#x}, {end:#x})")]
    RangeBeyondMapping {
        /// First address of the range.
        addr: usize,
        /// Length of the range.
        len: usize,
        /// Mapping base address (0 when no mapping covers the range).
        start: usize,
        /// End of the mapping content (0 when no mapping covers the range).
        end: usize,
    },

    /// The OS page-sync call failed.
    #[error("page sync failed: {0}")]
    SyncFailed(#[source] io::Error),

    /// Writing the deep-flush trigger of a DAX region failed.
    #[error("deep flush of region {region} failed: {source}")]
    DeepFlushFailed {
        /// DAX region id.
        region: u32,
        /// Underlying error.
        source: io::Error,
    },

    /// A sysfs attribute of a DAX device could not be read.
    #[error("cannot read {path}: {source}")]
    Topology {
        /// Attribute path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// A sysfs attribute of a DAX device held an unexpected value.
    #[error("malformed value {value:?} in {path}")]
    TopologyValue {
        /// Attribute path.
        path: PathBuf,
        /// Raw content.
        value: String,
    },

    /// The access probe hit a protection fault.
    #[error("access fault at {addr:#x}+{len}")]
    AccessFault {
        /// First address of the probed range.
        addr: usize,
        /// Length of the probed range.
        len: usize,
    },
}

impl PmemError {
    /// Class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            PmemError::Io(_) | PmemError::SyncFailed(_) | PmemError::DeepFlushFailed { .. } => {
                ErrorKind::Io
            }
            PmemError::InvalidMode(_)
            | PmemError::AccessDenied { .. }
            | PmemError::OffsetUnaligned { .. }
            | PmemError::LengthUnaligned { .. }
            | PmemError::MapRange { .. }
            | PmemError::SourceEmpty
            | PmemError::InvalidFileType(_) => ErrorKind::Config,
            PmemError::OutOfBounds { .. } | PmemError::RangeBeyondMapping { .. } => {
                ErrorKind::Range
            }
            PmemError::Topology { .. } | PmemError::TopologyValue { .. } => ErrorKind::Topology,
            PmemError::AccessFault { .. } => ErrorKind::Access,
        }
    }

    /// Whether retrying the failed call could succeed. Only OS-level I/O failures qualify.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Io
    }
}
