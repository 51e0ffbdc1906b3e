//! The primitives a mapping is built on, bundled so they can be swapped out.

use std::sync::Arc;

use crate::arch::{NativeOps, PersistOps};
use crate::config::MapConfig;
use crate::errors::Result;
use crate::mmap::Mapping;
use crate::source::{MediaDescriptor, Source};
use crate::topology::{DeviceTopology, SysfsTopology};

/// Persist primitives and device topology used by every mapping it creates.
///
/// Each mapping keeps a clone of the platform it was created with, so a
/// replaced topology or counting `PersistOps` affects only mappings created
/// afterwards.
///
/// # Examples
///
/// ```
/// use pmem_map::{Platform, SysfsTopology};
/// use std::sync::Arc;
///
/// let platform = Platform::native().with_topology(Arc::new(SysfsTopology::with_root("/tmp/fake-sys")));
/// assert!(format!("{platform:?}").contains("fake-sys"));
/// ```
#[derive(Clone, Debug)]
pub struct Platform {
    ops: Arc<dyn PersistOps>,
    topology: Arc<dyn DeviceTopology>,
}

impl Default for Platform {
    fn default() -> Self {
        Self::native()
    }
}

impl Platform {
    /// CPU flush instructions, `msync` and sysfs at `/sys`.
    #[must_use]
    pub fn native() -> Self {
        Self::new(Arc::new(NativeOps::detect()), Arc::new(SysfsTopology::new()))
    }

    /// Platform from explicit parts.
    #[must_use]
    pub fn new(ops: Arc<dyn PersistOps>, topology: Arc<dyn DeviceTopology>) -> Self {
        Self { ops, topology }
    }

    /// Replace the persist primitives.
    #[must_use]
    pub fn with_ops(mut self, ops: Arc<dyn PersistOps>) -> Self {
        self.ops = ops;
        self
    }

    /// Replace the device topology.
    #[must_use]
    pub fn with_topology(mut self, topology: Arc<dyn DeviceTopology>) -> Self {
        self.topology = topology;
        self
    }

    /// Persist primitives in use.
    #[must_use]
    pub fn ops(&self) -> &dyn PersistOps {
        &*self.ops
    }

    /// Device topology in use.
    #[must_use]
    pub fn topology(&self) -> &dyn DeviceTopology {
        &*self.topology
    }

    /// Classify `source` with this platform's topology.
    ///
    /// # Errors
    ///
    /// See [`crate::source::classify`].
    pub fn classify(&self, source: &Source<'_>) -> Result<MediaDescriptor> {
        self.topology.classify(source)
    }

    /// Map `source` according to `cfg`.
    ///
    /// # Errors
    ///
    /// Returns `PmemError::AccessDenied` if `cfg` needs more access than the
    /// source was opened with, the config errors (`OffsetUnaligned`,
    /// `LengthUnaligned`, `MapRange`, `SourceEmpty`) for a range the source
    /// cannot satisfy, classification errors, and `PmemError::Io` if the OS
    /// refuses the mapping.
    pub fn map(&self, cfg: &MapConfig, source: &Source<'_>) -> Result<Mapping> {
        Mapping::map(cfg, source, self)
    }
}
