//! Platform device topology: DAX detection, region lookup and the deep-flush trigger.
//!
//! The real implementation reads sysfs. Its root is configurable so the same
//! code can be pointed at a scratch directory laid out like sysfs.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::errors::{PmemError, Result};
use crate::source::{classify, MediaDescriptor, Source};

const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Major/minor pair of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
}

impl DeviceId {
    /// Split a raw `st_rdev` value using the Linux encoding.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_rdev(rdev: u64) -> Self {
        let major = ((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0x0000_0fff);
        let minor = ((rdev >> 12) & 0xffff_ff00) | (rdev & 0x0000_00ff);
        Self {
            major: major as u32,
            minor: minor as u32,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Outcome of a deep-flush request for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeepFlushOutcome {
    /// The trigger was written.
    Triggered,
    /// The platform reports that its buffers are already in the persistence domain.
    NotNeeded,
    /// No control file exists for the region; nothing deeper can be done.
    Unavailable,
}

/// Lookups the classifier and the deep-sync engine need from the platform.
///
/// Implementations must be usable from several threads at once. Deep-flush
/// requests for one region are serialised by the caller.
pub trait DeviceTopology: Send + Sync + fmt::Debug {
    /// Classify a source. The default inspects file-type bits and asks
    /// [`DeviceTopology::is_device_dax`] about character devices.
    ///
    /// # Errors
    ///
    /// See [`crate::source::classify`].
    fn classify(&self, source: &Source<'_>) -> Result<MediaDescriptor> {
        classify(source, self)
    }

    /// Whether the character device `dev` is a DAX device. A missing
    /// topology entry means "no".
    ///
    /// # Errors
    ///
    /// Returns a topology error if the entry exists but cannot be resolved.
    fn is_device_dax(&self, dev: DeviceId) -> Result<bool>;

    /// Region id of a DAX device.
    ///
    /// # Errors
    ///
    /// Returns a topology error if the id cannot be read or parsed.
    fn dax_region_id(&self, dev: DeviceId) -> Result<u32>;

    /// Usable size of a DAX device in bytes.
    ///
    /// # Errors
    ///
    /// Returns a topology error if the size cannot be read or parsed.
    fn dax_size(&self, dev: DeviceId) -> Result<u64>;

    /// Mapping alignment of a DAX device, if the platform reports one.
    ///
    /// # Errors
    ///
    /// Returns a topology error if the attribute exists but is malformed.
    fn dax_alignment(&self, dev: DeviceId) -> Result<Option<u64>>;

    /// Force the platform write-pending queues of `region` out to media.
    ///
    /// # Errors
    ///
    /// Returns `PmemError::DeepFlushFailed` if the trigger write fails.
    fn deep_flush(&self, region: u32) -> Result<DeepFlushOutcome>;
}

/// [`DeviceTopology`] backed by sysfs.
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsTopology {
    /// Topology rooted at `/sys`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(DEFAULT_SYSFS_ROOT)
    }

    /// Topology rooted at `root` instead of `/sys`.
    #[must_use]
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Sysfs root in use.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn char_dev_dir(&self, dev: DeviceId) -> PathBuf {
        self.root.join("dev/char").join(dev.to_string())
    }

    /// Path of the region-id attribute of `dev`.
    #[must_use]
    pub fn region_id_path(&self, dev: DeviceId) -> PathBuf {
        self.char_dev_dir(dev).join("device/dax_region/id")
    }

    /// Path of the deep-flush control file of `region`.
    #[must_use]
    pub fn deep_flush_path(&self, region: u32) -> PathBuf {
        self.root
            .join("bus/nd/devices")
            .join(format!("region{region}"))
            .join("deep_flush")
    }
}

fn read_attr(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| PmemError::Topology {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_attr(path: &Path, raw: &str) -> Result<u64> {
    let value = raw.trim();
    // Some attributes (align) are printed in hex.
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    };
    parsed.ok_or_else(|| PmemError::TopologyValue {
        path: path.to_path_buf(),
        value: value.to_string(),
    })
}

impl DeviceTopology for SysfsTopology {
    fn is_device_dax(&self, dev: DeviceId) -> Result<bool> {
        let link = self.char_dev_dir(dev).join("subsystem");
        let subsystem = match fs::canonicalize(&link) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(PmemError::Topology { path: link, source }),
        };
        let root = match fs::canonicalize(&self.root) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(PmemError::Topology {
                    path: self.root.clone(),
                    source,
                })
            }
        };
        Ok(subsystem == root.join("class/dax") || subsystem == root.join("bus/dax"))
    }

    fn dax_region_id(&self, dev: DeviceId) -> Result<u32> {
        let path = self.region_id_path(dev);
        let raw = read_attr(&path)?;
        let id = parse_attr(&path, &raw)?;
        u32::try_from(id).map_err(|_| PmemError::TopologyValue {
            path,
            value: raw.trim().to_string(),
        })
    }

    fn dax_size(&self, dev: DeviceId) -> Result<u64> {
        let path = self.char_dev_dir(dev).join("size");
        let raw = read_attr(&path)?;
        parse_attr(&path, &raw)
    }

    fn dax_alignment(&self, dev: DeviceId) -> Result<Option<u64>> {
        let path = self.char_dev_dir(dev).join("device/align");
        match fs::read_to_string(&path) {
            Ok(raw) => parse_attr(&path, &raw).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PmemError::Topology { path, source }),
        }
    }

    fn deep_flush(&self, region: u32) -> Result<DeepFlushOutcome> {
        let path = self.deep_flush_path(region);
        let current = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("deep flush unavailable for region {region} ({}): {e}", path.display());
                return Ok(DeepFlushOutcome::Unavailable);
            }
        };
        if current == "0\n" {
            log::debug!("region {region} does not need deep flushing");
            return Ok(DeepFlushOutcome::NotNeeded);
        }

        let mut control = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|source| PmemError::DeepFlushFailed { region, source })?;
        control
            .write_all(b"1")
            .map_err(|source| PmemError::DeepFlushFailed { region, source })?;
        log::trace!("deep flush triggered for region {region}");
        Ok(DeepFlushOutcome::Triggered)
    }
}
