//! Shared helpers for integration tests: scratch files, a counting
//! `PersistOps` and a topology that reports every regular file as device DAX.
#![allow(dead_code)]

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use pmem_map::{
    DeepFlushOutcome, DeviceId, DeviceTopology, MediaDescriptor, MediaKind, NativeOps,
    PersistOps, Platform, PmemError, Result, Source,
};

pub fn tmp_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("pmem_map_test_{}_{}", name, std::process::id()));
    p
}

/// Create (or truncate) `path` with `len` zero bytes and open it read-write.
pub fn create_rw(path: &Path, len: u64) -> File {
    let _ = fs::remove_file(path);
    let f = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(path)
        .expect("create");
    f.set_len(len).expect("set_len");
    f
}

/// Real primitives, with every call counted.
#[derive(Debug, Default)]
pub struct CountingOps {
    native: NativeOps,
    flushes: AtomicUsize,
    drains: AtomicUsize,
    syncs: AtomicUsize,
    fail_syncs: AtomicBool,
}

impl CountingOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn drains(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Make every later `sync_pages` fail with `EIO`.
    pub fn fail_syncs(&self) {
        self.fail_syncs.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flushes.store(0, Ordering::SeqCst);
        self.drains.store(0, Ordering::SeqCst);
        self.syncs.store(0, Ordering::SeqCst);
    }
}

impl PersistOps for CountingOps {
    fn flush(&self, addr: *const u8, len: usize) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.native.flush(addr, len);
    }

    fn drain(&self) {
        self.drains.fetch_add(1, Ordering::SeqCst);
        self.native.drain();
    }

    fn sync_pages(&self, addr: *const u8, len: usize) -> io::Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        if self.fail_syncs.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.native.sync_pages(addr, len)
    }
}

/// Pretends every regular file is a device DAX namespace in `region`.
#[derive(Debug)]
pub struct FakeDaxTopology {
    pub region: Option<u32>,
    pub outcome: DeepFlushOutcome,
    fail_deep_flush: bool,
    deep_flushes: AtomicUsize,
}

impl FakeDaxTopology {
    pub fn new(region: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            region,
            outcome: DeepFlushOutcome::Triggered,
            fail_deep_flush: false,
            deep_flushes: AtomicUsize::new(0),
        })
    }

    /// Like `new`, but writing the region's trigger fails with `EIO`.
    pub fn failing(region: u32) -> Arc<Self> {
        Arc::new(Self {
            region: Some(region),
            outcome: DeepFlushOutcome::Triggered,
            fail_deep_flush: true,
            deep_flushes: AtomicUsize::new(0),
        })
    }

    pub fn deep_flushes(&self) -> usize {
        self.deep_flushes.load(Ordering::SeqCst)
    }
}

impl DeviceTopology for FakeDaxTopology {
    fn classify(&self, source: &Source<'_>) -> Result<MediaDescriptor> {
        let meta = source.metadata()?;
        Ok(MediaDescriptor {
            kind: MediaKind::DeviceDax,
            region: self.region,
            size: meta.len(),
            alignment: pmem_map::utils::page_size() as u64,
        })
    }

    fn is_device_dax(&self, _dev: DeviceId) -> Result<bool> {
        Ok(true)
    }

    fn dax_region_id(&self, _dev: DeviceId) -> Result<u32> {
        Ok(self.region.unwrap_or(0))
    }

    fn dax_size(&self, _dev: DeviceId) -> Result<u64> {
        Ok(0)
    }

    fn dax_alignment(&self, _dev: DeviceId) -> Result<Option<u64>> {
        Ok(None)
    }

    fn deep_flush(&self, region: u32) -> Result<DeepFlushOutcome> {
        self.deep_flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deep_flush {
            return Err(PmemError::DeepFlushFailed {
                region,
                source: io::Error::from_raw_os_error(libc::EIO),
            });
        }
        Ok(self.outcome)
    }
}

/// Platform with counting primitives over the real sysfs.
pub fn counting_platform(ops: &Arc<CountingOps>) -> Platform {
    Platform::native().with_ops(ops.clone())
}

/// Platform with counting primitives over a fake device DAX topology.
pub fn dax_platform(ops: &Arc<CountingOps>, topology: &Arc<FakeDaxTopology>) -> Platform {
    Platform::new(ops.clone(), topology.clone())
}
