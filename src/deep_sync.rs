//! Deep sync: push a range all the way into the platform's power-fail domain.
//!
//! For page- and cache-line-granularity mappings the OS page sync already
//! reaches the media. Byte-granularity (device DAX) mappings are persisted
//! with cache flushes and then the region's write-pending queues are forced
//! out through the topology's deep-flush trigger.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::{PmemError, Result};
use crate::mmap::Mapping;
use crate::persist::Strategy;
use crate::registry;
use crate::topology::DeepFlushOutcome;
use crate::utils::slice_range;

static REGION_LOCKS: Mutex<BTreeMap<u32, Arc<Mutex<()>>>> =
    parking_lot::const_mutex(BTreeMap::new());

fn region_lock(region: u32) -> Arc<Mutex<()>> {
    REGION_LOCKS.lock().entry(region).or_default().clone()
}

fn check_range(map: &Mapping, addr: usize, len: usize) -> Result<()> {
    let start = map.base();
    let end = start + map.size();
    let beyond = addr < start || addr >= end || addr.checked_add(len).map_or(true, |e| e > end);
    if beyond {
        return Err(PmemError::RangeBeyondMapping {
            addr,
            len,
            start,
            end,
        });
    }
    Ok(())
}

/// Deep-sync `[addr, addr + len)` of `map`.
///
/// # Errors
///
/// Returns `PmemError::RangeBeyondMapping` if the range is not inside the
/// mapping (checked before anything is flushed), `PmemError::SyncFailed` if
/// the OS page sync fails, and `PmemError::DeepFlushFailed` if the region
/// trigger cannot be written.
pub fn deep_sync(map: &Mapping, addr: *const u8, len: usize) -> Result<()> {
    check_range(map, addr as usize, len)?;
    match map.strategy() {
        Strategy::Page | Strategy::CacheLine => {
            log::debug!("deep sync {addr:p}+{len}: page sync");
            map.ops().sync_pages(addr, len).map_err(PmemError::SyncFailed)
        }
        Strategy::Byte => {
            map.persist_raw(addr, len)?;
            let Some(region) = map.region_id() else {
                log::debug!("deep sync {addr:p}+{len}: no region, persist only");
                return Ok(());
            };
            let lock = region_lock(region);
            let _guard = lock.lock();
            match map.topology().deep_flush(region)? {
                DeepFlushOutcome::Triggered => {
                    log::debug!("deep sync {addr:p}+{len}: region {region} flushed");
                }
                DeepFlushOutcome::NotNeeded | DeepFlushOutcome::Unavailable => {}
            }
            Ok(())
        }
    }
}

/// Deep-sync a raw range, looking up the mapping that contains it.
///
/// # Errors
///
/// Returns `PmemError::RangeBeyondMapping` with a zero mapping range if no
/// live mapping contains the whole range; otherwise as [`deep_sync`].
pub fn deep_sync_at(addr: *const u8, len: usize) -> Result<()> {
    let Some(map) = registry::find(addr, len) else {
        return Err(PmemError::RangeBeyondMapping {
            addr: addr as usize,
            len,
            start: 0,
            end: 0,
        });
    };
    deep_sync(&map, addr, len)
}

impl Mapping {
    /// Deep-sync `[addr, addr + len)`, where `addr` points into this mapping.
    ///
    /// # Errors
    ///
    /// See [`deep_sync`].
    pub fn deep_sync(&self, addr: *const u8, len: usize) -> Result<()> {
        deep_sync(self, addr, len)
    }

    /// Deep-sync `[offset, offset + len)` of this mapping.
    ///
    /// # Errors
    ///
    /// Returns `PmemError::OutOfBounds` for a range outside the mapping,
    /// otherwise as [`deep_sync`].
    pub fn deep_sync_range(&self, offset: usize, len: usize) -> Result<()> {
        let (start, _) = slice_range(offset, len, self.size())?;
        deep_sync(self, self.ptr_at(start), len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::granularity::Granularity;
    use crate::platform::Platform;
    use crate::source::Source;
    use std::fs::OpenOptions;

    fn page_map(len: u64) -> (tempfile::NamedTempFile, Mapping) {
        let tmp = tempfile::NamedTempFile::new().expect("tmp");
        tmp.as_file().set_len(len).expect("set_len");
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .expect("open");
        let map = Platform::native()
            .map(&MapConfig::new(Granularity::Page), &Source::from_file(&f).expect("src"))
            .expect("map");
        (tmp, map)
    }

    #[test]
    fn range_check_matches_mapping_bounds() {
        let (_tmp, map) = page_map(8192);
        let base = map.base();
        assert!(check_range(&map, base, 8192).is_ok());
        assert!(check_range(&map, base + 8191, 1).is_ok());
        assert!(check_range(&map, base + 100, 0).is_ok());
        assert!(check_range(&map, base - 1, 1).is_err());
        assert!(check_range(&map, base + 8192, 0).is_err());
        assert!(check_range(&map, base + 8000, 193).is_err());
        assert!(check_range(&map, usize::MAX, 2).is_err());
    }

    #[test]
    fn deep_sync_by_offset_and_address() {
        let (_tmp, map) = page_map(8192);
        map.deep_sync_range(0, 8192).expect("range");
        assert!(matches!(
            map.deep_sync_range(8000, 500),
            Err(PmemError::OutOfBounds { .. })
        ));
        deep_sync_at(map.address().cast_const(), 10).expect("lookup");
        assert!(matches!(
            deep_sync_at(std::ptr::null(), 1),
            Err(PmemError::RangeBeyondMapping { start: 0, end: 0, .. })
        ));
    }

    #[test]
    fn one_lock_per_region() {
        let a = region_lock(7);
        let b = region_lock(7);
        let c = region_lock(8);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
