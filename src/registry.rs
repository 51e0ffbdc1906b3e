//! Process-wide table of live mappings, keyed by base address.
//!
//! Entries hold weak references so the table never keeps a mapping alive.
//! Lookups upgrade under the read lock, which means a lookup either sees a
//! mapping that stays valid for as long as the caller holds the result, or
//! sees nothing.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::granularity::Granularity;
use crate::mmap::{Inner, Mapping};

struct Entry {
    end: usize,
    granularity: Granularity,
    inner: Weak<Inner>,
}

static REGISTRY: RwLock<BTreeMap<usize, Entry>> = parking_lot::const_rwlock(BTreeMap::new());

pub(crate) fn register(inner: &Arc<Inner>) {
    let end = inner.base + inner.content_len;
    let previous = REGISTRY.write().insert(
        inner.base,
        Entry {
            end,
            granularity: inner.granularity,
            inner: Arc::downgrade(inner),
        },
    );
    if previous.is_some() {
        // The OS handed out the address again before the old entry's owner
        // finished dropping; the new mapping wins.
        log::debug!("replaced stale registry entry at {:#x}", inner.base);
    }
}

// Only the entry that still belongs to `owner` is removed.
pub(crate) fn deregister(base: usize, owner: *const Inner) {
    let mut table = REGISTRY.write();
    if table
        .get(&base)
        .is_some_and(|e| std::ptr::eq(e.inner.as_ptr(), owner))
    {
        table.remove(&base);
    }
}

/// Live mapping containing `[addr, addr + len)`, if any.
///
/// A zero-length range matches the mapping containing `addr`.
#[must_use]
pub fn find(addr: *const u8, len: usize) -> Option<Mapping> {
    let addr = addr as usize;
    let table = REGISTRY.read();
    let (_, entry) = table.range(..=addr).next_back()?;
    if addr >= entry.end || addr.checked_add(len)? > entry.end {
        return None;
    }
    entry.inner.upgrade().map(|inner| Mapping { inner })
}

/// Whether every byte of `[addr, addr + len)` lies in registered mappings that
/// persist at finer than page granularity.
///
/// Adjacent mappings may together cover the range. An empty range is never
/// reported as persistent memory.
#[must_use]
pub fn is_pmem(addr: *const u8, len: usize) -> bool {
    if len == 0 {
        return false;
    }
    let mut cursor = addr as usize;
    let Some(end) = cursor.checked_add(len) else {
        return false;
    };
    let table = REGISTRY.read();
    while cursor < end {
        let Some((_, entry)) = table.range(..=cursor).next_back() else {
            return false;
        };
        if cursor >= entry.end {
            return false;
        }
        // No upgrade here: dropping a last reference under the read lock
        // would deadlock in deregister.
        if entry.inner.strong_count() == 0 || entry.granularity == Granularity::Page {
            return false;
        }
        cursor = entry.end;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::platform::Platform;
    use crate::source::Source;
    use std::fs::OpenOptions;

    fn mapped(len: u64) -> (tempfile::NamedTempFile, Mapping) {
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
    fn find_by_interior_address() {
        let (_tmp, map) = mapped(10_000);
        let base = map.address().cast_const();
        let found = find(base.wrapping_add(5000), 100).expect("found");
        assert!(found.ptr_eq(&map));
        assert!(find(base, map.size()).is_some());
        assert!(find(base.wrapping_add(9_999), 2).is_none());
        assert!(find(base.wrapping_add(10_000), 0).is_none());
    }

    #[test]
    fn unmap_removes_entry_but_clones_keep_mapping() {
        let (_tmp, map) = mapped(4096);
        let base = map.address().cast_const();
        let clone = map.clone();
        map.unmap();
        assert!(find(base, 1).is_none());
        let mut b = [0u8; 1];
        clone.read_into(0, &mut b).expect("still mapped");
    }

    #[test]
    fn page_mappings_are_not_pmem() {
        let (_tmp, map) = mapped(4096);
        assert!(!is_pmem(map.address(), 16));
        assert!(!is_pmem(map.address(), 0));
        assert!(!is_pmem(std::ptr::null(), 16));
    }
}
