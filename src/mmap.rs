//! Address-space mappings with a durability strategy bound at creation.

use std::fmt;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions, MmapRaw};
use parking_lot::RwLock;

use crate::arch::PersistOps;
use crate::config::{MapConfig, Protection, Sharing};
use crate::errors::{PmemError, Result};
use crate::granularity::{resolve, Granularity};
use crate::persist::Strategy;
use crate::platform::Platform;
use crate::registry;
use crate::source::{AccessMode, MediaKind, Source};
use crate::topology::DeviceTopology;
use crate::utils::{align_up, page_size, slice_range};

pub(crate) struct Inner {
    // Keeps the OS mapping alive; unmapped when dropped.
    pub(crate) map: MapVariant,
    pub(crate) base: usize,
    pub(crate) content_len: usize,
    pub(crate) reserved_len: usize,
    pub(crate) granularity: Granularity,
    pub(crate) strategy: Strategy,
    pub(crate) protection: Protection,
    pub(crate) sharing: Sharing,
    pub(crate) media_kind: MediaKind,
    pub(crate) region: Option<u32>,
    pub(crate) platform: Platform,
    // Taken exclusively by the bound write functions, shared by reads.
    pub(crate) latch: RwLock<()>,
}

// The payloads are never read; holding them keeps the OS mapping alive.
#[allow(dead_code)]
pub(crate) enum MapVariant {
    Shared(MmapRaw),
    /// Copy-on-write; writes never reach the source.
    Private(MmapMut),
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Deregister before the fields drop, so the range is gone from the
        // table before munmap can hand it out again.
        registry::deregister(self.base, self as *const Inner);
        log::debug!(
            "unmapped {:#x}+{} ({})",
            self.base,
            self.reserved_len,
            match self.map {
                MapVariant::Shared(_) => "shared",
                MapVariant::Private(_) => "private",
            }
        );
    }
}

/// An active mapping of (part of) a source.
///
/// The granularity and the bound flush/drain/persist functions are fixed when
/// the mapping is created. Cloning is cheap; the OS mapping is released when
/// the last clone is dropped or passed to [`Mapping::unmap`].
///
/// # Examples
///
/// ```no_run
/// use std::fs::OpenOptions;
/// use pmem_map::{CopyFlags, Granularity, MapConfig, Platform, Source};
///
/// let file = OpenOptions::new().read(true).write(true).open("pool.bin")?;
/// let source = Source::from_file(&file)?;
/// let map = Platform::native().map(&MapConfig::new(Granularity::Page), &source)?;
///
/// map.copy_fn().call(0, b"hello", CopyFlags::empty())?;
/// map.deep_sync_range(0, 5)?;
/// map.unmap();
/// # Ok::<(), pmem_map::PmemError>(())
/// ```
#[derive(Clone)]
pub struct Mapping {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("address", &format_args!("{:#x}", self.inner.base))
            .field("size", &self.inner.content_len)
            .field("granularity", &self.inner.granularity)
            .field("protection", &self.inner.protection)
            .field("sharing", &self.inner.sharing)
            .field("media", &self.inner.media_kind)
            .finish()
    }
}

// Write-only descriptors can never be mapped; a shared writable mapping also
// needs write access. Private mappings only ever need read access.
fn check_access(cfg: &MapConfig, access: AccessMode) -> Result<()> {
    let denied = !access.can_read()
        || (cfg.sharing() == Sharing::Shared
            && cfg.protection().contains(Protection::WRITE)
            && !access.can_write());
    if denied {
        return Err(PmemError::AccessDenied {
            protection: cfg.protection(),
            sharing: cfg.sharing(),
            access,
        });
    }
    Ok(())
}

impl Mapping {
    pub(crate) fn map(cfg: &MapConfig, source: &Source<'_>, platform: &Platform) -> Result<Self> {
        check_access(cfg, source.access())?;

        let media = platform.topology().classify(source)?;
        if media.size == 0 {
            return Err(PmemError::SourceEmpty);
        }
        let offset = cfg.offset();
        if offset % media.alignment != 0 {
            return Err(PmemError::OffsetUnaligned {
                offset,
                alignment: media.alignment,
            });
        }
        let map_range_err = |len: u64| PmemError::MapRange {
            offset,
            len,
            size: media.size,
        };
        let len = if cfg.length() == 0 {
            media.size.checked_sub(offset).filter(|&l| l > 0).ok_or_else(|| map_range_err(0))?
        } else {
            cfg.length() as u64
        };
        if offset.checked_add(len).map_or(true, |end| end > media.size) {
            return Err(map_range_err(len));
        }
        if media.kind == MediaKind::DeviceDax && len % media.alignment != 0 {
            return Err(PmemError::LengthUnaligned {
                len,
                alignment: media.alignment,
            });
        }
        let content_len = usize::try_from(len).map_err(|_| map_range_err(len))?;
        let reserved_len = align_up(len, page_size() as u64) as usize;

        let (map, base) = establish(source, cfg, content_len)?;
        // SAFETY: [base, base + reserved_len) is exactly the mapping memmap2 created.
        let rc = unsafe {
            libc::mprotect(
                base as *mut libc::c_void,
                reserved_len,
                cfg.protection().to_libc(),
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let granularity = resolve(media.kind, cfg.requested_max_granularity());
        let inner = Arc::new(Inner {
            map,
            base,
            content_len,
            reserved_len,
            granularity,
            strategy: Strategy::for_granularity(granularity),
            protection: cfg.protection(),
            sharing: cfg.sharing(),
            media_kind: media.kind,
            region: media.region,
            platform: platform.clone(),
            latch: RwLock::new(()),
        });
        registry::register(&inner);
        log::debug!(
            "mapped {:?} at {base:#x}+{content_len} (offset {offset}) with {granularity} granularity",
            media.kind
        );
        Ok(Self { inner })
    }

    /// Release this handle and remove the mapping from the lookup table.
    ///
    /// The OS mapping goes away once no other clone of this handle is alive.
    /// Pointers obtained from [`Mapping::address`] must not be used afterwards.
    pub fn unmap(self) {
        registry::deregister(self.inner.base, Arc::as_ptr(&self.inner));
        drop(self);
    }

    /// Base address of the mapping (page aligned).
    #[must_use]
    pub fn address(&self) -> *mut u8 {
        self.inner.base as *mut u8
    }

    /// Content length in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.content_len
    }

    /// Page-aligned length reserved in the address space.
    #[must_use]
    pub fn reserved_len(&self) -> usize {
        self.inner.reserved_len
    }

    /// Effective durability granularity.
    #[must_use]
    pub fn granularity(&self) -> Granularity {
        self.inner.granularity
    }

    /// Page protection.
    #[must_use]
    pub fn protection(&self) -> Protection {
        self.inner.protection
    }

    /// Sharing mode.
    #[must_use]
    pub fn sharing(&self) -> Sharing {
        self.inner.sharing
    }

    /// Kind of medium behind the mapping.
    #[must_use]
    pub fn media_kind(&self) -> MediaKind {
        self.inner.media_kind
    }

    /// DAX region id, for device DAX mappings.
    #[must_use]
    pub fn region_id(&self) -> Option<u32> {
        self.inner.region
    }

    /// Read bytes from the mapping into `buf` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `PmemError::InvalidMode` if the mapping is not readable.
    /// Returns `PmemError::OutOfBounds` if range exceeds the mapping.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if !self.inner.protection.contains(Protection::READ) {
            return Err(PmemError::InvalidMode("mapping is not readable"));
        }
        let (start, _) = slice_range(offset, buf.len(), self.size())?;
        let _guard = self.inner.latch.read();
        // SAFETY: the range was validated against the content length and the
        // pages are readable.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr_at(start), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Whether two handles refer to the same mapping.
    #[must_use]
    pub fn ptr_eq(&self, other: &Mapping) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        (self.inner.base + offset) as *mut u8
    }

    pub(crate) fn base(&self) -> usize {
        self.inner.base
    }

    pub(crate) fn strategy(&self) -> Strategy {
        self.inner.strategy
    }

    pub(crate) fn ops(&self) -> &dyn PersistOps {
        self.inner.platform.ops()
    }

    pub(crate) fn topology(&self) -> &dyn DeviceTopology {
        self.inner.platform.topology()
    }
}

// Create the OS mapping. The final protection is applied by the caller.
fn establish(source: &Source<'_>, cfg: &MapConfig, len: usize) -> Result<(MapVariant, usize)> {
    let mut opts = MmapOptions::new();
    opts.offset(cfg.offset()).len(len);
    let file = source.file();
    match cfg.sharing() {
        Sharing::Shared => {
            let raw = if source.access().can_write() {
                opts.map_raw(file)?
            } else {
                opts.map_raw_read_only(file)?
            };
            let base = raw.as_mut_ptr() as usize;
            Ok((MapVariant::Shared(raw), base))
        }
        Sharing::Private => {
            // SAFETY: the pages are only reached through this crate's bounds-checked
            // functions or raw pointers whose use is the caller's responsibility.
            let mut private = unsafe { opts.map_copy(file)? };
            let base = private.as_mut_ptr() as usize;
            Ok((MapVariant::Private(private), base))
        }
    }
}
