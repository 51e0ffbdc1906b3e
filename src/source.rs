//! Mapping sources and media classification.
//!
//! A [`Source`] borrows an already-open descriptor; it never opens or closes
//! files itself. [`classify`] inspects the descriptor's metadata and, for
//! character devices, consults a [`DeviceTopology`] to tell device DAX apart
//! from everything else.

use std::fs::{File, Metadata};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileTypeExt, MetadataExt};

use crate::errors::{PmemError, Result};
use crate::topology::{DeviceId, DeviceTopology};
use crate::utils::page_size;

/// How the source descriptor was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Opened for reading only.
    ReadOnly,
    /// Opened for writing only; such descriptors cannot be mapped.
    WriteOnly,
    /// Opened for reading and writing.
    ReadWrite,
}

impl AccessMode {
    /// Whether the descriptor can be read.
    #[must_use]
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    /// Whether the descriptor can be written.
    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

/// Borrowed descriptor to be mapped, together with its access mode.
#[derive(Debug, Clone, Copy)]
pub struct Source<'f> {
    file: &'f File,
    access: AccessMode,
}

impl<'f> Source<'f> {
    /// Wrap an open file, reading its access mode from the descriptor flags.
    ///
    /// # Errors
    ///
    /// Returns `PmemError::Io` if the descriptor flags cannot be read.
    pub fn from_file(file: &'f File) -> Result<Self> {
        use std::os::fd::AsRawFd;

        // SAFETY: F_GETFL only reads the flags of a descriptor we borrow.
        let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let access = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => AccessMode::WriteOnly,
            libc::O_RDWR => AccessMode::ReadWrite,
            _ => AccessMode::ReadOnly,
        };
        Ok(Self { file, access })
    }

    /// Wrap an open file whose access mode the caller already knows.
    #[must_use]
    pub fn with_access(file: &'f File, access: AccessMode) -> Self {
        Self { file, access }
    }

    /// Access mode of the descriptor.
    #[must_use]
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// The borrowed file.
    #[must_use]
    pub fn file(&self) -> &'f File {
        self.file
    }

    /// Metadata of the descriptor.
    ///
    /// # Errors
    ///
    /// Returns `PmemError::Io` if `fstat` fails.
    pub fn metadata(&self) -> Result<Metadata> {
        Ok(self.file.metadata()?)
    }
}

/// Kind of medium behind a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Regular file (possibly on a DAX-capable filesystem, served via the page cache).
    RegularFile,
    /// Block device, served via the page cache.
    BlockDevice,
    /// Character device exposing persistent memory directly.
    DeviceDax,
}

/// Result of classifying a source. Only `kind` and `region` outlive the map call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaDescriptor {
    /// Medium kind.
    pub kind: MediaKind,
    /// DAX region id, present only for [`MediaKind::DeviceDax`].
    pub region: Option<u32>,
    /// Usable size of the source in bytes.
    pub size: u64,
    /// Alignment required for mapping offsets.
    pub alignment: u64,
}

/// Classify `source` using `topology` for device lookups.
///
/// This is the default behaviour of [`DeviceTopology::classify`].
///
/// # Errors
///
/// Returns `PmemError::InvalidFileType` for directories, FIFOs, sockets and
/// character devices that are not device DAX,
/// `PmemError::Io` if metadata cannot be read, and topology errors when a
/// device is DAX but its attributes cannot be read.
pub fn classify<T: DeviceTopology + ?Sized>(
    source: &Source<'_>,
    topology: &T,
) -> Result<MediaDescriptor> {
    let meta = source.metadata()?;
    let ft = meta.file_type();
    let page = page_size() as u64;

    if ft.is_file() {
        return Ok(MediaDescriptor {
            kind: MediaKind::RegularFile,
            region: None,
            size: meta.len(),
            alignment: page,
        });
    }

    if ft.is_block_device() {
        return Ok(MediaDescriptor {
            kind: MediaKind::BlockDevice,
            region: None,
            size: device_size(source.file())?,
            alignment: page,
        });
    }

    if ft.is_char_device() {
        let dev = DeviceId::from_rdev(meta.rdev());
        if topology.is_device_dax(dev)? {
            let region = topology.dax_region_id(dev)?;
            let size = topology.dax_size(dev)?;
            let alignment = topology
                .dax_alignment(dev)?
                .filter(|&a| a > 0)
                .unwrap_or(page);
            log::debug!("{dev} is device DAX in region {region}, size {size}, align {alignment}");
            return Ok(MediaDescriptor {
                kind: MediaKind::DeviceDax,
                region: Some(region),
                size,
                alignment,
            });
        }
        log::debug!("character device {dev} is not device DAX");
        return Err(PmemError::InvalidFileType("character device is not device DAX"));
    }

    if ft.is_dir() {
        return Err(PmemError::InvalidFileType("directory"));
    }
    Err(PmemError::InvalidFileType("neither a regular file nor a device"))
}

// Size of a block device; the descriptor's file position is restored afterwards.
fn device_size(file: &File) -> Result<u64> {
    let mut f = file;
    let pos = f.stream_position()?;
    let end = f.seek(SeekFrom::End(0))?;
    f.seek(SeekFrom::Start(pos))?;
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::SysfsTopology;
    use std::fs::OpenOptions;

    #[test]
    fn access_mode_from_descriptor() {
        let tmp = tempfile::NamedTempFile::new().expect("tmp");
        let ro = File::open(tmp.path()).expect("open ro");
        assert_eq!(Source::from_file(&ro).expect("src").access(), AccessMode::ReadOnly);

        let rw = OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .expect("open rw");
        assert_eq!(Source::from_file(&rw).expect("src").access(), AccessMode::ReadWrite);

        let wo = OpenOptions::new().write(true).open(tmp.path()).expect("open wo");
        let access = Source::from_file(&wo).expect("src").access();
        assert_eq!(access, AccessMode::WriteOnly);
        assert!(!access.can_read());
    }

    #[test]
    fn regular_file_classification() {
        let tmp = tempfile::NamedTempFile::new().expect("tmp");
        tmp.as_file().set_len(12_288).expect("set_len");
        let src = Source::from_file(tmp.as_file()).expect("src");
        let media = classify(&src, &SysfsTopology::new()).expect("classify");
        assert_eq!(media.kind, MediaKind::RegularFile);
        assert_eq!(media.region, None);
        assert_eq!(media.size, 12_288);
        assert_eq!(media.alignment, page_size() as u64);
    }

    #[test]
    fn directory_is_rejected() {
        let dir = tempfile::tempdir().expect("dir");
        let f = File::open(dir.path()).expect("open dir");
        let src = Source::with_access(&f, AccessMode::ReadOnly);
        let err = classify(&src, &SysfsTopology::new()).expect_err("dir");
        assert!(matches!(err, PmemError::InvalidFileType(_)));
    }

    #[test]
    fn non_dax_char_device_is_rejected() {
        // /dev/zero has no DAX subsystem link under an empty sysfs root.
        let Ok(f) = File::open("/dev/zero") else { return };
        let root = tempfile::tempdir().expect("root");
        let src = Source::with_access(&f, AccessMode::ReadOnly);
        let err = classify(&src, &SysfsTopology::with_root(root.path())).expect_err("classify");
        assert!(matches!(
            err,
            PmemError::InvalidFileType("character device is not device DAX")
        ));
    }
}
