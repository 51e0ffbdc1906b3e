//! Signal-free access probing.
//!
//! Reading or writing a mapping the process has no permission for raises a
//! protection fault. [`check_access`] asks the kernel to touch the range on our
//! behalf instead, so a fault comes back as `EFAULT` rather than a signal:
//! bytes are pushed from the range into a private pipe (a read), and for a
//! write probe fed back from the pipe into the range. The contents of the
//! range are left unchanged, but the probe is not atomic with respect to
//! other threads writing the same bytes.

use crate::errors::Result;

/// Kind of access to probe for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The range can be loaded from.
    Read,
    /// The range can be loaded from and stored to.
    Write,
}

// Small enough that one write into an empty pipe is never short.
const CHUNK: usize = 4096;

/// Check that `[addr, addr + len)` can be accessed as `access` without faulting.
///
/// # Errors
///
/// Returns `PmemError::AccessFault` if any part of the range would fault and
/// `PmemError::Io` if the probe pipe cannot be created.
pub fn check_access(addr: *const u8, len: usize, access: Access) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    imp::check_access(addr, len, access)
}

mod imp {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use super::{Access, CHUNK};
    use crate::errors::{PmemError, Result};

    struct Pipe {
        read: OwnedFd,
        write: OwnedFd,
    }

    impl Pipe {
        fn new() -> io::Result<Self> {
            let mut fds = [0 as libc::c_int; 2];
            // SAFETY: `fds` has room for the two descriptors pipe(2) returns.
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: both descriptors were just created and are owned by nobody else.
            let (read, write) =
                unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
            Ok(Self { read, write })
        }
    }

    enum Outcome {
        Done(usize),
        Fault,
    }

    fn retry(mut op: impl FnMut() -> libc::ssize_t) -> io::Result<Outcome> {
        loop {
            let n = op();
            if n >= 0 {
                return Ok(Outcome::Done(n.unsigned_abs()));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EFAULT) => return Ok(Outcome::Fault),
                _ => return Err(err),
            }
        }
    }

    pub(super) fn check_access(addr: *const u8, len: usize, access: Access) -> Result<()> {
        let fault = || PmemError::AccessFault { addr: addr as usize, len };
        let pipe = Pipe::new()?;
        let mut scratch = [0u8; CHUNK];
        let mut done = 0;
        while done < len {
            let chunk = (len - done).min(CHUNK);
            let at = addr.wrapping_add(done);

            // The kernel reads the range; EFAULT if it is not readable.
            // SAFETY: write(2) validates the user range itself.
            let pushed = match retry(|| unsafe {
                libc::write(pipe.write.as_raw_fd(), at.cast(), chunk)
            })? {
                Outcome::Done(n) if n == chunk => n,
                _ => return Err(fault()),
            };

            let sink = match access {
                Access::Read => scratch.as_mut_ptr(),
                // Feed the same bytes back; EFAULT if not writable.
                Access::Write => at.cast_mut(),
            };
            // SAFETY: read(2) validates the user range itself; `scratch`
            // holds at least `pushed` bytes.
            match retry(|| unsafe {
                libc::read(pipe.read.as_raw_fd(), sink.cast(), pushed)
            })? {
                Outcome::Done(n) if n == pushed => {}
                _ => return Err(fault()),
            }
            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PmemError;

    #[test]
    fn heap_memory_is_accessible() {
        let mut buf: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let before = buf.clone();
        check_access(buf.as_ptr(), buf.len(), Access::Read).expect("read");
        check_access(buf.as_mut_ptr(), buf.len(), Access::Write).expect("write");
        assert_eq!(buf, before);
        check_access(std::ptr::null(), 0, Access::Write).expect("empty");
    }

    #[test]
    fn null_page_faults() {
        let err = check_access(std::ptr::null(), 8, Access::Read).expect_err("fault");
        assert!(matches!(err, PmemError::AccessFault { addr: 0, len: 8 }));
    }

    #[test]
    fn read_only_literal_rejects_write() {
        static RO: [u8; 16] = [1; 16];
        check_access(RO.as_ptr(), RO.len(), Access::Read).expect("read");
        let err = check_access(RO.as_ptr(), RO.len(), Access::Write).expect_err("write");
        assert!(matches!(err, PmemError::AccessFault { .. }));
    }
}
