//! Low-level durability primitives: cache-line flush, store fence and OS page sync.
//!
//! [`PersistOps`] is the seam between the mapping logic and the hardware. The
//! native implementation picks the best flush instruction once, at
//! construction; tests substitute an implementation that only counts calls.

use std::fmt;
use std::io;

use crate::utils::{align_down, page_size};

/// Cache-line size assumed by the flush loops.
pub const CACHE_LINE_SIZE: usize = 64;

/// Flush, drain and page-sync primitives.
///
/// All methods must be safe to call concurrently and on overlapping ranges;
/// redundant calls are wasted work, never incorrect.
pub trait PersistOps: Send + Sync + fmt::Debug {
    /// Write back every CPU cache line touching `[addr, addr + len)`.
    ///
    /// `addr` must point into memory mapped at least readable.
    fn flush(&self, addr: *const u8, len: usize);

    /// Store barrier: flushes issued before it are ordered before any later store.
    fn drain(&self);

    /// Ask the OS to write dirty pages covering `[addr, addr + len)` back to
    /// the backing store and wait for completion.
    ///
    /// # Errors
    ///
    /// Returns the OS error of the sync call.
    fn sync_pages(&self, addr: *const u8, len: usize) -> io::Result<()>;
}

/// Cache flush instruction selected for this CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushInstruction {
    /// x86 `clwb`: write back, keep the line cached.
    Clwb,
    /// x86 `clflushopt`: weakly ordered write back and invalidate.
    ClflushOpt,
    /// x86 `clflush`: strongly ordered write back and invalidate.
    Clflush,
    /// Arm `dc cvac`: clean to the point of coherency.
    DcCvac,
    /// No cache maintenance instruction known for this target.
    None,
}

/// [`PersistOps`] using the CPU's own instructions and `msync`.
#[derive(Debug, Clone, Copy)]
pub struct NativeOps {
    instruction: FlushInstruction,
}

impl Default for NativeOps {
    fn default() -> Self {
        Self::detect()
    }
}

impl NativeOps {
    /// Probe the CPU and select its best flush instruction.
    #[must_use]
    pub fn detect() -> Self {
        let instruction = detect_instruction();
        log::debug!("using {instruction:?} for cache flushes");
        Self { instruction }
    }

    /// Instruction in use.
    #[must_use]
    pub fn instruction(&self) -> FlushInstruction {
        self.instruction
    }
}

impl PersistOps for NativeOps {
    fn flush(&self, addr: *const u8, len: usize) {
        if len == 0 {
            return;
        }
        let end = addr as usize + len;
        let mut line = align_down(addr as usize, CACHE_LINE_SIZE);
        while line < end {
            // SAFETY: the line lies within a range the caller guarantees is mapped.
            unsafe { flush_line(self.instruction, line) };
            line += CACHE_LINE_SIZE;
        }
    }

    fn drain(&self) {
        store_fence();
    }

    fn sync_pages(&self, addr: *const u8, len: usize) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        let start = align_down(addr as usize, page_size());
        let len = len + (addr as usize - start);
        loop {
            // SAFETY: msync does not touch memory contents; an unmapped range
            // is reported as ENOMEM.
            let rc = unsafe { libc::msync(start as *mut libc::c_void, len, libc::MS_SYNC) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use std::arch::asm;
        use std::arch::x86_64::{__cpuid, __cpuid_count, _mm_clflush, _mm_sfence};

        const CPUID_7_EBX_CLFLUSHOPT: u32 = 1 << 23;
        const CPUID_7_EBX_CLWB: u32 = 1 << 24;

        #[allow(unused_unsafe)]
        fn detect_instruction() -> FlushInstruction {
            // SAFETY: cpuid is available on every x86_64 processor.
            let max_leaf = unsafe { __cpuid(0) }.eax;
            if max_leaf < 7 {
                return FlushInstruction::Clflush;
            }
            // SAFETY: leaf 7 exists, checked above.
            let ebx = unsafe { __cpuid_count(7, 0) }.ebx;
            if ebx & CPUID_7_EBX_CLWB != 0 {
                FlushInstruction::Clwb
            } else if ebx & CPUID_7_EBX_CLFLUSHOPT != 0 {
                FlushInstruction::ClflushOpt
            } else {
                FlushInstruction::Clflush
            }
        }

        // clwb/clflushopt are emitted as raw bytes so older assemblers accept them.
        unsafe fn flush_line(instruction: FlushInstruction, line: usize) {
            match instruction {
                // clwb [rax]
                FlushInstruction::Clwb => asm!(
                    ".byte 0x66, 0x0f, 0xae, 0x30",
                    in("rax") line,
                    options(nostack, preserves_flags)
                ),
                // clflushopt [rax]
                FlushInstruction::ClflushOpt => asm!(
                    ".byte 0x66, 0x0f, 0xae, 0x38",
                    in("rax") line,
                    options(nostack, preserves_flags)
                ),
                _ => _mm_clflush(line as *const u8),
            }
        }

        #[allow(unused_unsafe)]
        fn store_fence() {
            // SAFETY: sfence has no memory operands.
            unsafe { _mm_sfence() };
        }
    } else if #[cfg(target_arch = "aarch64")] {
        use std::arch::asm;

        fn detect_instruction() -> FlushInstruction {
            FlushInstruction::DcCvac
        }

        unsafe fn flush_line(_instruction: FlushInstruction, line: usize) {
            asm!("dc cvac, {0}", in(reg) line, options(nostack, preserves_flags));
        }

        fn store_fence() {
            // SAFETY: a barrier has no operands.
            unsafe { asm!("dmb ish", options(nostack, preserves_flags)) };
        }
    } else {
        use std::sync::atomic::{compiler_fence, fence, Ordering};

        fn detect_instruction() -> FlushInstruction {
            FlushInstruction::None
        }

        unsafe fn flush_line(_instruction: FlushInstruction, _line: usize) {
            compiler_fence(Ordering::SeqCst);
        }

        fn store_fence() {
            fence(Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_flush_and_drain_on_heap_memory() {
        let ops = NativeOps::detect();
        let buf = vec![7u8; 3 * CACHE_LINE_SIZE + 5];
        // Unaligned start and a tail that spills into another line.
        ops.flush(buf[3..].as_ptr(), buf.len() - 3);
        ops.flush(buf.as_ptr(), 0);
        ops.drain();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x86_picks_a_flush_instruction() {
        let ops = NativeOps::detect();
        assert!(matches!(
            ops.instruction(),
            FlushInstruction::Clwb | FlushInstruction::ClflushOpt | FlushInstruction::Clflush
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sync_pages_rejects_unmapped_range() {
        let ops = NativeOps::detect();
        // Page 0 is never mapped in a user process.
        let err = ops
            .sync_pages(std::ptr::null::<u8>().wrapping_add(16), 16)
            .expect_err("unmapped");
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
        assert!(ops.sync_pages(std::ptr::null(), 0).is_ok());
    }
}
