//! Utility helpers for alignment, page size, and safe range calculations.

use crate::errors::{PmemError, Result};

/// Get the system page size in bytes.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE is safe to call.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    // Page size should always be positive and fit in usize
    page_size.max(0) as usize
}

/// Align a value up to the nearest multiple of `alignment`.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    // Fast path for power-of-2 alignments (common case for page sizes)
    if alignment.is_power_of_two() {
        let mask = alignment - 1;
        (value + mask) & !mask
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Align an address down to a multiple of `alignment` (which must be a power of two).
#[must_use]
pub fn align_down(addr: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    addr & !(alignment - 1)
}

/// Ensure the requested [offset, offset+len) range is within [0, total).
/// Returns `Ok(())` if valid; otherwise an `OutOfBounds` error.
///
/// # Errors
///
/// Returns `PmemError::OutOfBounds` if the range exceeds bounds.
pub fn ensure_in_bounds(offset: u64, len: u64, total: u64) -> Result<()> {
    if offset > total {
        return Err(PmemError::OutOfBounds { offset, len, total });
    }
    let end = offset.saturating_add(len);
    if end > total {
        return Err(PmemError::OutOfBounds { offset, len, total });
    }
    Ok(())
}

/// Validate [offset, offset+len) against `total` and return it as a `start..end` pair.
///
/// # Errors
///
/// Returns `PmemError::OutOfBounds` if the requested range exceeds the total length.
pub fn slice_range(offset: usize, len: usize, total: usize) -> Result<(usize, usize)> {
    ensure_in_bounds(offset as u64, len as u64, total as u64)?;
    Ok((offset, offset + len))
}
