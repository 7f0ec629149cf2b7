//! Page geometry for IOMMU translations
//!
//! Every address and length handed to a domain is checked against the
//! 4KB translation granule before anything is recorded.

/// Page size (4KB)
pub const PAGE_SIZE: u64 = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

/// Helper to calculate number of pages needed
pub fn pages_needed(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE)
}

/// Helper to align address down to page boundary
pub fn align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Helper to check if address is page-aligned
pub fn is_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

/// Last byte of `[start, start + length)`
///
/// `None` for an empty range or one that runs past the top of the address
/// space. A range whose exclusive end is exactly 2^64 is valid.
pub fn range_last(start: u64, length: u64) -> Option<u64> {
    start.checked_add(length.checked_sub(1)?)
}

/// Check whether two half-open ranges intersect
///
/// Compared on inclusive last bytes so the top page is handled exactly.
/// Empty ranges intersect nothing.
pub fn ranges_overlap(a_start: u64, a_len: u64, b_start: u64, b_len: u64) -> bool {
    if a_len == 0 || b_len == 0 {
        return false;
    }
    let a_last = a_start.saturating_add(a_len - 1);
    let b_last = b_start.saturating_add(b_len - 1);
    a_start <= b_last && b_start <= a_last
}
