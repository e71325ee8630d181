use crate::sizes::KB;

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x8000_0000;

/// Rounds `addr` down to the start of its page.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary.
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    page_round_down(addr + PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

/// Returns true if `addr` lies below the kernel split.
#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

/// Returns true if every byte of `[addr, addr + len)` is a user address.
///
/// An empty range is accepted as long as `addr` itself is a user address.
pub const fn is_user_range(addr: usize, len: usize) -> bool {
    match addr.checked_add(len) {
        Some(end) => is_user_vaddr(addr) && end <= OFFSET,
        None => false,
    }
}

/// Iterates over the start address of every page touched by `[addr, addr + len)`.
pub fn pages_in(addr: usize, len: usize) -> impl Iterator<Item = usize> {
    let start = page_round_down(addr);
    let end = if len == 0 { start } else { page_round_up(addr + len) };
    (start..end).step_by(PAGE_FRAME_SIZE)
}
