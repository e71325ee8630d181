//! The hardware address-translation interface.
//!
//! The memory manager only ever touches a process's page tables through
//! [`PageDirectory`]. On x86 the MMU sets the accessed and dirty bits behind
//! our back, so every call must be atomic per page.

// Frame numbers and user addresses fit in 32 bits on x86.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::FrameId;
use crate::sync::Mutex;
use alloc::{boxed::Box, collections::BTreeMap};
use arbitrary_int::u20;
use kidneyos_shared::{
    mem::{is_page_aligned, is_user_vaddr},
    paging::{PageTable, PageTableEntry, VirtualAddress},
};

pub trait PageDirectory: Send + Sync {
    /// Maps user page `page` to physical frame `frame`.
    ///
    /// Returns `false` if the mapping could not be installed, e.g. no memory
    /// was left for a page table.
    #[must_use]
    fn map(&self, page: usize, frame: FrameId, writable: bool) -> bool;
    /// Removes the mapping for `page`, if any.
    fn unmap(&self, page: usize);
    /// The frame `page` is mapped to.
    fn translate(&self, page: usize) -> Option<FrameId>;

    fn is_accessed(&self, page: usize) -> bool;
    fn set_accessed(&self, page: usize, accessed: bool);
    fn is_dirty(&self, page: usize) -> bool;
    fn set_dirty(&self, page: usize, dirty: bool);

    /// Reads and clears the accessed bit in one step.
    fn test_and_clear_accessed(&self, page: usize) -> bool {
        let accessed = self.is_accessed(page);
        if accessed {
            self.set_accessed(page, false);
        }
        accessed
    }
}

/// A two-level x86 page table maintained in software.
///
/// Page tables are allocated lazily, one per 4 MB of user address space, up
/// to `table_limit`.
pub struct SoftPageDirectory {
    tables: Mutex<BTreeMap<u16, Box<PageTable>>>,
    table_limit: usize,
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self::with_table_limit(usize::MAX)
    }

    /// A directory that fails to map pages once `limit` page tables exist.
    pub fn with_table_limit(limit: usize) -> Self {
        Self {
            tables: Mutex::new(BTreeMap::new()),
            table_limit: limit,
        }
    }

    /// Number of page tables currently allocated.
    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }

    fn split(page: usize) -> (u16, usize) {
        debug_assert!(is_page_aligned(page), "unaligned page {page:#x}");
        debug_assert!(is_user_vaddr(page), "kernel page {page:#x}");
        let addr = VirtualAddress::from_usize(page);
        (
            addr.page_directory_index().value(),
            addr.page_table_index().value() as usize,
        )
    }

    /// Applies `f` to the present entry for `page`, if there is one.
    fn with_entry<R>(&self, page: usize, f: impl FnOnce(&mut PageTableEntry) -> R) -> Option<R> {
        let (dir, idx) = Self::split(page);
        let mut tables = self.tables.lock();
        let entry = tables.get_mut(&dir)?.get_mut(idx)?;
        if !entry.present() {
            return None;
        }
        Some(f(entry))
    }
}

impl Default for SoftPageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory for SoftPageDirectory {
    fn map(&self, page: usize, frame: FrameId, writable: bool) -> bool {
        let (dir, idx) = Self::split(page);
        let mut tables = self.tables.lock();
        if !tables.contains_key(&dir) {
            if tables.len() >= self.table_limit {
                return false;
            }
            tables.insert(dir, Box::default());
        }
        let Some(table) = tables.get_mut(&dir) else {
            return false;
        };
        debug_assert!(!table[idx].present(), "page {page:#x} already mapped");
        table[idx] = PageTableEntry::user(u20::new(frame.0 as u32), writable);
        true
    }

    fn unmap(&self, page: usize) {
        let (dir, idx) = Self::split(page);
        let mut tables = self.tables.lock();
        let Some(table) = tables.get_mut(&dir) else {
            return;
        };
        table[idx] = PageTableEntry::DEFAULT;
        if table.is_vacant() {
            tables.remove(&dir);
        }
    }

    fn translate(&self, page: usize) -> Option<FrameId> {
        self.with_entry(page, |entry| {
            FrameId(entry.page_frame_address().value() as usize)
        })
    }

    fn is_accessed(&self, page: usize) -> bool {
        self.with_entry(page, |entry| entry.accessed())
            .unwrap_or(false)
    }

    fn set_accessed(&self, page: usize, accessed: bool) {
        self.with_entry(page, |entry| *entry = entry.with_accessed(accessed));
    }

    fn is_dirty(&self, page: usize) -> bool {
        self.with_entry(page, |entry| entry.dirty()).unwrap_or(false)
    }

    fn set_dirty(&self, page: usize, dirty: bool) {
        self.with_entry(page, |entry| *entry = entry.with_dirty(dirty));
    }

    fn test_and_clear_accessed(&self, page: usize) -> bool {
        self.with_entry(page, |entry| {
            let accessed = entry.accessed();
            *entry = entry.with_accessed(false);
            accessed
        })
        .unwrap_or(false)
    }
}
