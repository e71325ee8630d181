//! The supplemental page table.
//!
//! The hardware page table only knows about resident pages. For every user
//! page of an address space, this table records where its contents live
//! when it is not resident and how to bring it back.
//!
//! A page starts out as [`PageState::ZeroFill`] or [`PageState::FileBacked`]
//! when it is installed. The first fault makes it [`PageState::Resident`].
//! Eviction sends anonymous pages to swap ([`PageState::Swapped`]) and file
//! pages back to [`PageState::FileBacked`]; the next fault brings them back.
//!
//! Every method that touches frames takes a [`FrameLock`], so the frame lock
//! is always acquired before the lock around this table.

use super::eviction::{FaultContext, Pager};
use super::frame_table::FrameLock;
use super::phys::{FrameId, PageFrame};
use super::swap::{SwapSlot, SwapTable};
use crate::block::BlockError;
use crate::error::{Result, VmError};
use crate::fs::BackingFile;
use crate::paging::PageDirectory;
use alloc::{collections::BTreeMap, sync::Arc};
use core::fmt;
use kidneyos_shared::mem::{
    is_page_aligned, is_user_range, is_user_vaddr, pages_in, PAGE_FRAME_SIZE,
};
use log::{trace, warn};
use zerocopy::AsBytes;

/// The part of a file that holds one page.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn BackingFile>,
    /// Byte offset of the page within the file.
    pub offset: usize,
    /// Bytes of the page that come from the file. The rest of the page is
    /// zero when loaded and never written back.
    pub length: usize,
}

impl FileBacking {
    pub fn new(file: Arc<dyn BackingFile>, offset: usize, length: usize) -> Self {
        assert!(
            length <= PAGE_FRAME_SIZE,
            "file page of {length} bytes exceeds a page"
        );
        Self {
            file,
            offset,
            length,
        }
    }

    /// Reads the file's bytes into a zeroed `page`.
    fn load(&self, page: &mut PageFrame) -> Result<()> {
        if self.length == 0 {
            return Ok(());
        }
        let read = self
            .file
            .read_at(self.offset, &mut page.as_bytes_mut()[..self.length])?;
        if read < self.length {
            trace!(
                "short read at file offset {}: {read} of {} bytes",
                self.offset,
                self.length
            );
        }
        Ok(())
    }

    fn write_back(&self, page: &PageFrame) -> Result<()> {
        if self.length == 0 {
            return Ok(());
        }
        let written = self
            .file
            .write_at(self.offset, &page.as_bytes()[..self.length])?;
        if written != self.length {
            return Err(VmError::Block(BlockError::WriteError));
        }
        Ok(())
    }
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub enum PageState {
    /// Not yet touched; materializes as a page of zeroes.
    ZeroFill,
    /// In memory. File pages keep their backing so eviction can write them
    /// back.
    Resident {
        frame: FrameId,
        backing: Option<FileBacking>,
    },
    /// An anonymous page parked in swap.
    Swapped { slot: SwapSlot },
    /// A file page that is not in memory.
    FileBacked(FileBacking),
}

#[derive(Clone, Debug)]
pub struct PageDescriptor {
    pub page: usize,
    pub state: PageState,
    /// Set when a resident page is found modified on eviction.
    pub dirty: bool,
}

impl PageDescriptor {
    pub fn frame(&self) -> Option<FrameId> {
        match self.state {
            PageState::Resident { frame, .. } => Some(frame),
            _ => None,
        }
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.state {
            PageState::Swapped { slot } => Some(slot),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<usize, PageDescriptor>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageDescriptor> {
        self.entries.values()
    }

    /// Registers `page` to be zero-filled on first touch.
    pub fn install_zero_fill(&mut self, page: usize) -> Result<()> {
        self.install(page, PageState::ZeroFill)
    }

    /// Registers `page` to be read from `backing` on first touch.
    pub fn install_file_backed(&mut self, page: usize, backing: FileBacking) -> Result<()> {
        self.install(page, PageState::FileBacked(backing))
    }

    fn install(&mut self, page: usize, state: PageState) -> Result<()> {
        if !is_page_aligned(page) || !is_user_vaddr(page) {
            return Err(VmError::BadAddress);
        }
        if self.entries.contains_key(&page) {
            return Err(VmError::AlreadyMapped);
        }
        trace!("installed page {page:#x} as {state:?}");
        self.entries.insert(
            page,
            PageDescriptor {
                page,
                state,
                dirty: false,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, page: usize) -> Option<&PageDescriptor> {
        self.entries.get(&page)
    }

    /// Returns true if no page of `[start, start + len)` has a descriptor.
    pub fn is_range_free(&self, start: usize, len: usize) -> bool {
        pages_in(start, len).all(|page| !self.entries.contains_key(&page))
    }

    fn descriptor_mut(&mut self, page: usize) -> &mut PageDescriptor {
        self.entries
            .get_mut(&page)
            .unwrap_or_else(|| panic!("no descriptor for page {page:#x}"))
    }

    /// Makes `page` resident and returns its frame, pinned.
    ///
    /// If the page must be loaded, a frame is allocated (evicting some page,
    /// possibly of another address space), filled, and mapped. When any of
    /// that fails the new frame is released and the descriptor is left as it
    /// was.
    pub fn fault_in(
        &mut self,
        page: usize,
        frames: &mut FrameLock<'_>,
        cx: FaultContext<'_>,
    ) -> Result<FrameId> {
        debug_assert!(is_page_aligned(page));
        let state = match self.entries.get(&page) {
            Some(desc) => desc.state.clone(),
            None => return Err(VmError::NotMapped),
        };

        let backing = match &state {
            PageState::Resident { frame, .. } => {
                frames.pin(*frame);
                return Ok(*frame);
            }
            PageState::FileBacked(backing) => Some(backing.clone()),
            PageState::ZeroFill | PageState::Swapped { .. } => None,
        };

        // A swapped page is overwritten in full by the read.
        let zero_fill = !matches!(state, PageState::Swapped { .. });
        let frame = frames.allocate(cx.asid, page, zero_fill, &mut Pager::new(self, cx))?;

        let loaded = {
            let mut data = frames.memory().frame(frame);
            match &state {
                PageState::Swapped { slot } => cx.swap.read(*slot, &mut data),
                PageState::FileBacked(backing) => backing.load(&mut data),
                PageState::ZeroFill | PageState::Resident { .. } => Ok(()),
            }
        };
        if let Err(err) = loaded {
            warn!("could not load page {page:#x} of space {}: {err}", cx.asid);
            frames.free(frame);
            return Err(err);
        }

        if !cx.pagedir.map(page, frame, true) {
            warn!("could not map page {page:#x} of space {}", cx.asid);
            frames.free(frame);
            return Err(VmError::MappingFailed);
        }

        // The slot is only given up once the page is safely mapped.
        if let PageState::Swapped { slot } = state {
            cx.swap.free_slot(slot);
        }
        frames.pin(frame);

        let desc = self.descriptor_mut(page);
        desc.state = PageState::Resident { frame, backing };
        desc.dirty = false;
        trace!("page {page:#x} of space {} resident in {frame}", cx.asid);
        Ok(frame)
    }

    /// Moves resident `page` out of memory and frees its frame.
    ///
    /// Anonymous pages go to a fresh swap slot. File pages are written back
    /// only if dirty. The mapping is cleared before the frame is freed so no
    /// one can see a freed frame still mapped.
    pub fn evict(
        &mut self,
        page: usize,
        frames: &mut FrameLock<'_>,
        swap: &SwapTable,
        pagedir: &dyn PageDirectory,
    ) -> Result<()> {
        let desc = self.descriptor_mut(page);
        let PageState::Resident { frame, backing } = &desc.state else {
            panic!("evicting page {page:#x}, which is not resident");
        };
        let (frame, backing) = (*frame, backing.clone());
        desc.dirty |= pagedir.is_dirty(page) || frames.is_dirty(frame);

        let next = match backing {
            None => {
                let slot = swap.allocate_slot()?;
                if let Err(err) = swap.write(slot, &frames.memory().frame(frame)) {
                    swap.free_slot(slot);
                    return Err(err);
                }
                PageState::Swapped { slot }
            }
            Some(backing) => {
                if desc.dirty {
                    backing.write_back(&frames.memory().frame(frame))?;
                }
                PageState::FileBacked(backing)
            }
        };
        trace!("page {page:#x} evicted from {frame} to {next:?}");

        desc.state = next;
        pagedir.unmap(page);
        frames.free(frame);
        desc.dirty = false;
        Ok(())
    }

    /// Drops every descriptor in `[start, start + length)`.
    ///
    /// Dirty file pages are written back first; nothing is sent to swap.
    /// Every covered page is released even if a write-back fails, in which
    /// case the first error is returned. Backing files stay open.
    ///
    /// Nothing is released if any covered page is pinned; its frame may be
    /// in the middle of a kernel copy.
    pub fn unmap_range(
        &mut self,
        start: usize,
        length: usize,
        frames: &mut FrameLock<'_>,
        swap: &SwapTable,
        pagedir: &dyn PageDirectory,
    ) -> Result<()> {
        if !is_page_aligned(start) || !is_user_range(start, length) {
            return Err(VmError::BadAddress);
        }
        let pinned = pages_in(start, length)
            .filter_map(|page| self.entries.get(&page).and_then(PageDescriptor::frame))
            .any(|frame| frames.is_pinned(frame));
        if pinned {
            return Err(VmError::Busy);
        }

        let mut result = Ok(());
        for page in pages_in(start, length) {
            let Some(desc) = self.entries.remove(&page) else {
                continue;
            };
            let released = Self::release(desc, frames, swap, pagedir);
            if result.is_ok() {
                result = released;
            }
        }
        result
    }

    /// Drops every descriptor, releasing frames and swap slots.
    pub fn destroy(
        &mut self,
        frames: &mut FrameLock<'_>,
        swap: &SwapTable,
        pagedir: &dyn PageDirectory,
    ) {
        for desc in core::mem::take(&mut self.entries).into_values() {
            let page = desc.page;
            if let Err(err) = Self::release(desc, frames, swap, pagedir) {
                warn!("lost write-back of page {page:#x}: {err}");
            }
        }
    }

    fn release(
        desc: PageDescriptor,
        frames: &mut FrameLock<'_>,
        swap: &SwapTable,
        pagedir: &dyn PageDirectory,
    ) -> Result<()> {
        let page = desc.page;
        match desc.state {
            PageState::Resident { frame, backing } => {
                let dirty = desc.dirty || pagedir.is_dirty(page) || frames.is_dirty(frame);
                let flushed = match backing {
                    Some(backing) if dirty => backing.write_back(&frames.memory().frame(frame)),
                    _ => Ok(()),
                };
                pagedir.unmap(page);
                frames.free(frame);
                flushed
            }
            PageState::Swapped { slot } => {
                swap.free_slot(slot);
                Ok(())
            }
            PageState::ZeroFill | PageState::FileBacked(_) => Ok(()),
        }
    }
}
