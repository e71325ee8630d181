//! A process's view of user memory.
//!
//! Kernel code that touches user buffers goes through [`AddressSpace`]: it
//! faults pages in, keeps them pinned while the kernel copies, and releases
//! them afterwards. Lock order is frame lock, then this space's page table,
//! then everything else.

use super::eviction::FaultContext;
use super::page_table::{FileBacking, PageDescriptor, SupplementalPageTable};
use super::phys::FrameId;
use super::system::VmSystem;
use super::Asid;
use crate::error::{Result, VmError};
use crate::fs::BackingFile;
use crate::paging::PageDirectory;
use crate::sync::Mutex;
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use core::cmp::min;
use kidneyos_shared::mem::{
    is_page_aligned, is_user_range, is_user_vaddr, page_offset, page_round_down, pages_in,
    PAGE_FRAME_SIZE,
};
use log::{debug, warn};
use zerocopy::AsBytes;

/// The parts of an address space that eviction from other spaces needs.
pub struct SpaceShared {
    asid: Asid,
    spt: Mutex<SupplementalPageTable>,
    pagedir: Box<dyn PageDirectory>,
}

impl SpaceShared {
    pub(crate) fn new(asid: Asid, pagedir: Box<dyn PageDirectory>) -> Self {
        Self {
            asid,
            spt: Mutex::new(SupplementalPageTable::new()),
            pagedir,
        }
    }

    pub fn asid(&self) -> Asid {
        self.asid
    }

    pub fn page_table(&self) -> &Mutex<SupplementalPageTable> {
        &self.spt
    }

    pub fn page_directory(&self) -> &dyn PageDirectory {
        &*self.pagedir
    }
}

/// Handle of a file mapping made with [`AddressSpace::mmap`].
pub type MapId = u32;

#[derive(Default)]
struct Mappings {
    next: MapId,
    regions: BTreeMap<MapId, (usize, usize)>,
}

pub struct AddressSpace {
    shared: Arc<SpaceShared>,
    system: Arc<VmSystem>,
    mappings: Mutex<Mappings>,
}

impl AddressSpace {
    pub(crate) fn new(shared: Arc<SpaceShared>, system: Arc<VmSystem>) -> Self {
        Self {
            shared,
            system,
            mappings: Mutex::new(Mappings::default()),
        }
    }

    pub fn asid(&self) -> Asid {
        self.shared.asid
    }

    pub fn page_directory(&self) -> &dyn PageDirectory {
        self.shared.page_directory()
    }

    pub fn system(&self) -> &Arc<VmSystem> {
        &self.system
    }

    fn context(&self) -> FaultContext<'_> {
        FaultContext {
            asid: self.shared.asid,
            pagedir: self.shared.page_directory(),
            swap: self.system.swap(),
            registry: self.system.registry(),
        }
    }

    pub fn install_zero_fill(&self, page: usize) -> Result<()> {
        self.shared.spt.lock().install_zero_fill(page)
    }

    pub fn install_file_backed(&self, page: usize, backing: FileBacking) -> Result<()> {
        self.shared.spt.lock().install_file_backed(page, backing)
    }

    /// The descriptor of the page containing `addr`. Has no side effects.
    pub fn lookup(&self, addr: usize) -> Option<PageDescriptor> {
        self.shared
            .spt
            .lock()
            .lookup(page_round_down(addr))
            .cloned()
    }

    /// A snapshot of every descriptor, ordered by address.
    pub fn pages(&self) -> Vec<PageDescriptor> {
        self.shared.spt.lock().iter().cloned().collect()
    }

    /// Makes the page containing `addr` resident and returns its frame
    /// pinned. The caller must unpin it.
    pub fn fault_in(&self, addr: usize) -> Result<FrameId> {
        if !is_user_vaddr(addr) {
            return Err(VmError::BadAddress);
        }
        let page = page_round_down(addr);
        let mut frames = self.system.frames().lock();
        let mut spt = self.shared.spt.lock();
        spt.fault_in(page, &mut frames, self.context())
    }

    /// Resolves a page fault on `addr` taken by the process itself.
    pub fn handle_fault(&self, addr: usize) -> Result<()> {
        let frame = self.fault_in(addr)?;
        self.release_pin(page_round_down(addr), frame, None);
        Ok(())
    }

    /// Faults in and pins every page of `[addr, addr + len)`.
    ///
    /// On failure the pages pinned so far are released. The range must not
    /// need more frames than the pool holds.
    pub fn pin_range(&self, addr: usize, len: usize) -> Result<()> {
        if !is_user_range(addr, len) {
            return Err(VmError::BadAddress);
        }
        let mut pinned = Vec::new();
        for page in pages_in(addr, len) {
            match self.fault_in(page) {
                Ok(frame) => pinned.push((page, frame)),
                Err(err) => {
                    for (page, frame) in pinned {
                        self.release_pin(page, frame, None);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Releases one pin on every resident page of `[addr, addr + len)`.
    pub fn unpin_range(&self, addr: usize, len: usize) -> Result<()> {
        if !is_user_range(addr, len) {
            return Err(VmError::BadAddress);
        }
        let mut frames = self.system.frames().lock();
        let spt = self.shared.spt.lock();
        for page in pages_in(addr, len) {
            if let Some(frame) = spt.lookup(page).and_then(PageDescriptor::frame) {
                frames.unpin(frame);
            }
        }
        Ok(())
    }

    /// Drops the pin taken by [`Self::fault_in`] on `page`, recording a
    /// kernel read or write if `access` says so. Nothing happens unless
    /// `page` still lives in `frame`.
    fn release_pin(&self, page: usize, frame: FrameId, access: Option<bool>) {
        let mut frames = self.system.frames().lock();
        let spt = self.shared.spt.lock();
        if spt.lookup(page).and_then(PageDescriptor::frame) != Some(frame) {
            return;
        }
        if let Some(write) = access {
            frames.mark_accessed(frame, write);
        }
        frames.unpin(frame);
    }

    /// Runs `f` on each page-sized piece of `[addr, addr + len)` with the
    /// piece's frame resident and pinned.
    fn for_each_chunk(
        &self,
        addr: usize,
        len: usize,
        write: bool,
        mut f: impl FnMut(FrameId, usize, usize),
    ) -> Result<()> {
        if !is_user_range(addr, len) {
            return Err(VmError::BadAddress);
        }
        let end = addr + len;
        let mut pos = addr;
        while pos < end {
            let offset = page_offset(pos);
            let chunk = min(PAGE_FRAME_SIZE - offset, end - pos);
            let frame = self.fault_in(pos)?;
            f(frame, offset, chunk);
            self.release_pin(page_round_down(pos), frame, Some(write));
            pos += chunk;
        }
        Ok(())
    }

    /// Copies `len` bytes of user memory at `addr` into a kernel buffer.
    pub fn copy_from_user(&self, addr: usize, len: usize) -> Result<Vec<u8>> {
        let memory = self.system.frames().memory();
        let mut out = Vec::with_capacity(len);
        self.for_each_chunk(addr, len, false, |frame, offset, chunk| {
            let data = memory.frame(frame);
            out.extend_from_slice(&data.as_bytes()[offset..offset + chunk]);
        })?;
        Ok(out)
    }

    /// Copies `data` into user memory at `addr`.
    pub fn copy_to_user(&self, addr: usize, data: &[u8]) -> Result<()> {
        let memory = self.system.frames().memory();
        let mut copied = 0;
        self.for_each_chunk(addr, data.len(), true, |frame, offset, chunk| {
            let mut page = memory.frame(frame);
            page.as_bytes_mut()[offset..offset + chunk]
                .copy_from_slice(&data[copied..copied + chunk]);
            copied += chunk;
        })
    }

    /// Maps `length` bytes of `file` starting at `offset` at user address
    /// `addr`. Bytes past `length` or past the end of the file read as
    /// zeroes and are never written back.
    pub fn mmap(
        &self,
        addr: usize,
        file: Arc<dyn BackingFile>,
        offset: usize,
        length: usize,
    ) -> Result<MapId> {
        if length == 0
            || !is_page_aligned(addr)
            || !is_page_aligned(offset)
            || !is_user_range(addr, length)
            || offset.checked_add(length).is_none()
        {
            return Err(VmError::BadAddress);
        }

        let file_len = file.len();
        {
            let mut spt = self.shared.spt.lock();
            if !spt.is_range_free(addr, length) {
                return Err(VmError::AlreadyMapped);
            }
            for (i, page) in pages_in(addr, length).enumerate() {
                let start = i * PAGE_FRAME_SIZE;
                let file_offset = offset + start;
                let backed = min(PAGE_FRAME_SIZE, length - start)
                    .min(file_len.saturating_sub(file_offset));
                let backing = FileBacking::new(Arc::clone(&file), file_offset, backed);
                spt.install_file_backed(page, backing)?;
            }
        }

        let mut mappings = self.mappings.lock();
        let id = mappings.next;
        mappings.next += 1;
        mappings.regions.insert(id, (addr, length));
        debug!(
            "space {}: mapping {id} at {addr:#x}, {length} bytes",
            self.asid()
        );
        Ok(id)
    }

    /// Removes mapping `id`, writing dirty pages back to the file.
    ///
    /// The mapping stays in place if one of its pages is pinned.
    pub fn munmap(&self, id: MapId) -> Result<()> {
        let region = self.mappings.lock().regions.get(&id).copied();
        let (addr, length) = region.ok_or(VmError::NotMapped)?;
        match self.unmap_range(addr, length) {
            Err(VmError::Busy) => Err(VmError::Busy),
            result => {
                self.mappings.lock().regions.remove(&id);
                result
            }
        }
    }

    /// Drops every page of `[start, start + length)`. Fails with
    /// [`VmError::Busy`], releasing nothing, while any of them is pinned.
    pub fn unmap_range(&self, start: usize, length: usize) -> Result<()> {
        let mut frames = self.system.frames().lock();
        let mut spt = self.shared.spt.lock();
        spt.unmap_range(
            start,
            length,
            &mut frames,
            self.system.swap(),
            self.page_directory(),
        )
    }

    /// Tears down the address space. Dirty file pages are written back and
    /// every frame and swap slot it holds is released.
    pub fn destroy(self) {
        drop(self);
    }

    fn teardown(&self) {
        {
            let mut frames = self.system.frames().lock();
            let mut spt = self.shared.spt.lock();
            let pages = spt.len();
            spt.destroy(&mut frames, self.system.swap(), self.page_directory());
            debug!("destroyed address space {}: {pages} pages", self.asid());
        }
        if self.system.registry().remove(self.asid()).is_none() {
            warn!("address space {} was not registered", self.asid());
        }
        self.mappings.lock().regions.clear();
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("asid", &self.asid())
            .finish_non_exhaustive()
    }
}

