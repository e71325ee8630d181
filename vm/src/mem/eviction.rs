//! Evicting pages on behalf of a faulting address space.
//!
//! The victim picked by the clock may belong to any address space. If it is
//! the faulting one, its page table is already locked by the caller and is
//! reused; otherwise the owner's table is locked here, which is safe because
//! the frame lock is held and every path takes the frame lock first.

use super::frame_table::{Evictor, FrameLock, Victim};
use super::page_table::SupplementalPageTable;
use super::swap::SwapTable;
use super::system::Registry;
use super::Asid;
use crate::error::Result;
use crate::paging::PageDirectory;
use log::trace;

/// What a fault needs besides the faulting page table itself.
#[derive(Clone, Copy)]
pub struct FaultContext<'a> {
    pub asid: Asid,
    pub pagedir: &'a dyn PageDirectory,
    pub swap: &'a SwapTable,
    pub registry: &'a Registry,
}

pub(crate) struct Pager<'a> {
    own: &'a mut SupplementalPageTable,
    cx: FaultContext<'a>,
}

impl<'a> Pager<'a> {
    pub(crate) fn new(own: &'a mut SupplementalPageTable, cx: FaultContext<'a>) -> Self {
        Self { own, cx }
    }
}

impl Evictor for Pager<'_> {
    fn test_and_clear_accessed(&mut self, owner: Asid, page: usize) -> bool {
        if owner == self.cx.asid {
            return self.cx.pagedir.test_and_clear_accessed(page);
        }
        self.cx
            .registry
            .get(owner)
            .unwrap_or_else(|| panic!("frame owned by unknown space {owner}"))
            .page_directory()
            .test_and_clear_accessed(page)
    }

    fn evict(&mut self, frames: &mut FrameLock<'_>, victim: Victim) -> Result<()> {
        if victim.owner == self.cx.asid {
            return self
                .own
                .evict(victim.page, frames, self.cx.swap, self.cx.pagedir);
        }

        let space = self
            .cx
            .registry
            .get(victim.owner)
            .unwrap_or_else(|| panic!("{} owned by unknown space {}", victim.frame, victim.owner));
        trace!(
            "space {} evicting page {:#x} of space {}",
            self.cx.asid,
            victim.page,
            victim.owner
        );
        let mut spt = space.page_table().lock();
        spt.evict(victim.page, frames, self.cx.swap, space.page_directory())
    }
}
