//! The global frame table.
//!
//! Every frame of the user pool is either free or owned by exactly one user
//! page. The table remembers that owner so that, when the pool runs dry, a
//! victim can be pushed out of whichever address space it belongs to.

use super::phys::{FrameId, PhysicalMemory};
use super::Asid;
use crate::error::Result;
use crate::sync::{Mutex, MutexGuard};
use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use core::fmt;
use log::{debug, trace};
use zerocopy::FromZeroes;

/// Accessed and dirty bits of the frame's kernel alias.
///
/// Kernel copies into or out of a pinned frame go through the kernel's own
/// mapping of it, so the user page table never sees them.
#[bitfield(u8, default = 0)]
pub struct FrameFlags {
    #[bit(0, rw)]
    accessed: bool,
    #[bit(1, rw)]
    dirty: bool,
}

/// A frame in use.
#[derive(Clone, Copy)]
pub struct FrameDescriptor {
    /// Address space the frame belongs to.
    pub owner: Asid,
    /// User page mapped to the frame.
    pub page: usize,
    pins: u16,
    flags: FrameFlags,
}

impl FrameDescriptor {
    fn new(owner: Asid, page: usize) -> Self {
        Self {
            owner,
            page,
            pins: 0,
            flags: FrameFlags::DEFAULT,
        }
    }

    pub fn pinned(&self) -> bool {
        self.pins > 0
    }
}

impl fmt::Debug for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDescriptor")
            .field("owner", &self.owner)
            .field("page", &format_args!("{:#x}", self.page))
            .field("pins", &self.pins)
            .field("accessed", &self.flags.accessed())
            .field("dirty", &self.flags.dirty())
            .finish()
    }
}

/// The frame chosen by [`FrameLock::select_victim`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Victim {
    pub frame: FrameId,
    pub owner: Asid,
    pub page: usize,
}

/// What the frame table needs from page tables in order to evict.
pub trait Evictor {
    /// Reads and clears the accessed bit of `page` in `owner`'s page directory.
    fn test_and_clear_accessed(&mut self, owner: Asid, page: usize) -> bool;

    /// Moves the victim's page out of memory.
    ///
    /// On success the victim frame must have been freed. On failure the frame
    /// table must be left as it was.
    fn evict(&mut self, frames: &mut FrameLock<'_>, victim: Victim) -> Result<()>;
}

struct FrameTableState {
    /// Indexed by frame number.
    slots: Box<[Option<FrameDescriptor>]>,
    /// Clock hand: next slot to consider for eviction.
    hand: usize,
    resident: usize,
}

pub struct FrameTable {
    state: Mutex<FrameTableState>,
    memory: PhysicalMemory,
}

impl FrameTable {
    pub fn new(frames: usize) -> Self {
        Self {
            state: Mutex::new(FrameTableState {
                slots: vec![None; frames].into_boxed_slice(),
                hand: 0,
                resident: 0,
            }),
            memory: PhysicalMemory::new(frames),
        }
    }

    /// Acquires the frame lock.
    ///
    /// This is the outermost lock of the memory manager: a thread that needs
    /// both the frame lock and a supplemental page table lock takes this one
    /// first.
    pub fn lock(&self) -> FrameLock<'_> {
        FrameLock {
            state: self.state.lock(),
            memory: &self.memory,
        }
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Frame contents. Callers must hold a pin on any frame they touch
    /// without the frame lock.
    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }
}

/// Proof that the frame lock is held, and the only way to change the table.
pub struct FrameLock<'a> {
    state: MutexGuard<'a, FrameTableState>,
    memory: &'a PhysicalMemory,
}

impl<'a> FrameLock<'a> {
    pub fn memory(&self) -> &'a PhysicalMemory {
        self.memory
    }

    pub fn resident_count(&self) -> usize {
        self.state.resident
    }

    pub fn descriptor(&self, frame: FrameId) -> Option<&FrameDescriptor> {
        self.state.slots.get(frame.0)?.as_ref()
    }

    fn descriptor_mut(&mut self, frame: FrameId) -> &mut FrameDescriptor {
        match self.state.slots.get_mut(frame.0) {
            Some(Some(desc)) => desc,
            _ => panic!("{frame} is not allocated"),
        }
    }

    /// Allocates a frame for `page` of `owner`, evicting another page if the
    /// pool is exhausted. The frame comes back unpinned.
    pub fn allocate<E: Evictor + ?Sized>(
        &mut self,
        owner: Asid,
        page: usize,
        zero_fill: bool,
        evictor: &mut E,
    ) -> Result<FrameId> {
        let frame = match self.find_free() {
            Some(frame) => frame,
            None => {
                let victim = self.select_victim(evictor);
                debug!(
                    "evicting page {:#x} of space {} from {}",
                    victim.page, victim.owner, victim.frame
                );
                evictor.evict(self, victim)?;
                assert!(
                    self.descriptor(victim.frame).is_none(),
                    "eviction left {} allocated",
                    victim.frame
                );
                victim.frame
            }
        };

        self.state.slots[frame.0] = Some(FrameDescriptor::new(owner, page));
        self.state.resident += 1;
        if zero_fill {
            self.memory.frame(frame).zero();
        }
        trace!("allocated {frame} for page {page:#x} of space {owner}");
        Ok(frame)
    }

    fn find_free(&self) -> Option<FrameId> {
        if self.state.resident == self.state.slots.len() {
            return None;
        }
        self.state
            .slots
            .iter()
            .position(Option::is_none)
            .map(FrameId)
    }

    /// Releases `frame`. Pins are dropped along with the descriptor.
    pub fn free(&mut self, frame: FrameId) {
        let slot = &mut self.state.slots[frame.0];
        assert!(slot.is_some(), "double free of {frame}");
        *slot = None;
        self.state.resident -= 1;
        trace!("freed {frame}");
    }

    pub fn pin(&mut self, frame: FrameId) {
        let desc = self.descriptor_mut(frame);
        desc.pins = desc
            .pins
            .checked_add(1)
            .unwrap_or_else(|| panic!("pin count of {frame} overflowed"));
    }

    /// Releases one pin. Unpinning an unpinned frame does nothing.
    pub fn unpin(&mut self, frame: FrameId) {
        let desc = self.descriptor_mut(frame);
        desc.pins = desc.pins.saturating_sub(1);
    }

    pub fn is_pinned(&self, frame: FrameId) -> bool {
        self.descriptor(frame).is_some_and(FrameDescriptor::pinned)
    }

    /// Records a kernel access to `frame` through its kernel alias.
    pub fn mark_accessed(&mut self, frame: FrameId, write: bool) {
        let desc = self.descriptor_mut(frame);
        desc.flags = desc.flags.with_accessed(true);
        if write {
            desc.flags = desc.flags.with_dirty(true);
        }
    }

    /// Whether the kernel alias of `frame` has been written.
    pub fn is_dirty(&self, frame: FrameId) -> bool {
        self.descriptor(frame).is_some_and(|desc| desc.flags.dirty())
    }

    /// Picks the next frame to evict with the clock algorithm.
    ///
    /// Pinned frames are skipped. A frame accessed since the hand last passed
    /// has its accessed bits cleared and gets a second chance. Two full turns
    /// of the hand always find a victim unless every frame is pinned, which
    /// callers must never allow.
    pub fn select_victim<E: Evictor + ?Sized>(&mut self, evictor: &mut E) -> Victim {
        let len = self.state.slots.len();

        for _ in 0..2 * len {
            let idx = self.state.hand;
            self.state.hand = (idx + 1) % len;

            let Some(desc) = self.state.slots[idx].as_mut() else {
                continue;
            };
            if desc.pinned() {
                continue;
            }

            let kernel_accessed = desc.flags.accessed();
            desc.flags = desc.flags.with_accessed(false);
            let user_accessed = evictor.test_and_clear_accessed(desc.owner, desc.page);
            if kernel_accessed || user_accessed {
                continue;
            }

            return Victim {
                frame: FrameId(idx),
                owner: desc.owner,
                page: desc.page,
            };
        }

        panic!("no evictable frame among {len}: every frame is pinned");
    }
}
