//! Physical memory handed to the user pool.

use crate::sync::{Mutex, MutexGuard};
use alloc::boxed::Box;
use core::fmt;
use kidneyos_shared::sizes::{SECTORS_PER_PAGE, SECTOR_SIZE};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Physical frame number within the user pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {}", self.0)
    }
}

#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(transparent)]
pub struct Sector(pub [u8; SECTOR_SIZE]);

/// The contents of one frame, laid out as the sectors it occupies on a
/// block device so it can be transferred without copying.
#[derive(FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct PageFrame {
    sectors: [Sector; SECTORS_PER_PAGE],
}

impl PageFrame {
    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    pub fn sectors_mut(&mut self) -> &mut [Sector] {
        &mut self.sectors
    }
}

/// The user pool: one lock per frame guarding its contents.
///
/// A frame's lock comes after the frame-table, page table, and page
/// directory locks. While it is held, only the swap and backing-file locks
/// may be taken, to move the page to or from its store.
pub struct PhysicalMemory {
    frames: Box<[Mutex<PageFrame>]>,
}

impl PhysicalMemory {
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames)
                .map(|_| Mutex::new(PageFrame::new_zeroed()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Locks the contents of `frame`.
    pub fn frame(&self, frame: FrameId) -> MutexGuard<'_, PageFrame> {
        self.frames[frame.0].lock()
    }
}
