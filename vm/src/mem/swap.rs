//! Swap space: page-sized slots on the swap block device.

// Slot sectors are bounded by the device size, which is a `BlockSector`.
#![allow(clippy::cast_possible_truncation)]

use super::phys::PageFrame;
use crate::block::{Block, BlockSector, BlockType};
use crate::error::{Result, VmError};
use crate::sync::Mutex;
use core::fmt;
use kidneyos_shared::{bitmap::Bitmap, sizes::SECTORS_PER_PAGE};
use log::{info, trace, warn};

/// Index of a page-sized slot in swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        (self.0 * SECTORS_PER_PAGE) as BlockSector
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "swap slot {}", self.0)
    }
}

pub struct SwapTable {
    /// Set bits are slots holding a page.
    used: Mutex<Bitmap>,
    device: Mutex<Block>,
}

impl SwapTable {
    pub fn new(device: Block) -> Self {
        assert_eq!(
            device.get_type(),
            BlockType::Swap,
            "{} is not a swap device",
            device.get_name()
        );
        let slots = device.get_size() as usize / SECTORS_PER_PAGE;
        info!("swap: {} slots on {}", slots, device.get_name());

        Self {
            used: Mutex::new(Bitmap::new(slots)),
            device: Mutex::new(device),
        }
    }

    pub fn capacity(&self) -> usize {
        self.used.lock().len()
    }

    pub fn used_slots(&self) -> usize {
        self.used.lock().count()
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        self.used.lock().test(slot.0)
    }

    /// Reserves a free slot.
    pub fn allocate_slot(&self) -> Result<SwapSlot> {
        let found = self.used.lock().scan_and_flip();
        match found {
            Some(idx) => {
                trace!("allocated swap slot {idx}");
                Ok(SwapSlot(idx))
            }
            None => {
                warn!("swap: all {} slots in use", self.capacity());
                Err(VmError::OutOfSwap)
            }
        }
    }

    pub fn free_slot(&self, slot: SwapSlot) {
        let mut used = self.used.lock();
        assert!(used.test(slot.0), "free of unused {slot}");
        used.set(slot.0, false);
        trace!("freed {slot}");
    }

    /// Writes `page` into `slot`, one sector at a time.
    pub fn write(&self, slot: SwapSlot, page: &PageFrame) -> Result<()> {
        assert!(self.is_allocated(slot), "write to unused {slot}");
        let mut device = self.device.lock();
        let first = slot.first_sector();
        for (sector, data) in (first..).zip(page.sectors()) {
            device.write(sector, &data.0)?;
        }
        Ok(())
    }

    /// Reads `slot` into `page`. The slot stays allocated.
    pub fn read(&self, slot: SwapSlot, page: &mut PageFrame) -> Result<()> {
        assert!(self.is_allocated(slot), "read from unused {slot}");
        let mut device = self.device.lock();
        let first = slot.first_sector();
        for (sector, data) in (first..).zip(page.sectors_mut()) {
            device.read(sector, &mut data.0)?;
        }
        Ok(())
    }

    /// Read and write counts of the swap device.
    pub fn io_counts(&self) -> (u32, u32) {
        let device = self.device.lock();
        (device.read_count(), device.write_count())
    }
}
