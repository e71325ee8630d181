use super::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use super::block_error::BlockError;
use alloc::{vec, vec::Vec};

/// A RAM-backed block device driver.
///
/// Used as the swap and filesystem device when the kernel runs hosted, and
/// by tests.
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    /// A zeroed device of `sectors` sectors.
    pub fn new(sectors: usize) -> Self {
        Self {
            data: vec![0; sectors * BLOCK_SECTOR_SIZE],
        }
    }

    /// A device holding `contents`, padded with zeroes to a whole number of sectors.
    pub fn with_contents(contents: &[u8]) -> Self {
        let mut data = contents.to_vec();
        data.resize(contents.len().div_ceil(BLOCK_SECTOR_SIZE) * BLOCK_SECTOR_SIZE, 0);
        Self { data }
    }

    pub fn sectors(&self) -> usize {
        self.data.len() / BLOCK_SECTOR_SIZE
    }

    fn range(&self, sector: BlockSector) -> Result<core::ops::Range<usize>, BlockError> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        if start + BLOCK_SECTOR_SIZE > self.data.len() {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(start..start + BLOCK_SECTOR_SIZE)
    }
}

impl BlockOp for MemDevice {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}
