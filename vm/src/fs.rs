//! File handles that back memory-mapped regions.

use crate::block::{Block, BlockError, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::cmp::min;
use core::sync::atomic::{AtomicUsize, Ordering};

/// An open file, as handed to the memory manager by the filesystem.
///
/// Both calls are positional and never move a file cursor. Reads past the
/// end of the file are short.
pub trait BackingFile: Send + Sync {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, BlockError>;
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, BlockError>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A file held entirely in kernel memory.
#[derive(Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    writes: AtomicUsize,
}

impl MemFile {
    pub fn new(contents: &[u8]) -> Self {
        Self {
            data: Mutex::new(contents.to_vec()),
            writes: AtomicUsize::new(0),
        }
    }

    /// A copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Number of `write_at` calls made so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, BlockError> {
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, BlockError> {
        let mut data = self.data.lock();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }
}

/// A file stored in consecutive sectors of a filesystem device.
///
/// The file cannot grow; writes past `len` are short.
pub struct ExtentFile {
    device: Arc<Mutex<Block>>,
    start: BlockSector,
    len: usize,
}

impl ExtentFile {
    pub fn new(device: Arc<Mutex<Block>>, start: BlockSector, len: usize) -> Self {
        Self { device, start, len }
    }

    fn sector_of(&self, pos: usize) -> Result<BlockSector, BlockError> {
        BlockSector::try_from(pos / BLOCK_SECTOR_SIZE)
            .ok()
            .and_then(|rel| self.start.checked_add(rel))
            .ok_or(BlockError::SectorOutOfBounds)
    }
}

impl BackingFile for ExtentFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, BlockError> {
        let end = min(self.len, offset.saturating_add(buf.len()));
        let mut device = self.device.lock();
        let mut bounce = [0u8; BLOCK_SECTOR_SIZE];
        let mut pos = offset;

        while pos < end {
            let sector_ofs = pos % BLOCK_SECTOR_SIZE;
            let chunk = min(BLOCK_SECTOR_SIZE - sector_ofs, end - pos);
            device.read(self.sector_of(pos)?, &mut bounce)?;
            buf[pos - offset..pos - offset + chunk]
                .copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            pos += chunk;
        }

        Ok(end.saturating_sub(offset))
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, BlockError> {
        let end = min(self.len, offset.saturating_add(buf.len()));
        let mut device = self.device.lock();
        let mut bounce = [0u8; BLOCK_SECTOR_SIZE];
        let mut pos = offset;

        while pos < end {
            let sector = self.sector_of(pos)?;
            let sector_ofs = pos % BLOCK_SECTOR_SIZE;
            let chunk = min(BLOCK_SECTOR_SIZE - sector_ofs, end - pos);
            // Partial sectors are read back first so neighbouring bytes survive.
            if chunk < BLOCK_SECTOR_SIZE {
                device.read(sector, &mut bounce)?;
            }
            bounce[sector_ofs..sector_ofs + chunk]
                .copy_from_slice(&buf[pos - offset..pos - offset + chunk]);
            device.write(sector, &bounce)?;
            pos += chunk;
        }

        Ok(end.saturating_sub(offset))
    }

    fn len(&self) -> usize {
        self.len
    }
}
