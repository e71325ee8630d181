use crate::mem::PAGE_FRAME_SIZE;

pub const KB: usize = 1024;
pub const MB: usize = KB * KB;

/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors making up one page-sized transfer (a swap slot, or one
/// page of a mapped file).
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE;

/// Default swap partition size, in sectors (4 MB).
pub const SWAP_SECTORS: usize = 4 * MB / SECTOR_SIZE;
