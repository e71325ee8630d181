// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support. It would be nice if
// you could tell clippy that you were only dealing with 32-bit usizes...
#![allow(clippy::cast_possible_truncation)]

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

pub const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl PageTable {
    pub const DEFAULT: Self = Self([PageTableEntry::DEFAULT; PAGE_TABLE_LEN]);

    /// Returns true if no entry in the table is present.
    pub fn is_vacant(&self) -> bool {
        self.0.iter().all(|entry| !entry.present())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user entry pointing at physical frame number `frame`.
    pub fn user(frame: u20, writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(frame)
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    pub const fn from_usize(addr: usize) -> Self {
        Self::new_with_raw_value(addr as u32)
    }
}
