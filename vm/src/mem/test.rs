//! Whole-system scenarios: faults, eviction across address spaces, swap and
//! file write-back.

use super::*;
use crate::block::{Block, BlockSector, BlockType, MemDevice};
use crate::config::VmConfig;
use crate::error::VmError;
use crate::fs::{BackingFile, ExtentFile, MemFile};
use crate::paging::{PageDirectory, SoftPageDirectory};
use crate::sync::Mutex;
use kidneyos_shared::{mem::PAGE_FRAME_SIZE, sizes::SECTORS_PER_PAGE};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use zerocopy::AsBytes;

const PAGE: usize = PAGE_FRAME_SIZE;

fn system(frames: usize, swap_slots: usize) -> Arc<VmSystem> {
    let sectors = swap_slots * SECTORS_PER_PAGE;
    VmSystem::new(
        VmConfig::new(frames),
        Block::new(
            BlockType::Swap,
            "swap",
            sectors as BlockSector,
            Box::new(MemDevice::new(sectors)),
        ),
    )
}

fn space(system: &Arc<VmSystem>) -> AddressSpace {
    system.create_address_space(Box::new(SoftPageDirectory::new()))
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

/// Checks that frame ownership, hardware mappings, and swap usage all agree
/// with the page tables of `spaces`.
fn check_invariants(system: &VmSystem, spaces: &[&AddressSpace]) {
    let mut resident = 0;
    let mut swapped = 0;
    for space in spaces {
        let pages = space.pages();
        let frames = system.frames().lock();
        for desc in pages {
            let mapped = space.page_directory().translate(desc.page);
            match desc.state {
                PageState::Resident { frame, .. } => {
                    resident += 1;
                    let owner = frames.descriptor(frame).expect("resident page without frame");
                    assert_eq!(owner.owner, space.asid());
                    assert_eq!(owner.page, desc.page);
                    assert_eq!(mapped, Some(frame));
                }
                PageState::Swapped { slot } => {
                    swapped += 1;
                    assert!(system.swap().is_allocated(slot));
                    assert_eq!(mapped, None);
                }
                PageState::ZeroFill | PageState::FileBacked(_) => assert_eq!(mapped, None),
            }
        }
    }
    let stats = system.stats();
    assert_eq!(stats.resident_frames, resident);
    assert_eq!(stats.used_swap_slots, swapped);
}

fn is_swapped(space: &AddressSpace, addr: usize) -> bool {
    space.lookup(addr).and_then(|d| d.swap_slot()).is_some()
}

#[test]
fn anonymous_page_survives_a_trip_through_swap() {
    let system = system(1, 4);
    let a = space(&system);
    a.install_zero_fill(0x1000).unwrap();
    a.install_zero_fill(0x2000).unwrap();

    a.copy_to_user(0x1000, b"hello").unwrap();
    // Touching the second page evicts the first.
    assert_eq!(a.copy_from_user(0x2000, 4).unwrap(), [0; 4]);
    assert!(is_swapped(&a, 0x1000));
    assert_eq!(system.stats().used_swap_slots, 1);
    check_invariants(&system, &[&a]);

    assert_eq!(a.copy_from_user(0x1000, 5).unwrap(), b"hello");
    assert!(a.lookup(0x1000).unwrap().frame().is_some());
    // The first page's slot was released; the second page now holds one.
    assert!(is_swapped(&a, 0x2000));
    assert_eq!(system.stats().used_swap_slots, 1);
    check_invariants(&system, &[&a]);
}

#[test]
fn file_page_reads_zeroes_past_its_length() {
    let system = system(4, 4);
    let a = space(&system);
    let contents = pattern(6000, 0);
    let file = Arc::new(MemFile::new(&contents));
    a.mmap(0x10000, file.clone(), 0, contents.len()).unwrap();

    let second = a.copy_from_user(0x10000 + PAGE, PAGE).unwrap();
    assert_eq!(&second[..6000 - PAGE], &contents[PAGE..]);
    assert!(second[6000 - PAGE..].iter().all(|&b| b == 0));

    let first = a.copy_from_user(0x10000, 16).unwrap();
    assert_eq!(first, &contents[..16]);
    assert_eq!(file.write_count(), 0);
    check_invariants(&system, &[&a]);
}

#[test]
fn file_pages_are_written_back_only_when_dirty() {
    let system = system(1, 4);
    let a = space(&system);
    let file = Arc::new(MemFile::new(&pattern(PAGE, 7)));
    a.mmap(0x10000, file.clone(), 0, PAGE).unwrap();
    a.install_zero_fill(0x20000).unwrap();

    a.copy_from_user(0x10000, 8).unwrap();
    a.copy_from_user(0x20000, 1).unwrap();
    assert!(matches!(
        a.lookup(0x10000).unwrap().state,
        PageState::FileBacked(_)
    ));
    assert_eq!(file.write_count(), 0);

    a.copy_to_user(0x10000, b"XY").unwrap();
    a.copy_from_user(0x20000, 1).unwrap();
    assert_eq!(file.write_count(), 1);
    assert_eq!(&file.contents()[..2], b"XY");
    assert_eq!(&file.contents()[2..], &pattern(PAGE, 7)[2..]);
    check_invariants(&system, &[&a]);
}

#[test]
fn user_mode_writes_are_seen_through_the_dirty_bit() {
    let system = system(1, 4);
    let a = space(&system);
    let file = Arc::new(MemFile::new(&[0; 16]));
    a.mmap(0x10000, file.clone(), 0, 16).unwrap();
    a.install_zero_fill(0x20000).unwrap();

    // Simulate the process storing to its page behind the kernel's back.
    a.handle_fault(0x10000).unwrap();
    let frame = a.page_directory().translate(0x10000).unwrap();
    system.frames().memory().frame(frame).as_bytes_mut()[3] = 0x42;
    a.page_directory().set_dirty(0x10000, true);

    a.handle_fault(0x20000).unwrap();
    assert_eq!(file.write_count(), 1);
    assert_eq!(file.contents()[3], 0x42);
    assert_eq!(file.contents().len(), 16);
}

#[test]
fn two_processes_share_a_single_frame() {
    let system = system(1, 4);
    let a = space(&system);
    let b = space(&system);
    a.install_zero_fill(0x1000).unwrap();
    b.install_zero_fill(0x1000).unwrap();

    a.copy_to_user(0x1000, b"a").unwrap();
    b.copy_to_user(0x1000, b"b").unwrap();
    assert!(is_swapped(&a, 0x1000));
    check_invariants(&system, &[&a, &b]);

    assert_eq!(a.copy_from_user(0x1000, 1).unwrap(), b"a");
    assert!(is_swapped(&b, 0x1000));
    check_invariants(&system, &[&a, &b]);

    assert_eq!(b.copy_from_user(0x1000, 1).unwrap(), b"b");
    assert!(is_swapped(&a, 0x1000));
    check_invariants(&system, &[&a, &b]);
}

#[test]
fn pinned_frames_are_never_evicted() {
    let system = system(2, 8);
    let a = space(&system);
    for page in 1..=4 {
        a.install_zero_fill(page * PAGE).unwrap();
    }

    a.copy_to_user(PAGE, b"pinned").unwrap();
    a.pin_range(PAGE, 1).unwrap();
    let frame = a.lookup(PAGE).unwrap().frame().unwrap();

    for _ in 0..3 {
        for page in 2..=4 {
            a.copy_from_user(page * PAGE, 1).unwrap();
            assert_eq!(a.lookup(PAGE).unwrap().frame(), Some(frame));
        }
    }
    check_invariants(&system, &[&a]);

    a.unpin_range(PAGE, 1).unwrap();
    assert!(!system.frames().lock().is_pinned(frame));
    a.copy_from_user(2 * PAGE, 1).unwrap();
    a.copy_from_user(3 * PAGE, 1).unwrap();
    assert_eq!(a.copy_from_user(PAGE, 6).unwrap(), b"pinned");
}

#[test]
#[should_panic(expected = "every frame is pinned")]
fn fault_with_every_frame_pinned_panics() {
    let system = system(1, 4);
    let a = space(&system);
    a.install_zero_fill(0x1000).unwrap();
    a.install_zero_fill(0x2000).unwrap();
    a.pin_range(0x1000, 1).unwrap();
    let _ = a.handle_fault(0x2000);
}

/// A page directory whose `map` can be made to fail.
struct FlakyDirectory {
    inner: SoftPageDirectory,
    fail: Arc<AtomicBool>,
}

impl PageDirectory for FlakyDirectory {
    fn map(&self, page: usize, frame: FrameId, writable: bool) -> bool {
        !self.fail.load(Ordering::SeqCst) && self.inner.map(page, frame, writable)
    }
    fn unmap(&self, page: usize) {
        self.inner.unmap(page);
    }
    fn translate(&self, page: usize) -> Option<FrameId> {
        self.inner.translate(page)
    }
    fn is_accessed(&self, page: usize) -> bool {
        self.inner.is_accessed(page)
    }
    fn set_accessed(&self, page: usize, accessed: bool) {
        self.inner.set_accessed(page, accessed);
    }
    fn is_dirty(&self, page: usize) -> bool {
        self.inner.is_dirty(page)
    }
    fn set_dirty(&self, page: usize, dirty: bool) {
        self.inner.set_dirty(page, dirty);
    }
}

#[test]
fn failed_mapping_leaves_the_page_where_it_was() {
    let system = system(1, 4);
    let fail = Arc::new(AtomicBool::new(false));
    let a = system.create_address_space(Box::new(FlakyDirectory {
        inner: SoftPageDirectory::new(),
        fail: fail.clone(),
    }));
    a.install_zero_fill(0x1000).unwrap();
    a.install_zero_fill(0x2000).unwrap();
    a.copy_to_user(0x1000, b"x").unwrap();
    a.handle_fault(0x2000).unwrap();
    let slot = a.lookup(0x1000).unwrap().swap_slot().unwrap();

    fail.store(true, Ordering::SeqCst);
    assert_eq!(a.copy_from_user(0x1000, 1), Err(VmError::MappingFailed));
    assert_eq!(a.lookup(0x1000).unwrap().swap_slot(), Some(slot));
    assert!(system.swap().is_allocated(slot));
    assert_eq!(system.stats().resident_frames, 0);
    check_invariants(&system, &[&a]);

    fail.store(false, Ordering::SeqCst);
    assert_eq!(a.copy_from_user(0x1000, 1).unwrap(), b"x");
    check_invariants(&system, &[&a]);
}

#[test]
fn zero_fill_page_stays_untouched_when_mapping_fails() {
    let system = system(2, 2);
    let a = system.create_address_space(Box::new(SoftPageDirectory::with_table_limit(0)));
    a.install_zero_fill(0x1000).unwrap();

    assert_eq!(a.handle_fault(0x1000), Err(VmError::MappingFailed));
    assert!(matches!(
        a.lookup(0x1000).unwrap().state,
        PageState::ZeroFill
    ));
    assert_eq!(system.stats().resident_frames, 0);
}

#[test]
fn munmap_writes_back_and_forgets_the_range() {
    let system = system(4, 4);
    let a = space(&system);
    let file = Arc::new(MemFile::new(&pattern(2 * PAGE, 1)));
    let id = a.mmap(0x10000, file.clone(), 0, 2 * PAGE).unwrap();

    // Straddles both pages.
    a.copy_to_user(0x10000 + PAGE - 5, b"0123456789").unwrap();
    a.munmap(id).unwrap();

    assert_eq!(&file.contents()[PAGE - 5..PAGE + 5], b"0123456789");
    assert_eq!(file.write_count(), 2);
    assert!(a.lookup(0x10000).is_none());
    assert!(a.lookup(0x10000 + PAGE).is_none());
    assert_eq!(system.stats().resident_frames, 0);
    assert_eq!(a.munmap(id), Err(VmError::NotMapped));
}

#[test]
fn mmap_rejects_bad_and_overlapping_ranges() {
    let system = system(2, 2);
    let a = space(&system);
    let file: Arc<dyn BackingFile> = Arc::new(MemFile::new(&[1; 100]));

    assert_eq!(
        a.mmap(0x10001, file.clone(), 0, 100),
        Err(VmError::BadAddress)
    );
    assert_eq!(a.mmap(0x10000, file.clone(), 0, 0), Err(VmError::BadAddress));
    assert_eq!(
        a.mmap(0x10000, file.clone(), 10, 100),
        Err(VmError::BadAddress)
    );

    a.install_zero_fill(0x11000).unwrap();
    assert_eq!(
        a.mmap(0x10000, file.clone(), 0, PAGE + 1),
        Err(VmError::AlreadyMapped)
    );
    // Nothing of the rejected mapping was installed.
    assert!(a.lookup(0x10000).is_none());
    assert!(a.mmap(0x10000, file, 0, 100).is_ok());
}

#[test]
fn destroy_releases_frames_and_swap() {
    let system = system(2, 8);
    let a = space(&system);
    let b = space(&system);
    let file = Arc::new(MemFile::new(&[0; 8]));
    a.mmap(0x40000, file.clone(), 0, 8).unwrap();
    for page in 1..=4 {
        a.install_zero_fill(page * PAGE).unwrap();
        a.copy_to_user(page * PAGE, &[page as u8]).unwrap();
    }
    a.copy_to_user(0x40000, b"dirty").unwrap();
    b.install_zero_fill(PAGE).unwrap();

    let before = system.stats();
    assert_eq!(before.resident_frames, 2);
    // Pages 1, 2 and 3 went to swap; page 4 and the file page are resident.
    assert_eq!(before.used_swap_slots, 3);
    check_invariants(&system, &[&a, &b]);

    a.destroy();
    assert_eq!(&file.contents()[..5], b"dirty");
    let after = system.stats();
    assert_eq!(after.resident_frames, 0);
    assert_eq!(after.used_swap_slots, 0);
    assert_eq!(system.registry().len(), 1);

    // The survivor can use the whole pool again.
    assert_eq!(b.copy_from_user(PAGE, 1).unwrap(), [0]);
    check_invariants(&system, &[&b]);
}

#[test]
fn lookup_has_no_side_effects() {
    let system = system(2, 2);
    let a = space(&system);
    a.install_zero_fill(0x1000).unwrap();
    let before = system.stats();

    assert!(a.lookup(0x5000).is_none());
    assert!(matches!(
        a.lookup(0x1000).unwrap().state,
        PageState::ZeroFill
    ));
    assert_eq!(a.pages().len(), 1);
    assert_eq!(system.stats(), before);
}

#[test]
fn bad_accesses_are_rejected() {
    let system = system(2, 2);
    let a = space(&system);
    a.install_zero_fill(0x1000).unwrap();

    assert_eq!(a.handle_fault(0x9000), Err(VmError::NotMapped));
    assert_eq!(
        a.handle_fault(kidneyos_shared::mem::OFFSET),
        Err(VmError::BadAddress)
    );
    assert_eq!(
        a.copy_to_user(kidneyos_shared::mem::OFFSET - 2, b"abc"),
        Err(VmError::BadAddress)
    );
    // A copy running off the end of the mapped region fails part way.
    assert_eq!(
        a.copy_to_user(0x2000 - 2, b"abcd"),
        Err(VmError::NotMapped)
    );
    assert_eq!(a.copy_from_user(0x2000 - 2, 2).unwrap(), b"ab");
}

#[test]
fn out_of_swap_is_reported() {
    let system = system(1, 1);
    let a = space(&system);
    for page in 1..=3 {
        a.install_zero_fill(page * PAGE).unwrap();
    }
    a.handle_fault(PAGE).unwrap();
    a.handle_fault(2 * PAGE).unwrap();
    assert_eq!(a.handle_fault(3 * PAGE), Err(VmError::OutOfSwap));
    // The resident page was not lost.
    assert!(a.lookup(2 * PAGE).unwrap().frame().is_some());
    check_invariants(&system, &[&a]);
}

#[test]
fn concurrent_processes_keep_their_data() {
    const THREADS: u8 = 4;
    const PAGES: usize = 6;
    let system = system(4, 64);

    let handles: Vec<_> = (0..THREADS)
        .map(|id| {
            let system = Arc::clone(&system);
            std::thread::spawn(move || {
                let space = space(&system);
                for page in 1..=PAGES {
                    space.install_zero_fill(page * PAGE).unwrap();
                    space
                        .copy_to_user(page * PAGE, &pattern(64, id ^ page as u8))
                        .unwrap();
                }
                for _ in 0..5 {
                    for page in 1..=PAGES {
                        let data = space.copy_from_user(page * PAGE, 64).unwrap();
                        assert_eq!(data, pattern(64, id ^ page as u8));
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    let stats = system.stats();
    assert_eq!(stats.resident_frames, 0);
    assert_eq!(stats.used_swap_slots, 0);
    assert!(system.registry().is_empty());
}

#[test]
fn default_configuration_sizes() {
    let sectors = kidneyos_shared::sizes::SWAP_SECTORS;
    let system = VmSystem::new(
        VmConfig::default(),
        Block::new(
            BlockType::Swap,
            "hdb1",
            sectors as BlockSector,
            Box::new(MemDevice::new(sectors)),
        ),
    );
    assert_eq!(
        system.stats(),
        VmStats {
            resident_frames: 0,
            total_frames: 1024,
            used_swap_slots: 0,
            total_swap_slots: 1024,
        }
    );
}

#[test]
fn pinned_page_cannot_be_unmapped() {
    let system = system(2, 4);
    let a = space(&system);
    let b = space(&system);
    let file = Arc::new(MemFile::new(&[0; 16]));
    let id = a.mmap(0x10000, file.clone(), 0, 16).unwrap();
    b.install_zero_fill(0x1000).unwrap();

    // A kernel copy into a's page is in flight.
    let frame = a.fault_in(0x10000).unwrap();
    assert_eq!(a.unmap_range(0x10000, PAGE), Err(VmError::Busy));
    assert_eq!(a.munmap(id), Err(VmError::Busy));
    assert!(system.frames().lock().is_pinned(frame));
    assert_eq!(a.lookup(0x10000).unwrap().frame(), Some(frame));
    system.frames().memory().frame(frame).as_bytes_mut()[0] = 0xee;

    // The other process is handed a different frame and sees only its own data.
    let theirs = b.fault_in(0x1000).unwrap();
    assert_ne!(theirs, frame);
    b.unpin_range(0x1000, 1).unwrap();
    assert_eq!(b.copy_from_user(0x1000, 1).unwrap(), [0]);
    check_invariants(&system, &[&a, &b]);

    a.unpin_range(0x10000, 1).unwrap();
    a.page_directory().set_dirty(0x10000, true);
    a.munmap(id).unwrap();
    assert_eq!(file.contents()[0], 0xee);
    assert!(a.lookup(0x10000).is_none());
    assert_eq!(a.munmap(id), Err(VmError::NotMapped));
    check_invariants(&system, &[&a, &b]);
}

#[test]
fn failed_pin_range_releases_earlier_pins() {
    let system = system(2, 4);
    let a = space(&system);
    a.install_zero_fill(0x1000).unwrap();

    assert_eq!(a.pin_range(0x1000, 2 * PAGE), Err(VmError::NotMapped));
    let frame = a.lookup(0x1000).unwrap().frame().unwrap();
    assert!(!system.frames().lock().is_pinned(frame));
    a.unmap_range(0x1000, PAGE).unwrap();
    assert_eq!(system.stats().resident_frames, 0);
}

#[test]
fn mapping_past_end_of_file_is_clamped() {
    let system = system(1, 4);
    let a = space(&system);
    let b = space(&system);
    let device = Arc::new(Mutex::new(Block::new(
        BlockType::FileSystem,
        "hda1",
        8,
        Box::new(MemDevice::new(8)),
    )));
    let file = Arc::new(ExtentFile::new(device, 0, 100));
    a.mmap(0x10000, file.clone(), 0, PAGE).unwrap();
    b.install_zero_fill(0x1000).unwrap();

    a.copy_to_user(0x10000, b"abc").unwrap();
    a.copy_to_user(0x10000 + 200, b"zzz").unwrap();

    // b's faults evict a's dirty page; only the file's 100 bytes go back.
    b.handle_fault(0x1000).unwrap();
    let desc = a.lookup(0x10000).unwrap();
    assert!(matches!(desc.state, PageState::FileBacked(ref backing) if backing.length == 100));
    let mut buf = [0; 3];
    assert_eq!(file.read_at(0, &mut buf), Ok(3));
    assert_eq!(&buf, b"abc");

    assert_eq!(a.copy_from_user(0x10000, 3).unwrap(), b"abc");
    assert_eq!(a.copy_from_user(0x10000 + 200, 3).unwrap(), [0; 3]);
    b.handle_fault(0x1000).unwrap();
    assert_eq!(file.len(), 100);
    check_invariants(&system, &[&a, &b]);
}

#[test]
fn mapping_a_short_file_does_not_grow_it() {
    let system = system(2, 2);
    let a = space(&system);
    let file = Arc::new(MemFile::new(b"0123456789"));
    let id = a.mmap(0x10000, file.clone(), 0, 2 * PAGE).unwrap();

    a.copy_to_user(0x10000 + 4, b"xx").unwrap();
    a.copy_to_user(0x10000 + PAGE, b"lost").unwrap();
    a.munmap(id).unwrap();
    assert_eq!(file.contents(), b"0123xx6789");
    assert_eq!(file.write_count(), 1);
}

#[test]
fn overflowing_ranges_are_rejected() {
    let system = system(2, 2);
    let a = space(&system);
    let file: Arc<dyn BackingFile> = Arc::new(MemFile::new(&[1; 16]));

    assert_eq!(
        a.mmap(0x10000, file, usize::MAX & !(PAGE - 1), 2 * PAGE),
        Err(VmError::BadAddress)
    );
    assert_eq!(a.unpin_range(usize::MAX - 1, 4), Err(VmError::BadAddress));
    assert_eq!(
        a.unpin_range(kidneyos_shared::mem::OFFSET - 1, 2),
        Err(VmError::BadAddress)
    );
    assert_eq!(a.pin_range(usize::MAX - 1, 4), Err(VmError::BadAddress));
    assert!(a.pages().is_empty());
}
