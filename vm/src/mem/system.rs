//! The memory manager as a whole: the global frame table, swap, and the
//! registry of live address spaces.

use super::address_space::{AddressSpace, SpaceShared};
use super::frame_table::FrameTable;
use super::swap::SwapTable;
use super::Asid;
use crate::block::Block;
use crate::config::VmConfig;
use crate::paging::PageDirectory;
use crate::sync::Mutex;
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicU16, Ordering};
use log::{debug, info};

/// Live address spaces by id. Eviction looks up a victim's owner here.
pub struct Registry {
    spaces: Mutex<BTreeMap<Asid, Arc<SpaceShared>>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            spaces: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, asid: Asid) -> Option<Arc<SpaceShared>> {
        self.spaces.lock().get(&asid).cloned()
    }

    pub fn len(&self) -> usize {
        self.spaces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, asid: Asid) -> bool {
        self.spaces.lock().contains_key(&asid)
    }

    fn insert(&self, space: Arc<SpaceShared>) {
        let prev = self.spaces.lock().insert(space.asid(), space);
        assert!(prev.is_none(), "address space id reused while live");
    }

    pub(crate) fn remove(&self, asid: Asid) -> Option<Arc<SpaceShared>> {
        self.spaces.lock().remove(&asid)
    }
}

/// Occupancy of the frame pool and swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmStats {
    pub resident_frames: usize,
    pub total_frames: usize,
    pub used_swap_slots: usize,
    pub total_swap_slots: usize,
}

pub struct VmSystem {
    frames: FrameTable,
    swap: SwapTable,
    registry: Registry,
    next_asid: AtomicU16,
}

impl VmSystem {
    /// Sets up the user pool and takes over `swap_device`.
    pub fn new(config: VmConfig, swap_device: Block) -> Arc<Self> {
        config.validate();
        let system = Self {
            frames: FrameTable::new(config.user_frames),
            swap: SwapTable::new(swap_device),
            registry: Registry::new(),
            next_asid: AtomicU16::new(1),
        };
        info!(
            "vm: {} user frames, {} swap slots",
            system.frames.capacity(),
            system.swap.capacity()
        );
        Arc::new(system)
    }

    /// Creates an empty address space translating through `pagedir`.
    pub fn create_address_space(self: &Arc<Self>, pagedir: Box<dyn PageDirectory>) -> AddressSpace {
        let asid = self.allocate_asid();
        let shared = Arc::new(SpaceShared::new(asid, pagedir));
        self.registry.insert(Arc::clone(&shared));
        debug!("created address space {asid}");
        AddressSpace::new(shared, Arc::clone(self))
    }

    fn allocate_asid(&self) -> Asid {
        loop {
            let asid = self.next_asid.fetch_add(1, Ordering::Relaxed);
            if asid != 0 && !self.registry.contains(asid) {
                return asid;
            }
            assert!(
                self.registry.len() < usize::from(Asid::MAX),
                "out of address space ids"
            );
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> VmStats {
        let resident_frames = self.frames.lock().resident_count();
        VmStats {
            resident_frames,
            total_frames: self.frames.capacity(),
            used_swap_slots: self.swap.used_slots(),
            total_swap_slots: self.swap.capacity(),
        }
    }
}
