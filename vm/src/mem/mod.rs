//! Frames, swap, and per-process page tables.

pub mod address_space;
pub mod eviction;
pub mod frame_table;
pub mod page_table;
pub mod phys;
pub mod swap;
pub mod system;

#[cfg(test)]
mod test;

pub use address_space::{AddressSpace, MapId, SpaceShared};
pub use eviction::FaultContext;
pub use frame_table::{Evictor, FrameDescriptor, FrameLock, FrameTable, Victim};
pub use page_table::{FileBacking, PageDescriptor, PageState, SupplementalPageTable};
pub use phys::{FrameId, PageFrame, PhysicalMemory};
pub use swap::{SwapSlot, SwapTable};
pub use system::{Registry, VmStats, VmSystem};

/// Identifies an address space.
pub type Asid = u16;
