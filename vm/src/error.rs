use crate::block::BlockError;
use core::fmt;

/// Recoverable failures reported to the fault and syscall layers.
///
/// Broken invariants (double frees, evicting a page that is not resident,
/// unpinning a free frame) are not represented here; they panic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// No free swap slot is left to evict a page into.
    OutOfSwap,
    /// The page directory could not install the mapping.
    MappingFailed,
    /// No page descriptor covers the address.
    NotMapped,
    /// A page descriptor already exists for the address.
    AlreadyMapped,
    /// The address or range is unaligned, empty, or reaches into kernel space.
    BadAddress,
    /// A page in the range is pinned by a kernel access in progress.
    Busy,
    /// The swap device or a backing file failed.
    Block(BlockError),
}

pub type Result<T> = core::result::Result<T, VmError>;

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfSwap => write!(f, "out of swap space"),
            Self::MappingFailed => write!(f, "could not install page mapping"),
            Self::NotMapped => write!(f, "address not mapped"),
            Self::AlreadyMapped => write!(f, "page already mapped"),
            Self::BadAddress => write!(f, "bad user address"),
            Self::Busy => write!(f, "page is pinned"),
            Self::Block(err) => write!(f, "block device: {err}"),
        }
    }
}

impl core::error::Error for VmError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Block(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        Self::Block(err)
    }
}
