use kidneyos_shared::sizes::MB;

/// Boot-time parameters of the memory manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Physical frames handed to the user pool.
    pub user_frames: usize,
}

impl VmConfig {
    /// Frame numbers are stored in 20-bit page table fields.
    pub const MAX_USER_FRAMES: usize = 1 << 20;

    pub const fn new(user_frames: usize) -> Self {
        Self { user_frames }
    }

    /// Panics on a configuration the memory manager cannot run with.
    pub fn validate(&self) {
        assert!(self.user_frames > 0, "user pool needs at least one frame");
        assert!(
            self.user_frames <= Self::MAX_USER_FRAMES,
            "user pool of {} frames exceeds {}",
            self.user_frames,
            Self::MAX_USER_FRAMES
        );
    }
}

impl Default for VmConfig {
    // 4 MB of user memory.
    fn default() -> Self {
        Self::new(4 * MB / kidneyos_shared::mem::PAGE_FRAME_SIZE)
    }
}
