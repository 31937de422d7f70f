//! Tunables shared by the mapped-file manager, journal writer and directory
//! synchronizer.

/// Default allocation granularity for mapped files (64KB).
pub const DEFAULT_ALLOCATION_GRANULARITY: u64 = 64 * 1024;

/// Default bound on symbolic links followed while syncing a directory.
pub const DEFAULT_MAX_SYMLINK_DEPTH: u32 = 32;

/// Default number of retries for a positioned write interrupted by a signal.
pub const DEFAULT_WRITE_RETRIES: u32 = 10;

/// Platform layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PalConfig {
    /// Minimum unit a mapped file's backing size is rounded up to.
    pub allocation_granularity: u64,
    /// Maximum number of symbolic links followed when syncing a directory.
    pub max_symlink_depth: u32,
    /// How many times an interrupted positioned write is retried.
    pub write_retries: u32,
}

impl Default for PalConfig {
    fn default() -> Self {
        PalConfig {
            allocation_granularity: DEFAULT_ALLOCATION_GRANULARITY,
            max_symlink_depth: DEFAULT_MAX_SYMLINK_DEPTH,
            write_retries: DEFAULT_WRITE_RETRIES,
        }
    }
}

impl PalConfig {
    pub fn with_allocation_granularity(mut self, granularity: u64) -> Self {
        self.allocation_granularity = granularity.max(1);
        self
    }

    pub fn with_max_symlink_depth(mut self, depth: u32) -> Self {
        self.max_symlink_depth = depth;
        self
    }

    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.write_retries = retries;
        self
    }
}
