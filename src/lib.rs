pub mod config;
pub mod error;
pub mod platform;
pub mod storage;
pub mod system;

pub use config::PalConfig;
pub use error::{error_string, ErrnoFlags, FailCode, PalError, PalResult};
pub use system::{
    current_thread_id, query_disk_io_stats, query_disk_space, query_system_info, DiskSpaceInfo,
    IoStats, SystemInfo,
};
