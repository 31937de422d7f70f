//! Error types for the platform layer.
//!
//! Every failure that comes out of a system call carries the `io::Error` that
//! was captured right after that call returned, so the platform code can never
//! be overwritten by a later cleanup step.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Status codes reported alongside a captured platform error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailCode {
    OpenFailed,
    SeekFailed,
    StatFailed,
    AllocationFailed,
    DurabilityTestFailed,
    SyncFailed,
    FlushFailed,
    PathRecursion,
    MapFailed,
    UnmapFailed,
    ProtectFailed,
    UnlinkFailed,
    CloseFailed,
    WriteFailed,
    ReadFailed,
    TruncateFailed,
    UnknownStatFormat,
    QueryFailed,
}

/// Errors that can occur in the platform layer.
#[derive(Error, Debug)]
pub enum PalError {
    #[error("Failed to open {path:?}: {source}")]
    OpenFailed { path: PathBuf, source: io::Error },

    #[error("Failed to seek {path:?}: {source}")]
    SeekFailed { path: PathBuf, source: io::Error },

    #[error("Failed to stat {path:?}: {source}")]
    StatFailed { path: PathBuf, source: io::Error },

    #[error("Failed to allocate {length} bytes: {source}")]
    AllocationFailed { length: u64, source: io::Error },

    #[error("Storage at {path:?} does not support durable direct writes: {source}")]
    DurabilityTestFailed { path: PathBuf, source: io::Error },

    #[error("Failed to sync {path:?}: {source}")]
    SyncFailed { path: PathBuf, source: io::Error },

    #[error("Failed to flush {length} mapped bytes: {source}")]
    FlushFailed { length: u64, source: io::Error },

    #[error("Symbolic link chain at {path:?} exceeds depth {depth}")]
    PathRecursion { path: PathBuf, depth: u32 },

    #[error("Failed to map {length} bytes: {source}")]
    MapFailed { length: u64, source: io::Error },

    #[error("Failed to unmap {length} bytes: {source}")]
    UnmapFailed { length: u64, source: io::Error },

    #[error("Failed to change protection of {length} bytes: {source}")]
    ProtectFailed { length: u64, source: io::Error },

    #[error("Failed to unlink {path:?}: {source}")]
    UnlinkFailed { path: PathBuf, source: io::Error },

    /// `unlink` carries the unlink failure recorded earlier in the same dispose.
    #[error("Failed to close {path:?}: {source}")]
    CloseFailed {
        path: PathBuf,
        source: io::Error,
        unlink: Option<io::Error>,
    },

    #[error("Failed to write {size} bytes at offset {offset}: {source}")]
    WriteFailed {
        offset: u64,
        size: usize,
        source: io::Error,
    },

    #[error("Failed to read at offset {offset}: {source}")]
    ReadFailed { offset: u64, source: io::Error },

    #[error("Failed to truncate to {length} bytes: {source}")]
    TruncateFailed { length: u64, source: io::Error },

    #[error("Unknown statistics format in {path:?}")]
    UnknownStatFormat { path: PathBuf },

    #[error("System query failed: {source}")]
    QueryFailed { source: io::Error },
}

impl PalError {
    pub fn code(&self) -> FailCode {
        match self {
            PalError::OpenFailed { .. } => FailCode::OpenFailed,
            PalError::SeekFailed { .. } => FailCode::SeekFailed,
            PalError::StatFailed { .. } => FailCode::StatFailed,
            PalError::AllocationFailed { .. } => FailCode::AllocationFailed,
            PalError::DurabilityTestFailed { .. } => FailCode::DurabilityTestFailed,
            PalError::SyncFailed { .. } => FailCode::SyncFailed,
            PalError::FlushFailed { .. } => FailCode::FlushFailed,
            PalError::PathRecursion { .. } => FailCode::PathRecursion,
            PalError::MapFailed { .. } => FailCode::MapFailed,
            PalError::UnmapFailed { .. } => FailCode::UnmapFailed,
            PalError::ProtectFailed { .. } => FailCode::ProtectFailed,
            PalError::UnlinkFailed { .. } => FailCode::UnlinkFailed,
            PalError::CloseFailed { .. } => FailCode::CloseFailed,
            PalError::WriteFailed { .. } => FailCode::WriteFailed,
            PalError::ReadFailed { .. } => FailCode::ReadFailed,
            PalError::TruncateFailed { .. } => FailCode::TruncateFailed,
            PalError::UnknownStatFormat { .. } => FailCode::UnknownStatFormat,
            PalError::QueryFailed { .. } => FailCode::QueryFailed,
        }
    }

    /// The platform error code captured at the point of failure, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            PalError::OpenFailed { source, .. }
            | PalError::SeekFailed { source, .. }
            | PalError::StatFailed { source, .. }
            | PalError::AllocationFailed { source, .. }
            | PalError::DurabilityTestFailed { source, .. }
            | PalError::SyncFailed { source, .. }
            | PalError::FlushFailed { source, .. }
            | PalError::MapFailed { source, .. }
            | PalError::UnmapFailed { source, .. }
            | PalError::ProtectFailed { source, .. }
            | PalError::UnlinkFailed { source, .. }
            | PalError::CloseFailed { source, .. }
            | PalError::WriteFailed { source, .. }
            | PalError::ReadFailed { source, .. }
            | PalError::TruncateFailed { source, .. }
            | PalError::QueryFailed { source } => source.raw_os_error(),
            PalError::PathRecursion { .. } => Some(libc::ELOOP),
            PalError::UnknownStatFormat { .. } => None,
        }
    }
}

/// Result type for platform operations.
pub type PalResult<T> = Result<T, PalError>;

/// Conditions callers usually want to react to without parsing a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrnoFlags {
    pub no_mem: bool,
    pub no_ent: bool,
    pub no_spc: bool,
}

impl ErrnoFlags {
    pub fn from_errno(errno: i32) -> Self {
        ErrnoFlags {
            no_mem: errno == libc::ENOMEM,
            no_ent: errno == libc::ENOENT,
            no_spc: errno == libc::ENOSPC,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.no_mem || self.no_ent || self.no_spc)
    }
}

/// Human readable message for a platform error code.
pub fn error_string(errno: i32) -> (String, ErrnoFlags) {
    let message = io::Error::from_raw_os_error(errno).to_string();
    (message, ErrnoFlags::from_errno(errno))
}
