//! Read-only system queries: disk capacity, block-device I/O counters, page
//! size and the calling thread's id. None of these touch durability.

use crate::error::{PalError, PalResult};
use crate::platform::cvt;
use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpaceInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Cumulative completed I/O operations of a block device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub read_ops: u64,
    pub write_ops: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    pub page_size: u64,
    pub prefetch_supported: bool,
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Capacity of the filesystem holding `path`. `free_bytes` counts only space
/// available to unprivileged users.
pub fn query_disk_space(path: impl AsRef<Path>) -> PalResult<DiskSpaceInfo> {
    let path = path.as_ref();
    let stat_failed = |source| PalError::StatFailed {
        path: path.to_path_buf(),
        source,
    };

    let c_path = c_path(path).map_err(stat_failed)?;
    let mut buf = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `c_path` is NUL terminated and `buf` is large enough to fill.
    cvt(unsafe { libc::statvfs(c_path.as_ptr(), buf.as_mut_ptr()) }).map_err(stat_failed)?;
    // SAFETY: statvfs succeeded.
    let buf = unsafe { buf.assume_init() };

    let fragment = buf.f_frsize as u64;
    Ok(DiskSpaceInfo {
        total_bytes: fragment * buf.f_blocks as u64,
        free_bytes: fragment * buf.f_bavail as u64,
    })
}

/// I/O counters of the block device holding `path`, read from
/// `/sys/dev/block/<major>:<minor>/stat`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn query_disk_io_stats(path: impl AsRef<Path>) -> PalResult<IoStats> {
    use std::os::unix::fs::MetadataExt;

    let path = path.as_ref();
    let dev = std::fs::metadata(path)
        .map_err(|source| PalError::StatFailed {
            path: path.to_path_buf(),
            source,
        })?
        .dev();

    let stat_path = block_stat_path(dev as libc::dev_t);
    let contents =
        std::fs::read_to_string(&stat_path).map_err(|source| PalError::StatFailed {
            path: stat_path.clone(),
            source,
        })?;

    parse_block_stat(&contents).ok_or(PalError::UnknownStatFormat { path: stat_path })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn query_disk_io_stats(_path: impl AsRef<Path>) -> PalResult<IoStats> {
    Err(PalError::QueryFailed {
        source: io::Error::from_raw_os_error(libc::ENOTSUP),
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn block_stat_path(dev: libc::dev_t) -> std::path::PathBuf {
    std::path::PathBuf::from(format!(
        "/sys/dev/block/{}:{}/stat",
        libc::major(dev),
        libc::minor(dev)
    ))
}

/// Parse a block-device stat line.
///
/// Fields 1, 3 and 5 are read (fields 2 and 4 must be numbers but are
/// ignored), stopping at the first field that does not parse. Devices and
/// partitions with extended statistics yield three values: reads completed is
/// the first, writes completed the third. Old-style partition stat files
/// (`reads sectors writes sectors`) yield two values, the second being writes.
pub fn parse_block_stat(contents: &str) -> Option<IoStats> {
    let mut assigned = Vec::with_capacity(3);
    for (i, field) in contents.split_whitespace().take(5).enumerate() {
        let Ok(value) = field.parse::<u64>() else {
            break;
        };
        if i % 2 == 0 {
            assigned.push(value);
        }
    }

    match assigned[..] {
        [read_ops, _, write_ops] => Some(IoStats {
            read_ops,
            write_ops,
        }),
        [read_ops, write_ops] => Some(IoStats {
            read_ops,
            write_ops,
        }),
        _ => None,
    }
}

pub fn query_system_info() -> PalResult<SystemInfo> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return Err(PalError::QueryFailed {
            source: io::Error::last_os_error(),
        });
    }
    Ok(SystemInfo {
        page_size: page_size as u64,
        prefetch_supported: true,
    })
}

/// Kernel id of the calling thread.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_thread_id() -> u64 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn current_thread_id() -> u64 {
    let mut id = 0u64;
    // SAFETY: a null thread means the calling thread; `id` outlives the call.
    unsafe { libc::pthread_threadid_np(0, &mut id) };
    id
}
