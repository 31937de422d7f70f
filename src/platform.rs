//! Platform capability interface.
//!
//! The handful of primitives whose behavior differs between operating systems
//! live behind [`Platform`]. Exactly one implementation is compiled in and
//! exported as [`NativePlatform`]; the rest of the crate is written against the
//! trait only.

use std::fs::File;
use std::io;
use std::os::unix::io::IntoRawFd;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
compile_error!("durafs supports Linux and Apple targets only");

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub mod apple;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod linux;

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub use apple::ApplePlatform as NativePlatform;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::LinuxPlatform as NativePlatform;

pub trait Platform {
    /// Flush file data and metadata to stable storage.
    fn flush_file(&self, file: &File) -> io::Result<()>;

    /// Whether flushing a directory on the filesystem hosting `dir` is
    /// meaningful. Network filesystems return `false`.
    fn sync_directory_allowed(&self, dir: &File) -> io::Result<bool>;

    /// Reserve `len` bytes starting at `offset`.
    fn fallocate(&self, file: &File, offset: u64, len: u64) -> io::Result<()>;

    /// Extra open(2) flags requesting synchronous cache-bypassing writes.
    fn direct_open_flags(&self) -> i32;

    /// Finish enabling cache bypass on a descriptor opened with
    /// [`Platform::direct_open_flags`].
    fn finish_open_direct(&self, file: &File) -> io::Result<()>;
}

/// Convert a libc return value into an `io::Result`, capturing errno
/// immediately.
pub(crate) fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Close `file`, reporting the result of close(2) instead of discarding it.
/// Deferred write errors can first surface here.
pub(crate) fn close_file(file: File) -> io::Result<()> {
    let fd = file.into_raw_fd();
    // SAFETY: `fd` was just released by `file` and is closed exactly once.
    cvt(unsafe { libc::close(fd) })?;
    Ok(())
}
