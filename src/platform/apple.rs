use super::{cvt, Platform};
use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::AsRawFd;

/// Filesystem type names on which directory fsync is skipped.
pub const SYNC_EXEMPT_FSTYPES: [&str; 4] = ["nfs", "smbfs", "afpfs", "webdav"];

pub fn is_sync_exempt(fstype: &str) -> bool {
    SYNC_EXEMPT_FSTYPES.contains(&fstype)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplePlatform;

impl ApplePlatform {
    /// Filesystem type name of the filesystem hosting `file`.
    pub fn filesystem_type(file: &File) -> io::Result<String> {
        let mut buf = MaybeUninit::<libc::statfs>::uninit();
        // SAFETY: the descriptor is owned by `file` and `buf` is large enough
        // for the kernel to fill.
        cvt(unsafe { libc::fstatfs(file.as_raw_fd(), buf.as_mut_ptr()) })?;
        // SAFETY: fstatfs succeeded, so the struct is initialized and
        // f_fstypename is NUL terminated.
        let buf = unsafe { buf.assume_init() };
        let name = unsafe { CStr::from_ptr(buf.f_fstypename.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }
}

impl Platform for ApplePlatform {
    fn flush_file(&self, file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        // fsync only reaches the drive cache here; F_FULLFSYNC asks the drive
        // to flush. Not every filesystem implements it.
        // SAFETY: the descriptor is owned by `file`.
        if unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) } == 0 {
            return Ok(());
        }
        // SAFETY: as above.
        cvt(unsafe { libc::fsync(fd) })?;
        Ok(())
    }

    fn sync_directory_allowed(&self, dir: &File) -> io::Result<bool> {
        Ok(!is_sync_exempt(&Self::filesystem_type(dir)?))
    }

    fn fallocate(&self, file: &File, offset: u64, len: u64) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let target = offset + len;
        let current = file.metadata()?.len();
        if current >= target {
            return Ok(());
        }

        let mut store = libc::fstore_t {
            fst_flags: libc::F_ALLOCATECONTIG,
            fst_posmode: libc::F_PEOFPOSMODE,
            fst_offset: 0,
            fst_length: (target - current) as libc::off_t,
            fst_bytesalloc: 0,
        };
        // SAFETY: the descriptor is owned by `file` and `store` outlives the call.
        if unsafe { libc::fcntl(fd, libc::F_PREALLOCATE, &mut store) } == -1 {
            store.fst_flags = libc::F_ALLOCATEALL;
            // SAFETY: as above.
            cvt(unsafe { libc::fcntl(fd, libc::F_PREALLOCATE, &mut store) })?;
        }

        // SAFETY: the descriptor is owned by `file`.
        cvt(unsafe { libc::ftruncate(fd, target as libc::off_t) })?;
        Ok(())
    }

    fn direct_open_flags(&self) -> i32 {
        libc::O_DSYNC
    }

    fn finish_open_direct(&self, file: &File) -> io::Result<()> {
        // No O_DIRECT on Apple targets; F_NOCACHE bypasses the unified buffer cache.
        // SAFETY: the descriptor is owned by `file`.
        cvt(unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) })?;
        Ok(())
    }
}
