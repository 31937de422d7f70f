use super::{cvt, Platform};
use std::fs::File;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::AsRawFd;

pub const NFS_SUPER_MAGIC: u32 = 0x6969;
pub const CIFS_MAGIC_NUMBER: u32 = 0xFF53_4D42;
pub const SMB_SUPER_MAGIC: u32 = 0x517B;
pub const SMB2_MAGIC_NUMBER: u32 = 0xFE53_4D42;

/// Filesystems on which directory fsync is skipped: they either reject the
/// call or provide durability through the server.
pub const SYNC_EXEMPT_MAGICS: [u32; 4] = [
    NFS_SUPER_MAGIC,
    CIFS_MAGIC_NUMBER,
    SMB_SUPER_MAGIC,
    SMB2_MAGIC_NUMBER,
];

pub fn is_sync_exempt(magic: u32) -> bool {
    SYNC_EXEMPT_MAGICS.contains(&magic)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    /// Filesystem type code of the filesystem hosting `file`.
    pub fn filesystem_magic(file: &File) -> io::Result<u32> {
        let mut buf = MaybeUninit::<libc::statfs>::uninit();
        // SAFETY: the descriptor is owned by `file` and `buf` is large enough
        // for the kernel to fill.
        cvt(unsafe { libc::fstatfs(file.as_raw_fd(), buf.as_mut_ptr()) })?;
        // SAFETY: fstatfs succeeded, so the struct is initialized.
        let buf = unsafe { buf.assume_init() };
        // f_type is a signed word whose width varies by target; magics are 32 bit.
        Ok(buf.f_type as u32)
    }
}

impl Platform for LinuxPlatform {
    fn flush_file(&self, file: &File) -> io::Result<()> {
        // SAFETY: the descriptor is owned by `file`.
        cvt(unsafe { libc::fsync(file.as_raw_fd()) })?;
        Ok(())
    }

    fn sync_directory_allowed(&self, dir: &File) -> io::Result<bool> {
        Ok(!is_sync_exempt(Self::filesystem_magic(dir)?))
    }

    fn fallocate(&self, file: &File, offset: u64, len: u64) -> io::Result<()> {
        loop {
            // SAFETY: the descriptor is owned by `file`.
            // posix_fallocate returns the error code instead of setting errno.
            let rc = unsafe {
                libc::posix_fallocate(
                    file.as_raw_fd(),
                    offset as libc::off_t,
                    len as libc::off_t,
                )
            };
            match rc {
                0 => return Ok(()),
                libc::EINTR => continue,
                rc => return Err(io::Error::from_raw_os_error(rc)),
            }
        }
    }

    fn direct_open_flags(&self) -> i32 {
        libc::O_DSYNC | libc::O_DIRECT
    }

    fn finish_open_direct(&self, _file: &File) -> io::Result<()> {
        // O_DIRECT already took effect at open.
        Ok(())
    }
}
