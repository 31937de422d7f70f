//! Durable header writes at the start of a file.

use crate::config::PalConfig;
use crate::error::{PalError, PalResult};
use crate::platform::{close_file, NativePlatform, Platform};
use crate::storage::alloc::pwrite_with_retries;
use crate::storage::dirsync::DirectorySync;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Write `header` at offset 0 of `path` and flush it. A newly created file also
/// gets its directory entry flushed.
pub fn write_header(path: impl AsRef<Path>, header: &[u8]) -> PalResult<()> {
    write_header_with(&PalConfig::default(), path, header)
}

pub fn write_header_with(
    config: &PalConfig,
    path: impl AsRef<Path>,
    header: &[u8],
) -> PalResult<()> {
    let path = path.as_ref();
    let platform = NativePlatform::default();

    let (file, created) = open_or_create(path).map_err(|source| PalError::OpenFailed {
        path: path.to_path_buf(),
        source,
    })?;

    pwrite_with_retries(&file, header, 0, config.write_retries).map_err(|source| {
        PalError::WriteFailed {
            offset: 0,
            size: header.len(),
            source,
        }
    })?;

    platform
        .flush_file(&file)
        .map_err(|source| PalError::SyncFailed {
            path: path.to_path_buf(),
            source,
        })?;

    close_file(file).map_err(|source| PalError::CloseFailed {
        path: path.to_path_buf(),
        source,
        unlink: None,
    })?;

    if created {
        DirectorySync::new(platform, config.max_symlink_depth).sync_containing_directory(path)?;
    }
    Ok(())
}

fn open_or_create(path: &Path) -> io::Result<(File, bool)> {
    let mut options = OpenOptions::new();
    options.write(true).mode(0o600);

    match options.clone().create_new(true).open(path) {
        Ok(file) => Ok((file, true)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok((options.open(path)?, false)),
        Err(e) => Err(e),
    }
}
