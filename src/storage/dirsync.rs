//! Directory durability synchronizer.
//!
//! Creating or growing a file changes metadata held by its directory. Until
//! that directory is flushed, a crash can bring the file back with its old
//! length (or not at all). When the directory is reached through symbolic
//! links, every real directory along the chain is flushed too.

use crate::config::PalConfig;
use crate::error::{PalError, PalResult};
use crate::platform::{NativePlatform, Platform};
use log::debug;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Flush the metadata of the directory holding `path`.
pub fn sync_containing_directory(path: &Path) -> PalResult<()> {
    sync_containing_directory_with(&PalConfig::default(), path)
}

pub fn sync_containing_directory_with(config: &PalConfig, path: &Path) -> PalResult<()> {
    DirectorySync::new(NativePlatform::default(), config.max_symlink_depth)
        .sync_containing_directory(path)
}

/// The directory `path` lives in. A bare file name lives in `.`.
pub fn containing_directory(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => path.to_path_buf(),
    }
}

pub struct DirectorySync<P> {
    platform: P,
    max_depth: u32,
}

impl<P: Platform> DirectorySync<P> {
    pub fn new(platform: P, max_depth: u32) -> Self {
        DirectorySync {
            platform,
            max_depth,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn sync_containing_directory(&self, path: &Path) -> PalResult<()> {
        self.sync_directory(&containing_directory(path), 0)
    }

    /// Flush `dir`. If `dir` is reached through symbolic links, also flush
    /// the directory holding each link target along the chain, counting every
    /// hop against the depth limit.
    pub fn sync_directory(&self, dir: &Path, depth: u32) -> PalResult<()> {
        if depth > self.max_depth {
            return Err(PalError::PathRecursion {
                path: dir.to_path_buf(),
                depth: self.max_depth,
            });
        }

        // open(2) resolves the whole chain, so this flushes the final directory.
        self.flush_directory(dir)?;

        let mut current = dir.to_path_buf();
        let mut depth = depth;
        while let Some(target) = self.link_target(&current)? {
            depth += 1;
            if depth > self.max_depth {
                return Err(PalError::PathRecursion {
                    path: current,
                    depth: self.max_depth,
                });
            }

            debug!("Following {:?} -> {:?} for directory sync", current, target);
            self.flush_directory(&containing_directory(&target))?;
            current = target;
        }
        Ok(())
    }

    fn flush_directory(&self, dir: &Path) -> PalResult<()> {
        let handle = File::open(dir).map_err(|source| PalError::OpenFailed {
            path: dir.to_path_buf(),
            source,
        })?;

        let allowed = self
            .platform
            .sync_directory_allowed(&handle)
            .map_err(|source| PalError::StatFailed {
                path: dir.to_path_buf(),
                source,
            })?;
        if !allowed {
            debug!("Skipping directory sync of {:?} on network filesystem", dir);
            return Ok(());
        }

        self.platform
            .flush_file(&handle)
            .map_err(|source| PalError::SyncFailed {
                path: dir.to_path_buf(),
                source,
            })
    }

    /// Where `path` points if it is a symbolic link. A relative target is
    /// resolved against the directory holding the link.
    fn link_target(&self, path: &Path) -> PalResult<Option<PathBuf>> {
        let target = match fs::read_link(path) {
            Ok(target) => target,
            // EINVAL: not a symbolic link, the chain ends here.
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => return Ok(None),
            Err(source) => {
                return Err(PalError::StatFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if target.is_relative() {
            Ok(Some(containing_directory(path).join(target)))
        } else {
            Ok(Some(target))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailCode;
    use std::cell::{Cell, RefCell};
    use std::io;
    use std::os::unix::fs::{symlink, MetadataExt};
    use tempfile::tempdir;

    /// Records the inode of every flushed directory; reports every
    /// filesystem as exempt or not.
    struct RecordingPlatform {
        allowed: bool,
        flushes: Cell<u32>,
        inodes: RefCell<Vec<u64>>,
    }

    impl RecordingPlatform {
        fn new(allowed: bool) -> Self {
            RecordingPlatform {
                allowed,
                flushes: Cell::new(0),
                inodes: RefCell::new(Vec::new()),
            }
        }
    }

    impl Platform for RecordingPlatform {
        fn flush_file(&self, file: &File) -> io::Result<()> {
            self.flushes.set(self.flushes.get() + 1);
            self.inodes.borrow_mut().push(file.metadata()?.ino());
            Ok(())
        }

        fn sync_directory_allowed(&self, _dir: &File) -> io::Result<bool> {
            Ok(self.allowed)
        }

        fn fallocate(&self, _file: &File, _offset: u64, _len: u64) -> io::Result<()> {
            Ok(())
        }

        fn direct_open_flags(&self) -> i32 {
            0
        }

        fn finish_open_direct(&self, _file: &File) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_containing_directory() {
        assert_eq!(
            containing_directory(Path::new("/data/db/file.bin")),
            PathBuf::from("/data/db")
        );
        assert_eq!(
            containing_directory(Path::new("file.bin")),
            PathBuf::from(".")
        );
        assert_eq!(containing_directory(Path::new("/")), PathBuf::from("/"));
    }

    #[test]
    fn test_sync_real_directory() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("data.bin");
        fs::write(&file, b"x")?;

        sync_containing_directory(&file)?;
        Ok(())
    }

    #[test]
    fn test_exempt_filesystem_never_flushes() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let sync = DirectorySync::new(RecordingPlatform::new(false), 32);

        sync.sync_containing_directory(&dir.path().join("data.bin"))?;
        assert_eq!(sync.platform().flushes.get(), 0);
        Ok(())
    }

    #[test]
    fn test_symlink_chain_flushes_each_hop() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (a, b, c) = (dir.path().join("a"), dir.path().join("b"), dir.path().join("c"));
        let real = c.join("real");
        for d in [&a, &b, &c, &real] {
            fs::create_dir(d)?;
        }
        symlink(&real, b.join("hop1"))?;
        // Relative link resolved against the link's own directory.
        symlink("../b/hop1", a.join("hop2"))?;

        let sync = DirectorySync::new(RecordingPlatform::new(true), 32);
        sync.sync_containing_directory(&a.join("hop2").join("data.bin"))?;

        let ino = |p: &Path| fs::metadata(p).map(|m| m.ino());
        // real (through the chain), b (holds hop1), c (holds real)
        let expected = vec![ino(real.as_path())?, ino(b.as_path())?, ino(c.as_path())?];
        assert_eq!(*sync.platform().inodes.borrow(), expected);
        Ok(())
    }

    #[test]
    fn test_plain_directory_flushes_once() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let sync = DirectorySync::new(RecordingPlatform::new(true), 32);

        sync.sync_containing_directory(&dir.path().join("data.bin"))?;
        let expected = vec![fs::metadata(dir.path())?.ino()];
        assert_eq!(*sync.platform().inodes.borrow(), expected);
        Ok(())
    }

    #[test]
    fn test_symlink_depth_exceeded_is_an_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let real = dir.path().join("real");
        fs::create_dir(&real)?;

        let mut previous = real.clone();
        for i in 0..4 {
            let link = dir.path().join(format!("link{}", i));
            symlink(&previous, &link)?;
            previous = link;
        }

        let sync = DirectorySync::new(RecordingPlatform::new(true), 2);
        let err = sync
            .sync_containing_directory(&previous.join("data.bin"))
            .unwrap_err();
        assert_eq!(err.code(), FailCode::PathRecursion);
        Ok(())
    }

    #[test]
    fn test_missing_directory_fails_to_open() {
        let sync = DirectorySync::new(RecordingPlatform::new(true), 32);
        let err = sync
            .sync_containing_directory(Path::new("/nonexistent/path/that/does/not/exist/f"))
            .unwrap_err();
        assert_eq!(err.code(), FailCode::OpenFailed);
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }
}
