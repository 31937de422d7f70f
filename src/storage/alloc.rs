//! File space preallocation.

use crate::config::PalConfig;
use crate::error::{PalError, PalResult};
use crate::platform::{NativePlatform, Platform};
use log::debug;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Outcome of [`ensure_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// The file already had at least the requested length.
    Unchanged,
    /// The file grew from `from` to `to` bytes.
    Extended { from: u64, to: u64 },
}

impl Allocation {
    pub fn grew(&self) -> bool {
        matches!(self, Allocation::Extended { .. })
    }
}

/// Make sure `file` is at least `target_length` bytes long.
///
/// Space is reserved with the platform's native preallocation call. When the
/// filesystem does not support it (FAT variants, some network mounts) the file
/// is extended sparsely by writing one zero byte at `target_length - 1`: the
/// length is correct but the extent may contain holes.
pub fn ensure_size(file: &File, target_length: u64) -> PalResult<Allocation> {
    ensure_size_with(&PalConfig::default(), file, target_length)
}

pub fn ensure_size_with(
    config: &PalConfig,
    file: &File,
    target_length: u64,
) -> PalResult<Allocation> {
    ensure_size_on(&NativePlatform::default(), config, file, target_length)
}

pub fn ensure_size_on<P: Platform>(
    platform: &P,
    config: &PalConfig,
    file: &File,
    target_length: u64,
) -> PalResult<Allocation> {
    let failed = |source: io::Error| PalError::AllocationFailed {
        length: target_length,
        source,
    };

    let current = file.metadata().map_err(failed)?.len();
    if target_length <= current {
        return Ok(Allocation::Unchanged);
    }

    match platform.fallocate(file, 0, target_length) {
        Ok(()) => {}
        Err(e) if is_unsupported(&e) => {
            debug!(
                "Native preallocation unsupported ({}), extending sparsely to {} bytes",
                e, target_length
            );
            pwrite_with_retries(file, &[0u8], target_length - 1, config.write_retries)
                .map_err(failed)?;
        }
        Err(e) => return Err(failed(e)),
    }

    Ok(Allocation::Extended {
        from: current,
        to: target_length,
    })
}

/// Errors meaning "this filesystem cannot reserve that much space natively".
fn is_unsupported(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) | Some(libc::EFBIG)
    )
}

/// A target of positioned writes.
pub(crate) trait WriteAt {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
}

impl WriteAt for File {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        FileExt::write_at(self, buf, offset)
    }
}

/// Write all of `buf` at `offset`, resuming after short writes and retrying a
/// write interrupted by a signal at most `retries` times.
pub(crate) fn pwrite_with_retries<W: WriteAt + ?Sized>(
    target: &W,
    buf: &[u8],
    offset: u64,
    retries: u32,
) -> io::Result<()> {
    let mut written = 0usize;
    let mut interrupted = 0u32;

    while written < buf.len() {
        match target.write_at(&buf[written..], offset + written as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "positioned write made no progress",
                ));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted && interrupted < retries => {
                interrupted += 1;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use tempfile::tempdir;

    /// Positioned-write target that replays scripted outcomes, then accepts
    /// every remaining byte.
    #[derive(Default)]
    struct ScriptedWrites {
        script: RefCell<VecDeque<io::Result<usize>>>,
        written: RefCell<Vec<(u64, Vec<u8>)>>,
    }

    impl ScriptedWrites {
        fn new(script: impl IntoIterator<Item = io::Result<usize>>) -> Self {
            ScriptedWrites {
                script: RefCell::new(script.into_iter().collect()),
                written: RefCell::new(Vec::new()),
            }
        }

        fn interrupted(times: usize) -> Self {
            Self::new((0..times).map(|_| Err(io::Error::from(io::ErrorKind::Interrupted))))
        }
    }

    impl WriteAt for ScriptedWrites {
        fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
            let n = match self.script.borrow_mut().pop_front() {
                Some(Ok(n)) => n.min(buf.len()),
                Some(Err(e)) => return Err(e),
                None => buf.len(),
            };
            self.written.borrow_mut().push((offset, buf[..n].to_vec()));
            Ok(n)
        }
    }

    /// Platform whose native preallocation always fails with `errno`.
    struct FailingAllocate {
        errno: i32,
        calls: Cell<u32>,
    }

    impl Platform for FailingAllocate {
        fn flush_file(&self, _file: &File) -> io::Result<()> {
            Ok(())
        }

        fn sync_directory_allowed(&self, _dir: &File) -> io::Result<bool> {
            Ok(true)
        }

        fn fallocate(&self, _file: &File, _offset: u64, _len: u64) -> io::Result<()> {
            self.calls.set(self.calls.get() + 1);
            Err(io::Error::from_raw_os_error(self.errno))
        }

        fn direct_open_flags(&self) -> i32 {
            0
        }

        fn finish_open_direct(&self, _file: &File) -> io::Result<()> {
            Ok(())
        }
    }

    fn open_rw(path: &std::path::Path) -> io::Result<File> {
        File::options().read(true).write(true).create(true).open(path)
    }

    #[test]
    fn test_ensure_size_grows_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = open_rw(&dir.path().join("data.bin"))?;

        let allocation = ensure_size(&file, 128 * 1024)?;
        assert_eq!(
            allocation,
            Allocation::Extended {
                from: 0,
                to: 128 * 1024
            }
        );
        assert_eq!(file.metadata()?.len(), 128 * 1024);

        Ok(())
    }

    #[test]
    fn test_ensure_size_is_idempotent() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = open_rw(&dir.path().join("data.bin"))?;

        ensure_size(&file, 4096)?;
        let allocation = ensure_size(&file, 4096)?;
        assert_eq!(allocation, Allocation::Unchanged);
        assert!(!allocation.grew());
        assert_eq!(file.metadata()?.len(), 4096);

        // A smaller target never shrinks the file.
        assert_eq!(ensure_size(&file, 100)?, Allocation::Unchanged);
        assert_eq!(file.metadata()?.len(), 4096);

        Ok(())
    }

    #[test]
    fn test_fallback_to_sparse_extension() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = open_rw(&dir.path().join("data.bin"))?;

        for errno in [libc::EINVAL, libc::EOPNOTSUPP, libc::EFBIG] {
            let platform = FailingAllocate {
                errno,
                calls: Cell::new(0),
            };
            let target = file.metadata()?.len() + 10_000;
            let allocation = ensure_size_on(&platform, &PalConfig::default(), &file, target)?;
            assert!(allocation.grew());
            assert_eq!(platform.calls.get(), 1);
            assert_eq!(file.metadata()?.len(), target);

            let mut last = [0xFFu8; 1];
            file.read_exact_at(&mut last, target - 1)?;
            assert_eq!(last, [0]);
        }

        Ok(())
    }

    #[test]
    fn test_other_errors_are_fatal() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = open_rw(&dir.path().join("data.bin"))?;
        let platform = FailingAllocate {
            errno: libc::ENOSPC,
            calls: Cell::new(0),
        };

        let err = ensure_size_on(&platform, &PalConfig::default(), &file, 4096).unwrap_err();
        assert_eq!(err.code(), crate::error::FailCode::AllocationFailed);
        assert_eq!(err.errno(), Some(libc::ENOSPC));
        assert_eq!(file.metadata()?.len(), 0);

        Ok(())
    }

    #[test]
    fn test_pwrite_with_retries_writes_everything() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = open_rw(&dir.path().join("data.bin"))?;

        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        pwrite_with_retries(&file, &data, 512, 3)?;

        let mut read_back = vec![0u8; data.len()];
        file.read_exact_at(&mut read_back, 512)?;
        assert_eq!(read_back, data);

        Ok(())
    }

    #[test]
    fn test_pwrite_retries_interrupted_writes() -> anyhow::Result<()> {
        let target = ScriptedWrites::interrupted(3);
        pwrite_with_retries(&target, b"payload", 64, 3)?;
        assert_eq!(*target.written.borrow(), vec![(64, b"payload".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_pwrite_gives_up_after_bounded_retries() {
        let target = ScriptedWrites::interrupted(4);
        let err = pwrite_with_retries(&target, b"payload", 0, 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(target.written.borrow().is_empty());
    }

    #[test]
    fn test_pwrite_resumes_short_writes() -> anyhow::Result<()> {
        let target = ScriptedWrites::new([
            Ok(3),
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Ok(2),
        ]);
        pwrite_with_retries(&target, b"0123456789", 100, 1)?;
        assert_eq!(
            *target.written.borrow(),
            vec![
                (100, b"012".to_vec()),
                (103, b"34".to_vec()),
                (105, b"56789".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_pwrite_zero_progress_is_an_error() {
        let target = ScriptedWrites::new([Ok(0)]);
        let err = pwrite_with_retries(&target, b"x", 0, 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
