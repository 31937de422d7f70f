//! Durable append-log (journal) files.
//!
//! In [`JournalMode::Safe`] the descriptor is opened for synchronous,
//! cache-bypassing writes: every [`JournalHandle::write`] returns only once the
//! data is on stable storage. Cache bypass means the buffer address, its length
//! and the file offset must all be multiples of the device block size;
//! [`AlignedBuffer`] provides suitably aligned memory. Misalignment is reported
//! by the device as a failed write.

use crate::config::PalConfig;
use crate::error::{PalError, PalResult};
use crate::platform::{close_file, NativePlatform, Platform};
use crate::storage::alloc::{ensure_size_on, pwrite_with_retries, WriteAt};
use crate::storage::dirsync::DirectorySync;
use crate::storage::mmap::release;
use log::{debug, warn};
use std::alloc::{self, Layout};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Size reserved by [`test_storage_durability`] (64KB).
const DURABILITY_PROBE_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JournalMode {
    /// Synchronous, cache-bypassing writes.
    #[default]
    Safe,
    /// Plain buffered writes. Nothing is durable until the OS decides so.
    Danger,
}

/// Write handle to a journal file.
pub struct JournalHandle {
    file: ManuallyDrop<File>,
    path: PathBuf,
    mode: JournalMode,
    length: u64,
    config: PalConfig,
}

impl fmt::Debug for JournalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalHandle")
            .field("fd", &self.file.as_raw_fd())
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("length", &self.length)
            .finish()
    }
}

impl JournalHandle {
    /// Open (creating if needed) the journal at `path` and make sure it is at
    /// least `preallocate_length` bytes long. Reopening an existing journal
    /// that is already long enough leaves it untouched.
    pub fn open(
        path: impl AsRef<Path>,
        mode: JournalMode,
        preallocate_length: u64,
    ) -> PalResult<JournalHandle> {
        Self::open_with(&PalConfig::default(), path, mode, preallocate_length)
    }

    pub fn open_with(
        config: &PalConfig,
        path: impl AsRef<Path>,
        mode: JournalMode,
        preallocate_length: u64,
    ) -> PalResult<JournalHandle> {
        let path = path.as_ref();
        let platform = NativePlatform::default();

        let file = open_for_writes(&platform, path, mode)?;

        let current_length = file
            .metadata()
            .map_err(|source| PalError::StatFailed {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        let allocation = ensure_size_on(&platform, config, &file, preallocate_length)?;
        if allocation.grew() {
            DirectorySync::new(platform, config.max_symlink_depth)
                .sync_containing_directory(path)?;
        }

        debug!(
            "Opened journal {:?} ({:?}): {} bytes on disk, {} requested",
            path, mode, current_length, preallocate_length
        );

        Ok(JournalHandle {
            file: ManuallyDrop::new(file),
            path: path.to_path_buf(),
            mode,
            length: current_length.max(preallocate_length),
            config: *config,
        })
    }

    /// Write all of `buffer` at `offset`.
    ///
    /// Interrupted writes are retried up to the configured bound and short
    /// writes are resumed. In safe mode `buffer`, its length and `offset` must
    /// be aligned to the device block size.
    pub fn write(&mut self, buffer: &[u8], offset: u64) -> PalResult<()> {
        write_fully(&*self.file, buffer, offset, self.config.write_retries)?;
        self.length = self.length.max(offset + buffer.len() as u64);
        Ok(())
    }

    /// Cut the journal to `length` bytes and flush the change.
    pub fn truncate(&mut self, length: u64) -> PalResult<()> {
        self.file
            .set_len(length)
            .map_err(|source| PalError::TruncateFailed { length, source })?;
        NativePlatform::default()
            .flush_file(&self.file)
            .map_err(|source| PalError::SyncFailed {
                path: self.path.clone(),
                source,
            })?;
        self.length = length;
        Ok(())
    }

    /// Close the descriptor, reporting a failing close(2).
    pub fn close(self) -> PalResult<()> {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the file is taken exactly once.
        let file = unsafe { ManuallyDrop::take(&mut this.file) };
        let path = std::mem::take(&mut this.path);
        close_file(file).map_err(|source| PalError::CloseFailed {
            path,
            source,
            unlink: None,
        })
    }

    /// Close the journal, unlinking it first when `delete_on_close` is set.
    ///
    /// The descriptor is closed even when the unlink fails; a failing close
    /// carries the unlink error.
    pub fn dispose(self, delete_on_close: bool) -> PalResult<()> {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the file is taken exactly once.
        let file = unsafe { ManuallyDrop::take(&mut this.file) };
        let path = std::mem::take(&mut this.path);
        release(file, &path, delete_on_close)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> JournalMode {
        self.mode
    }

    /// Known length of the journal file.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl Drop for JournalHandle {
    fn drop(&mut self) {
        // SAFETY: drop runs once and `close` bypasses it.
        let file = unsafe { ManuallyDrop::take(&mut self.file) };
        if let Err(e) = close_file(file) {
            warn!("Closing journal {:?} failed: {}", self.path, e);
        }
    }
}

fn write_fully<W: WriteAt + ?Sized>(
    target: &W,
    buffer: &[u8],
    offset: u64,
    retries: u32,
) -> PalResult<()> {
    pwrite_with_retries(target, buffer, offset, retries).map_err(|source| {
        PalError::WriteFailed {
            offset,
            size: buffer.len(),
            source,
        }
    })
}

fn open_for_writes<P: Platform>(platform: &P, path: &Path, mode: JournalMode) -> PalResult<File> {
    let open_failed = |source| PalError::OpenFailed {
        path: path.to_path_buf(),
        source,
    };

    let mut options = OpenOptions::new();
    options.write(true).create(true).mode(0o600);
    if mode == JournalMode::Safe {
        options.custom_flags(platform.direct_open_flags());
    }

    let file = options.open(path).map_err(open_failed)?;
    if mode == JournalMode::Safe {
        platform.finish_open_direct(&file).map_err(open_failed)?;
    }
    Ok(file)
}

/// Read handle to a journal file, used when replaying it.
#[derive(Debug)]
pub struct JournalReader {
    file: File,
    path: PathBuf,
    retries: u32,
}

impl JournalReader {
    pub fn open(path: impl AsRef<Path>) -> PalResult<JournalReader> {
        Self::open_with(&PalConfig::default(), path)
    }

    /// Open for reads; interrupted reads are retried `config.write_retries`
    /// times, like writes.
    pub fn open_with(config: &PalConfig, path: impl AsRef<Path>) -> PalResult<JournalReader> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| PalError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(JournalReader {
            file,
            path: path.to_path_buf(),
            retries: config.write_retries,
        })
    }

    /// Fill `buffer` from `offset`, returning fewer bytes only at end of file.
    pub fn read(&self, buffer: &mut [u8], offset: u64) -> PalResult<usize> {
        let mut total = 0usize;
        let mut interrupted = 0u32;

        while total < buffer.len() {
            match self.file.read_at(&mut buffer[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        && interrupted < self.retries =>
                {
                    interrupted += 1;
                }
                Err(source) => return Err(PalError::ReadFailed { offset, source }),
            }
        }

        Ok(total)
    }

    pub fn len(&self) -> PalResult<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|source| PalError::StatFailed {
                path: self.path.clone(),
                source,
            })?
            .len())
    }

    pub fn is_empty(&self) -> PalResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// Check that the filesystem holding `temp_path` accepts synchronous
/// cache-bypassing writes with preallocation.
///
/// An allocation failing with `EINVAL` means direct writes are unsupported and
/// is reported as [`PalError::DurabilityTestFailed`]. The probe file is always
/// removed.
pub fn test_storage_durability(temp_path: impl AsRef<Path>) -> PalResult<()> {
    let temp_path = temp_path.as_ref();
    let result = probe_durability(&NativePlatform::default(), temp_path);

    if let Err(e) = fs::remove_file(temp_path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove durability probe {:?}: {}", temp_path, e);
        }
    }

    result
}

fn probe_durability<P: Platform>(platform: &P, path: &Path) -> PalResult<()> {
    let file = open_for_writes(platform, path, JournalMode::Safe)?;

    match ensure_size_on(platform, &PalConfig::default(), &file, DURABILITY_PROBE_SIZE) {
        Ok(_) => {}
        Err(PalError::AllocationFailed { source, .. })
            if source.raw_os_error() == Some(libc::EINVAL) =>
        {
            return Err(PalError::DurabilityTestFailed {
                path: path.to_path_buf(),
                source,
            });
        }
        Err(e) => return Err(e),
    }

    close_file(file).map_err(|source| PalError::CloseFailed {
        path: path.to_path_buf(),
        source,
        unlink: None,
    })
}

/// Zeroed heap memory aligned for cache-bypassing I/O.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
// SAFETY: shared access is read-only.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes aligned to `align` (a power of two).
    pub fn new(len: usize, align: usize) -> io::Result<AlignedBuffer> {
        let layout = Layout::from_size_align(len.max(align), align)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Ok(AlignedBuffer { ptr, len, layout })
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the allocation holds at least `len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
