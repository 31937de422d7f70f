//! Memory-mapped data files.
//!
//! A [`MappedFile`] owns the descriptor of a data file; each [`Mapping`] owns
//! one region of address space backed by it. The two lifetimes are
//! independent: growing a file never remaps in place (not every OS can resize
//! a mapping), it hands out a new `Mapping` covering the larger extent while
//! earlier mappings stay valid until their owner unmaps them.
//!
//! ```text
//! create_and_map ──► MappedFile + Mapping(len = N1)
//! grow(N2)       ──► Mapping(len = N2)      (old Mapping still live)
//! unmap(old)     ──► readers migrated, old region released
//! dispose        ──► unlink (delete-on-close) then close, exactly once
//! ```

use crate::config::PalConfig;
use crate::error::{PalError, PalResult};
use crate::platform::{close_file, cvt, NativePlatform};
use crate::storage::alloc::ensure_size_on;
use crate::storage::dirsync::{containing_directory, DirectorySync};
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::mem::ManuallyDrop;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::OnceLock;
use std::{fmt, slice};

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The system page size, queried once.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no memory-safety preconditions.
        let rc = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if rc <= 0 {
            warn!("sysconf(_SC_PAGESIZE) failed, assuming 4096");
            4096
        } else {
            rc as usize
        }
    })
}

/// `value` rounded up to a multiple of `multiple` (treated as at least 1), or
/// `None` if that does not fit in a `u64`.
fn round_up(value: u64, multiple: u64) -> Option<u64> {
    let multiple = multiple.max(1);
    value.div_ceil(multiple).checked_mul(multiple)
}

fn too_large(length: u64) -> PalError {
    PalError::AllocationFailed {
        length,
        source: io::Error::from_raw_os_error(libc::EFBIG),
    }
}

/// How writes through a mapping relate to the backing file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sharing {
    /// Writes reach the file.
    #[default]
    Shared,
    /// Writes stay private to the process.
    CopyOnWrite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapFlags {
    pub sharing: Sharing,
    /// Unlink the backing file on dispose.
    pub delete_on_close: bool,
}

impl MapFlags {
    pub fn shared() -> Self {
        MapFlags::default()
    }

    pub fn copy_on_write() -> Self {
        MapFlags {
            sharing: Sharing::CopyOnWrite,
            delete_on_close: false,
        }
    }

    pub fn delete_on_close(mut self) -> Self {
        self.delete_on_close = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
}

impl Protection {
    fn prot_flags(self) -> libc::c_int {
        match self {
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// A read-write region of address space backed by a mapped file.
///
/// Owned by whoever received it from [`MappedFile::create_and_map`] or
/// [`MappedFile::grow`]. [`Mapping::unmap`] consumes it; dropping it unmaps
/// without the delete-on-close advisory.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a Mapping is the sole owner of its region; the raw pointer is not
// tied to the creating thread.
unsafe impl Send for Mapping {}
// SAFETY: shared access only hands out reads and copies.
unsafe impl Sync for Mapping {}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Mapping {
    fn map(file: &File, length: u64, sharing: Sharing) -> PalResult<Mapping> {
        let map_failed = |source: io::Error| PalError::MapFailed { length, source };

        let len = usize::try_from(length)
            .map_err(|_| map_failed(io::Error::from_raw_os_error(libc::EOVERFLOW)))?;
        let flags = match sharing {
            Sharing::Shared => libc::MAP_SHARED,
            Sharing::CopyOnWrite => libc::MAP_PRIVATE,
        };

        // SAFETY: we ask the kernel for a fresh region; the descriptor is owned
        // by `file` and the mapping keeps the file referenced after close.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(map_failed(io::Error::last_os_error()));
        }

        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| map_failed(io::Error::from_raw_os_error(libc::EFAULT)))?;
        Ok(Mapping { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the whole region as a slice.
    ///
    /// # Safety
    ///
    /// Other shared mappings of the same file (and other processes) see the
    /// same bytes. The caller must ensure nothing writes to the region while
    /// the slice is alive and that no page of it is read-protected.
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// View the whole region as a mutable slice.
    ///
    /// # Safety
    ///
    /// Same as [`Mapping::as_slice`], and no other mapping of the file may be
    /// accessed while the slice is alive.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }

    /// Copy bytes out of the region starting at `offset`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        self.check_bounds(offset, buf.len())?;
        // SAFETY: bounds checked above; `buf` cannot overlap the mapping
        // because we never hand out long-lived references to it.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        self.check_bounds(offset, data.len())?;
        // SAFETY: bounds checked above.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {}+{} outside mapping of {} bytes",
                    offset, len, self.len
                ),
            )),
        }
    }

    /// Page-aligned start and length covering `[offset, offset + len)`,
    /// clamped to the mapping.
    fn page_range(&self, offset: usize, len: usize) -> io::Result<(*mut libc::c_void, usize)> {
        if offset > self.len {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let end = offset.saturating_add(len).min(self.len);
        let start = offset - offset % page_size();
        // SAFETY: start <= offset <= self.len.
        let addr = unsafe { self.ptr.as_ptr().add(start) };
        Ok((addr as *mut libc::c_void, end - start))
    }

    /// Write dirty pages of the whole region back to the file and wait.
    pub fn flush(&self) -> PalResult<()> {
        self.flush_range(0, self.len)
    }

    pub fn flush_range(&self, offset: usize, len: usize) -> PalResult<()> {
        let failed = |source| PalError::FlushFailed {
            length: len as u64,
            source,
        };
        let (addr, len) = self.page_range(offset, len).map_err(failed)?;
        // SAFETY: the range lies within this mapping.
        cvt(unsafe { libc::msync(addr, len, libc::MS_SYNC) }).map_err(failed)?;
        Ok(())
    }

    /// Ask the OS to read the range ahead of use.
    ///
    /// See [`prefetch_ranges`] to issue several requests at once.
    pub fn prefetch(&self, offset: usize, len: usize) -> PalResult<()> {
        self.advise(offset, len, libc::MADV_WILLNEED)
            .map_err(|source| PalError::MapFailed {
                length: len as u64,
                source,
            })
    }

    /// Tell the OS the range's contents are no longer needed.
    pub fn discard(&self, offset: usize, len: usize) -> PalResult<()> {
        self.advise(offset, len, libc::MADV_DONTNEED)
            .map_err(|source| PalError::UnmapFailed {
                length: len as u64,
                source,
            })
    }

    fn advise(&self, offset: usize, len: usize, advice: libc::c_int) -> io::Result<()> {
        let (addr, len) = self.page_range(offset, len)?;
        // SAFETY: the range lies within this mapping.
        cvt(unsafe { libc::madvise(addr, len, advice) })?;
        Ok(())
    }

    /// Change the protection of the pages covering the range.
    ///
    /// # Safety
    ///
    /// While any part of the region is [`Protection::ReadOnly`], the caller
    /// must not write to it through [`Mapping::write_at`] or a slice; doing so
    /// faults the process.
    pub unsafe fn protect(
        &self,
        offset: usize,
        len: usize,
        protection: Protection,
    ) -> PalResult<()> {
        let failed = |source| PalError::ProtectFailed {
            length: len as u64,
            source,
        };
        let (addr, len) = self.page_range(offset, len).map_err(failed)?;
        // SAFETY: the range lies within this mapping.
        cvt(unsafe { libc::mprotect(addr, len, protection.prot_flags()) }).map_err(failed)?;
        Ok(())
    }

    /// Release the region.
    ///
    /// With `delete_on_close` the pages are first marked as not needed so the
    /// kernel does not write back data about to be deleted. That advisory is
    /// best-effort; the unmap is attempted regardless.
    pub fn unmap(self, delete_on_close: bool) -> PalResult<()> {
        let this = ManuallyDrop::new(self);
        let addr = this.ptr.as_ptr() as *mut libc::c_void;

        if delete_on_close {
            // SAFETY: the whole region belongs to this mapping.
            if unsafe { libc::madvise(addr, this.len, libc::MADV_DONTNEED) } != 0 {
                warn!(
                    "madvise(MADV_DONTNEED) before unmap failed: {}",
                    io::Error::last_os_error()
                );
            }
        }

        // SAFETY: the region is unmapped exactly once; `this` is not dropped.
        cvt(unsafe { libc::munmap(addr, this.len) }).map_err(|source| PalError::UnmapFailed {
            length: this.len as u64,
            source,
        })?;
        Ok(())
    }
}

/// Prefetch each `(mapping, offset, len)` range in order, stopping at the
/// first failure.
pub fn prefetch_ranges(ranges: &[(&Mapping, usize, usize)]) -> PalResult<()> {
    for &(mapping, offset, len) in ranges {
        mapping.prefetch(offset, len)?;
    }
    Ok(())
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: the region is owned by this mapping and released only here.
        if unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) } != 0 {
            warn!(
                "munmap of {} bytes failed: {}",
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}

/// An open, memory-mappable data file.
pub struct MappedFile {
    file: ManuallyDrop<File>,
    path: PathBuf,
    flags: MapFlags,
    length: u64,
    config: PalConfig,
}

impl fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedFile")
            .field("fd", &self.file.as_raw_fd())
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("length", &self.length)
            .finish()
    }
}

impl MappedFile {
    /// Open or create `path` and map at least `initial_length` bytes of it.
    ///
    /// The mapped length is `initial_length` rounded up to the allocation
    /// granularity, or the current file length if larger, rounded up to the
    /// page size. The returned mapping covers exactly [`MappedFile::len`] bytes.
    ///
    /// # Safety
    ///
    /// The returned [`Mapping`] reads and writes the file's pages directly.
    /// Other mappings of the same file, in this process or another, see those
    /// bytes too. The caller must make sure no region is written through one
    /// mapping while it is read or written through another at the same time.
    pub unsafe fn create_and_map(
        path: impl AsRef<Path>,
        initial_length: u64,
        flags: MapFlags,
    ) -> PalResult<(MappedFile, Mapping)> {
        Self::create_and_map_with(&PalConfig::default(), path, initial_length, flags)
    }

    /// # Safety
    ///
    /// Same contract as [`MappedFile::create_and_map`].
    pub unsafe fn create_and_map_with(
        config: &PalConfig,
        path: impl AsRef<Path>,
        initial_length: u64,
        flags: MapFlags,
    ) -> PalResult<(MappedFile, Mapping)> {
        let path = path.as_ref();

        let parent = containing_directory(path);
        fs::create_dir_all(&parent).map_err(|source| PalError::OpenFailed {
            path: parent.clone(),
            source,
        })?;

        // From here on, an early return drops `file` and closes the descriptor.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(path)
            .map_err(|source| PalError::OpenFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let path = fs::canonicalize(path).map_err(|source| PalError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;

        let current_length =
            file.seek(SeekFrom::End(0))
                .map_err(|source| PalError::SeekFailed {
                    path: path.clone(),
                    source,
                })?;

        let actual_length = round_up(initial_length.max(1), config.allocation_granularity)
            .and_then(|granular| round_up(granular.max(current_length), page_size() as u64))
            .ok_or_else(|| too_large(initial_length))?;

        let platform = NativePlatform::default();
        let allocation = ensure_size_on(&platform, config, &file, actual_length)?;
        if allocation.grew() {
            DirectorySync::new(platform, config.max_symlink_depth)
                .sync_containing_directory(&path)?;
        }

        let mapping = Mapping::map(&file, actual_length, flags.sharing)?;

        debug!(
            "Mapped {:?}: {} bytes (requested {}, on disk {}) {:?}",
            path, actual_length, initial_length, current_length, flags
        );

        Ok((
            MappedFile {
                file: ManuallyDrop::new(file),
                path,
                flags,
                length: actual_length,
                config: *config,
            },
            mapping,
        ))
    }

    /// Extend the file to `new_length` and return a new mapping covering it
    /// from offset 0.
    ///
    /// Mappings returned earlier are left untouched and remain valid; the
    /// caller unmaps them once readers have moved to the new one. A failure
    /// leaves the handle open.
    ///
    /// # Safety
    ///
    /// The new mapping aliases every earlier mapping of the file over their
    /// common prefix. Same contract as [`MappedFile::create_and_map`].
    pub unsafe fn grow(&mut self, new_length: u64, sharing: Sharing) -> PalResult<Mapping> {
        let requested = new_length;
        let new_length =
            round_up(new_length.max(1), page_size() as u64).ok_or_else(|| too_large(requested))?;

        let platform = NativePlatform::default();
        let allocation = ensure_size_on(&platform, &self.config, &self.file, new_length)?;
        if allocation.grew() {
            DirectorySync::new(platform, self.config.max_symlink_depth)
                .sync_containing_directory(&self.path)?;
        }

        let mapping = Mapping::map(&self.file, new_length, sharing)?;
        self.length = self.length.max(new_length);

        debug!("Grew {:?} to {} bytes", self.path, new_length);
        Ok(mapping)
    }

    /// Unlink the file if delete-on-close was requested, then close it.
    ///
    /// The descriptor is closed even when the unlink fails. If both fail the
    /// close error is returned and carries the unlink error.
    pub fn dispose(self) -> PalResult<()> {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the file is taken exactly once.
        let file = unsafe { ManuallyDrop::take(&mut this.file) };
        let path = std::mem::take(&mut this.path);
        release(file, &path, this.flags.delete_on_close)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    /// Largest extent mapped so far.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        // SAFETY: drop runs once and `dispose` bypasses it.
        let file = unsafe { ManuallyDrop::take(&mut self.file) };
        if let Err(e) = release(file, &self.path, self.flags.delete_on_close) {
            warn!("Releasing mapped file {:?} failed: {}", self.path, e);
        }
    }
}

pub(crate) fn release(file: File, path: &Path, delete_on_close: bool) -> PalResult<()> {
    let mut unlink_error = None;
    if delete_on_close {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to unlink {:?} on close: {}", path, e);
            unlink_error = Some(e);
        }
    }

    if let Err(source) = close_file(file) {
        return Err(PalError::CloseFailed {
            path: path.to_path_buf(),
            source,
            unlink: unlink_error,
        });
    }

    match unlink_error {
        Some(source) => Err(PalError::UnlinkFailed {
            path: path.to_path_buf(),
            source,
        }),
        None => Ok(()),
    }
}
