//! Durable file primitives for the storage engine.
//!
//! This module answers one question for every call: after it returns, what is
//! guaranteed to survive a power loss? Components, leaf first:
//!
//! - **alloc**: reserves file space, falling back to sparse extension
//! - **dirsync**: flushes directory metadata so length changes are durable
//! - **mmap**: creates, grows and disposes memory-mapped data files
//! - **journal**: synchronous, cache-bypassing positioned writes for the log
//! - **header**: writes a small header at the start of a file and flushes it
//!
//! Nothing in here interprets the bytes written through it.

pub mod alloc;
pub mod dirsync;
pub mod header;
pub mod journal;
pub mod mmap;

pub use alloc::{ensure_size, ensure_size_with, Allocation};
pub use dirsync::sync_containing_directory;
pub use header::write_header;
pub use journal::{
    test_storage_durability, AlignedBuffer, JournalHandle, JournalMode, JournalReader,
};
pub use mmap::{page_size, prefetch_ranges, MapFlags, MappedFile, Mapping, Protection, Sharing};
