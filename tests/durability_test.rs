use anyhow::Result;
use durafs::storage::{
    ensure_size, page_size, sync_containing_directory, Allocation, JournalHandle, JournalMode,
    JournalReader, MapFlags, MappedFile, Mapping, Sharing,
};
use durafs::{FailCode, PalConfig, PalError, PalResult};
use rand::Rng;
use std::fs::{self, OpenOptions};
use std::path::Path;
use tempfile::tempdir;

fn map_file(
    path: impl AsRef<Path>,
    initial_length: u64,
    flags: MapFlags,
) -> PalResult<(MappedFile, Mapping)> {
    // SAFETY: each test maps its own file and uses it from one thread.
    unsafe { MappedFile::create_and_map(path, initial_length, flags) }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill(&mut buf[..]);
    buf
}

#[test]
fn test_mapped_length_covers_request() -> Result<()> {
    let dir = tempdir()?;
    let page = page_size() as u64;

    for (i, initial) in [1u64, 4095, 4096, 65_537, 300_000].into_iter().enumerate() {
        let path = dir.path().join(format!("data-{}.db", i));
        let (file, mut mapping) = map_file(&path, initial, MapFlags::shared())?;

        assert!(file.len() >= initial);
        assert_eq!(file.len() % page, 0);
        assert_eq!(mapping.len() as u64, file.len());
        assert_eq!(fs::metadata(&path)?.len(), file.len());

        let last = mapping.len() - 1;
        mapping.write_at(last, &[0xAB])?;
        let mut byte = [0u8];
        mapping.read_at(last, &mut byte)?;
        assert_eq!(byte, [0xAB]);

        mapping.unmap(false)?;
        file.dispose()?;
    }
    Ok(())
}

#[test]
fn test_ensure_size_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("prealloc.bin");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;

    assert_eq!(
        ensure_size(&file, 12_345)?,
        Allocation::Extended {
            from: 0,
            to: 12_345
        }
    );
    assert_eq!(ensure_size(&file, 12_345)?, Allocation::Unchanged);
    assert_eq!(file.metadata()?.len(), 12_345);
    Ok(())
}

#[test]
fn test_delete_on_close_leaves_no_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("scratch.tmp");

    let (file, mapping) = map_file(&path, 8192, MapFlags::shared().delete_on_close())?;
    mapping.unmap(true)?;
    file.dispose()?;

    assert!(!path.exists());
    OpenOptions::new().write(true).create_new(true).open(&path)?;
    Ok(())
}

#[test]
fn test_grow_preserves_contents() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("grow.db");
    let config = PalConfig::default().with_allocation_granularity(4096);

    // SAFETY: both mappings are used from this thread only.
    let (mut file, mut first) =
        unsafe { MappedFile::create_and_map_with(&config, &path, 4096, MapFlags::shared())? };
    let payload = random_bytes(first.len());
    first.write_at(0, &payload)?;

    let target = file.len() * 8;
    // SAFETY: as above.
    let second = unsafe { file.grow(target, Sharing::Shared)? };
    assert!(second.len() as u64 >= target);
    assert_eq!(file.len(), second.len() as u64);

    let mut seen = vec![0u8; payload.len()];
    second.read_at(0, &mut seen)?;
    assert_eq!(seen, payload);

    // The old mapping stays valid until its owner unmaps it.
    first.read_at(0, &mut seen)?;
    assert_eq!(seen, payload);

    first.unmap(false)?;
    second.unmap(false)?;
    file.dispose()?;
    Ok(())
}

#[test]
fn test_reopen_keeps_mapped_data() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("persist.db");
    let payload = random_bytes(1000);

    {
        let (file, mut mapping) = map_file(&path, 4096, MapFlags::shared())?;
        mapping.write_at(100, &payload)?;
        mapping.flush()?;
        mapping.unmap(false)?;
        file.dispose()?;
    }

    let (file, mapping) = map_file(&path, 1, MapFlags::copy_on_write())?;
    let mut seen = vec![0u8; payload.len()];
    mapping.read_at(100, &mut seen)?;
    assert_eq!(seen, payload);
    drop(mapping);
    drop(file);
    Ok(())
}

#[test]
fn test_journal_preallocates_before_first_write() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("journal.log");

    let journal = JournalHandle::open(&path, JournalMode::Danger, 1 << 20)?;
    assert!(fs::metadata(&path)?.len() >= 1 << 20);
    assert!(journal.len() >= 1 << 20);
    journal.close()?;
    Ok(())
}

#[test]
fn test_journal_writes_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("journal.log");
    let first = random_bytes(4096);
    let second = random_bytes(512);

    let mut journal = JournalHandle::open(&path, JournalMode::Danger, 64 * 1024)?;
    journal.write(&first, 0)?;
    journal.write(&second, 8192)?;
    journal.close()?;

    let journal = JournalHandle::open(&path, JournalMode::Danger, 64 * 1024)?;
    assert_eq!(journal.len(), 64 * 1024);
    journal.close()?;

    let reader = JournalReader::open(&path)?;
    let mut seen = vec![0u8; first.len()];
    assert_eq!(reader.read(&mut seen, 0)?, first.len());
    assert_eq!(seen, first);

    let mut seen = vec![0u8; second.len()];
    assert_eq!(reader.read(&mut seen, 8192)?, second.len());
    assert_eq!(seen, second);
    Ok(())
}

#[test]
fn test_sync_directory_of_new_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("fresh.bin");
    fs::write(&path, b"fresh")?;
    sync_containing_directory(&path)?;
    Ok(())
}

#[test]
fn test_errors_carry_platform_code() {
    let err = JournalHandle::open(
        "/nonexistent/path/that/does/not/exist/journal.log",
        JournalMode::Danger,
        0,
    )
    .unwrap_err();

    assert!(matches!(err, PalError::OpenFailed { .. }));
    assert_eq!(err.code(), FailCode::OpenFailed);
    assert_eq!(err.errno(), Some(libc::ENOENT));
}
