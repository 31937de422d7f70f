//! durafs - inspect and exercise the durability guarantees of a data directory

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use durafs::config::{
    DEFAULT_ALLOCATION_GRANULARITY, DEFAULT_MAX_SYMLINK_DEPTH, DEFAULT_WRITE_RETRIES,
};
use durafs::storage::{self, dirsync};
use durafs::{system, PalConfig};
use log::{debug, info};
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// durafs - durable file primitives for storage engines
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Unit that preallocated lengths are rounded up to
    #[arg(long, global = true, default_value_t = DEFAULT_ALLOCATION_GRANULARITY)]
    allocation_granularity: u64,

    /// Maximum symbolic links followed when syncing a directory
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_SYMLINK_DEPTH)]
    max_symlink_depth: u32,

    /// Retries for a write interrupted by a signal
    #[arg(long, global = true, default_value_t = DEFAULT_WRITE_RETRIES)]
    write_retries: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Total and free bytes of the filesystem holding PATH
    DiskSpace { path: PathBuf },

    /// Completed read/write operations of the block device holding PATH
    IoStats { path: PathBuf },

    /// Page size and prefetch support
    Sysinfo,

    /// Check that DIR accepts synchronous, cache-bypassing writes
    TestDurability { dir: PathBuf },

    /// Reserve LENGTH bytes for PATH and make the new length durable
    Preallocate { path: PathBuf, length: u64 },

    /// Flush the directory entry of PATH, following symbolic links
    SyncDir { path: PathBuf },
}

impl Args {
    fn config(&self) -> PalConfig {
        PalConfig::default()
            .with_allocation_granularity(self.allocation_granularity)
            .with_max_symlink_depth(self.max_symlink_depth)
            .with_write_retries(self.write_retries)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = args.config();
    debug!("Using {:?}", config);

    match &args.command {
        Command::DiskSpace { path } => {
            let space = system::query_disk_space(path)
                .with_context(|| format!("Failed to query disk space of {}", path.display()))?;
            println!("total: {} bytes", space.total_bytes);
            println!("free:  {} bytes", space.free_bytes);
        }
        Command::IoStats { path } => {
            let stats = system::query_disk_io_stats(path)
                .with_context(|| format!("Failed to query I/O stats of {}", path.display()))?;
            println!("reads:  {}", stats.read_ops);
            println!("writes: {}", stats.write_ops);
        }
        Command::Sysinfo => {
            let info = system::query_system_info().context("Failed to query system info")?;
            println!("page size: {}", info.page_size);
            println!("prefetch:  {}", info.prefetch_supported);
            println!("thread id: {}", system::current_thread_id());
        }
        Command::TestDurability { dir } => {
            let probe = dir.join(format!(".durafs-probe-{}", std::process::id()));
            storage::test_storage_durability(&probe)
                .with_context(|| format!("Durability test failed in {}", dir.display()))?;
            info!("{} supports durable direct writes", dir.display());
        }
        Command::Preallocate { path, length } => preallocate(&config, path, *length)?,
        Command::SyncDir { path } => {
            dirsync::sync_containing_directory_with(&config, path)
                .with_context(|| format!("Failed to sync directory of {}", path.display()))?;
            info!("Synced directory of {}", path.display());
        }
    }

    Ok(())
}

fn preallocate(config: &PalConfig, path: &Path, length: u64) -> Result<()> {
    let granularity = config.allocation_granularity.max(1);
    let target = length
        .div_ceil(granularity)
        .checked_mul(granularity)
        .with_context(|| format!("{} bytes rounded to {} overflows", length, granularity))?;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let allocation = storage::ensure_size_with(config, &file, target)
        .with_context(|| format!("Failed to preallocate {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {}", path.display()))?;
    drop(file);

    if allocation.grew() {
        dirsync::sync_containing_directory_with(config, path)
            .with_context(|| format!("Failed to sync directory of {}", path.display()))?;
        info!("{}: {:?}", path.display(), allocation);
    } else {
        info!("{} already holds {} bytes", path.display(), target);
    }
    Ok(())
}
