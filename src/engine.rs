//! The uniform recovered-entry model and engine dispatch.
//!
//! Every engine reduces its findings to `RecoveredEntry` values so listing
//! and extraction stay engine-agnostic; the `run` entry point wires one
//! source, one engine and one output directory together for a whole run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::carver::Carver;
use crate::detect::{self, Filesystem};
use crate::disk_reader::{BlockSource, DiskReader};
use crate::error::RecoveryError;
use crate::fat32::Fat32Engine;
use crate::ntfs::{DataRun, NtfsEngine};
use crate::output;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// Engine-specific description of where an entry's payload lives.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PayloadLocator {
    /// FAT32: the chain was zeroed on deletion, so only the first cluster
    /// survives; extraction assumes contiguity from there.
    FatClusters { first_cluster: u32 },
    /// NTFS: payload small enough to live inside the MFT record.
    NtfsResident {
        #[serde(skip)]
        data: Vec<u8>,
    },
    /// NTFS: ordered non-resident extent list.
    NtfsRuns { runs: Vec<DataRun> },
    /// Carver: bounded byte range, optionally cut at a footer match.
    CarveRegion {
        offset: u64,
        max_size: u64,
        #[serde(skip)]
        footer: Option<&'static [u8]>,
    },
}

/// One recoverable item, produced identically by all three engines.
#[derive(Serialize, Debug, Clone)]
pub struct RecoveredEntry {
    pub display_name: String,
    pub relative_path: String,
    pub size_bytes: u64,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_unix: Option<i64>,
    pub locator: PayloadLocator,
}

/// Parameters of a single recovery run.
pub struct RunOptions {
    pub device: String,
    pub output_dir: PathBuf,
    /// `None` means detect from the boot sector.
    pub fs_override: Option<Filesystem>,
    /// List recoverable entries without writing anything.
    pub scan_only: bool,
    /// Signature carving instead of filesystem parsing.
    pub carve: bool,
    /// Print the scan listing as JSON instead of text.
    pub json: bool,
}

pub enum RecoveryEngine<R> {
    Fat32(Fat32Engine<R>),
    Ntfs(NtfsEngine<R>),
    Carver(Carver<R>),
}

impl<R: BlockSource> RecoveryEngine<R> {
    pub fn scan(&mut self) -> Result<Vec<RecoveredEntry>, RecoveryError> {
        match self {
            RecoveryEngine::Fat32(engine) => engine.scan(),
            RecoveryEngine::Ntfs(engine) => engine.scan(),
            RecoveryEngine::Carver(engine) => engine.scan(),
        }
    }

    pub fn extract(
        &mut self,
        entry: &RecoveredEntry,
        out_root: &Path,
    ) -> Result<(), RecoveryError> {
        match self {
            RecoveryEngine::Fat32(engine) => engine.extract(entry, out_root),
            RecoveryEngine::Ntfs(engine) => engine.extract(entry, out_root),
            RecoveryEngine::Carver(engine) => engine.extract(entry, out_root),
        }
    }
}

/// Run one complete recovery pass and return how many files were handled.
///
/// In scan-only mode the count is the number of entries found; otherwise it
/// is the number of files actually written. Per-file failures are reported
/// and skipped; only structural failures abort the run.
pub fn run(opts: &RunOptions) -> Result<usize, RecoveryError> {
    let mut reader = DiskReader::open(&opts.device)?;
    output::ensure_root(&opts.output_dir)?;

    let mut engine = if opts.carve {
        println!("Using file carving mode (signature-based recovery)...");
        RecoveryEngine::Carver(Carver::new(reader))
    } else {
        let fs = match opts.fs_override {
            Some(fs) => fs,
            None => {
                let fs = detect::detect(&mut reader)?;
                println!("Detected filesystem: {}", fs);
                fs
            }
        };
        match fs {
            Filesystem::Fat32 => {
                let engine = Fat32Engine::new(reader)?;
                let boot = engine.boot();
                println!("FAT32 filesystem");
                println!("  Bytes per sector: {}", boot.bytes_per_sector);
                println!("  Sectors per cluster: {}", boot.sectors_per_cluster);
                println!("  Cluster size: {} bytes", engine.cluster_size());
                println!("  Root cluster: {}", boot.root_cluster);
                RecoveryEngine::Fat32(engine)
            }
            Filesystem::Ntfs => {
                let engine = NtfsEngine::new(reader)?;
                let boot = engine.boot();
                println!("NTFS filesystem");
                println!("  Bytes per sector: {}", boot.bytes_per_sector);
                println!("  Sectors per cluster: {}", boot.sectors_per_cluster);
                println!("  Cluster size: {} bytes", engine.cluster_size());
                println!("  MFT record size: {} bytes", engine.record_size());
                println!("  MFT location: cluster {}", boot.mft_cluster);
                RecoveryEngine::Ntfs(engine)
            }
            Filesystem::Fat16 => {
                return Err(RecoveryError::UnsupportedFilesystem(fs.to_string()));
            }
        }
    };

    let entries = engine.scan()?;
    print_listing(&entries, opts);

    if opts.scan_only {
        return Ok(entries.len());
    }

    println!("\nRecovering files...");
    let mut recovered = 0;
    for entry in &entries {
        if entry.kind == EntryKind::Directory {
            continue;
        }
        // A deleted NTFS record whose run list was already lost has nothing
        // to extract.
        if matches!(&entry.locator, PayloadLocator::NtfsRuns { runs } if runs.is_empty()) {
            continue;
        }

        match engine.extract(entry, &opts.output_dir) {
            Ok(()) => {
                let path = output::resolve(&opts.output_dir, &entry.relative_path);
                println!("  Recovered: {}", path.display());
                recovered += 1;
            }
            Err(e) => {
                println!("  Failed to recover {}: {}", entry.display_name, e);
                log::warn!("extraction failed for {}: {}", entry.relative_path, e);
            }
        }
    }

    Ok(recovered)
}

fn print_listing(entries: &[RecoveredEntry], opts: &RunOptions) {
    if opts.json {
        match serde_json::to_string_pretty(entries) {
            Ok(json) => println!("{}", json),
            Err(e) => log::warn!("could not serialise listing: {}", e),
        }
        return;
    }

    if opts.carve {
        // Carver hit lists get large; group them by signature instead of
        // printing every generated name.
        let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in entries {
            let kind = entry
                .relative_path
                .split('/')
                .next()
                .unwrap_or("unknown");
            *by_type.entry(kind).or_insert(0) += 1;
        }
        println!("\nFound {} potential files:", entries.len());
        for (name, count) in by_type {
            println!("  {}: {}", name, count);
        }
        return;
    }

    println!("\nFound {} deleted files:\n", entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let tag = match entry.kind {
            EntryKind::Directory => "DIR ",
            EntryKind::File => "FILE",
        };
        println!(
            "[{}] {} {} ({} bytes)",
            i + 1,
            tag,
            entry.relative_path,
            entry.size_bytes
        );
    }
}
