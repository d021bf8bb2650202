//! FAT32 parser for deleted-entry recovery.
//!
//! Walks the directory tree from the root cluster, reassembling long
//! filenames from LFN chains and flagging entries whose first name byte is
//! the 0xE5 tombstone. Deletion zeroes a file's FAT chain, so extraction
//! assumes contiguous clusters from the recorded first cluster; that is the
//! documented best effort for fragmented files.

use std::collections::HashSet;
use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::disk_reader::BlockSource;
use crate::engine::{EntryKind, PayloadLocator, RecoveredEntry};
use crate::error::RecoveryError;
use crate::output;

const DIR_ENTRY_SIZE: usize = 32;
const DELETED_MARKER: u8 = 0xE5;
const ATTR_LFN: u8 = 0x0F;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_VOLUME_LABEL: u8 = 0x08;
/// FAT entries at or above this value terminate a cluster chain.
const CLUSTER_END: u32 = 0x0FFF_FFF8;

#[derive(Serialize, Debug, Clone)]
pub struct BootParams {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub fat_size_32: u32,
    pub root_cluster: u32,
}

#[derive(Debug)]
pub struct Fat32Engine<R> {
    reader: R,
    boot: BootParams,
    fat_start: u64,
    data_start: u64,
    cluster_size: u32,
    fat: Vec<u32>,
}

impl<R: BlockSource> Fat32Engine<R> {
    /// Parse the boot sector and derive the volume geometry.
    pub fn new(mut reader: R) -> Result<Self, RecoveryError> {
        let mut buf = [0u8; 512];
        let n = reader
            .read_at(0, &mut buf)
            .map_err(|e| RecoveryError::read_at(0, e))?;
        if n < 512 {
            return Err(RecoveryError::InvalidBootSector(
                "boot sector truncated".to_string(),
            ));
        }

        let boot = BootParams {
            bytes_per_sector: LittleEndian::read_u16(&buf[11..13]),
            sectors_per_cluster: buf[13],
            reserved_sectors: LittleEndian::read_u16(&buf[14..16]),
            num_fats: buf[16],
            fat_size_32: LittleEndian::read_u32(&buf[36..40]),
            root_cluster: LittleEndian::read_u32(&buf[44..48]),
        };

        if boot.bytes_per_sector == 0 || boot.sectors_per_cluster == 0 {
            return Err(RecoveryError::InvalidBootSector(
                "zero bytes-per-sector or sectors-per-cluster".to_string(),
            ));
        }

        let fat_start = boot.reserved_sectors as u64 * boot.bytes_per_sector as u64;
        let fat_size_bytes = boot.fat_size_32 as u64 * boot.bytes_per_sector as u64;
        let data_start = fat_start + boot.num_fats as u64 * fat_size_bytes;
        let cluster_size = boot.sectors_per_cluster as u32 * boot.bytes_per_sector as u32;

        Ok(Fat32Engine {
            reader,
            boot,
            fat_start,
            data_start,
            cluster_size,
            fat: Vec::new(),
        })
    }

    pub fn boot(&self) -> &BootParams {
        &self.boot
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    fn load_fat(&mut self) -> Result<(), RecoveryError> {
        let declared = self.boot.fat_size_32 as u64 * self.boot.bytes_per_sector as u64;
        // A corrupt boot sector can declare a FAT larger than the device;
        // clamp so the allocation stays bounded by what is readable.
        let available = self.reader.size().saturating_sub(self.fat_start);
        let fat_size = declared.min(available) as usize;

        let mut buf = vec![0u8; fat_size];
        let n = self
            .reader
            .read_at(self.fat_start, &mut buf)
            .map_err(|e| RecoveryError::read_at(self.fat_start, e))?;
        buf.truncate(n);

        self.fat = buf
            .chunks_exact(4)
            .map(LittleEndian::read_u32)
            .collect();
        Ok(())
    }

    fn cluster_to_offset(&self, cluster: u32) -> u64 {
        self.data_start + (cluster as u64 - 2) * self.cluster_size as u64
    }

    fn read_cluster(&mut self, cluster: u32) -> Result<Vec<u8>, RecoveryError> {
        let offset = self.cluster_to_offset(cluster);
        let mut buf = vec![0u8; self.cluster_size as usize];
        let n = self
            .reader
            .read_at(offset, &mut buf)
            .map_err(|e| RecoveryError::read_at(offset, e))?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Walk the directory tree and return every deleted entry found.
    pub fn scan(&mut self) -> Result<Vec<RecoveredEntry>, RecoveryError> {
        self.load_fat()?;

        let mut entries = Vec::new();
        let mut visited = HashSet::new();
        let root = self.boot.root_cluster;
        self.scan_directory(root, "", &mut entries, &mut visited)?;

        log::info!("fat32 scan found {} deleted entries", entries.len());
        Ok(entries)
    }

    fn scan_directory(
        &mut self,
        mut cluster: u32,
        path: &str,
        entries: &mut Vec<RecoveredEntry>,
        visited: &mut HashSet<u32>,
    ) -> Result<(), RecoveryError> {
        while cluster >= 2 && cluster < CLUSTER_END {
            if !visited.insert(cluster) {
                break;
            }

            let data = self.read_cluster(cluster)?;
            let mut lfn_parts: Vec<String> = Vec::new();

            for slot in data.chunks_exact(DIR_ENTRY_SIZE) {
                if slot[0] == 0x00 {
                    // End-of-directory marker; the rest of the chain holds
                    // no more entries.
                    return Ok(());
                }

                if slot[11] == ATTR_LFN {
                    if slot[0] & 0x40 != 0 {
                        lfn_parts.clear();
                    }
                    // Slots appear in reverse logical order; prepend so the
                    // joined fragments read forwards.
                    lfn_parts.insert(0, decode_lfn_slot(slot));
                    continue;
                }

                if slot[11] & ATTR_VOLUME_LABEL != 0 {
                    continue;
                }

                let is_deleted = slot[0] == DELETED_MARKER;
                let is_dir = slot[11] & ATTR_DIRECTORY != 0;
                let first_cluster = LittleEndian::read_u16(&slot[26..28]) as u32
                    | (LittleEndian::read_u16(&slot[20..22]) as u32) << 16;
                let size = LittleEndian::read_u32(&slot[28..32]);

                let short_name = render_short_name(&slot[..11], is_deleted);
                let long_name = lfn_parts.concat();
                lfn_parts.clear();

                let name = if long_name.is_empty() {
                    short_name
                } else {
                    long_name
                };

                if name == "." || name == ".." {
                    continue;
                }

                let entry_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", path, name)
                };

                if is_deleted {
                    entries.push(RecoveredEntry {
                        display_name: name,
                        relative_path: entry_path.clone(),
                        size_bytes: size as u64,
                        kind: if is_dir {
                            EntryKind::Directory
                        } else {
                            EntryKind::File
                        },
                        modified_unix: None,
                        locator: PayloadLocator::FatClusters { first_cluster },
                    });
                }

                // Deleted directories may have reused clusters, so only
                // live ones are walked.
                if is_dir && !is_deleted && first_cluster >= 2 {
                    if let Err(e) = self.scan_directory(first_cluster, &entry_path, entries, visited)
                    {
                        log::warn!("skipping unreadable directory {}: {}", entry_path, e);
                    }
                }
            }

            cluster = match self.fat.get(cluster as usize) {
                Some(&next) => next,
                None => break,
            };
        }

        Ok(())
    }

    /// Reconstruct a deleted entry's payload under `out_root`.
    ///
    /// The FAT chain was zeroed on deletion, so successive clusters from
    /// the first are read until the declared size is satisfied.
    pub fn extract(&mut self, entry: &RecoveredEntry, out_root: &std::path::Path) -> Result<(), RecoveryError> {
        if entry.kind == EntryKind::Directory {
            let dir = output::resolve(out_root, &entry.relative_path);
            return std::fs::create_dir_all(&dir).map_err(|e| RecoveryError::output(&dir, e));
        }

        let first_cluster = match entry.locator {
            PayloadLocator::FatClusters { first_cluster } => first_cluster,
            _ => return Ok(()),
        };

        let mut out = output::create_file(out_root, &entry.relative_path)?;
        let out_path = output::resolve(out_root, &entry.relative_path);

        let cluster_size = self.cluster_size as u64;
        let clusters_needed = ((entry.size_bytes + cluster_size - 1) / cluster_size).max(1);

        let mut written: u64 = 0;
        let mut cluster = first_cluster;
        for _ in 0..clusters_needed {
            if written >= entry.size_bytes || cluster < 2 {
                break;
            }
            let data = self.read_cluster(cluster)?;
            if data.is_empty() {
                break;
            }
            let remaining = entry.size_bytes - written;
            let take = (data.len() as u64).min(remaining) as usize;
            out.write_all(&data[..take])
                .map_err(|e| RecoveryError::output(&out_path, e))?;
            written += take as u64;
            cluster = match cluster.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }

        Ok(())
    }
}

fn decode_lfn_slot(slot: &[u8]) -> String {
    let mut units = Vec::with_capacity(13);
    let ranges: [(usize, usize); 3] = [(1, 11), (14, 26), (28, 32)];

    'outer: for (start, end) in ranges {
        let mut pos = start;
        while pos + 2 <= end {
            let unit = LittleEndian::read_u16(&slot[pos..pos + 2]);
            if unit == 0x0000 || unit == 0xFFFF {
                break 'outer;
            }
            units.push(unit);
            pos += 2;
        }
    }

    String::from_utf16_lossy(&units)
}

fn render_short_name(raw: &[u8], is_deleted: bool) -> String {
    let mut name = [0u8; 11];
    name.copy_from_slice(&raw[..11]);
    if is_deleted {
        // The tombstone overwrote the first character; it cannot be
        // recovered.
        name[0] = b'?';
    }

    let base = String::from_utf8_lossy(&name[..8]).trim_end().to_string();
    let ext = String::from_utf8_lossy(&name[8..11]).trim_end().to_string();

    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}
