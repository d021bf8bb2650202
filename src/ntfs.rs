//! NTFS MFT parser for deleted-record recovery.
//!
//! Records are fetched one at a time from the Master File Table, repaired
//! with the per-sector update-sequence fixup, and decoded attribute by
//! attribute. A record whose in-use flag is clear is a deletion candidate;
//! its payload location survives in the $DATA attribute's run list (or
//! inline, for resident data) until the clusters are reused.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::disk_reader::BlockSource;
use crate::engine::{EntryKind, PayloadLocator, RecoveredEntry};
use crate::error::RecoveryError;
use crate::output;

const MFT_MAGIC: &[u8] = b"FILE";
const ATTR_STANDARD_INFO: u32 = 0x10;
const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_END: u32 = 0xFFFF_FFFF;

/// MFT record 5 is always the root directory.
const ROOT_MFT_INDEX: u64 = 5;
/// Upper bound on scanned records; very large volumes are cut off here.
const MAX_MFT_RECORDS: u64 = 10_000_000;
/// $FILE_NAME name-type for DOS 8.3 aliases.
const NAME_TYPE_DOS: u8 = 2;

#[derive(Serialize, Debug, Clone)]
pub struct BootParams {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub mft_cluster: u64,
    pub clusters_per_mft_record: i8,
}

/// One fragment of a non-resident attribute's extent.
///
/// `cluster_offset` is the absolute LCN after the signed deltas have been
/// summed; zero marks a sparse run that reads as zeros.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DataRun {
    pub cluster_offset: i64,
    pub cluster_count: u64,
}

#[derive(Debug, Clone, Default)]
struct MftFileInfo {
    name: String,
    parent_ref: u64,
    size: u64,
    is_deleted: bool,
    is_directory: bool,
    modified_unix: Option<i64>,
    data_runs: Vec<DataRun>,
    resident_data: Option<Vec<u8>>,
}

pub struct NtfsEngine<R> {
    reader: R,
    boot: BootParams,
    mft_start: u64,
    cluster_size: u32,
    record_size: u32,
    records: HashMap<u64, MftFileInfo>,
}

impl<R: BlockSource> NtfsEngine<R> {
    /// Parse the boot sector and locate the MFT.
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
        if &buf[3..7] != b"NTFS" {
            return Err(RecoveryError::InvalidBootSector(
                "missing NTFS signature".to_string(),
            ));
        }

        let boot = BootParams {
            bytes_per_sector: LittleEndian::read_u16(&buf[11..13]),
            sectors_per_cluster: buf[13],
            mft_cluster: LittleEndian::read_u64(&buf[48..56]),
            clusters_per_mft_record: buf[64] as i8,
        };

        if boot.bytes_per_sector == 0 || boot.sectors_per_cluster == 0 {
            return Err(RecoveryError::InvalidBootSector(
                "zero bytes-per-sector or sectors-per-cluster".to_string(),
            ));
        }

        let cluster_size = boot.bytes_per_sector as u32 * boot.sectors_per_cluster as u32;

        // Negative values encode a record size of 2^|v| bytes; positive
        // values count whole clusters.
        let v = boot.clusters_per_mft_record;
        let record_size = if v < 0 {
            let pow = -(v as i32) as u32;
            if pow > 31 {
                return Err(RecoveryError::InvalidBootSector(format!(
                    "clusters-per-MFT-record out of range: {}",
                    v
                )));
            }
            1u32 << pow
        } else {
            v as u32 * cluster_size
        };
        if record_size == 0 {
            return Err(RecoveryError::InvalidBootSector(
                "zero MFT record size".to_string(),
            ));
        }

        // Corrupt boot sectors can put the MFT cluster anywhere; saturate
        // rather than wrap so bogus offsets just read past the end.
        let mft_start = boot.mft_cluster.saturating_mul(cluster_size as u64);

        Ok(NtfsEngine {
            reader,
            boot,
            mft_start,
            cluster_size,
            record_size,
            records: HashMap::new(),
        })
    }

    pub fn boot(&self) -> &BootParams {
        &self.boot
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    fn fetch_record(&mut self, index: u64) -> Result<Option<Vec<u8>>, RecoveryError> {
        let offset = self
            .mft_start
            .saturating_add(index.saturating_mul(self.record_size as u64));
        let mut buf = vec![0u8; self.record_size as usize];
        let n = self
            .reader
            .read_at(offset, &mut buf)
            .map_err(|e| RecoveryError::read_at(offset, e))?;
        if n < buf.len() || &buf[0..4] != MFT_MAGIC {
            return Ok(None);
        }
        apply_fixup(&mut buf);
        Ok(Some(buf))
    }

    /// Scan the MFT and return every deleted, named, non-system record.
    pub fn scan(&mut self) -> Result<Vec<RecoveredEntry>, RecoveryError> {
        let total = self.reader.size() / self.record_size as u64;
        let max_records = total.min(MAX_MFT_RECORDS);

        let mut deleted: Vec<u64> = Vec::new();

        for index in 0..max_records {
            let record = match self.fetch_record(index) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    log::debug!("record {} unreadable: {}", index, e);
                    continue;
                }
            };

            let info = match parse_record(&record) {
                Some(info) => info,
                None => continue,
            };

            if info.name.is_empty()
                || info.name == "."
                || info.name == ".."
                || info.name.starts_with('$')
            {
                continue;
            }

            if info.is_deleted {
                deleted.push(index);
            }
            self.records.insert(index, info);

            if index > 0 && index % 10_000 == 0 {
                log::info!(
                    "scanned {} MFT records, {} deleted so far",
                    index,
                    deleted.len()
                );
            }
        }

        let mut entries = Vec::with_capacity(deleted.len());
        for &index in &deleted {
            let relative_path = self.reconstruct_path(index);
            let info = &self.records[&index];
            let locator = match &info.resident_data {
                Some(data) => PayloadLocator::NtfsResident { data: data.clone() },
                None => PayloadLocator::NtfsRuns {
                    runs: info.data_runs.clone(),
                },
            };
            entries.push(RecoveredEntry {
                display_name: info.name.clone(),
                relative_path,
                size_bytes: info.size,
                kind: if info.is_directory {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                modified_unix: info.modified_unix,
                locator,
            });
        }

        log::info!("ntfs scan found {} deleted entries", entries.len());
        Ok(entries)
    }

    /// Rebuild the directory path of a record by chasing parent references
    /// through the scanned map.
    ///
    /// The walk stops at the root (parent 5), at a self-referencing parent,
    /// at a parent missing from the map, or on a cycle; whatever partial
    /// path was accumulated is returned.
    fn reconstruct_path(&self, index: u64) -> String {
        let mut parts: Vec<&str> = Vec::new();
        let mut visited = HashSet::new();
        let mut current = index;

        loop {
            if !visited.insert(current) {
                break;
            }
            let info = match self.records.get(&current) {
                Some(info) => info,
                None => break,
            };
            if !info.name.is_empty() && info.name != "." {
                parts.push(&info.name);
            }
            if info.parent_ref == ROOT_MFT_INDEX || info.parent_ref == current {
                break;
            }
            current = info.parent_ref;
        }

        if parts.is_empty() {
            return match self.records.get(&index) {
                Some(info) if !info.name.is_empty() => info.name.clone(),
                _ => format!("file_{}", index),
            };
        }

        parts.reverse();
        parts.join("/")
    }

    /// Reconstruct a deleted record's payload under `out_root`.
    pub fn extract(
        &mut self,
        entry: &RecoveredEntry,
        out_root: &Path,
    ) -> Result<(), RecoveryError> {
        if entry.kind == EntryKind::Directory {
            let dir = output::resolve(out_root, &entry.relative_path);
            return std::fs::create_dir_all(&dir).map_err(|e| RecoveryError::output(&dir, e));
        }

        let out_path = output::resolve(out_root, &entry.relative_path);
        let mut out = output::create_file(out_root, &entry.relative_path)?;

        match &entry.locator {
            PayloadLocator::NtfsResident { data } => {
                out.write_all(data)
                    .map_err(|e| RecoveryError::output(&out_path, e))?;
            }
            PayloadLocator::NtfsRuns { runs } => {
                self.write_runs(runs, entry.size_bytes, &mut out, &out_path)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn write_runs(
        &mut self,
        runs: &[DataRun],
        size: u64,
        out: &mut std::fs::File,
        out_path: &Path,
    ) -> Result<(), RecoveryError> {
        let cluster_size = self.cluster_size as u64;
        let mut written: u64 = 0;

        for run in runs {
            if written >= size {
                break;
            }

            if run.cluster_offset == 0 {
                // Sparse run: occupies the extent but reads as zeros,
                // written in bounded chunks since the count is untrusted.
                let span = run.cluster_count.saturating_mul(cluster_size);
                let mut remaining = span.min(size - written);
                let zeros = [0u8; 64 * 1024];
                while remaining > 0 {
                    let take = (zeros.len() as u64).min(remaining) as usize;
                    out.write_all(&zeros[..take])
                        .map_err(|e| RecoveryError::output(out_path, e))?;
                    written += take as u64;
                    remaining -= take as u64;
                }
                continue;
            }

            if run.cluster_offset < 0 {
                log::warn!("skipping run with negative LCN {}", run.cluster_offset);
                continue;
            }

            let base = (run.cluster_offset as u64).saturating_mul(cluster_size);
            let mut buf = vec![0u8; cluster_size as usize];
            for c in 0..run.cluster_count {
                if written >= size {
                    break;
                }
                let offset = base + c * cluster_size;
                let n = self
                    .reader
                    .read_at(offset, &mut buf)
                    .map_err(|e| RecoveryError::read_at(offset, e))?;
                if n == 0 {
                    break;
                }
                let take = (n as u64).min(size - written) as usize;
                out.write_all(&buf[..take])
                    .map_err(|e| RecoveryError::output(out_path, e))?;
                written += take as u64;
            }
        }
        Ok(())
    }
}

/// Restore the bytes the update-sequence protection replaced.
///
/// The last two bytes of every 512-byte sector inside a multi-sector record
/// hold a copy of the update-sequence signature; the displaced originals
/// live in the array that follows it. Positions whose bytes do not match
/// the signature are left alone (a torn write).
fn apply_fixup(record: &mut [u8]) {
    if record.len() < 8 {
        return;
    }
    let usa_offset = LittleEndian::read_u16(&record[4..6]) as usize;
    let usa_count = LittleEndian::read_u16(&record[6..8]) as usize;

    if usa_count < 2 || usa_offset + usa_count * 2 > record.len() {
        return;
    }

    let signature = [record[usa_offset], record[usa_offset + 1]];

    for i in 1..usa_count {
        let pos = i * 512 - 2;
        if pos + 2 > record.len() {
            break;
        }
        if record[pos] == signature[0] && record[pos + 1] == signature[1] {
            record[pos] = record[usa_offset + i * 2];
            record[pos + 1] = record[usa_offset + i * 2 + 1];
        }
    }
}

/// Decode one MFT record's attributes into a file description.
fn parse_record(record: &[u8]) -> Option<MftFileInfo> {
    if record.len() < 24 {
        return None;
    }

    let attrs_offset = LittleEndian::read_u16(&record[20..22]) as usize;
    let flags = LittleEndian::read_u16(&record[22..24]);

    let mut info = MftFileInfo {
        is_deleted: flags & 0x01 == 0,
        is_directory: flags & 0x02 != 0,
        ..MftFileInfo::default()
    };

    let mut offset = attrs_offset;
    while offset + 16 <= record.len() {
        let attr_type = LittleEndian::read_u32(&record[offset..offset + 4]);
        if attr_type == ATTR_END || attr_type == 0 {
            break;
        }
        let attr_len = LittleEndian::read_u32(&record[offset + 4..offset + 8]) as usize;
        if attr_len == 0 || offset + attr_len > record.len() {
            break;
        }

        let attr = &record[offset..offset + attr_len];
        let non_resident = attr[8];

        match attr_type {
            ATTR_STANDARD_INFO if non_resident == 0 => {
                if let Some(modified) = parse_standard_info(attr) {
                    info.modified_unix = Some(modified);
                }
            }
            ATTR_FILE_NAME if non_resident == 0 => {
                parse_file_name(attr, &mut info);
            }
            ATTR_DATA => {
                parse_data(attr, non_resident, &mut info);
            }
            _ => {}
        }

        offset += attr_len;
    }

    Some(info)
}

fn parse_standard_info(attr: &[u8]) -> Option<i64> {
    if attr.len() < 24 {
        return None;
    }
    let value_offset = LittleEndian::read_u16(&attr[20..22]) as usize;
    let value = attr.get(value_offset..)?;
    if value.len() < 32 {
        return None;
    }
    let modified = LittleEndian::read_i64(&value[8..16]);
    filetime_to_unix(modified)
}

fn parse_file_name(attr: &[u8], info: &mut MftFileInfo) {
    if attr.len() < 24 {
        return;
    }
    let value_offset = LittleEndian::read_u16(&attr[20..22]) as usize;
    let value = match attr.get(value_offset..) {
        Some(v) if v.len() >= 66 => v,
        _ => return,
    };

    let name_len = value[64] as usize;
    let name_type = value[65];

    // Every record with a DOS alias also carries a Win32 $FILE_NAME; the
    // alias must not shadow a name that is already known.
    if name_type == NAME_TYPE_DOS && !info.name.is_empty() {
        return;
    }

    if 66 + name_len * 2 > value.len() {
        return;
    }

    info.parent_ref = LittleEndian::read_u64(&value[0..8]) & 0x0000_FFFF_FFFF_FFFF;
    info.name = decode_utf16_le(&value[66..66 + name_len * 2]);
}

fn parse_data(attr: &[u8], non_resident: u8, info: &mut MftFileInfo) {
    // Named $DATA attributes are alternate streams; only the unnamed main
    // stream is recovered.
    if attr.len() < 24 || attr[9] != 0 {
        return;
    }

    if non_resident == 0 {
        let value_len = LittleEndian::read_u32(&attr[16..20]) as usize;
        let value_offset = LittleEndian::read_u16(&attr[20..22]) as usize;
        if let Some(value) = attr.get(value_offset..value_offset + value_len) {
            info.size = value_len as u64;
            info.resident_data = Some(value.to_vec());
        }
        return;
    }

    if attr.len() < 64 {
        return;
    }
    let runs_offset = LittleEndian::read_u16(&attr[32..34]) as usize;
    info.size = LittleEndian::read_u64(&attr[48..56]);
    if let Some(runs) = attr.get(runs_offset..) {
        info.data_runs = decode_data_runs(runs);
    }
}

/// Decode a data-run list.
///
/// Each run is a header byte (`low nibble` = length width, `high nibble` =
/// offset width) followed by an unsigned length and a signed LCN delta.
/// Deltas are sign-extended from the top bit of their last byte and summed
/// to produce absolute LCNs. A zero offset width marks a sparse run.
fn decode_data_runs(data: &[u8]) -> Vec<DataRun> {
    let mut runs = Vec::new();
    let mut current_lcn: i64 = 0;
    let mut pos = 0;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }
        let len_bytes = (header & 0x0F) as usize;
        let off_bytes = (header >> 4) as usize;
        // Widths above 8 bytes cannot encode a valid length or LCN.
        if len_bytes > 8 || off_bytes > 8 {
            break;
        }
        if pos + 1 + len_bytes + off_bytes > data.len() {
            break;
        }

        let mut count: u64 = 0;
        for i in 0..len_bytes {
            count |= (data[pos + 1 + i] as u64) << (8 * i);
        }

        if off_bytes == 0 {
            runs.push(DataRun {
                cluster_offset: 0,
                cluster_count: count,
            });
        } else {
            let mut delta: i64 = 0;
            for i in 0..off_bytes {
                delta |= (data[pos + 1 + len_bytes + i] as i64) << (8 * i);
            }
            if off_bytes < 8 && data[pos + len_bytes + off_bytes] & 0x80 != 0 {
                delta |= !0i64 << (8 * off_bytes);
            }
            current_lcn += delta;
            runs.push(DataRun {
                cluster_offset: current_lcn,
                cluster_count: count,
            });
        }

        pos += 1 + len_bytes + off_bytes;
    }

    runs
}

fn decode_utf16_le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Windows FILETIME (100 ns ticks since 1601) to Unix seconds.
fn filetime_to_unix(ft: i64) -> Option<i64> {
    if ft <= 0 {
        return None;
    }
    Some(ft / 10_000_000 - 11_644_473_600)
}
