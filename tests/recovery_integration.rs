//! End-to-end recovery scenarios over synthetic disk images.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

use salvage::detect::Filesystem;
use salvage::disk_reader::{BlockSource, DiskReader};
use salvage::engine::{PayloadLocator, RunOptions};
use salvage::fat32::Fat32Engine;

// FAT32 image geometry shared by the scenarios: 512-byte sectors, 8 sectors
// per cluster, 32 reserved sectors, two FATs of 2048 sectors each.
const FAT_DATA_START: usize = 32 * 512 + 2 * 2048 * 512;
const FAT_CLUSTER_SIZE: usize = 4096;

fn fat32_image() -> Vec<u8> {
    let mut img = vec![0u8; 10 * 1024 * 1024];
    img[0] = 0xEB;
    img[1] = 0x58;
    img[2] = 0x90;
    img[3..11].copy_from_slice(b"MSDOS5.0");
    img[11..13].copy_from_slice(&512u16.to_le_bytes());
    img[13] = 8;
    img[14..16].copy_from_slice(&32u16.to_le_bytes());
    img[16] = 2;
    img[32..36].copy_from_slice(&2_097_152u32.to_le_bytes());
    img[36..40].copy_from_slice(&2048u32.to_le_bytes());
    img[44..48].copy_from_slice(&2u32.to_le_bytes());
    img[82..90].copy_from_slice(b"FAT32   ");
    img[510] = 0x55;
    img[511] = 0xAA;
    img
}

fn fat_cluster_offset(cluster: u32) -> usize {
    FAT_DATA_START + (cluster as usize - 2) * FAT_CLUSTER_SIZE
}

fn fat_dir_entry(name11: &[u8; 11], attr: u8, first_cluster: u16, size: u32) -> [u8; 32] {
    let mut slot = [0u8; 32];
    slot[..11].copy_from_slice(name11);
    slot[11] = attr;
    slot[26..28].copy_from_slice(&first_cluster.to_le_bytes());
    slot[28..32].copy_from_slice(&size.to_le_bytes());
    slot
}

fn write_image(img: &[u8]) -> tempfile::NamedTempFile {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), img).unwrap();
    tmp
}

fn run_opts(device: &Path, out: &Path) -> RunOptions {
    RunOptions {
        device: device.to_str().unwrap().to_string(),
        output_dir: out.to_path_buf(),
        fs_override: None,
        scan_only: false,
        carve: false,
        json: false,
    }
}

fn recovered_files(root: &Path) -> Vec<std::path::PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect()
}

#[test]
fn fat32_single_deleted_file_is_recovered() {
    let mut img = fat32_image();

    // Deleted "?EST.TXT" at cluster 5, 2048 bytes.
    let slot = fat_dir_entry(b"\xE5EST    TXT", 0x20, 5, 2048);
    let root = fat_cluster_offset(2);
    img[root..root + 32].copy_from_slice(&slot);

    let payload = fat_cluster_offset(5);
    for (i, b) in img[payload..payload + FAT_CLUSTER_SIZE].iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let expected = img[payload..payload + 2048].to_vec();

    let device = write_image(&img);
    let before = fs::read(device.path()).unwrap();
    let out = tempfile::tempdir().unwrap();

    let count = salvage::run(&run_opts(device.path(), out.path())).unwrap();
    assert_eq!(count, 1);

    let files = recovered_files(out.path());
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_name().unwrap().to_str().unwrap(), "?EST.TXT");
    assert_eq!(fs::read(&files[0]).unwrap(), expected);

    // The source image must be byte-identical after the run.
    assert_eq!(fs::read(device.path()).unwrap(), before);
}

#[test]
fn fat32_long_filename_round_trips() {
    let mut img = fat32_image();
    let root = fat_cluster_offset(2);

    // One LFN slot for "Hëllo.txt" (9 code units, then a terminator).
    let mut lfn = [0xFFu8; 32];
    lfn[0] = 0x41; // last slot in physical order, sequence 1
    lfn[11] = 0x0F;
    lfn[12] = 0;
    lfn[13] = 0;
    lfn[26] = 0;
    lfn[27] = 0;
    let units: Vec<u16> = "Hëllo.txt".encode_utf16().collect();
    let regions: [(usize, usize); 3] = [(1, 11), (14, 26), (28, 32)];
    let mut it = units.iter().copied().chain(std::iter::once(0u16));
    for (start, end) in regions {
        let mut pos = start;
        while pos + 2 <= end {
            if let Some(u) = it.next() {
                lfn[pos..pos + 2].copy_from_slice(&u.to_le_bytes());
            }
            pos += 2;
        }
    }
    img[root..root + 32].copy_from_slice(&lfn);

    let base = fat_dir_entry(b"\xE5ELLO~1 TXT", 0x20, 6, 100);
    img[root + 32..root + 64].copy_from_slice(&base);

    let device = write_image(&img);
    let mut engine = Fat32Engine::new(DiskReader::open(device.path().to_str().unwrap()).unwrap())
        .unwrap();
    let entries = engine.scan().unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].display_name, "Hëllo.txt");
    assert_eq!(entries[0].relative_path, "Hëllo.txt");
}

// NTFS image geometry: 512-byte sectors, 8 sectors per cluster (4 KiB
// clusters), MFT at cluster 4, 1 KiB records.
const NTFS_CLUSTER_SIZE: usize = 4096;
const NTFS_MFT_START: usize = 4 * NTFS_CLUSTER_SIZE;

fn ntfs_image() -> Vec<u8> {
    let mut img = vec![0u8; 1024 * 1024];
    img[0] = 0xEB;
    img[1] = 0x52;
    img[2] = 0x90;
    img[3..11].copy_from_slice(b"NTFS    ");
    img[11..13].copy_from_slice(&512u16.to_le_bytes());
    img[13] = 8;
    img[48..56].copy_from_slice(&4u64.to_le_bytes());
    img[64] = 0xF6; // 1024-byte records
    img[510] = 0x55;
    img[511] = 0xAA;
    img
}

fn ntfs_file_name_attr(name: &str, parent: u64) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let value_len = 66 + units.len() * 2;
    let total = 24 + value_len;
    let mut attr = vec![0u8; total];
    attr[0..4].copy_from_slice(&0x30u32.to_le_bytes());
    attr[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    attr[16..20].copy_from_slice(&(value_len as u32).to_le_bytes());
    attr[20..22].copy_from_slice(&24u16.to_le_bytes());
    attr[24..32].copy_from_slice(&parent.to_le_bytes());
    attr[24 + 64] = units.len() as u8;
    attr[24 + 65] = 1; // Win32 name
    for (i, u) in units.iter().enumerate() {
        attr[24 + 66 + i * 2..24 + 68 + i * 2].copy_from_slice(&u.to_le_bytes());
    }
    attr
}

fn ntfs_data_attr(real_size: u64, runs: &[u8]) -> Vec<u8> {
    let total = 64 + runs.len();
    let mut attr = vec![0u8; total];
    attr[0..4].copy_from_slice(&0x80u32.to_le_bytes());
    attr[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    attr[8] = 1; // non-resident
    attr[32..34].copy_from_slice(&64u16.to_le_bytes());
    attr[48..56].copy_from_slice(&real_size.to_le_bytes());
    attr[64..].copy_from_slice(runs);
    attr
}

fn ntfs_record(name: &str, real_size: u64, runs: &[u8]) -> Vec<u8> {
    let mut record = vec![0u8; 1024];
    record[0..4].copy_from_slice(b"FILE");
    record[20..22].copy_from_slice(&56u16.to_le_bytes()); // attrs offset
    record[22..24].copy_from_slice(&0u16.to_le_bytes()); // not in use: deleted

    let mut pos = 56;
    for attr in [ntfs_file_name_attr(name, 5), ntfs_data_attr(real_size, runs)] {
        record[pos..pos + attr.len()].copy_from_slice(&attr);
        pos += attr.len();
    }
    record[pos..pos + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    record
}

#[test]
fn ntfs_two_fragment_file_is_reassembled() {
    let mut img = ntfs_image();

    // Runs: (delta 100, 1 cluster) then (delta 5, 1 cluster) -> LCN 100, 105.
    let record = ntfs_record("data.bin", 8192, &[0x11, 0x01, 0x64, 0x11, 0x01, 0x05, 0x00]);
    img[NTFS_MFT_START..NTFS_MFT_START + 1024].copy_from_slice(&record);

    let a = 100 * NTFS_CLUSTER_SIZE;
    let b = 105 * NTFS_CLUSTER_SIZE;
    img[a..a + NTFS_CLUSTER_SIZE].fill(0xAB);
    img[b..b + NTFS_CLUSTER_SIZE].fill(0xCD);

    let device = write_image(&img);
    let out = tempfile::tempdir().unwrap();

    let count = salvage::run(&run_opts(device.path(), out.path())).unwrap();
    assert_eq!(count, 1);

    let recovered = fs::read(out.path().join("data.bin")).unwrap();
    assert_eq!(recovered.len(), 8192);
    assert!(recovered[..4096].iter().all(|&b| b == 0xAB));
    assert!(recovered[4096..].iter().all(|&b| b == 0xCD));
}

#[test]
fn ntfs_sparse_run_reads_as_zeros() {
    let mut img = ntfs_image();

    // Runs: (100, 1), sparse (0, 2), (103, 1); 16 KiB file.
    let record = ntfs_record(
        "sparse.bin",
        16384,
        &[0x11, 0x01, 0x64, 0x01, 0x02, 0x11, 0x01, 0x03, 0x00],
    );
    img[NTFS_MFT_START..NTFS_MFT_START + 1024].copy_from_slice(&record);

    let a = 100 * NTFS_CLUSTER_SIZE;
    let b = 103 * NTFS_CLUSTER_SIZE;
    img[a..a + NTFS_CLUSTER_SIZE].fill(0xAB);
    img[b..b + NTFS_CLUSTER_SIZE].fill(0xCD);

    let device = write_image(&img);
    let out = tempfile::tempdir().unwrap();

    let count = salvage::run(&run_opts(device.path(), out.path())).unwrap();
    assert_eq!(count, 1);

    let recovered = fs::read(out.path().join("sparse.bin")).unwrap();
    assert_eq!(recovered.len(), 16384);
    assert!(recovered[..4096].iter().all(|&b| b == 0xAB));
    assert!(recovered[4096..12288].iter().all(|&b| b == 0));
    assert!(recovered[12288..].iter().all(|&b| b == 0xCD));
}

#[test]
fn ntfs_scan_listing_is_deterministic() {
    let mut img = ntfs_image();
    let record = ntfs_record("data.bin", 8192, &[0x11, 0x01, 0x64, 0x11, 0x01, 0x05, 0x00]);
    img[NTFS_MFT_START..NTFS_MFT_START + 1024].copy_from_slice(&record);

    let device = write_image(&img);
    let out = tempfile::tempdir().unwrap();
    let mut opts = run_opts(device.path(), out.path());
    opts.scan_only = true;
    opts.fs_override = Some(Filesystem::Ntfs);

    let first = salvage::run(&opts).unwrap();
    let second = salvage::run(&opts).unwrap();
    assert_eq!(first, 1);
    assert_eq!(first, second);
}

#[test]
fn carved_jpeg_is_cut_at_footer() {
    let mut img = vec![0u8; 1024 * 1024];
    img[0..4].copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
    img[4..1004].fill(0x42);
    img[1004..1006].copy_from_slice(&[0xFF, 0xD9]);

    let device = write_image(&img);
    let out = tempfile::tempdir().unwrap();
    let mut opts = run_opts(device.path(), out.path());
    opts.carve = true;

    let count = salvage::run(&opts).unwrap();
    assert_eq!(count, 1);

    let carved = fs::read(out.path().join("JPEG/carved_000000.jpg")).unwrap();
    assert_eq!(carved.len(), 1006);
    assert_eq!(&carved[..], &img[..1006]);

    assert_eq!(recovered_files(out.path()).len(), 1);
}

/// Source that refuses to return more than 512 bytes per read.
struct ShortReadDevice {
    inner: DiskReader,
}

impl BlockSource for ShortReadDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let cap = buf.len().min(512);
        self.inner.read_at(offset, &mut buf[..cap])
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

#[test]
fn carver_terminates_on_short_reading_device() {
    let img = vec![0u8; 1024 * 1024];
    let device = write_image(&img);

    let reader = DiskReader::open(device.path().to_str().unwrap()).unwrap();
    let mut carver = salvage::carver::Carver::new(ShortReadDevice { inner: reader });
    let hits = carver.scan().unwrap();
    assert!(hits.is_empty());
}

#[test]
fn zip_family_hits_share_an_offset() {
    let mut img = vec![0u8; 1024 * 1024];
    img[0..4].copy_from_slice(&[0x50, 0x4B, 0x03, 0x04]);

    let device = write_image(&img);
    let reader = DiskReader::open(device.path().to_str().unwrap()).unwrap();
    let mut carver = salvage::carver::Carver::new(reader);
    let hits = carver.scan().unwrap();

    assert_eq!(hits.len(), 4);
    for hit in &hits {
        match hit.locator {
            PayloadLocator::CarveRegion { offset, .. } => assert_eq!(offset, 0),
            _ => panic!("expected carve region"),
        }
    }
}
