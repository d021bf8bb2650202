//! Signature-based file carving.
//!
//! The carver ignores filesystem metadata entirely: it sweeps the device
//! with overlapped buffered reads, matches a table of magic-byte headers at
//! every position, and extracts a bounded byte range per hit, cut short at
//! the format's footer when one is defined.

use std::io::Write;
use std::path::Path;

use crate::disk_reader::BlockSource;
use crate::engine::{EntryKind, PayloadLocator, RecoveredEntry};
use crate::error::RecoveryError;
use crate::output;

const SCAN_BUF_SIZE: usize = 1024 * 1024;
const SCAN_OVERLAP: usize = 1024;
const EXTRACT_CHUNK: usize = 64 * 1024;
/// Tail reserve so secondary probes (the MP4 "ftyp" check) stay in bounds.
const SEARCH_RESERVE: usize = 64;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// A carvable file format: magic header, optional footer, size cap.
#[derive(Debug, Clone)]
pub struct FileSignature {
    pub name: &'static str,
    pub extension: &'static str,
    pub header: &'static [u8],
    pub footer: Option<&'static [u8]>,
    pub max_size: u64,
}

/// The built-in signature table.
///
/// ZIP-family formats (DOCX/XLSX/PPTX/ZIP) share the PK header on purpose:
/// each produces its own hit and the caller decides what to keep.
pub static SIGNATURES: &[FileSignature] = &[
    // Images
    FileSignature { name: "JPEG", extension: ".jpg", header: &[0xFF, 0xD8, 0xFF], footer: Some(&[0xFF, 0xD9]), max_size: 50 * MB },
    FileSignature { name: "PNG", extension: ".png", header: &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A], footer: Some(&[0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82]), max_size: 50 * MB },
    FileSignature { name: "GIF", extension: ".gif", header: &[0x47, 0x49, 0x46, 0x38], footer: Some(&[0x00, 0x3B]), max_size: 20 * MB },
    FileSignature { name: "BMP", extension: ".bmp", header: &[0x42, 0x4D], footer: None, max_size: 50 * MB },
    FileSignature { name: "WEBP", extension: ".webp", header: &[0x52, 0x49, 0x46, 0x46], footer: None, max_size: 50 * MB },
    FileSignature { name: "TIFF", extension: ".tiff", header: &[0x49, 0x49, 0x2A, 0x00], footer: None, max_size: 100 * MB },
    FileSignature { name: "TIFF-BE", extension: ".tiff", header: &[0x4D, 0x4D, 0x00, 0x2A], footer: None, max_size: 100 * MB },
    // Videos
    FileSignature { name: "MP4", extension: ".mp4", header: &[0x00, 0x00, 0x00], footer: None, max_size: 4 * GB },
    FileSignature { name: "AVI", extension: ".avi", header: &[0x52, 0x49, 0x46, 0x46], footer: None, max_size: 4 * GB },
    FileSignature { name: "MKV", extension: ".mkv", header: &[0x1A, 0x45, 0xDF, 0xA3], footer: None, max_size: 4 * GB },
    FileSignature { name: "MOV", extension: ".mov", header: &[0x00, 0x00, 0x00, 0x14, 0x66, 0x74, 0x79, 0x70], footer: None, max_size: 4 * GB },
    FileSignature { name: "WMV", extension: ".wmv", header: &[0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11], footer: None, max_size: 4 * GB },
    FileSignature { name: "FLV", extension: ".flv", header: &[0x46, 0x4C, 0x56, 0x01], footer: None, max_size: 2 * GB },
    // Audio
    FileSignature { name: "MP3", extension: ".mp3", header: &[0xFF, 0xFB], footer: None, max_size: 100 * MB },
    FileSignature { name: "MP3-ID3", extension: ".mp3", header: &[0x49, 0x44, 0x33], footer: None, max_size: 100 * MB },
    FileSignature { name: "WAV", extension: ".wav", header: &[0x52, 0x49, 0x46, 0x46], footer: None, max_size: 500 * MB },
    FileSignature { name: "FLAC", extension: ".flac", header: &[0x66, 0x4C, 0x61, 0x43], footer: None, max_size: 500 * MB },
    FileSignature { name: "OGG", extension: ".ogg", header: &[0x4F, 0x67, 0x67, 0x53], footer: None, max_size: 200 * MB },
    FileSignature { name: "M4A", extension: ".m4a", header: &[0x00, 0x00, 0x00, 0x20, 0x66, 0x74, 0x79, 0x70, 0x4D, 0x34, 0x41], footer: None, max_size: 500 * MB },
    // Documents
    FileSignature { name: "PDF", extension: ".pdf", header: &[0x25, 0x50, 0x44, 0x46], footer: Some(&[0x25, 0x25, 0x45, 0x4F, 0x46]), max_size: 500 * MB },
    FileSignature { name: "DOCX", extension: ".docx", header: &[0x50, 0x4B, 0x03, 0x04], footer: None, max_size: 100 * MB },
    FileSignature { name: "XLSX", extension: ".xlsx", header: &[0x50, 0x4B, 0x03, 0x04], footer: None, max_size: 100 * MB },
    FileSignature { name: "PPTX", extension: ".pptx", header: &[0x50, 0x4B, 0x03, 0x04], footer: None, max_size: 500 * MB },
    FileSignature { name: "ZIP", extension: ".zip", header: &[0x50, 0x4B, 0x03, 0x04], footer: None, max_size: GB },
    FileSignature { name: "RAR", extension: ".rar", header: &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07], footer: None, max_size: GB },
    FileSignature { name: "7Z", extension: ".7z", header: &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C], footer: None, max_size: GB },
    // Executables
    FileSignature { name: "EXE", extension: ".exe", header: &[0x4D, 0x5A], footer: None, max_size: 500 * MB },
    FileSignature { name: "ELF", extension: ".elf", header: &[0x7F, 0x45, 0x4C, 0x46], footer: None, max_size: 500 * MB },
    // Databases
    FileSignature { name: "SQLite", extension: ".sqlite", header: &[0x53, 0x51, 0x4C, 0x69, 0x74, 0x65, 0x20, 0x66, 0x6F, 0x72, 0x6D, 0x61, 0x74], footer: None, max_size: GB },
];

pub struct Carver<R> {
    reader: R,
    buf_size: usize,
    signatures: &'static [FileSignature],
}

impl<R: BlockSource> Carver<R> {
    pub fn new(reader: R) -> Self {
        Carver {
            reader,
            buf_size: SCAN_BUF_SIZE,
            signatures: SIGNATURES,
        }
    }

    /// Restrict the scan to a custom signature set.
    pub fn with_signatures(mut self, signatures: &'static [FileSignature]) -> Self {
        self.signatures = signatures;
        self
    }

    /// Sweep the device and record a hit for every header match.
    ///
    /// Headers are matched only at the cursor's buffer positions, with a
    /// trailing reserve so secondary probes never run off the buffer. The
    /// cursor advances by at least one byte per iteration regardless of how
    /// little the source returned.
    pub fn scan(&mut self) -> Result<Vec<RecoveredEntry>, RecoveryError> {
        let size = self.reader.size();

        let buf_size = self.buf_size.min(size as usize).max(128);
        let overlap = if buf_size < 2 * SCAN_OVERLAP { 0 } else { SCAN_OVERLAP };

        log::info!("carving {} bytes for {} signatures", size, self.signatures.len());

        let mut entries = Vec::new();
        let mut buf = vec![0u8; buf_size];
        let mut cursor: u64 = 0;
        let mut next_progress = 100 * MB;

        while cursor < size {
            let n = self
                .reader
                .read_at(cursor, &mut buf)
                .map_err(|e| RecoveryError::read_at(cursor, e))?;
            if n == 0 {
                break;
            }

            let search_end = n.saturating_sub(SEARCH_RESERVE);
            for i in 0..search_end {
                for sig in self.signatures {
                    if sig.header.len() > n - i {
                        continue;
                    }
                    if &buf[i..i + sig.header.len()] != sig.header {
                        continue;
                    }
                    if !post_check(sig, &buf[i..n]) {
                        continue;
                    }
                    let index = entries.len();
                    let file_name = format!("carved_{:06}{}", index, sig.extension);
                    entries.push(RecoveredEntry {
                        display_name: file_name.clone(),
                        relative_path: format!("{}/{}", sig.name, file_name),
                        size_bytes: sig.max_size,
                        kind: EntryKind::File,
                        modified_unix: None,
                        locator: PayloadLocator::CarveRegion {
                            offset: cursor + i as u64,
                            max_size: sig.max_size,
                            footer: sig.footer,
                        },
                    });
                }
            }

            if cursor >= next_progress {
                log::info!(
                    "carve scan {:.1}% done, {} hits",
                    cursor as f64 / size as f64 * 100.0,
                    entries.len()
                );
                next_progress += 100 * MB;
            }

            let advance = if n > overlap { n - overlap } else { n };
            cursor += (advance as u64).max(1);
        }

        log::info!("carve scan found {} hits", entries.len());
        Ok(entries)
    }

    /// Copy a hit's byte range into its output file.
    ///
    /// Stops at the footer when the signature has one and it is found,
    /// otherwise at `max_size` or end of device.
    pub fn extract(
        &mut self,
        entry: &RecoveredEntry,
        out_root: &Path,
    ) -> Result<(), RecoveryError> {
        let (start, max_size, footer) = match entry.locator {
            PayloadLocator::CarveRegion {
                offset,
                max_size,
                footer,
            } => (offset, max_size, footer),
            _ => return Ok(()),
        };

        let out_path = output::resolve(out_root, &entry.relative_path);
        let mut out = output::create_file(out_root, &entry.relative_path)?;

        let mut buf = vec![0u8; EXTRACT_CHUNK];
        let mut written: u64 = 0;
        let mut pos = start;

        while written < max_size {
            let to_read = buf.len().min((max_size - written) as usize);
            let n = self
                .reader
                .read_at(pos, &mut buf[..to_read])
                .map_err(|e| RecoveryError::read_at(pos, e))?;
            if n == 0 {
                break;
            }

            if let Some(footer) = footer {
                if let Some(idx) = find_pattern(&buf[..n], footer) {
                    let end = idx + footer.len();
                    out.write_all(&buf[..end])
                        .map_err(|e| RecoveryError::output(&out_path, e))?;
                    return Ok(());
                }
            }

            out.write_all(&buf[..n])
                .map_err(|e| RecoveryError::output(&out_path, e))?;
            written += n as u64;
            pos += n as u64;
        }

        Ok(())
    }
}

/// Extra validation beyond the raw header match.
fn post_check(sig: &FileSignature, window: &[u8]) -> bool {
    if sig.name == "MP4" {
        return window.len() >= 8 && &window[4..8] == b"ftyp";
    }
    true
}

fn find_pattern(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
