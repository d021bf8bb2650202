//! Filesystem identification from the boot sector.

use std::fmt;

use crate::disk_reader::BlockSource;
use crate::error::RecoveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    Ntfs,
    Fat32,
    Fat16,
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filesystem::Ntfs => write!(f, "ntfs"),
            Filesystem::Fat32 => write!(f, "fat32"),
            Filesystem::Fat16 => write!(f, "fat16"),
        }
    }
}

/// Identify the filesystem from the first 4 KiB of the source.
///
/// NTFS carries its OEM tag at offset 3. FAT32 puts "FAT32" at offset 82;
/// offset 54 is checked as well for legacy formatters, where a bare "FAT1"
/// prefix instead indicates FAT12/16.
pub fn detect<R: BlockSource>(reader: &mut R) -> Result<Filesystem, RecoveryError> {
    let mut buf = [0u8; 4096];
    let n = reader
        .read_at(0, &mut buf)
        .map_err(|e| RecoveryError::read_at(0, e))?;

    if n < 87 {
        return Err(RecoveryError::UnknownFilesystem);
    }

    if &buf[3..7] == b"NTFS" {
        return Ok(Filesystem::Ntfs);
    }
    if &buf[82..87] == b"FAT32" || &buf[54..59] == b"FAT32" {
        return Ok(Filesystem::Fat32);
    }
    if &buf[54..58] == b"FAT1" {
        return Ok(Filesystem::Fat16);
    }

    Err(RecoveryError::UnknownFilesystem)
}
