//! Raw disk access.
//!
//! `DiskReader` opens a physical device or image file read-only and serves
//! positional reads. Engines are written against the `BlockSource` trait so
//! tests can substitute in-memory or deliberately short-reading sources.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};

use crate::error::RecoveryError;

/// Read-only random-access byte source.
///
/// `read_at` must not fail on reads past the end: it returns fewer bytes
/// than requested (possibly zero) instead. No write primitive exists on
/// this surface.
pub trait BlockSource {
    /// Positional read into `buf`. Returns the number of bytes read, which
    /// may be less than `buf.len()` near the end of the source.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Total size of the source in bytes.
    fn size(&self) -> u64;
}

/// File- or device-backed block source.
pub struct DiskReader {
    handle: File,
    total_size: u64,
}

impl DiskReader {
    /// Open a device or image file for reading.
    ///
    /// On Windows, raw volumes ("\\.\C:", "\\.\PhysicalDrive0") must be
    /// opened with sharing enabled or the open fails while the volume is
    /// mounted.
    pub fn open(path: &str) -> Result<Self, RecoveryError> {
        let mut opts = OpenOptions::new();
        opts.read(true);

        #[cfg(windows)]
        {
            use std::os::windows::fs::OpenOptionsExt;
            use winapi::um::winnt::{FILE_SHARE_READ, FILE_SHARE_WRITE};
            opts.share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE);
        }

        let mut handle = opts.open(path).map_err(|e| RecoveryError::Open {
            path: path.to_string(),
            source: e,
        })?;

        let mut total_size = handle
            .metadata()
            .map_err(|e| RecoveryError::Open {
                path: path.to_string(),
                source: e,
            })?
            .len();

        // Block devices report a zero metadata length; seek to the end to
        // find the real size.
        if total_size == 0 {
            total_size = handle
                .seek(SeekFrom::End(0))
                .and_then(|size| handle.seek(SeekFrom::Start(0)).map(|_| size))
                .map_err(|e| RecoveryError::Open {
                    path: path.to_string(),
                    source: e,
                })?;
        }

        log::debug!("opened {} ({} bytes)", path, total_size);

        Ok(DiskReader { handle, total_size })
    }

    /// Release the underlying handle.
    pub fn close(self) {
        drop(self.handle);
    }
}

impl BlockSource for DiskReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.total_size {
            return Ok(0);
        }
        self.handle.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match self.handle.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn size(&self) -> u64 {
        self.total_size
    }
}
