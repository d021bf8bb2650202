//! In-memory block sources for unit tests.

use std::io;

use crate::disk_reader::BlockSource;

/// Byte-vector source.
#[derive(Debug)]
pub struct MemSource {
    data: Vec<u8>,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        MemSource { data }
    }
}

impl BlockSource for MemSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = (offset as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Source that caps every read, modelling a device that returns short reads.
pub struct ShortReadSource {
    inner: MemSource,
    max_per_read: usize,
}

impl ShortReadSource {
    pub fn new(data: Vec<u8>, max_per_read: usize) -> Self {
        ShortReadSource {
            inner: MemSource::new(data),
            max_per_read,
        }
    }
}

impl BlockSource for ShortReadSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let cap = buf.len().min(self.max_per_read);
        self.inner.read_at(offset, &mut buf[..cap])
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}
