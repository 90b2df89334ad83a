//! Sparse-extent tables: a little-endian i64 count, `count` (offset, length)
//! pairs, then an MD5 of the preceding bytes. Transfers append these as an
//! out-of-band trailer so receivers can hole-punch instead of storing zeros.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseExtent {
    pub offset: i64,
    pub len: i64,
}

impl SparseExtent {
    pub fn end(&self) -> i64 {
        self.offset + self.len
    }

    pub fn contains(&self, offset: i64, len: i64) -> bool {
        self.offset <= offset && offset + len <= self.end()
    }
}

/// Serialize an extent table with its integrity hash.
pub fn write_extent_table<W: Write>(w: &mut W, extents: &[SparseExtent]) -> io::Result<()> {
    let mut body = Vec::with_capacity(extents.len() * 16);
    for e in extents {
        body.write_i64::<LittleEndian>(e.offset)?;
        body.write_i64::<LittleEndian>(e.len)?;
    }
    w.write_i64::<LittleEndian>(extents.len() as i64)?;
    w.write_all(&body)?;
    let digest: [u8; 16] = Md5::new_with_prefix(&body).finalize().into();
    w.write_all(&digest)
}

/// Sequential reader over an extent table file. The trailing MD5 has been
/// verified by whoever received the table; the iterator just walks entries.
pub struct ExtentIterator {
    file: File,
    count: i64,
    next: i64,
}

impl ExtentIterator {
    pub fn new(mut file: File) -> io::Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let count = file.read_i64::<LittleEndian>()?;
        Ok(ExtentIterator { file, count, next: 0 })
    }

    pub fn next_extent(&mut self) -> io::Result<Option<SparseExtent>> {
        if self.next >= self.count {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(8 + self.next as u64 * 16))?;
        let offset = self.file.read_i64::<LittleEndian>()?;
        let len = self.file.read_i64::<LittleEndian>()?;
        self.next += 1;
        Ok(Some(SparseExtent { offset, len }))
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// Validate a received table body (everything before the 16-byte hash)
/// against its trailing MD5.
pub fn verify_extent_table(file: &mut File) -> io::Result<bool> {
    let total = file.seek(SeekFrom::End(0))?;
    if total < 24 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(8))?;
    let body_len = total - 8 - 16;
    let mut md5 = Md5::new();
    let mut remaining = body_len;
    let mut buf = [0u8; 4096];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        file.read_exact(&mut buf[..want])?;
        md5.update(&buf[..want]);
        remaining -= want as u64;
    }
    let mut stored = [0u8; 16];
    file.read_exact(&mut stored)?;
    let computed: [u8; 16] = md5.finalize().into();
    Ok(stored == computed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn table_round_trip() {
        let extents = vec![
            SparseExtent { offset: 0, len: 1 << 20 },
            SparseExtent { offset: 5 << 20, len: 512 * 1024 },
        ];
        let mut file = tempfile().unwrap();
        write_extent_table(&mut file, &extents).unwrap();

        assert!(verify_extent_table(&mut file.try_clone().unwrap()).unwrap());

        let mut it = ExtentIterator::new(file).unwrap();
        assert_eq!(it.next_extent().unwrap(), Some(extents[0]));
        assert_eq!(it.next_extent().unwrap(), Some(extents[1]));
        assert_eq!(it.next_extent().unwrap(), None);
        it.reset();
        assert_eq!(it.next_extent().unwrap(), Some(extents[0]));
    }

    #[test]
    fn corrupt_table_fails_verification() {
        let mut file = tempfile().unwrap();
        write_extent_table(&mut file, &[SparseExtent { offset: 0, len: 4096 }]).unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        assert!(!verify_extent_table(&mut file).unwrap());
    }
}
