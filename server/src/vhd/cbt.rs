//! Change-block tracking: one record per 512 KiB volume block, holding a
//! little-endian u16 offset tag and the block's MD5. The tag encodes the
//! 512-byte sub-block position the hashed extent started at, so blocks
//! whose filesystem extent was relocated between snapshots never compare
//! equal by accident. An all-zero record means "unknown".

use crate::hashing::{sparse_block_md5, BLOCK_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const CBT_RECORD_SIZE: u64 = 2 + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbtRecord {
    pub offset_tag: u16,
    pub hash: [u8; 16],
}

impl CbtRecord {
    pub fn is_unknown(&self) -> bool {
        self.offset_tag == 0 && self.hash == [0u8; 16]
    }

    pub fn is_sparse(&self) -> bool {
        self.hash == sparse_block_md5()
    }
}

fn tag_of(volume_offset: i64) -> u16 {
    ((volume_offset % BLOCK_SIZE as i64) / 512) as u16
}

fn index_of(volume_offset: i64) -> u64 {
    (volume_offset / BLOCK_SIZE as i64) as u64
}

pub struct CbtFile {
    file: File,
}

impl CbtFile {
    pub fn create<P: AsRef<Path>>(path: P, volume_size: i64) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let blocks = (volume_size as u64).div_ceil(BLOCK_SIZE);
        file.set_len(blocks * CBT_RECORD_SIZE)?;
        Ok(CbtFile { file })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Ok(CbtFile { file })
    }

    pub fn block_count(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len() / CBT_RECORD_SIZE)
    }

    pub fn read_record(&mut self, index: u64) -> io::Result<CbtRecord> {
        if index >= self.block_count()? {
            return Ok(CbtRecord { offset_tag: 0, hash: [0u8; 16] });
        }
        self.file.seek(SeekFrom::Start(index * CBT_RECORD_SIZE))?;
        let offset_tag = self.file.read_u16::<LittleEndian>()?;
        let mut hash = [0u8; 16];
        self.file.read_exact(&mut hash)?;
        Ok(CbtRecord { offset_tag, hash })
    }

    fn write_record(&mut self, index: u64, rec: &CbtRecord) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(index * CBT_RECORD_SIZE))?;
        self.file.write_u16::<LittleEndian>(rec.offset_tag)?;
        self.file.write_all(&rec.hash)
    }

    /// Record the strong hash observed for the block at `volume_offset`.
    pub fn update(&mut self, volume_offset: i64, hash: &[u8; 16]) -> io::Result<()> {
        self.write_record(
            index_of(volume_offset),
            &CbtRecord { offset_tag: tag_of(volume_offset), hash: *hash },
        )
    }

    /// The block is a zero extent; store the designated sparse hash so it
    /// compares equal without the data ever being stored.
    pub fn mark_sparse(&mut self, volume_offset: i64) -> io::Result<()> {
        self.update(volume_offset, &sparse_block_md5())
    }

    /// The known hash at `volume_offset`, if the stored tag still matches
    /// the extent position.
    pub fn lookup(&mut self, volume_offset: i64) -> io::Result<Option<[u8; 16]>> {
        let rec = self.read_record(index_of(volume_offset))?;
        if rec.is_unknown() || rec.offset_tag != tag_of(volume_offset) {
            return Ok(None);
        }
        Ok(Some(rec.hash))
    }

    /// Block indices whose hash changed (or is unknown) relative to `prev`.
    /// An image incremental transfers exactly these.
    pub fn changed_blocks(&mut self, prev: &mut CbtFile) -> io::Result<Vec<u64>> {
        let blocks = self.block_count()?.max(prev.block_count()?);
        let mut changed = Vec::new();
        for index in 0..blocks {
            let ours = self.read_record(index)?;
            let theirs = prev.read_record(index)?;
            if ours.is_unknown() || theirs.is_unknown() || ours != theirs {
                changed.push(index);
            }
        }
        Ok(changed)
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn update_and_lookup() {
        let dir = tempdir().unwrap();
        let mut cbt = CbtFile::create(dir.path().join("c.cbt"), 4 * BLOCK_SIZE as i64).unwrap();

        assert_eq!(cbt.block_count().unwrap(), 4);
        assert_eq!(cbt.lookup(0).unwrap(), None);

        let hash = [7u8; 16];
        cbt.update(BLOCK_SIZE as i64, &hash).unwrap();
        assert_eq!(cbt.lookup(BLOCK_SIZE as i64).unwrap(), Some(hash));
    }

    #[test]
    fn relocated_extent_tag_invalidates() {
        let dir = tempdir().unwrap();
        let mut cbt = CbtFile::create(dir.path().join("c.cbt"), 2 * BLOCK_SIZE as i64).unwrap();

        // Hash recorded for an extent starting 4 KiB into the block.
        cbt.update(4096, &[9u8; 16]).unwrap();
        // A block-aligned read of the same index must not trust it.
        assert_eq!(cbt.lookup(0).unwrap(), None);
        assert_eq!(cbt.lookup(4096).unwrap(), Some([9u8; 16]));
    }

    #[test]
    fn sparse_blocks_compare_equal_without_storage() {
        let dir = tempdir().unwrap();
        let mut a = CbtFile::create(dir.path().join("a.cbt"), 2 * BLOCK_SIZE as i64).unwrap();
        let mut b = CbtFile::create(dir.path().join("b.cbt"), 2 * BLOCK_SIZE as i64).unwrap();

        a.mark_sparse(0).unwrap();
        b.mark_sparse(0).unwrap();
        a.update(BLOCK_SIZE as i64, &[1u8; 16]).unwrap();
        b.update(BLOCK_SIZE as i64, &[2u8; 16]).unwrap();

        assert_eq!(a.changed_blocks(&mut b).unwrap(), vec![1]);
    }

    #[test]
    fn unknown_blocks_always_count_as_changed() {
        let dir = tempdir().unwrap();
        let mut a = CbtFile::create(dir.path().join("a.cbt"), 2 * BLOCK_SIZE as i64).unwrap();
        let mut b = CbtFile::create(dir.path().join("b.cbt"), 2 * BLOCK_SIZE as i64).unwrap();
        a.update(0, &[1u8; 16]).unwrap();
        b.update(0, &[1u8; 16]).unwrap();
        // Block 1 unknown on both sides: still transferred.
        assert_eq!(a.changed_blocks(&mut b).unwrap(), vec![1]);
    }
}
