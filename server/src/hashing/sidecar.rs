//! The per-file hash sidecar: a little-endian i64 logical size followed by
//! one block record per 512 KiB block (16-byte MD5 + 128 LE Adler-32 chunk
//! hashes). The tail record is truncated to the chunks actually present; a
//! logical size of -1 marks a metadata-only entry with no data body.

use super::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest as ShaDigest, Sha512};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Logical size value marking a metadata-only sidecar.
pub const METADATA_ONLY: i64 = -1;

/// One decoded sidecar record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub strong: [u8; 16],
    pub rolling: Vec<u32>,
}

impl BlockRecord {
    pub fn is_sparse(&self) -> bool {
        self.strong == sparse_block_md5()
    }

    pub fn sparse() -> Self {
        Self::decode(sparse_block_record())
    }

    /// Decode from raw bytes (16-byte MD5 + 4-byte LE adlers). Short reads
    /// from a truncated tail record yield fewer rolling hashes.
    pub fn decode(raw: &[u8]) -> Self {
        let mut strong = [0u8; 16];
        strong.copy_from_slice(&raw[..BIG_HASH_SIZE]);
        let rolling = raw[BIG_HASH_SIZE..]
            .chunks_exact(SMALL_HASH_SIZE)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        BlockRecord { strong, rolling }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BIG_HASH_SIZE + self.rolling.len() * SMALL_HASH_SIZE);
        out.extend_from_slice(&self.strong);
        for r in &self.rolling {
            out.extend_from_slice(&r.to_le_bytes());
        }
        out
    }

    /// Fixed 528-byte form for the wire; a truncated tail is zero-padded,
    /// matching what the peer expects to diff against.
    pub fn to_wire(&self) -> [u8; BLOCK_RECORD_SIZE] {
        let mut out = [0u8; BLOCK_RECORD_SIZE];
        let enc = self.encode();
        out[..enc.len()].copy_from_slice(&enc);
        out
    }
}

/// Random-access wrapper over a sidecar on disk.
pub struct SidecarFile {
    file: File,
}

impl SidecarFile {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(SidecarFile { file })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Ok(SidecarFile { file })
    }

    pub fn open_readonly<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(SidecarFile { file })
    }

    pub fn from_file(file: File) -> Self {
        SidecarFile { file }
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn logical_size(&mut self) -> io::Result<i64> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_i64::<LittleEndian>()
    }

    pub fn set_logical_size(&mut self, size: i64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_i64::<LittleEndian>(size)
    }

    /// Raw record bytes for `block`, or None when the sidecar ends before
    /// it (partial base files produce short sidecars).
    pub fn read_record_raw(&mut self, block: i64) -> io::Result<Option<Vec<u8>>> {
        self.file.seek(SeekFrom::Start(record_offset(block)))?;
        let mut buf = vec![0u8; BLOCK_RECORD_SIZE];
        let mut got = 0;
        while got < buf.len() {
            let n = self.file.read(&mut buf[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got < BIG_HASH_SIZE + SMALL_HASH_SIZE {
            return Ok(None);
        }
        buf.truncate(got - got % SMALL_HASH_SIZE);
        Ok(Some(buf))
    }

    pub fn read_record(&mut self, block: i64) -> io::Result<Option<BlockRecord>> {
        Ok(self.read_record_raw(block)?.map(|raw| BlockRecord::decode(&raw)))
    }

    /// Write a full record for `block`, truncated to the chunks present in
    /// a `logical_size`-byte file.
    pub fn write_record(&mut self, block: i64, rec: &BlockRecord, logical_size: i64) -> io::Result<()> {
        let len = record_len(block, logical_size);
        let enc = rec.to_wire();
        self.file.seek(SeekFrom::Start(record_offset(block)))?;
        self.file.write_all(&enc[..len])
    }

    pub fn write_sparse_record(&mut self, block: i64, logical_size: i64) -> io::Result<()> {
        let len = record_len(block, logical_size);
        self.file.seek(SeekFrom::Start(record_offset(block)))?;
        self.file.write_all(&sparse_block_record()[..len])
    }

    pub fn write_strong(&mut self, block: i64, md5: &[u8; 16]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(record_offset(block)))?;
        self.file.write_all(md5)
    }

    pub fn write_rolling(&mut self, block: i64, chunk_idx: usize, adler: u32) -> io::Result<()> {
        let off = record_offset(block) + (BIG_HASH_SIZE + chunk_idx * SMALL_HASH_SIZE) as u64;
        self.file.seek(SeekFrom::Start(off))?;
        self.file.write_u32::<LittleEndian>(adler)
    }

    pub fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Append the remainder of `other` beyond our current length; used when
    /// a failed transfer falls back to the base file's hash data.
    pub fn copy_tail_from(&mut self, other: &mut SidecarFile) -> io::Result<()> {
        let own_len = self.len()?;
        self.file.seek(SeekFrom::Start(own_len))?;
        other.file.seek(SeekFrom::Start(own_len))?;
        let mut buf = [0u8; 4096];
        loop {
            let n = other.file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.file.write_all(&buf[..n])?;
        }
        Ok(())
    }
}

/// Scan `input` and write its complete sidecar, returning the file size and
/// the SHA-512 content identity used by the dedup index.
pub fn build_sidecar(input: &mut File, sidecar: &mut SidecarFile) -> io::Result<(i64, [u8; 64])> {
    let size = input.seek(SeekFrom::End(0))? as i64;
    input.seek(SeekFrom::Start(0))?;
    sidecar.set_logical_size(size)?;

    let mut sha = Sha512::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    for block in 0..block_count(size) {
        let mut hasher = BlockHasher::new();
        let mut rolling = Vec::with_capacity(CHUNKS_PER_BLOCK);
        let block_bytes = (size - block * BLOCK_SIZE as i64).min(BLOCK_SIZE as i64) as usize;
        let mut read_total = 0usize;
        while read_total < block_bytes {
            let want = buf.len().min(block_bytes - read_total);
            input.read_exact(&mut buf[..want])?;
            sha.update(&buf[..want]);
            hasher.update(&buf[..want], |a| rolling.push(a));
            read_total += want;
        }
        let (strong, tail) = hasher.finalize();
        if let Some(t) = tail {
            rolling.push(t);
        }
        sidecar.write_record(block, &BlockRecord { strong, rolling }, size)?;
    }

    let mut id = [0u8; 64];
    id.copy_from_slice(&sha.finalize());
    Ok((size, id))
}

/// Recompute `input`'s hashes and compare them to `sidecar`. Returns the
/// offsets of mismatching blocks; a size mismatch reports every block.
pub fn verify_sidecar(input: &mut File, sidecar: &mut SidecarFile) -> io::Result<Vec<i64>> {
    let size = input.seek(SeekFrom::End(0))? as i64;
    let recorded = sidecar.logical_size()?;
    if recorded == METADATA_ONLY {
        return Ok(Vec::new());
    }
    if recorded != size {
        return Ok((0..block_count(size.max(recorded))).collect());
    }

    input.seek(SeekFrom::Start(0))?;
    let mut bad = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    for block in 0..block_count(size) {
        let mut hasher = BlockHasher::new();
        let mut rolling = Vec::with_capacity(CHUNKS_PER_BLOCK);
        let block_bytes = (size - block * BLOCK_SIZE as i64).min(BLOCK_SIZE as i64) as usize;
        let mut read_total = 0usize;
        while read_total < block_bytes {
            let want = buf.len().min(block_bytes - read_total);
            input.read_exact(&mut buf[..want])?;
            hasher.update(&buf[..want], |a| rolling.push(a));
            read_total += want;
        }
        let (strong, tail) = hasher.finalize();
        if let Some(t) = tail {
            rolling.push(t);
        }
        match sidecar.read_record(block)? {
            Some(rec) if rec.strong == strong && rec.rolling == rolling => {}
            _ => bad.push(block * BLOCK_SIZE as i64),
        }
    }
    Ok(bad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(path: &Path, data: &[u8]) -> File {
        std::fs::write(path, data).unwrap();
        File::options().read(true).write(true).open(path).unwrap()
    }

    #[test]
    fn build_and_verify_round_trip() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..BLOCK_SIZE as usize + 9000).map(|i| (i * 7 % 256) as u8).collect();
        let mut input = write_file(&dir.path().join("f"), &data);
        let mut sidecar = SidecarFile::create(dir.path().join("f.hash")).unwrap();

        let (size, _sha) = build_sidecar(&mut input, &mut sidecar).unwrap();
        assert_eq!(size, data.len() as i64);
        assert_eq!(sidecar.len().unwrap(), sidecar_len(size) as u64);
        assert!(verify_sidecar(&mut input, &mut sidecar).unwrap().is_empty());
    }

    #[test]
    fn verify_flags_modified_block() {
        let dir = tempdir().unwrap();
        let data = vec![0xAAu8; 2 * BLOCK_SIZE as usize];
        let path = dir.path().join("f");
        let mut input = write_file(&path, &data);
        let mut sidecar = SidecarFile::create(dir.path().join("f.hash")).unwrap();
        build_sidecar(&mut input, &mut sidecar).unwrap();

        // Flip one byte in the second block.
        input.seek(SeekFrom::Start(BLOCK_SIZE + 100)).unwrap();
        input.write_all(&[0xBB]).unwrap();

        let bad = verify_sidecar(&mut input, &mut sidecar).unwrap();
        assert_eq!(bad, vec![BLOCK_SIZE as i64]);
    }

    #[test]
    fn tail_record_round_trips_truncated() {
        let dir = tempdir().unwrap();
        let mut sidecar = SidecarFile::create(dir.path().join("t.hash")).unwrap();
        let size = BLOCK_SIZE as i64 + 5000; // tail: 2 chunks
        sidecar.set_logical_size(size).unwrap();

        let rec = BlockRecord {
            strong: [7u8; 16],
            rolling: vec![1, 2],
        };
        sidecar.write_record(1, &rec, size).unwrap();
        let back = sidecar.read_record(1).unwrap().unwrap();
        assert_eq!(back.strong, rec.strong);
        assert_eq!(&back.rolling[..2], &rec.rolling[..]);
        assert_eq!(sidecar.len().unwrap(), sidecar_len(size) as u64);
    }

    #[test]
    fn metadata_only_marker() {
        let dir = tempdir().unwrap();
        let mut sidecar = SidecarFile::create(dir.path().join("m.hash")).unwrap();
        sidecar.set_logical_size(METADATA_ONLY).unwrap();
        assert_eq!(sidecar.logical_size().unwrap(), -1);
    }
}
