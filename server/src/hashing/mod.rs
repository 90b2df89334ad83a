//! Hash grid primitives for the chunked transfer protocol.
//!
//! Files are cut into 512 KiB blocks, each carrying an MD5 strong hash and
//! 128 Adler-32 rolling hashes over its 4 KiB chunks. The per-file sidecar
//! serializes one 528-byte record per block (see [`sidecar`]).

pub mod sidecar;

use md5::{Digest, Md5};
use std::sync::OnceLock;

/// Rolling-hash granularity.
pub const CHUNK_SIZE: usize = 4096;
/// Strong-hash granularity (the checkpoint distance).
pub const BLOCK_SIZE: u64 = 512 * 1024;
pub const CHUNKS_PER_BLOCK: usize = (BLOCK_SIZE as usize) / CHUNK_SIZE;

pub const SMALL_HASH_SIZE: usize = 4;
pub const BIG_HASH_SIZE: usize = 16;
/// MD5 followed by 128 little-endian Adler-32 values.
pub const BLOCK_RECORD_SIZE: usize = BIG_HASH_SIZE + SMALL_HASH_SIZE * CHUNKS_PER_BLOCK;
/// Little-endian i64 logical file size.
pub const SIDECAR_HEADER_SIZE: u64 = 8;

/// Adler-32 of a chunk, reset at every chunk boundary.
pub fn chunk_adler(data: &[u8]) -> u32 {
    let mut h = adler2::Adler32::new();
    h.write_slice(data);
    h.checksum()
}

/// MD5 of a whole block (or the tail block's actual bytes).
pub fn block_md5(data: &[u8]) -> [u8; 16] {
    let mut h = Md5::new();
    h.update(data);
    h.finalize().into()
}

/// Number of 512 KiB blocks covering `size` bytes.
pub fn block_count(size: i64) -> i64 {
    if size <= 0 {
        return 0;
    }
    (size + BLOCK_SIZE as i64 - 1) / BLOCK_SIZE as i64
}

/// Number of chunks present in block `block` of a `size`-byte file.
pub fn chunks_in_block(block: i64, size: i64) -> usize {
    let block_start = block * BLOCK_SIZE as i64;
    let in_block = (size - block_start).clamp(0, BLOCK_SIZE as i64);
    ((in_block + CHUNK_SIZE as i64 - 1) / CHUNK_SIZE as i64) as usize
}

/// On-disk record length for block `block`; the tail record is truncated to
/// the chunks actually present.
pub fn record_len(block: i64, size: i64) -> usize {
    BIG_HASH_SIZE + SMALL_HASH_SIZE * chunks_in_block(block, size)
}

/// Total sidecar length for a file of `size` bytes.
pub fn sidecar_len(size: i64) -> i64 {
    let mut len = SIDECAR_HEADER_SIZE as i64;
    let blocks = block_count(size);
    for b in 0..blocks {
        len += record_len(b, size) as i64;
    }
    len
}

/// Byte offset of block `block`'s record inside the sidecar. Records are
/// fixed-size except the tail, so this is a plain multiply.
pub fn record_offset(block: i64) -> u64 {
    SIDECAR_HEADER_SIZE + block as u64 * BLOCK_RECORD_SIZE as u64
}

static SPARSE_RECORD: OnceLock<[u8; BLOCK_RECORD_SIZE]> = OnceLock::new();

/// The designated sidecar record for an all-zero block: MD5 over 512 KiB of
/// zeros followed by 128 copies of the Adler-32 of 4 KiB of zeros. Blocks
/// carrying this record compare equal without ever being stored.
pub fn sparse_block_record() -> &'static [u8; BLOCK_RECORD_SIZE] {
    SPARSE_RECORD.get_or_init(|| {
        let zeros = [0u8; CHUNK_SIZE];
        let small = chunk_adler(&zeros).to_le_bytes();

        let mut md5 = Md5::new();
        for _ in 0..CHUNKS_PER_BLOCK {
            md5.update(zeros);
        }
        let big: [u8; 16] = md5.finalize().into();

        let mut rec = [0u8; BLOCK_RECORD_SIZE];
        rec[..BIG_HASH_SIZE].copy_from_slice(&big);
        for i in 0..CHUNKS_PER_BLOCK {
            let off = BIG_HASH_SIZE + i * SMALL_HASH_SIZE;
            rec[off..off + SMALL_HASH_SIZE].copy_from_slice(&small);
        }
        rec
    })
}

/// The strong hash of an all-zero block.
pub fn sparse_block_md5() -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&sparse_block_record()[..BIG_HASH_SIZE]);
    out
}

pub fn buf_is_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// SHA-512 content identity of a file, as keyed by the dedup index.
pub fn file_sha512(path: &std::path::Path) -> std::io::Result<(i64, [u8; 64])> {
    use sha2::{Digest, Sha512};
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut sha = Sha512::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0i64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha.update(&buf[..n]);
        total += n as i64;
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&sha.finalize());
    Ok((total, out))
}

/// Incremental hasher for one block: feeds both the strong hash and the
/// per-chunk rolling hashes, yielding each chunk's Adler-32 as it closes.
pub struct BlockHasher {
    md5: Md5,
    adler: adler2::Adler32,
    chunk_fill: usize,
}

impl BlockHasher {
    pub fn new() -> Self {
        BlockHasher {
            md5: Md5::new(),
            adler: adler2::Adler32::new(),
            chunk_fill: 0,
        }
    }

    /// Feed bytes; invokes `on_chunk` with each completed chunk hash.
    pub fn update(&mut self, mut data: &[u8], mut on_chunk: impl FnMut(u32)) {
        while !data.is_empty() {
            let take = data.len().min(CHUNK_SIZE - self.chunk_fill);
            let (head, rest) = data.split_at(take);
            self.md5.update(head);
            self.adler.write_slice(head);
            self.chunk_fill += take;
            if self.chunk_fill == CHUNK_SIZE {
                on_chunk(self.adler.checksum());
                self.adler = adler2::Adler32::new();
                self.chunk_fill = 0;
            }
            data = rest;
        }
    }

    /// Close the block; returns the strong hash and, for a partial tail
    /// chunk, its rolling hash.
    pub fn finalize(self) -> ([u8; 16], Option<u32>) {
        let tail = if self.chunk_fill > 0 {
            Some(self.adler.checksum())
        } else {
            None
        };
        (self.md5.finalize().into(), tail)
    }
}

impl Default for BlockHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_record_matches_explicit_hash() {
        let zeros = vec![0u8; BLOCK_SIZE as usize];
        let rec = sparse_block_record();
        assert_eq!(&rec[..BIG_HASH_SIZE], &block_md5(&zeros)[..]);
        let adler = chunk_adler(&zeros[..CHUNK_SIZE]).to_le_bytes();
        assert_eq!(&rec[BIG_HASH_SIZE..BIG_HASH_SIZE + 4], &adler[..]);
    }

    #[test]
    fn adler_of_empty_is_one() {
        // Adler-32 starts at 1 per RFC 1950; the wire format relies on it.
        assert_eq!(chunk_adler(&[]), 1);
    }

    #[test]
    fn block_hasher_equals_one_shot() {
        let data: Vec<u8> = (0..BLOCK_SIZE as usize).map(|i| (i % 251) as u8).collect();
        let mut hasher = BlockHasher::new();
        let mut chunks = Vec::new();
        // Feed in uneven pieces to exercise chunk boundary handling.
        for piece in data.chunks(7000) {
            hasher.update(piece, |a| chunks.push(a));
        }
        let (big, tail) = hasher.finalize();
        assert_eq!(big, block_md5(&data));
        assert!(tail.is_none());
        assert_eq!(chunks.len(), CHUNKS_PER_BLOCK);
        for (i, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            assert_eq!(chunks[i], chunk_adler(chunk));
        }
    }

    #[test]
    fn tail_record_is_truncated() {
        // 1 MiB + 5000 bytes: two full blocks and a 2-chunk tail record.
        let size = 2 * BLOCK_SIZE as i64 + 5000;
        assert_eq!(block_count(size), 3);
        assert_eq!(chunks_in_block(2, size), 2);
        assert_eq!(record_len(2, size), BIG_HASH_SIZE + 2 * SMALL_HASH_SIZE);
        assert_eq!(
            sidecar_len(size),
            8 + 2 * BLOCK_RECORD_SIZE as i64 + (BIG_HASH_SIZE + 8) as i64
        );
    }
}
