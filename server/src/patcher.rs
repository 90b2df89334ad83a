//! Patch streams and their application.
//!
//! A patch file is `i64 LE target_size` followed by `{i64 LE offset,
//! u32 LE length, length bytes}` records; an offset of -1 tombstones the
//! record. Regions not covered by a record come from the base file at the
//! same offset. [`ChunkPatcher`] walks base + patch and hands the logical
//! new file to a [`PatchSink`]; [`PatchWriter`] produces the stream on the
//! receiving side of a transfer.

use crate::extents::{ExtentIterator, SparseExtent};
use crate::hashing::{buf_is_zero, CHUNK_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;

/// Zero-coalescing granularity for sparse detection.
pub const SPARSE_BLOCK: i64 = 512 * 1024;

const APPLY_BUFFER: usize = 512 * 1024;
const PATCH_HEADER_LEN: usize = 8 + 4;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("patch stream corrupt: {0}")]
    Corrupt(String),
}

/// Receives the reconstructed file.
pub trait PatchSink {
    /// One run of output bytes. `buf` is `None` for sparse runs and for
    /// unchanged runs the caller opted not to materialize
    /// (`require_unchanged(false)`).
    fn next_bytes(&mut self, buf: Option<&[u8]>, len: usize, changed: bool, sparse: bool)
        -> io::Result<()>;

    /// A coalesced sparse extent detected on output (with_sparse mode).
    fn next_sparse_extent(&mut self, _extent: SparseExtent) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct PatchHeader {
    offset: i64,
    size: u32,
}

/// Applies a patch stream against a base file.
pub struct ChunkPatcher {
    require_unchanged: bool,
    with_sparse: bool,
    unchanged_align: i64,
}

impl ChunkPatcher {
    pub fn new() -> Self {
        ChunkPatcher {
            require_unchanged: true,
            with_sparse: false,
            unchanged_align: 0,
        }
    }

    /// When false, unchanged runs are reported without data; the sink is
    /// expected to already hold the base bytes.
    pub fn require_unchanged(mut self, b: bool) -> Self {
        self.require_unchanged = b;
        self
    }

    /// Coalesce zero-filled 512 KiB windows into sparse extents on output.
    pub fn with_sparse(mut self, b: bool) -> Self {
        self.with_sparse = b;
        self
    }

    /// Widen unchanged runs abutting changed regions to multiples of `n`,
    /// so block-level strong hashes stay computable over aligned windows.
    pub fn unchanged_align(mut self, n: i64) -> Self {
        self.unchanged_align = n;
        self
    }

    /// Walk offsets 0..target_size, emitting patched and base data into
    /// `sink`. Returns the target size.
    pub fn apply(
        &self,
        base: &mut File,
        patch: &mut File,
        mut extent_iter: Option<&mut ExtentIterator>,
        sink: &mut dyn PatchSink,
    ) -> Result<i64, PatchError> {
        patch.seek(SeekFrom::Start(0))?;
        let base_size = base.seek(SeekFrom::End(0))? as i64;
        base.seek(SeekFrom::Start(0))?;

        let filesize = patch
            .read_i64::<LittleEndian>()
            .map_err(|_| PatchError::Corrupt("missing target size".into()))?;

        let mut run = SparseRun::new(self.with_sparse);
        let mut buf = vec![0u8; APPLY_BUFFER];

        let mut curr_extent = match extent_iter.as_deref_mut() {
            Some(it) => it.next_extent()?,
            None => None,
        };

        let align = self.unchanged_align;
        let mut align_start: i64 = -1;
        let mut align_end: i64 = -1;
        let mut align_end_next: i64 = -1;

        let mut has_header = true;
        let mut next_header: Option<PatchHeader> = None;
        let mut file_pos: i64 = 0;

        while (file_pos < base_size && file_pos < filesize) || has_header {
            if has_header && next_header.is_none() {
                next_header = read_next_valid_patch(patch)?;
                match next_header {
                    None => has_header = false,
                    Some(h) if align != 0 => {
                        align_start = round_down(h.offset, align);
                        align_end_next = round_up(h.offset + h.size as i64, align);
                    }
                    _ => {}
                }
            }

            if !has_header && (file_pos >= filesize || file_pos >= base_size) {
                break;
            }

            let mut tr: i64 = i64::MAX;
            if let Some(h) = next_header {
                let hoff = h.offset - file_pos;
                if hoff < 0 {
                    return Err(PatchError::Corrupt(format!(
                        "patch offset {} behind position {}",
                        h.offset, file_pos
                    )));
                }
                tr = tr.min(hoff);
            }

            let mut patching_finished = false;
            if tr == 0 {
                let h = next_header.as_mut().expect("tr==0 implies a header");
                if file_pos + h.size as i64 > filesize {
                    h.size = (filesize - file_pos) as u32;
                    patching_finished = true;
                }
            } else if file_pos >= filesize {
                return Err(PatchError::Corrupt(format!(
                    "position {} beyond target size {}",
                    file_pos, filesize
                )));
            }

            if tr == 0 {
                // Changed bytes from the patch body.
                let h = next_header.take().expect("tr==0 implies a header");
                align_end = align_end_next;
                let mut remaining = h.size as usize;
                while remaining > 0 {
                    let want = remaining.min(buf.len());
                    patch.read_exact(&mut buf[..want]).map_err(|e| {
                        PatchError::Corrupt(format!("short patch body at {}: {}", file_pos, e))
                    })?;
                    run.emit(file_pos, Some(&buf[..want]), want, true, false, sink)?;
                    remaining -= want;
                    file_pos += want as i64;
                }
                if self.require_unchanged {
                    base.seek(SeekFrom::Start(file_pos as u64))?;
                }
            } else if file_pos < base_size && file_pos < filesize {
                while let Some(e) = curr_extent {
                    if e.end() <= file_pos {
                        curr_extent = extent_iter
                            .as_deref_mut()
                            .expect("extent came from an iterator")
                            .next_extent()?;
                    } else {
                        break;
                    }
                }

                tr = tr.min(filesize - file_pos);

                let mut was_sparse = false;
                if let Some(e) = curr_extent {
                    if e.contains(file_pos, tr) {
                        run.emit(file_pos, None, tr as usize, false, true, sink)?;
                        file_pos += tr;
                        was_sparse = true;
                    }
                }

                while !was_sparse && tr > 0 && file_pos < base_size && file_pos < filesize {
                    tr = tr.min(APPLY_BUFFER as i64);

                    let mut curr_require_unchanged = self.require_unchanged;
                    if align != 0 {
                        let in_pre_window = align_start != -1
                            && align_end_next != -1
                            && file_pos >= align_start
                            && file_pos < align_end_next;
                        let in_post_window = align_end != -1 && file_pos < align_end;
                        if in_pre_window || in_post_window {
                            curr_require_unchanged = true;
                            base.seek(SeekFrom::Start(file_pos as u64))?;
                        }

                        if !curr_require_unchanged
                            && align_start != -1
                            && file_pos < align_start
                            && file_pos + tr > align_start
                        {
                            tr = align_start - file_pos;
                        } else if align_end != -1 && file_pos < align_end && file_pos + tr > align_end
                        {
                            tr = align_end - file_pos;
                        }
                    }

                    if curr_require_unchanged {
                        let r = base.read(&mut buf[..tr as usize])?;
                        if r == 0 {
                            return Err(PatchError::Corrupt(format!(
                                "base file ends at {} before target size {}",
                                file_pos, filesize
                            )));
                        }
                        run.emit(file_pos, Some(&buf[..r]), r, false, false, sink)?;
                        file_pos += r as i64;
                        tr -= r as i64;
                    } else {
                        if file_pos + tr > base_size {
                            tr = base_size - file_pos;
                        }
                        sink.next_bytes(None, tr as usize, false, false)?;
                        run.last_unchanged = true;
                        file_pos += tr;
                        tr = 0;
                    }

                    if align != 0 && file_pos == align_end {
                        align_end = -1;
                    }
                }
            } else {
                return Err(PatchError::Corrupt(format!(
                    "no data for position {} (base {} target {})",
                    file_pos, base_size, filesize
                )));
            }

            if patching_finished {
                run.finish(file_pos, sink)?;
                return Ok(filesize);
            }
        }

        run.finish(file_pos, sink)?;
        Ok(filesize)
    }
}

impl Default for ChunkPatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn round_up(n: i64, mult: i64) -> i64 {
    (n + mult - 1) / mult * mult
}

fn round_down(n: i64, mult: i64) -> i64 {
    n / mult * mult
}

fn read_next_valid_patch(patch: &mut File) -> Result<Option<PatchHeader>, PatchError> {
    loop {
        let mut hdr = [0u8; PATCH_HEADER_LEN];
        let mut got = 0;
        while got < hdr.len() {
            let n = patch.read(&mut hdr[got..])?;
            if n == 0 {
                return Ok(None);
            }
            got += n;
        }
        let offset = i64::from_le_bytes(hdr[..8].try_into().expect("8-byte slice"));
        let size = u32::from_le_bytes(hdr[8..].try_into().expect("4-byte slice"));
        if offset == -1 {
            // Tombstone: skip the dead body.
            patch.seek(SeekFrom::Current(size as i64))?;
            continue;
        }
        return Ok(Some(PatchHeader { offset, size }));
    }
}

/// Zero-window coalescing between the patcher and its sink. In with_sparse
/// mode output is re-blocked to 512 KiB windows; all-zero windows become
/// sparse runs plus an extent callback when they close.
struct SparseRun {
    enabled: bool,
    buf: Vec<u8>,
    only_zeros: bool,
    changed: bool,
    sparse_start: i64,
    last_unchanged: bool,
}

impl SparseRun {
    fn new(enabled: bool) -> Self {
        SparseRun {
            enabled,
            buf: if enabled { vec![0u8; SPARSE_BLOCK as usize] } else { Vec::new() },
            only_zeros: true,
            changed: false,
            sparse_start: -1,
            last_unchanged: false,
        }
    }

    fn emit(
        &mut self,
        mut pos: i64,
        buf: Option<&[u8]>,
        len: usize,
        changed: bool,
        sparse: bool,
        sink: &mut dyn PatchSink,
    ) -> io::Result<()> {
        if !self.enabled {
            return sink.next_bytes(buf, len, changed, sparse);
        }
        self.last_unchanged = false;

        if sparse {
            if self.sparse_start == -1 {
                self.sparse_start = round_up(pos, SPARSE_BLOCK);
            }
            return sink.next_bytes(None, len, changed, true);
        }

        let mut data = buf.expect("non-sparse emit carries data");
        let mut remaining = len;
        while remaining > 0 {
            if pos % SPARSE_BLOCK == 0 && remaining == SPARSE_BLOCK as usize {
                // Aligned full window: bypass the staging buffer.
                if buf_is_zero(&data[..remaining]) {
                    if self.sparse_start == -1 {
                        self.sparse_start = pos;
                    }
                    return sink.next_bytes(None, remaining, changed, true);
                }
                if self.sparse_start != -1 {
                    self.finish_sparse(pos, sink)?;
                }
                sink.next_bytes(Some(&data[..remaining]), remaining, changed, false)?;
                self.only_zeros = true;
                self.changed = false;
                return Ok(());
            }

            let next_checkpoint = round_down(pos, SPARSE_BLOCK) + SPARSE_BLOCK;
            let to_cp = remaining.min((next_checkpoint - pos) as usize);
            let used = (pos % SPARSE_BLOCK) as usize;

            if self.only_zeros && !buf_is_zero(&data[..to_cp]) {
                self.only_zeros = false;
            }
            if changed {
                self.changed = true;
            }
            self.buf[used..used + to_cp].copy_from_slice(&data[..to_cp]);

            if pos + to_cp as i64 == next_checkpoint {
                if self.only_zeros {
                    if self.sparse_start == -1 {
                        self.sparse_start = next_checkpoint - SPARSE_BLOCK;
                    }
                    sink.next_bytes(None, SPARSE_BLOCK as usize, self.changed, true)?;
                } else {
                    if self.sparse_start != -1 {
                        self.finish_sparse(pos, sink)?;
                    }
                    sink.next_bytes(Some(&self.buf), SPARSE_BLOCK as usize, self.changed, false)?;
                }
                self.only_zeros = true;
                self.changed = false;
            }

            pos += to_cp as i64;
            data = &data[to_cp..];
            remaining -= to_cp;
        }
        Ok(())
    }

    fn finish(&mut self, pos: i64, sink: &mut dyn PatchSink) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.finish_sparse(pos, sink)?;
        let used = (pos % SPARSE_BLOCK) as usize;
        if used > 0 && !self.last_unchanged {
            sink.next_bytes(Some(&self.buf[..used]), used, self.changed, false)?;
        }
        Ok(())
    }

    fn finish_sparse(&mut self, pos: i64, sink: &mut dyn PatchSink) -> io::Result<()> {
        if self.sparse_start != -1 && round_down(pos, SPARSE_BLOCK) > self.sparse_start {
            sink.next_sparse_extent(SparseExtent {
                offset: self.sparse_start,
                len: round_down(pos, SPARSE_BLOCK) - self.sparse_start,
            })?;
            self.sparse_start = -1;
        }
        Ok(())
    }
}

/// Sink that materializes output into a file, leaving holes for sparse runs.
pub struct FilePatchSink {
    file: File,
    pos: i64,
    pub extents: Vec<SparseExtent>,
}

impl FilePatchSink {
    pub fn new(file: File) -> Self {
        FilePatchSink { file, pos: 0, extents: Vec::new() }
    }

    /// Extend to the final size (trailing holes) and hand the file back.
    pub fn finish(mut self, target_size: i64) -> io::Result<File> {
        self.file.set_len(target_size as u64)?;
        Ok(self.file)
    }
}

impl PatchSink for FilePatchSink {
    fn next_bytes(&mut self, buf: Option<&[u8]>, len: usize, _changed: bool, _sparse: bool) -> io::Result<()> {
        if let Some(data) = buf {
            self.file.seek(SeekFrom::Start(self.pos as u64))?;
            self.file.write_all(data)?;
        }
        self.pos += len as i64;
        Ok(())
    }

    fn next_sparse_extent(&mut self, extent: SparseExtent) -> io::Result<()> {
        self.extents.push(extent);
        Ok(())
    }
}

/// Apply `patch` to `base`, writing the result to `output`. Used by restore
/// and the `patch-apply` CLI.
pub fn apply_to_file(
    base: &mut File,
    patch: &mut File,
    extent_iter: Option<&mut ExtentIterator>,
    output: File,
) -> Result<(File, Vec<SparseExtent>), PatchError> {
    let mut sink = FilePatchSink::new(output);
    let size = ChunkPatcher::new().with_sparse(true).apply(base, patch, extent_iter, &mut sink)?;
    let extents = std::mem::take(&mut sink.extents);
    Ok((sink.finish(size)?, extents))
}

/// Streaming writer for the patch format, with the 4 KiB record coalescing
/// the transfer session relies on and tombstone support for reconnects.
pub struct PatchWriter {
    file: File,
    pos: u64,
    buf: [u8; CHUNK_SIZE],
    buf_pos: usize,
    buf_start: i64,
    /// Record offsets written for the block in flight; rewritten to -1 when
    /// a reconnect invalidates them.
    last_records: Vec<u64>,
    output_fsize: i64,
    saved_output_fsize: i64,
}

impl PatchWriter {
    pub fn new(file: File) -> Self {
        PatchWriter {
            file,
            pos: 0,
            buf: [0u8; CHUNK_SIZE],
            buf_pos: 0,
            buf_start: 0,
            last_records: Vec::new(),
            output_fsize: 0,
            saved_output_fsize: 0,
        }
    }

    /// Largest offset covered so far; the logical size of the output.
    pub fn output_fsize(&self) -> i64 {
        self.output_fsize
    }

    pub fn write_size(&mut self, target_size: i64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_i64::<LittleEndian>(target_size)?;
        if self.pos == 0 {
            self.pos = 8;
        } else {
            self.file.seek(SeekFrom::Start(self.pos))?;
        }
        Ok(())
    }

    /// Append `data` at logical offset `pos`. Adjacent small writes coalesce
    /// into one record; `last` flushes the pending buffer.
    pub fn write(&mut self, pos: i64, data: &[u8], last: bool) -> io::Result<()> {
        if data.len() <= CHUNK_SIZE - self.buf_pos
            && (self.buf_pos == 0 || pos == self.buf_start + self.buf_pos as i64)
        {
            if self.buf_pos == 0 {
                self.buf_start = pos;
            }
            self.buf[self.buf_pos..self.buf_pos + data.len()].copy_from_slice(data);
            self.buf_pos += data.len();
            if last || self.buf_pos == CHUNK_SIZE || data.is_empty() {
                self.flush_buf()?;
            }
        } else {
            self.flush_buf()?;
            if !last && !data.is_empty() && data.len() < CHUNK_SIZE {
                self.buf[..data.len()].copy_from_slice(data);
                self.buf_start = pos;
                self.buf_pos = data.len();
            } else {
                self.write_record(pos, data)?;
            }
        }
        Ok(())
    }

    fn flush_buf(&mut self) -> io::Result<()> {
        if self.buf_pos > 0 {
            let len = self.buf_pos;
            let start = self.buf_start;
            let mut tmp = [0u8; CHUNK_SIZE];
            tmp[..len].copy_from_slice(&self.buf[..len]);
            self.buf_pos = 0;
            self.write_record(start, &tmp[..len])?;
        }
        Ok(())
    }

    fn write_record(&mut self, pos: i64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.write_i64::<LittleEndian>(pos)?;
        self.file.write_u32::<LittleEndian>(data.len() as u32)?;
        self.file.write_all(data)?;
        if self.last_records.is_empty() {
            self.saved_output_fsize = self.output_fsize;
        }
        self.last_records.push(self.pos);
        self.pos += (PATCH_HEADER_LEN + data.len()) as u64;
        self.output_fsize = self.output_fsize.max(pos + data.len() as i64);
        Ok(())
    }

    /// The current block's records survived verification; stop tracking them.
    pub fn commit_block(&mut self) {
        self.last_records.clear();
    }

    /// Tombstone every record of the block in flight (reconnect or strong
    /// hash mismatch) so the patcher skips them on apply.
    pub fn invalidate_last(&mut self) -> io::Result<()> {
        if !self.last_records.is_empty() {
            self.output_fsize = self.saved_output_fsize;
        }
        for &off in &self.last_records {
            self.file.seek(SeekFrom::Start(off))?;
            self.file.write_i64::<LittleEndian>(-1)?;
        }
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.last_records.clear();
        self.buf_pos = 0;
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    pub fn into_inner(self) -> File {
        self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    fn file_with(data: &[u8]) -> File {
        let mut f = tempfile().unwrap();
        f.write_all(data).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    fn read_all(f: &mut File) -> Vec<u8> {
        let mut out = Vec::new();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut out).unwrap();
        out
    }

    struct VecSink {
        data: Vec<u8>,
        extents: Vec<SparseExtent>,
    }

    impl VecSink {
        fn new() -> Self {
            VecSink { data: Vec::new(), extents: Vec::new() }
        }
    }

    impl PatchSink for VecSink {
        fn next_bytes(&mut self, buf: Option<&[u8]>, len: usize, _changed: bool, _sparse: bool) -> io::Result<()> {
            match buf {
                Some(b) => self.data.extend_from_slice(b),
                None => self.data.extend(std::iter::repeat(0u8).take(len)),
            }
            Ok(())
        }

        fn next_sparse_extent(&mut self, extent: SparseExtent) -> io::Result<()> {
            self.extents.push(extent);
            Ok(())
        }
    }

    fn make_patch(target_size: i64, records: &[(i64, &[u8])]) -> File {
        let mut f = tempfile().unwrap();
        f.write_i64::<LittleEndian>(target_size).unwrap();
        for (off, data) in records {
            f.write_i64::<LittleEndian>(*off).unwrap();
            f.write_u32::<LittleEndian>(data.len() as u32).unwrap();
            f.write_all(data).unwrap();
        }
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    #[test]
    fn single_record_patch() {
        let base = vec![0xAAu8; 1 << 20];
        let replacement = vec![0xBBu8; 4096];
        let mut expected = base.clone();
        expected[4096..8192].copy_from_slice(&replacement);

        let mut base_f = file_with(&base);
        let mut patch_f = make_patch(base.len() as i64, &[(4096, &replacement)]);

        let mut sink = VecSink::new();
        let size = ChunkPatcher::new().apply(&mut base_f, &mut patch_f, None, &mut sink).unwrap();
        assert_eq!(size, base.len() as i64);
        assert_eq!(sink.data, expected);
    }

    #[test]
    fn tombstoned_records_are_skipped() {
        let base = vec![0x11u8; 64 * 1024];
        let dead = vec![0xEEu8; 100];
        let live = vec![0x22u8; 200];

        let mut patch_f = tempfile().unwrap();
        patch_f.write_i64::<LittleEndian>(base.len() as i64).unwrap();
        patch_f.write_i64::<LittleEndian>(-1).unwrap();
        patch_f.write_u32::<LittleEndian>(dead.len() as u32).unwrap();
        patch_f.write_all(&dead).unwrap();
        patch_f.write_i64::<LittleEndian>(1000).unwrap();
        patch_f.write_u32::<LittleEndian>(live.len() as u32).unwrap();
        patch_f.write_all(&live).unwrap();

        let mut base_f = file_with(&base);
        let mut sink = VecSink::new();
        ChunkPatcher::new().apply(&mut base_f, &mut patch_f, None, &mut sink).unwrap();

        let mut expected = base.clone();
        expected[1000..1200].copy_from_slice(&live);
        assert_eq!(sink.data, expected);
    }

    #[test]
    fn growing_patch_extends_past_base() {
        let base = vec![0x33u8; 1000];
        let tail = vec![0x44u8; 500];
        let mut base_f = file_with(&base);
        let mut patch_f = make_patch(1500, &[(1000, &tail)]);

        let mut sink = VecSink::new();
        let size = ChunkPatcher::new().apply(&mut base_f, &mut patch_f, None, &mut sink).unwrap();
        assert_eq!(size, 1500);
        assert_eq!(&sink.data[..1000], &base[..]);
        assert_eq!(&sink.data[1000..], &tail[..]);
    }

    #[test]
    fn shrinking_patch_truncates_base() {
        let base = vec![0x55u8; 2000];
        let mut base_f = file_with(&base);
        let mut patch_f = make_patch(700, &[]);

        let mut sink = VecSink::new();
        let size = ChunkPatcher::new().apply(&mut base_f, &mut patch_f, None, &mut sink).unwrap();
        assert_eq!(size, 700);
        assert_eq!(sink.data.len(), 700);
    }

    #[test]
    fn sparse_mode_detects_zero_windows() {
        // One data block, two zero blocks, one data block.
        let bs = SPARSE_BLOCK as usize;
        let mut base = vec![0u8; 4 * bs];
        base[..bs].fill(0x77);
        base[3 * bs..].fill(0x88);

        let mut base_f = file_with(&base);
        let mut patch_f = make_patch(base.len() as i64, &[]);

        let mut sink = VecSink::new();
        ChunkPatcher::new().with_sparse(true).apply(&mut base_f, &mut patch_f, None, &mut sink).unwrap();

        assert_eq!(sink.data, base);
        assert_eq!(
            sink.extents,
            vec![SparseExtent { offset: SPARSE_BLOCK, len: 2 * SPARSE_BLOCK }]
        );
    }

    #[test]
    fn patch_writer_coalesces_and_invalidates() {
        let f = tempfile().unwrap();
        let mut w = PatchWriter::new(f);
        w.write_size(10_000).unwrap();

        // Two adjacent small writes coalesce into one record.
        w.write(100, &[1u8; 50], false).unwrap();
        w.write(150, &[2u8; 50], true).unwrap();
        assert_eq!(w.output_fsize(), 200);
        w.commit_block();

        // A second block's record gets tombstoned.
        w.write(5000, &[3u8; 100], true).unwrap();
        assert_eq!(w.output_fsize(), 5100);
        w.invalidate_last().unwrap();
        assert_eq!(w.output_fsize(), 200);

        let mut file = w.into_inner();
        let raw = read_all(&mut file);
        assert_eq!(i64::from_le_bytes(raw[..8].try_into().unwrap()), 10_000);
        // First record: offset 100, len 100.
        assert_eq!(i64::from_le_bytes(raw[8..16].try_into().unwrap()), 100);
        assert_eq!(u32::from_le_bytes(raw[16..20].try_into().unwrap()), 100);
        // Second record: tombstoned offset.
        let second = 8 + 12 + 100;
        assert_eq!(i64::from_le_bytes(raw[second..second + 8].try_into().unwrap()), -1);
    }

    #[test]
    fn apply_to_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let base = vec![0xABu8; 300_000];
        let change = vec![0xCDu8; 9000];
        let mut expected = base.clone();
        expected[12_345..12_345 + 9000].copy_from_slice(&change);

        let mut base_f = file_with(&base);
        let mut patch_f = make_patch(base.len() as i64, &[(12_345, &change)]);
        let out = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("out"))
            .unwrap();

        let (mut out, _extents) = apply_to_file(&mut base_f, &mut patch_f, None, out).unwrap();
        assert_eq!(read_all(&mut out), expected);
    }
}
