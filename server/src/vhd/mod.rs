//! Dynamic VHD container: 512-byte footer (mirrored at offset 0), 1024-byte
//! dynamic header, a block allocation table of sector pointers, and 2 MiB
//! data blocks each preceded by a sector bitmap. All metadata integers are
//! big-endian per the format.

pub mod cbt;
pub mod writer;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

const FOOTER_COOKIE: &[u8; 8] = b"conectix";
const DYNHDR_COOKIE: &[u8; 8] = b"cxsparse";
const FOOTER_SIZE: u64 = 512;
const DYNHDR_SIZE: u64 = 1024;
const BAT_OFFSET: u64 = FOOTER_SIZE + DYNHDR_SIZE;
const SECTOR: u64 = 512;
const BAT_FREE: u32 = 0xFFFF_FFFF;

/// Default VHD data block size. Distinct from the 512 KiB hash grid.
pub const VHD_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// MBR/GPT header area reserved at the start of the virtual disk; volume
/// data is written beyond it.
pub const MBR_AREA: u64 = 512 * 512;

#[derive(Error, Debug)]
pub enum VhdError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("not a VHD: {0}")]
    Format(String),
    #[error("write beyond virtual disk size: {0}")]
    OutOfRange(u64),
}

pub struct VhdFile {
    file: File,
    drive_size: u64,
    block_size: u64,
    /// Sector offsets of each block's bitmap, BAT_FREE when unallocated.
    bat: Vec<u32>,
    bitmap_sectors: u64,
    /// File offset where the next allocated block (or the trailing footer)
    /// goes.
    data_end: u64,
    uuid: Uuid,
    bat_dirty: bool,
}

impl VhdFile {
    pub fn create<P: AsRef<Path>>(path: P, drive_size: u64) -> Result<Self, VhdError> {
        let block_size = VHD_BLOCK_SIZE;
        let drive_size = drive_size.div_ceil(block_size) * block_size;
        let entries = (drive_size / block_size) as usize;
        let bat_bytes = ((entries as u64 * 4).div_ceil(SECTOR)) * SECTOR;

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let uuid = Uuid::new_v4();
        let mut vhd = VhdFile {
            file,
            drive_size,
            block_size,
            bat: vec![BAT_FREE; entries],
            bitmap_sectors: (block_size / SECTOR).div_ceil(8).div_ceil(SECTOR),
            data_end: BAT_OFFSET + bat_bytes,
            uuid,
            bat_dirty: true,
        };

        let footer = vhd.build_footer();
        vhd.file.seek(SeekFrom::Start(0))?;
        vhd.file.write_all(&footer)?;
        let header = vhd.build_dynamic_header();
        vhd.file.write_all(&header)?;
        vhd.write_bat()?;
        vhd.write_trailing_footer()?;
        Ok(vhd)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VhdError> {
        let mut file = File::options().read(true).write(true).open(path)?;

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut footer)?;
        if &footer[..8] != FOOTER_COOKIE {
            return Err(VhdError::Format("missing footer cookie".into()));
        }
        let drive_size = BigEndian::read_u64(&footer[48..56]);
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&footer[68..84]);

        let mut header = [0u8; DYNHDR_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[..8] != DYNHDR_COOKIE {
            return Err(VhdError::Format("missing dynamic header cookie".into()));
        }
        let table_offset = BigEndian::read_u64(&header[16..24]);
        let entries = BigEndian::read_u32(&header[28..32]) as usize;
        let block_size = BigEndian::read_u32(&header[32..36]) as u64;

        file.seek(SeekFrom::Start(table_offset))?;
        let mut bat = vec![BAT_FREE; entries];
        for slot in bat.iter_mut() {
            *slot = file.read_u32::<BigEndian>()?;
        }

        let bitmap_sectors = (block_size / SECTOR).div_ceil(8).div_ceil(SECTOR);
        let file_len = file.seek(SeekFrom::End(0))?;
        let data_end = file_len.saturating_sub(FOOTER_SIZE);

        Ok(VhdFile {
            file,
            drive_size,
            block_size,
            bat,
            bitmap_sectors,
            data_end,
            uuid: Uuid::from_bytes(uuid_bytes),
            bat_dirty: false,
        })
    }

    pub fn drive_size(&self) -> u64 {
        self.drive_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn allocated_blocks(&self) -> usize {
        self.bat.iter().filter(|&&e| e != BAT_FREE).count()
    }

    pub fn is_block_allocated(&self, index: usize) -> bool {
        self.bat.get(index).map(|&e| e != BAT_FREE).unwrap_or(false)
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), VhdError> {
        if offset + data.len() as u64 > self.drive_size {
            return Err(VhdError::OutOfRange(offset + data.len() as u64));
        }
        let mut pos = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let block = (pos / self.block_size) as usize;
            let in_block = pos % self.block_size;
            let take = remaining.len().min((self.block_size - in_block) as usize);

            let data_offset = self.block_data_offset(block)?;
            self.file.seek(SeekFrom::Start(data_offset + in_block))?;
            self.file.write_all(&remaining[..take])?;

            pos += take as u64;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    /// Read logical bytes; unallocated blocks read as zeros.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), VhdError> {
        if offset + buf.len() as u64 > self.drive_size {
            return Err(VhdError::OutOfRange(offset + buf.len() as u64));
        }
        let mut pos = offset;
        let mut filled = 0usize;
        while filled < buf.len() {
            let block = (pos / self.block_size) as usize;
            let in_block = pos % self.block_size;
            let take = (buf.len() - filled).min((self.block_size - in_block) as usize);

            if self.bat[block] == BAT_FREE {
                buf[filled..filled + take].fill(0);
            } else {
                let data_offset =
                    self.bat[block] as u64 * SECTOR + self.bitmap_sectors * SECTOR;
                self.file.seek(SeekFrom::Start(data_offset + in_block))?;
                self.file.read_exact(&mut buf[filled..filled + take])?;
            }
            pos += take as u64;
            filled += take;
        }
        Ok(())
    }

    /// Release the VHD blocks fully inside [start, end) back to "unused";
    /// partial spans are zeroed in place. Returns the bytes trimmed.
    pub fn trim(&mut self, start: u64, end: u64) -> Result<u64, VhdError> {
        let end = end.min(self.drive_size);
        if start >= end {
            return Ok(0);
        }
        let mut trimmed = 0u64;
        let first_block = start.div_ceil(self.block_size);
        let last_block = end / self.block_size;

        for block in first_block..last_block {
            if self.bat[block as usize] != BAT_FREE {
                self.bat[block as usize] = BAT_FREE;
                self.bat_dirty = true;
            }
            trimmed += self.block_size;
        }

        // Leading and trailing partial spans.
        let zero = vec![0u8; 64 * 1024];
        let mut zero_range = |vhd: &mut Self, mut from: u64, to: u64| -> Result<(), VhdError> {
            while from < to {
                let take = zero.len().min((to - from) as usize);
                let block = (from / vhd.block_size) as usize;
                if vhd.bat[block] != BAT_FREE {
                    vhd.write_at(from, &zero[..take])?;
                }
                from += take as u64;
            }
            Ok(())
        };
        if first_block * self.block_size > start {
            zero_range(self, start, (first_block * self.block_size).min(end))?;
        }
        if last_block >= first_block && last_block * self.block_size > start {
            zero_range(self, (last_block * self.block_size).max(start), end)?;
        }
        Ok(trimmed)
    }

    fn block_data_offset(&mut self, block: usize) -> Result<u64, VhdError> {
        if self.bat[block] == BAT_FREE {
            // Append a new block: bitmap (all sectors present) + zero data.
            let offset = self.data_end;
            self.file.seek(SeekFrom::Start(offset))?;
            let bitmap = vec![0xFFu8; (self.bitmap_sectors * SECTOR) as usize];
            self.file.write_all(&bitmap)?;
            let zeros = vec![0u8; 64 * 1024];
            let mut remaining = self.block_size;
            while remaining > 0 {
                let take = zeros.len().min(remaining as usize);
                self.file.write_all(&zeros[..take])?;
                remaining -= take as u64;
            }
            self.bat[block] = (offset / SECTOR) as u32;
            self.data_end = offset + self.bitmap_sectors * SECTOR + self.block_size;
            self.bat_dirty = true;
        }
        Ok(self.bat[block] as u64 * SECTOR + self.bitmap_sectors * SECTOR)
    }

    /// Persist BAT and trailing footer. Footer last, so a torn flush never
    /// presents a valid footer over a stale table.
    pub fn flush(&mut self) -> Result<(), VhdError> {
        if self.bat_dirty {
            self.write_bat()?;
            self.bat_dirty = false;
        }
        self.write_trailing_footer()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn write_bat(&mut self) -> Result<(), VhdError> {
        self.file.seek(SeekFrom::Start(BAT_OFFSET))?;
        for &entry in &self.bat {
            self.file.write_u32::<BigEndian>(entry)?;
        }
        // Pad the table to a sector boundary.
        let written = self.bat.len() as u64 * 4;
        let padded = written.div_ceil(SECTOR) * SECTOR;
        let pad = vec![0u8; (padded - written) as usize];
        self.file.write_all(&pad)?;
        Ok(())
    }

    fn write_trailing_footer(&mut self) -> Result<(), VhdError> {
        let footer = self.build_footer();
        self.file.seek(SeekFrom::Start(self.data_end))?;
        self.file.write_all(&footer)?;
        self.file.set_len(self.data_end + FOOTER_SIZE)?;
        Ok(())
    }

    fn build_footer(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut f = [0u8; FOOTER_SIZE as usize];
        f[..8].copy_from_slice(FOOTER_COOKIE);
        BigEndian::write_u32(&mut f[8..12], 2); // features: reserved bit
        BigEndian::write_u32(&mut f[12..16], 0x0001_0000); // format version
        BigEndian::write_u64(&mut f[16..24], FOOTER_SIZE); // data offset
        BigEndian::write_u32(&mut f[24..28], vhd_timestamp());
        f[28..32].copy_from_slice(b"pkrt"); // creator application
        BigEndian::write_u32(&mut f[32..36], 0x0001_0000);
        f[36..40].copy_from_slice(b"Wi2k");
        BigEndian::write_u64(&mut f[40..48], self.drive_size); // original size
        BigEndian::write_u64(&mut f[48..56], self.drive_size); // current size
        BigEndian::write_u32(&mut f[56..60], disk_geometry(self.drive_size));
        BigEndian::write_u32(&mut f[60..64], 3); // dynamic disk
        f[68..84].copy_from_slice(self.uuid.as_bytes());
        let checksum = footer_checksum(&f);
        BigEndian::write_u32(&mut f[64..68], checksum);
        f
    }

    fn build_dynamic_header(&self) -> [u8; DYNHDR_SIZE as usize] {
        let mut h = [0u8; DYNHDR_SIZE as usize];
        h[..8].copy_from_slice(DYNHDR_COOKIE);
        BigEndian::write_u64(&mut h[8..16], u64::MAX); // data offset: unused
        BigEndian::write_u64(&mut h[16..24], BAT_OFFSET);
        BigEndian::write_u32(&mut h[24..28], 0x0001_0000);
        BigEndian::write_u32(&mut h[28..32], self.bat.len() as u32);
        BigEndian::write_u32(&mut h[32..36], self.block_size as u32);
        let checksum = footer_checksum(&h);
        BigEndian::write_u32(&mut h[36..40], checksum);
        h
    }
}

/// One's complement of the byte sum, with the checksum field zeroed.
fn footer_checksum(data: &[u8]) -> u32 {
    let sum: u32 = data.iter().map(|&b| b as u32).sum::<u32>();
    !sum
}

/// Seconds since 2000-01-01 00:00 UTC.
fn vhd_timestamp() -> u32 {
    let epoch_2000 = 946_684_800i64;
    let now = chrono::Utc::now().timestamp();
    (now - epoch_2000).max(0) as u32
}

/// CHS geometry per the VHD specification's algorithm.
fn disk_geometry(disk_size: u64) -> u32 {
    let mut total_sectors = disk_size / SECTOR;
    if total_sectors > 65535 * 16 * 255 {
        total_sectors = 65535 * 16 * 255;
    }

    let (cyl_times_heads, heads, sectors_per_track);
    if total_sectors >= 65535 * 16 * 63 {
        sectors_per_track = 255u64;
        heads = 16u64;
        cyl_times_heads = total_sectors / sectors_per_track;
    } else {
        let mut spt = 17u64;
        let mut cth = total_sectors / spt;
        let mut h = (cth + 1023) / 1024;
        if h < 4 {
            h = 4;
        }
        if cth >= h * 1024 || h > 16 {
            spt = 31;
            h = 16;
            cth = total_sectors / spt;
        }
        if cth >= h * 1024 {
            spt = 63;
            h = 16;
            cth = total_sectors / spt;
        }
        sectors_per_track = spt;
        heads = h;
        cyl_times_heads = cth;
    }
    let cylinders = cyl_times_heads / heads;
    ((cylinders as u32) << 16) | ((heads as u32) << 8) | sectors_per_track as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vhd");
        let mut vhd = VhdFile::create(&path, 8 * VHD_BLOCK_SIZE).unwrap();

        let data = vec![0xABu8; 5000];
        vhd.write_at(3 * VHD_BLOCK_SIZE + 100, &data).unwrap();
        vhd.flush().unwrap();

        let mut back = vec![0u8; 5000];
        vhd.read_at(3 * VHD_BLOCK_SIZE + 100, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(vhd.allocated_blocks(), 1);

        // Unallocated regions read as zeros.
        let mut zeros = vec![0xFFu8; 100];
        vhd.read_at(0, &mut zeros).unwrap();
        assert!(zeros.iter().all(|&b| b == 0));
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vhd");
        {
            let mut vhd = VhdFile::create(&path, 4 * VHD_BLOCK_SIZE).unwrap();
            vhd.write_at(0, b"hello vhd").unwrap();
            vhd.flush().unwrap();
        }
        let mut vhd = VhdFile::open(&path).unwrap();
        assert_eq!(vhd.drive_size(), 4 * VHD_BLOCK_SIZE);
        let mut buf = [0u8; 9];
        vhd.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello vhd");
    }

    #[test]
    fn cross_block_write_spans_allocations() {
        let dir = tempdir().unwrap();
        let mut vhd = VhdFile::create(dir.path().join("x.vhd"), 4 * VHD_BLOCK_SIZE).unwrap();

        let data = vec![0x7Eu8; VHD_BLOCK_SIZE as usize + 4096];
        vhd.write_at(VHD_BLOCK_SIZE - 2048, &data).unwrap();
        assert_eq!(vhd.allocated_blocks(), 3);

        let mut back = vec![0u8; data.len()];
        vhd.read_at(VHD_BLOCK_SIZE - 2048, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn trim_releases_whole_blocks_and_zeroes_edges() {
        let dir = tempdir().unwrap();
        let mut vhd = VhdFile::create(dir.path().join("t.vhd"), 8 * VHD_BLOCK_SIZE).unwrap();

        let data = vec![0x11u8; (3 * VHD_BLOCK_SIZE) as usize];
        vhd.write_at(VHD_BLOCK_SIZE, &data).unwrap();
        assert_eq!(vhd.allocated_blocks(), 3);

        // Trim from mid-block 1 through the end of block 3.
        let trimmed = vhd.trim(VHD_BLOCK_SIZE + 4096, 4 * VHD_BLOCK_SIZE).unwrap();
        assert_eq!(trimmed, 2 * VHD_BLOCK_SIZE);
        assert_eq!(vhd.allocated_blocks(), 1);
        assert!(vhd.is_block_allocated(1));
        assert!(!vhd.is_block_allocated(2));
        assert!(!vhd.is_block_allocated(3));

        // The partial edge is zeroed, the untouched head intact.
        let mut head = vec![0u8; 4096];
        vhd.read_at(VHD_BLOCK_SIZE, &mut head).unwrap();
        assert!(head.iter().all(|&b| b == 0x11));
        let mut edge = vec![0xFFu8; 4096];
        vhd.read_at(VHD_BLOCK_SIZE + 4096, &mut edge).unwrap();
        assert!(edge.iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_range_write_is_rejected() {
        let dir = tempdir().unwrap();
        let mut vhd = VhdFile::create(dir.path().join("t.vhd"), VHD_BLOCK_SIZE).unwrap();
        assert!(matches!(
            vhd.write_at(VHD_BLOCK_SIZE - 10, &[0u8; 100]),
            Err(VhdError::OutOfRange(_))
        ));
    }
}
