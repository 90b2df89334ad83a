//! Image write pipeline: a bounded buffer channel feeds a front writer task
//! that either writes the VHD directly or, in file-buffered mode, spools
//! `{offset, length, data}` records into ~1 GiB temp files that a back
//! writer drains sequentially. Free-space exhaustion pauses the front
//! writer (backpressuring the transfer session) while urgent cleanup runs.

use super::{VhdError, VhdFile};
use crate::fsutil;
use crate::hashing::{sidecar::SidecarFile, BLOCK_SIZE};
use crate::protocol::BlockSink;
use crate::store::SpaceReclaimer;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Rotation threshold for file-buffered temp spools.
const FILEBUF_LIMIT: u64 = 1000 * 1024 * 1024;
const WRITE_RETRIES: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct VhdWriterConfig {
    /// Spool bursts through temp files when the VHD sits on slow storage.
    pub file_buffered: bool,
    pub temp_dir: PathBuf,
    /// Pause and reclaim when the destination falls below this.
    pub free_space_limit: u64,
    /// Buffer pool depth (outstanding write items).
    pub nbufs: usize,
    /// Volume data is shifted by this much; the MBR area sits below it.
    pub mbr_offset: u64,
}

impl Default for VhdWriterConfig {
    fn default() -> Self {
        VhdWriterConfig {
            file_buffered: false,
            temp_dir: std::env::temp_dir(),
            free_space_limit: 1000 * 1024 * 1024,
            nbufs: 64,
            mbr_offset: super::MBR_AREA,
        }
    }
}

enum WriteItem {
    Data { pos: u64, buf: Vec<u8> },
    Trim { start: u64, end: u64 },
}

/// VHD + hash sidecar behind one lock, so BAT and sidecar stay consistent.
struct Shared {
    vhd: VhdFile,
    sidecar: Option<SidecarFile>,
    logical_size: i64,
    trimmed_bytes: u64,
}

#[derive(Debug)]
pub struct WriterStats {
    pub written_bytes: u64,
    pub trimmed_bytes: u64,
    pub has_error: bool,
}

/// Cloneable sending half handed to the transfer session.
pub struct VhdSink {
    tx: mpsc::Sender<WriteItem>,
    has_error: Arc<AtomicBool>,
}

impl BlockSink for VhdSink {
    async fn write_at(&mut self, offset: i64, data: &[u8]) -> io::Result<()> {
        if self.has_error.load(Ordering::Relaxed) {
            // Writer already failed; swallow writes until teardown.
            return Ok(());
        }
        self.tx
            .send(WriteItem::Data { pos: offset as u64, buf: data.to_vec() })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "vhd writer gone"))
    }

    async fn punch(&mut self, offset: i64, len: i64) -> io::Result<()> {
        if self.has_error.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.tx
            .send(WriteItem::Trim { start: offset as u64, end: (offset + len) as u64 })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "vhd writer gone"))
    }
}

pub struct VhdWriter {
    tx: Option<mpsc::Sender<WriteItem>>,
    front: tokio::task::JoinHandle<WriterStats>,
    has_error: Arc<AtomicBool>,
}

impl VhdWriter {
    /// `sidecar` is the writer's own handle on the image hash file, used
    /// for the sparse records trim leaves behind.
    pub fn spawn(
        vhd: VhdFile,
        vhd_path: PathBuf,
        sidecar: Option<SidecarFile>,
        logical_size: i64,
        cfg: VhdWriterConfig,
        reclaimer: Option<Arc<dyn SpaceReclaimer>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(cfg.nbufs.max(1));
        let has_error = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Mutex::new(Shared {
            vhd,
            sidecar,
            logical_size,
            trimmed_bytes: 0,
        }));

        let front = tokio::spawn(front_writer(
            rx,
            shared,
            vhd_path,
            cfg,
            reclaimer,
            Arc::clone(&has_error),
        ));

        VhdWriter { tx: Some(tx), front, has_error }
    }

    pub fn sink(&self) -> VhdSink {
        VhdSink {
            tx: self.tx.as_ref().expect("writer still open").clone(),
            has_error: Arc::clone(&self.has_error),
        }
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Relaxed)
    }

    /// Close the pipeline, drain everything, flush the VHD.
    pub async fn finish(mut self) -> Result<WriterStats, VhdError> {
        drop(self.tx.take());
        let stats = self
            .front
            .await
            .map_err(|e| VhdError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        Ok(stats)
    }
}

async fn front_writer(
    mut rx: mpsc::Receiver<WriteItem>,
    shared: Arc<Mutex<Shared>>,
    vhd_path: PathBuf,
    cfg: VhdWriterConfig,
    reclaimer: Option<Arc<dyn SpaceReclaimer>>,
    has_error: Arc<AtomicBool>,
) -> WriterStats {
    let mut written_bytes = 0u64;
    let mut written_since_check = cfg.free_space_limit / 2;

    let mut filebuf: Option<FileBuffer> = None;
    let (back_tx, back_rx) = mpsc::channel::<PathBuf>(4);
    let back = if cfg.file_buffered {
        Some(tokio::spawn(back_writer(back_rx, Arc::clone(&shared), Arc::clone(&has_error))))
    } else {
        None
    };

    while let Some(item) = rx.recv().await {
        if has_error.load(Ordering::Relaxed) {
            continue;
        }

        // Free-space gate: pausing here stops consuming from the buffer
        // pool, which backpressures the transfer session.
        let item_len = match &item {
            WriteItem::Data { buf, .. } => buf.len() as u64,
            WriteItem::Trim { .. } => 0,
        };
        written_since_check += item_len;
        if written_since_check >= cfg.free_space_limit / 2 {
            written_since_check = 0;
            match fsutil::free_space(&vhd_path) {
                Ok(free) if free < cfg.free_space_limit => {
                    warn!(free, "image destination low on space, triggering cleanup");
                    let reclaimed = match &reclaimer {
                        Some(r) => r.reclaim(cfg.free_space_limit).await,
                        None => false,
                    };
                    if !reclaimed {
                        error!("space reclamation failed, failing image session");
                        has_error.store(true, Ordering::Relaxed);
                        continue;
                    }
                }
                _ => {}
            }
        }

        match item {
            WriteItem::Data { pos, buf } => {
                written_bytes += buf.len() as u64;
                if cfg.file_buffered {
                    if filebuf.is_none() {
                        match FileBuffer::create(&cfg.temp_dir) {
                            Ok(fb) => filebuf = Some(fb),
                            Err(e) => {
                                error!(error = %e, "cannot create temp spool");
                                has_error.store(true, Ordering::Relaxed);
                                continue;
                            }
                        }
                    }
                    let fb = filebuf.as_mut().expect("spool just created");
                    if let Err(e) = fb.append(pos, &buf) {
                        error!(error = %e, "temp spool write failed");
                        has_error.store(true, Ordering::Relaxed);
                        continue;
                    }
                    if fb.size >= FILEBUF_LIMIT {
                        let full = filebuf.take().expect("spool in rotation");
                        if back_tx.send(full.into_path()).await.is_err() {
                            has_error.store(true, Ordering::Relaxed);
                        }
                    }
                } else if !write_vhd_retry(&shared, pos + cfg.mbr_offset, &buf).await {
                    has_error.store(true, Ordering::Relaxed);
                }
            }
            WriteItem::Trim { start, end } => {
                if let Err(e) = apply_trim(&shared, start, end, cfg.mbr_offset) {
                    error!(error = %e, "trim failed");
                    has_error.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    // Drain: hand the last spool to the back writer and wait for it.
    if let Some(fb) = filebuf.take() {
        back_tx.send(fb.into_path()).await.ok();
    }
    drop(back_tx);
    if let Some(back) = back {
        back.await.ok();
    }

    let (trimmed_bytes, flush_result) = {
        let mut guard = shared.lock().expect("vhd lock poisoned");
        let r = guard.vhd.flush();
        (guard.trimmed_bytes, r)
    };
    if let Err(e) = flush_result {
        error!(error = %e, "final vhd flush failed");
        has_error.store(true, Ordering::Relaxed);
    }

    WriterStats {
        written_bytes,
        trimmed_bytes,
        has_error: has_error.load(Ordering::Relaxed),
    }
}

/// Sequentially replays temp spool files into the VHD.
async fn back_writer(
    mut rx: mpsc::Receiver<PathBuf>,
    shared: Arc<Mutex<Shared>>,
    has_error: Arc<AtomicBool>,
) {
    while let Some(path) = rx.recv().await {
        if !has_error.load(Ordering::Relaxed) {
            if let Err(e) = replay_spool(&path, &shared).await {
                error!(error = %e, spool = %path.display(), "spool replay failed");
                has_error.store(true, Ordering::Relaxed);
            }
        }
        std::fs::remove_file(&path).ok();
    }
}

async fn replay_spool(path: &PathBuf, shared: &Arc<Mutex<Shared>>) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    loop {
        let pos = match reader.read_u64::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        let len = reader.read_u32::<LittleEndian>()? as usize;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        if !write_vhd_retry(shared, pos, &buf).await {
            return Err(io::Error::new(io::ErrorKind::Other, "vhd write failed"));
        }
    }
    Ok(())
}

/// Bounded retries with back-off; a persistent failure latches the session
/// error and later writes are dropped.
async fn write_vhd_retry(shared: &Arc<Mutex<Shared>>, pos: u64, buf: &[u8]) -> bool {
    for attempt in 0..WRITE_RETRIES {
        let result = {
            let mut guard = shared.lock().expect("vhd lock poisoned");
            guard.vhd.write_at(pos, buf)
        };
        match result {
            Ok(()) => return true,
            Err(e) => {
                warn!(error = %e, pos, attempt, "vhd write failed");
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
            }
        }
    }
    false
}

fn apply_trim(
    shared: &Arc<Mutex<Shared>>,
    start: u64,
    end: u64,
    mbr_offset: u64,
) -> Result<(), VhdError> {
    let mut guard = shared.lock().expect("vhd lock poisoned");
    let released = guard.vhd.trim(start + mbr_offset, end + mbr_offset)?;
    guard.trimmed_bytes += end - start;

    // Hash-grid blocks wholly inside the trimmed range carry the sparse
    // record from here on.
    let logical_size = guard.logical_size;
    if let Some(sidecar) = guard.sidecar.as_mut() {
        let first = start.div_ceil(BLOCK_SIZE) as i64;
        let last = (end / BLOCK_SIZE) as i64;
        for block in first..last {
            sidecar.write_sparse_record(block, logical_size)?;
        }
    }
    debug!(start, end, released, "vhd range trimmed");
    Ok(())
}

/// File-buffered mode spool: `{u64 pos, u32 len, data}` records.
struct FileBuffer {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

impl FileBuffer {
    fn create(dir: &PathBuf) -> io::Result<Self> {
        let path = dir.join(format!("packrat-spool-{}", Uuid::new_v4()));
        let file = File::options().write(true).create_new(true).open(&path)?;
        Ok(FileBuffer { path, writer: BufWriter::new(file), size: 0 })
    }

    fn append(&mut self, pos: u64, data: &[u8]) -> io::Result<()> {
        self.writer.write_u64::<LittleEndian>(pos)?;
        self.writer.write_u32::<LittleEndian>(data.len() as u32)?;
        self.writer.write_all(data)?;
        self.size += 12 + data.len() as u64;
        Ok(())
    }

    fn into_path(mut self) -> PathBuf {
        self.writer.flush().ok();
        self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhd::{VhdFile, MBR_AREA, VHD_BLOCK_SIZE};
    use tempfile::tempdir;

    #[tokio::test]
    async fn direct_mode_lands_writes_shifted_by_mbr_area() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.vhd");
        let vhd = VhdFile::create(&path, MBR_AREA + 4 * VHD_BLOCK_SIZE).unwrap();

        let writer = VhdWriter::spawn(
            vhd,
            path.clone(),
            None,
            0,
            VhdWriterConfig { free_space_limit: 0, ..Default::default() },
            None,
        );
        let mut sink = writer.sink();
        sink.write_at(0, &[0xAAu8; 4096]).await.unwrap();
        sink.write_at(VHD_BLOCK_SIZE as i64, &[0xBBu8; 100]).await.unwrap();
        drop(sink);
        let stats = writer.finish().await.unwrap();
        assert!(!stats.has_error);
        assert_eq!(stats.written_bytes, 4196);

        let mut vhd = VhdFile::open(&path).unwrap();
        let mut buf = vec![0u8; 4096];
        vhd.read_at(MBR_AREA, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[tokio::test]
    async fn file_buffered_mode_replays_spools() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.vhd");
        let vhd = VhdFile::create(&path, MBR_AREA + 4 * VHD_BLOCK_SIZE).unwrap();

        let writer = VhdWriter::spawn(
            vhd,
            path.clone(),
            None,
            0,
            VhdWriterConfig {
                file_buffered: true,
                temp_dir: dir.path().to_path_buf(),
                free_space_limit: 0,
                ..Default::default()
            },
            None,
        );
        let mut sink = writer.sink();
        // Out-of-order writes must land correctly after replay.
        sink.write_at(VHD_BLOCK_SIZE as i64, &[2u8; 512]).await.unwrap();
        sink.write_at(0, &[1u8; 512]).await.unwrap();
        drop(sink);
        let stats = writer.finish().await.unwrap();
        assert!(!stats.has_error);

        let mut vhd = VhdFile::open(&path).unwrap();
        let mut buf = vec![0u8; 512];
        vhd.read_at(MBR_AREA, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 1));
        vhd.read_at(MBR_AREA + VHD_BLOCK_SIZE, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 2));
    }

    #[tokio::test]
    async fn trim_records_sparse_hashes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.vhd");
        let logical = 4 * VHD_BLOCK_SIZE as i64;
        let vhd = VhdFile::create(&path, MBR_AREA + 4 * VHD_BLOCK_SIZE).unwrap();
        let mut sc = SidecarFile::create(dir.path().join("img.hash")).unwrap();
        sc.set_logical_size(logical).unwrap();

        let writer = VhdWriter::spawn(
            vhd,
            path.clone(),
            Some(sc),
            logical,
            VhdWriterConfig { free_space_limit: 0, ..Default::default() },
            None,
        );
        let mut sink = writer.sink();
        sink.write_at(0, &vec![9u8; VHD_BLOCK_SIZE as usize]).await.unwrap();
        sink.punch(0, VHD_BLOCK_SIZE as i64).await.unwrap();
        drop(sink);
        let stats = writer.finish().await.unwrap();
        assert_eq!(stats.trimmed_bytes, VHD_BLOCK_SIZE);

        let mut sc = SidecarFile::open(dir.path().join("img.hash")).unwrap();
        for block in 0..(VHD_BLOCK_SIZE / BLOCK_SIZE) as i64 {
            assert!(sc.read_record(block).unwrap().unwrap().is_sparse());
        }
    }
}
