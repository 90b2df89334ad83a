//! The pulling side of the chunked transfer: requests a sliding window of
//! blocks, folds the peer's NO_CHANGE/UPDATE_CHUNK/WHOLE_BLOCK stream into
//! the output and the new sidecar, verifies every block's strong hash, and
//! survives transport loss by re-dialing and replaying with a resume flag.

use super::wire::{self, Request, Response};
use super::{BlockSink, NoSink, Reconnector, TransferError};
use super::{QUEUED_BLOCKS_HIGH, QUEUED_BLOCKS_LOW, RECONNECT_TRIES};
use crate::extents::{ExtentIterator, SparseExtent};
use crate::fsutil;
use crate::hashing::sidecar::{BlockRecord, SidecarFile, METADATA_ONLY};
use crate::hashing::{block_count, chunk_adler, sidecar_len, BlockHasher, BLOCK_SIZE, CHUNK_SIZE};
use crate::patcher::PatchWriter;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where a transfer lands.
pub enum JobOutput {
    /// Write into the file directly; for incrementals the file starts as a
    /// copy of the base and is modified in place.
    Inline(File),
    /// Record changes as a patch stream against a read-only base.
    Patch { base: File, patch: PatchWriter },
    /// Fetch only the size; the sidecar gets a -1 marker and no body.
    MetadataOnly,
}

pub struct TransferJob {
    pub remote_name: String,
    pub output: JobOutput,
    pub base_sidecar: Option<SidecarFile>,
    pub new_sidecar: Option<SidecarFile>,
    /// -1 when the size is unknown up front.
    pub predicted_size: i64,
}

#[derive(Debug)]
pub struct TransferResult {
    pub size: i64,
    pub received_bytes: i64,
    pub sparse_bytes: i64,
    /// Received sparse-extent table, when the peer announced one. Patch
    /// application needs it to reproduce holes.
    pub sparse_extents_path: Option<PathBuf>,
}

/// Hands the engine its next queued file, and takes unstarted files back
/// when a reconnect voids their pipelined requests.
pub trait QueueSource {
    fn next_job(&mut self) -> Option<TransferJob>;
    fn unqueue(&mut self, job: TransferJob);
    fn reset_queue(&mut self);
}

/// Inert source for single-file fetches.
struct NoQueue;

impl QueueSource for NoQueue {
    fn next_job(&mut self) -> Option<TransferJob> {
        None
    }

    fn unqueue(&mut self, _job: TransferJob) {}

    fn reset_queue(&mut self) {}
}

/// Pipelining state for queued mode: once the current file's block
/// requests are all on the wire, the next file's blockdiff request follows
/// them so its FILESIZE is already waiting when we get to it.
struct Prefetch<'q, Q: QueueSource> {
    source: &'q mut Q,
    /// Jobs whose request went out, tagged with the connection generation
    /// it was sent on.
    on_deck: VecDeque<(u64, TransferJob)>,
    exhausted: bool,
}

/// Drives transfers over one long-lived connection.
pub struct SessionDriver<R: Reconnector> {
    io: BufStream<R::Transport>,
    reconnector: R,
    identity: String,
    network_timeout: Duration,
    reconnect_timeout: Duration,
    reconnect_tries: u32,
    conn_generation: u64,
}

impl<R: Reconnector> SessionDriver<R> {
    pub async fn connect(mut reconnector: R, identity: String) -> io::Result<Self> {
        let transport = reconnector.connect().await?;
        Ok(SessionDriver {
            io: BufStream::new(transport),
            reconnector,
            identity,
            network_timeout: Duration::from_secs(120),
            reconnect_timeout: Duration::from_secs(300),
            reconnect_tries: RECONNECT_TRIES,
            conn_generation: 0,
        })
    }

    pub fn set_network_timeout(&mut self, t: Duration) {
        self.network_timeout = t;
    }

    pub fn set_reconnect_timeout(&mut self, t: Duration) {
        self.reconnect_timeout = t;
    }

    /// Fetch a single file.
    pub async fn fetch(&mut self, job: &mut TransferJob) -> Result<TransferResult, TransferError> {
        self.reconnect_tries = RECONNECT_TRIES;
        self.send_initial_request(job, false).await?;
        self.run_job(job, None::<&mut NoSink>, None::<&mut Prefetch<'_, NoQueue>>).await
    }

    /// Fetch an image: block-granular pulls into a sink, diffed against the
    /// previous image's hash data.
    pub async fn fetch_image<S: BlockSink>(
        &mut self,
        remote_name: &str,
        predicted_size: i64,
        prev_sidecar: Option<SidecarFile>,
        new_sidecar: SidecarFile,
        sink: &mut S,
    ) -> Result<TransferResult, TransferError> {
        self.reconnect_tries = RECONNECT_TRIES;
        let mut job = TransferJob {
            remote_name: remote_name.to_string(),
            output: JobOutput::MetadataOnly,
            base_sidecar: prev_sidecar,
            new_sidecar: Some(new_sidecar),
            predicted_size,
        };
        self.send_request(&Request::GetFileBlockdiff {
            name: job.remote_name.clone(),
            identity: self.identity.clone(),
            offset: 0,
            hashfilesize: job
                .base_sidecar
                .as_mut()
                .map(|s| s.logical_size())
                .transpose()?
                .unwrap_or(0)
                .max(0),
            predicted_size,
            resume: false,
        })
        .await?;
        self.run_job(&mut job, Some(sink), None::<&mut Prefetch<'_, NoQueue>>).await
    }

    /// Queued-only pipelining: each file's blockdiff request is streamed
    /// right behind the previous file's block requests, and the responses
    /// are processed serially as data arrives.
    pub async fn fetch_queued<Q: QueueSource>(
        &mut self,
        source: &mut Q,
    ) -> Result<Vec<(String, Result<TransferResult, TransferError>)>, TransferError> {
        self.reconnect_tries = RECONNECT_TRIES;
        let mut results = Vec::new();
        let mut on_deck: VecDeque<(u64, TransferJob)> = VecDeque::new();
        let mut exhausted = false;

        loop {
            let mut job = match on_deck.pop_front() {
                Some((generation, mut job)) => {
                    if generation != self.conn_generation {
                        // A reconnect voided the pipelined request.
                        self.send_initial_request(&mut job, false).await?;
                    }
                    job
                }
                None => {
                    if exhausted {
                        break;
                    }
                    match source.next_job() {
                        Some(mut job) => {
                            self.send_initial_request(&mut job, false).await?;
                            job
                        }
                        None => break,
                    }
                }
            };

            let name = job.remote_name.clone();
            let mut prefetch =
                Prefetch { source: &mut *source, on_deck: std::mem::take(&mut on_deck), exhausted };
            let outcome = self.run_job(&mut job, None::<&mut NoSink>, Some(&mut prefetch)).await;
            on_deck = prefetch.on_deck;
            exhausted = prefetch.exhausted;

            match outcome {
                Ok(res) => results.push((name, Ok(res))),
                Err(e @ (TransferError::ConnLost | TransferError::Timeout)) => {
                    source.reset_queue();
                    for (_, j) in on_deck {
                        source.unqueue(j);
                    }
                    return Err(e);
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "queued transfer failed");
                    results.push((name, Err(e)));
                    // The stream may still hold responses for the failed
                    // file; start clean before the next one.
                    self.reset_connection().await?;
                }
            }
        }
        Ok(results)
    }

    async fn reset_connection(&mut self) -> Result<(), TransferError> {
        let transport = self
            .reconnector
            .connect()
            .await
            .map_err(|_| TransferError::ConnLost)?;
        self.io = BufStream::new(transport);
        self.conn_generation += 1;
        Ok(())
    }

    /// Plain download: FILESIZE followed by the raw bytes. Used for
    /// filelists and MBR blobs; not chunked, not resumable.
    pub async fn fetch_plain(&mut self, name: &str) -> Result<Vec<u8>, TransferError> {
        self.send_request(&Request::GetFile {
            name: name.to_string(),
            identity: self.identity.clone(),
        })
        .await?;
        let size = match self.read_response().await? {
            Response::FileSize(size) => size,
            Response::CouldntOpen => return Err(TransferError::CannotOpen),
            Response::BaseDirLost => return Err(TransferError::BaseDirLost),
            Response::ReadError => return Err(TransferError::ReadError),
            other => {
                return Err(TransferError::Corrupt(format!("unexpected response {other:?}")))
            }
        };
        if size < 0 {
            return Err(TransferError::Corrupt(format!("negative file size {size}")));
        }
        let mut data = vec![0u8; size as usize];
        self.read_body(&mut data).await?;
        Ok(data)
    }

    /// Size probe via the metadata-only request.
    pub async fn fetch_size(&mut self, name: &str) -> Result<i64, TransferError> {
        self.send_request(&Request::GetFileMetadataOnly {
            name: name.to_string(),
            identity: self.identity.clone(),
        })
        .await?;
        match self.read_response().await? {
            Response::FileSize(size) => Ok(size),
            Response::CouldntOpen => Err(TransferError::CannotOpen),
            Response::BaseDirLost => Err(TransferError::BaseDirLost),
            Response::ReadError => Err(TransferError::ReadError),
            other => Err(TransferError::Corrupt(format!("unexpected response {other:?}"))),
        }
    }

    pub async fn ping(&mut self) -> Result<(), TransferError> {
        self.send_request(&Request::Ping).await?;
        self.io.flush().await.map_err(|_| TransferError::ConnLost)?;
        match self.read_response().await? {
            Response::Pong => Ok(()),
            other => Err(TransferError::Corrupt(format!("expected pong, got {other:?}"))),
        }
    }

    async fn send_request(&mut self, req: &Request) -> Result<(), TransferError> {
        wire::send_request(&mut self.io, req).await.map_err(|_| TransferError::ConnLost)
    }

    async fn read_response(&mut self) -> Result<Response, TransferError> {
        self.io.flush().await.map_err(|_| TransferError::ConnLost)?;
        match timeout(self.network_timeout, wire::read_response(&mut self.io)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Err(TransferError::Corrupt(e.to_string()))
            }
            Ok(Err(_)) => Err(TransferError::ConnLost),
            Err(_) => Err(TransferError::Timeout),
        }
    }

    async fn read_body(&mut self, buf: &mut [u8]) -> Result<(), TransferError> {
        match timeout(self.network_timeout, self.io.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransferError::ConnLost),
            Err(_) => Err(TransferError::Timeout),
        }
    }

    async fn send_initial_request(
        &mut self,
        job: &mut TransferJob,
        resume: bool,
    ) -> Result<(), TransferError> {
        let req = match job.output {
            JobOutput::MetadataOnly => Request::GetFileMetadataOnly {
                name: job.remote_name.clone(),
                identity: self.identity.clone(),
            },
            _ => {
                let hashfilesize = hashfilesize_of(job)?;
                Request::GetFileBlockdiff {
                    name: job.remote_name.clone(),
                    identity: self.identity.clone(),
                    offset: 0,
                    hashfilesize,
                    predicted_size: job.predicted_size,
                    resume,
                }
            }
        };
        self.send_request(&req).await
    }

    async fn run_job<S: BlockSink, Q: QueueSource>(
        &mut self,
        job: &mut TransferJob,
        mut sink: Option<&mut S>,
        mut prefetch: Option<&mut Prefetch<'_, Q>>,
    ) -> Result<TransferResult, TransferError> {
        let mut state = FetchState::new(job, sink.is_some())?;

        let result = self.fetch_loop(job, &mut state, &mut sink, &mut prefetch).await;

        match result {
            Ok(()) => {
                // Metadata probes never opened a remote handle.
                if !state.metadata_mode {
                    self.send_request(&Request::FreeFile).await.ok();
                    self.io.flush().await.ok();
                }
                state.finalize(job)?;
                Ok(TransferResult {
                    size: state.remote_filesize,
                    received_bytes: state.received_bytes,
                    sparse_bytes: state.sparse_bytes,
                    sparse_extents_path: state.extents_path.take(),
                })
            }
            Err(e) => {
                state.adjust_output_on_failure(job).ok();
                // Local disk exhaustion is its own failure class; callers
                // route it into urgent cleanup.
                match e {
                    TransferError::Io(ioe) if ioe.raw_os_error() == Some(libc::ENOSPC) => {
                        Err(TransferError::NoSpace)
                    }
                    other => Err(other),
                }
            }
        }
    }

    async fn fetch_loop<S: BlockSink, Q: QueueSource>(
        &mut self,
        job: &mut TransferJob,
        state: &mut FetchState,
        sink: &mut Option<&mut S>,
        prefetch: &mut Option<&mut Prefetch<'_, Q>>,
    ) -> Result<(), TransferError> {
        loop {
            if state.remote_filesize != -1 && !state.metadata_mode {
                // Fence every request batch so the peer drains its side.
                if self.fill_window(job, state, sink).await? {
                    self.send_request(&Request::FlushSocket).await.ok();
                }
            }

            // This file's requests are all on the wire: stream the next
            // queued file's handshake behind them.
            if state.remote_filesize != -1 && state.next_block >= state.total_blocks {
                if let Some(pf) = prefetch.as_mut() {
                    if pf.on_deck.is_empty() && !pf.exhausted {
                        match pf.source.next_job() {
                            Some(mut next) => {
                                self.send_initial_request(&mut next, false).await?;
                                pf.on_deck.push_back((self.conn_generation, next));
                            }
                            None => pf.exhausted = true,
                        }
                    }
                }
            }

            if state.is_done() {
                return Ok(());
            }

            let step = match self.read_response().await {
                Ok(resp) => self.handle_response(resp, job, state, sink).await,
                Err(e) => Err(e),
            };
            match step {
                Ok(()) => {}
                // Transport loss anywhere in a response (header or body)
                // goes through the reconnect path.
                Err(TransferError::ConnLost | TransferError::Timeout) => {
                    self.reconnect(job, state, true).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns whether any requests went out, so the caller can fence them
    /// with FLUSH_SOCKET.
    async fn fill_window<S: BlockSink>(
        &mut self,
        job: &mut TransferJob,
        state: &mut FetchState,
        sink: &mut Option<&mut S>,
    ) -> Result<bool, TransferError> {
        if state.pending.len() >= QUEUED_BLOCKS_LOW {
            return Ok(false);
        }

        let mut sent_any = false;
        while state.pending.len() < QUEUED_BLOCKS_HIGH && state.next_block < state.total_blocks {
            let block_offset = state.next_block * BLOCK_SIZE as i64;

            // Sparse fast path: blocks wholly inside an announced zero
            // extent never hit the wire.
            while let Some(e) = state.curr_extent {
                if e.end() <= block_offset {
                    state.curr_extent = state
                        .extent_iter
                        .as_mut()
                        .expect("extent came from an iterator")
                        .next_extent()?;
                } else {
                    break;
                }
            }
            if let Some(e) = state.curr_extent {
                if e.offset <= block_offset && e.end() >= block_offset + BLOCK_SIZE as i64 {
                    let run_blocks = (e.end() - block_offset) / BLOCK_SIZE as i64;
                    state.apply_sparse_run(job, sink, block_offset, run_blocks).await?;
                    continue;
                }
            }

            let record = if state.next_block < block_count(state.hashfilesize) {
                job.base_sidecar
                    .as_mut()
                    .map(|s| s.read_record(state.next_block))
                    .transpose()?
                    .flatten()
            } else {
                None
            };

            let req = Request::BlockRequest {
                offset: block_offset,
                want_whole: state.want_whole || record.is_none(),
                hashes: record.as_ref().map(|r| Box::new(r.to_wire())),
            };
            if self.send_request(&req).await.is_err() {
                self.reconnect(job, state, true).await?;
                return Ok(false);
            }
            state.pending.insert(block_offset, record);
            state.next_block += 1;
            sent_any = true;
        }
        Ok(sent_any)
    }

    async fn handle_response<S: BlockSink>(
        &mut self,
        resp: Response,
        job: &mut TransferJob,
        state: &mut FetchState,
        sink: &mut Option<&mut S>,
    ) -> Result<(), TransferError> {
        match resp {
            Response::FileSize(size) => self.handle_filesize(job, state, size, 0).await,
            Response::FileSizeAndExtents { size, n_extents } => {
                self.handle_filesize(job, state, size, n_extents).await
            }
            Response::WholeBlock { offset, len } => {
                if len as u64 > BLOCK_SIZE {
                    return Err(TransferError::Corrupt(format!("oversized block {len}")));
                }
                if !state.pending.contains_key(&offset) {
                    return Err(TransferError::Corrupt(format!("block {offset} not requested")));
                }
                let mut body = vec![0u8; len as usize];
                self.read_body(&mut body).await?;
                state.apply_whole_block(job, sink, offset, &body).await?;
                Ok(())
            }
            Response::UpdateChunk { offset, len } => {
                if len as usize > CHUNK_SIZE {
                    return Err(TransferError::Corrupt(format!("oversized chunk {len}")));
                }
                let block_offset = offset / BLOCK_SIZE as i64 * BLOCK_SIZE as i64;
                if !state.pending.contains_key(&block_offset) {
                    return Err(TransferError::Corrupt(format!("chunk {offset} not requested")));
                }
                let mut body = vec![0u8; len as usize];
                self.read_body(&mut body).await?;
                state.apply_update_chunk(job, offset, &body)?;
                Ok(())
            }
            Response::NoChange { offset } => state.apply_no_change(job, offset),
            Response::BlockHash { offset, hash } => {
                match state.check_block_hash(job, offset, &hash)? {
                    HashOutcome::Ok => Ok(()),
                    HashOutcome::Mismatch => {
                        warn!(offset, file = %job.remote_name, "block hash wrong, loading whole block out-of-band");
                        if let JobOutput::Patch { patch, .. } = &mut job.output {
                            patch.invalidate_last()?;
                        }
                        self.load_block_oob(job, state, sink, offset).await
                    }
                }
            }
            Response::BlockError { code1, code2 } => Err(TransferError::Peer { code1, code2 }),
            Response::CouldntOpen => Err(TransferError::CannotOpen),
            Response::BaseDirLost => Err(TransferError::BaseDirLost),
            Response::ReadError => Err(TransferError::ReadError),
            Response::Pong | Response::ScriptFinish => Ok(()),
        }
    }

    async fn handle_filesize(
        &mut self,
        job: &mut TransferJob,
        state: &mut FetchState,
        size: i64,
        n_extents: i64,
    ) -> Result<(), TransferError> {
        if size < 0 {
            return Err(TransferError::Corrupt(format!("negative file size {size}")));
        }
        if state.remote_filesize != -1 && state.remote_filesize != size {
            warn!(
                expected = state.remote_filesize,
                got = size,
                file = %job.remote_name,
                "file size changed from prediction"
            );
        }
        state.remote_filesize = size;
        state.total_blocks = block_count(size);

        if state.pending.keys().any(|&off| off >= size && size > 0)
            || (state.next_block > state.total_blocks && !state.pending.is_empty())
        {
            // Requests beyond the new end will never be answered.
            self.reconnect(job, state, true).await?;
            return Ok(());
        }
        state.next_block = state.next_block.min(state.total_blocks);

        match &mut job.output {
            JobOutput::Patch { patch, .. } => patch.write_size(size)?,
            JobOutput::MetadataOnly if state.metadata_mode => {
                if let Some(sidecar) = job.new_sidecar.as_mut() {
                    sidecar.set_logical_size(METADATA_ONLY)?;
                }
                state.done = true;
                return Ok(());
            }
            _ => {}
        }

        if let Some(sidecar) = job.new_sidecar.as_mut() {
            sidecar.set_logical_size(size)?;
            let want = sidecar_len(size) as u64;
            if sidecar.len()? > want {
                sidecar.truncate(want)?;
            }
        }

        if n_extents > 0 {
            self.receive_extent_trailer(state, n_extents).await?;
        }

        if size == 0 && n_extents == 0 {
            state.done = true;
        }
        Ok(())
    }

    async fn receive_extent_trailer(
        &mut self,
        state: &mut FetchState,
        n_extents: i64,
    ) -> Result<(), TransferError> {
        let body_len = n_extents as usize * 16;
        let mut body = vec![0u8; body_len + 16];
        self.read_body(&mut body).await?;

        let computed: [u8; 16] = Md5::new_with_prefix(&body[..body_len]).finalize().into();
        if computed != body[body_len..] {
            return Err(TransferError::Hash);
        }

        if let Some(old) = state.extents_path.take() {
            std::fs::remove_file(old).ok();
        }
        let path = std::env::temp_dir().join(format!("packrat-extents-{}", Uuid::new_v4()));
        let mut file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&n_extents.to_le_bytes())?;
        file.write_all(&body)?;

        let mut iter = ExtentIterator::new(file)?;
        state.curr_extent = iter.next_extent()?;
        state.extent_iter = Some(iter);
        state.extents_path = Some(path);
        Ok(())
    }

    /// Re-dial, replay the blockdiff request with the resume flag, rewind
    /// `next_block` to the earliest still-pending block, and tombstone the
    /// patch records of the block in flight.
    async fn reconnect(
        &mut self,
        job: &mut TransferJob,
        state: &mut FetchState,
        rerequest: bool,
    ) -> Result<(), TransferError> {
        if self.reconnect_tries == 0 {
            return Err(TransferError::ConnLost);
        }
        self.reconnect_tries -= 1;

        let deadline = tokio::time::Instant::now() + self.reconnect_timeout;
        loop {
            match self.reconnector.connect().await {
                Ok(transport) => {
                    self.io = BufStream::new(transport);
                    self.conn_generation += 1;
                    debug!(file = %job.remote_name, "reconnected");
                    break;
                }
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(_) => return Err(TransferError::ConnLost),
            }
        }

        if let Some(min_pending) = state.pending.keys().next().copied() {
            state.next_block = min_pending / BLOCK_SIZE as i64;
        }
        state.pending.clear();
        state.remote_filesize = -1;
        state.total_blocks = 0;
        state.md5 = Md5::new();
        state.block_for_chunk_start = -1;
        state.hash_for_whole_block = false;
        state.last_whole = None;
        state.extent_iter = None;
        state.curr_extent = None;

        if let JobOutput::Patch { patch, .. } = &mut job.output {
            patch.invalidate_last()?;
        }

        if rerequest {
            let resume = state.file_pos > 0;
            self.send_initial_request(job, resume).await?;
        }
        Ok(())
    }

    /// Strong hash mismatch fallback: pull the whole block over a fresh
    /// out-of-band connection and retry locally.
    async fn load_block_oob<S: BlockSink>(
        &mut self,
        job: &mut TransferJob,
        state: &mut FetchState,
        sink: &mut Option<&mut S>,
        block_offset: i64,
    ) -> Result<(), TransferError> {
        let transport = self
            .reconnector
            .connect()
            .await
            .map_err(|_| TransferError::ConnLost)?;
        let mut oob = BufStream::new(transport);

        wire::send_request(
            &mut oob,
            &Request::GetFileBlockdiff {
                name: job.remote_name.clone(),
                identity: self.identity.clone(),
                offset: 0,
                hashfilesize: 0,
                predicted_size: state.remote_filesize,
                resume: false,
            },
        )
        .await
        .map_err(|_| TransferError::ConnLost)?;
        wire::send_request(
            &mut oob,
            &Request::BlockRequest { offset: block_offset, want_whole: true, hashes: None },
        )
        .await
        .map_err(|_| TransferError::ConnLost)?;
        oob.flush().await.map_err(|_| TransferError::ConnLost)?;

        let mut body: Option<Vec<u8>> = None;
        loop {
            let resp = timeout(self.network_timeout, wire::read_response(&mut oob))
                .await
                .map_err(|_| TransferError::Timeout)?
                .map_err(|_| TransferError::ConnLost)?;
            match resp {
                Response::FileSize(_) => {}
                Response::FileSizeAndExtents { n_extents, .. } => {
                    let mut skip = vec![0u8; n_extents as usize * 16 + 16];
                    timeout(self.network_timeout, oob.read_exact(&mut skip))
                        .await
                        .map_err(|_| TransferError::Timeout)?
                        .map_err(|_| TransferError::ConnLost)?;
                }
                Response::WholeBlock { offset, len } => {
                    if offset != block_offset || len as u64 > BLOCK_SIZE {
                        return Err(TransferError::Corrupt("bad out-of-band block".into()));
                    }
                    let mut buf = vec![0u8; len as usize];
                    timeout(self.network_timeout, oob.read_exact(&mut buf))
                        .await
                        .map_err(|_| TransferError::Timeout)?
                        .map_err(|_| TransferError::ConnLost)?;
                    body = Some(buf);
                }
                Response::BlockHash { offset, hash } => {
                    let body = body.ok_or_else(|| {
                        TransferError::Corrupt("out-of-band hash before data".into())
                    })?;
                    if offset != block_offset || crate::hashing::block_md5(&body) != hash {
                        return Err(TransferError::Hash);
                    }
                    state.apply_whole_block(job, sink, block_offset, &body).await?;
                    state.pending.remove(&block_offset);
                    state.hash_for_whole_block = false;
                    state.last_whole = None;
                    wire::send_request(&mut oob, &Request::FreeFile).await.ok();
                    oob.flush().await.ok();
                    return Ok(());
                }
                Response::CouldntOpen => return Err(TransferError::CannotOpen),
                Response::BaseDirLost => return Err(TransferError::BaseDirLost),
                Response::ReadError => return Err(TransferError::ReadError),
                other => {
                    return Err(TransferError::Corrupt(format!(
                        "unexpected out-of-band response {other:?}"
                    )))
                }
            }
        }
    }
}

fn hashfilesize_of(job: &mut TransferJob) -> Result<i64, TransferError> {
    let Some(sidecar) = job.base_sidecar.as_mut() else {
        return Ok(0);
    };
    if sidecar.is_empty()? {
        return Ok(0);
    }
    let mut size = sidecar.logical_size()?;
    if size < 0 {
        return Err(TransferError::Corrupt(format!("damaged base sidecar, size {size}")));
    }
    // A partial base file caps the usable hash data.
    if let JobOutput::Patch { base, .. } | JobOutput::Inline(base) = &mut job.output {
        let base_len = base.metadata()?.len() as i64;
        if base_len < size {
            size = base_len;
        }
    }
    Ok(size)
}

enum HashOutcome {
    Ok,
    Mismatch,
}

/// Per-file transfer state; the md5/chunk bookkeeping mirrors the fact that
/// the peer's responses for one block arrive contiguously and in order.
struct FetchState {
    remote_filesize: i64,
    total_blocks: i64,
    hashfilesize: i64,
    next_block: i64,
    pending: BTreeMap<i64, Option<BlockRecord>>,
    image_mode: bool,
    metadata_mode: bool,
    want_whole: bool,

    extent_iter: Option<ExtentIterator>,
    curr_extent: Option<SparseExtent>,
    extents_path: Option<PathBuf>,

    md5: Md5,
    chunk_start: i64,
    block_for_chunk_start: i64,
    hash_for_whole_block: bool,
    last_whole: Option<(i64, [u8; 16])>,

    file_pos: i64,
    output_fsize: i64,
    received_bytes: i64,
    sparse_bytes: i64,
    done: bool,
}

impl FetchState {
    fn new(job: &mut TransferJob, image_mode: bool) -> Result<Self, TransferError> {
        let metadata_mode = !image_mode && matches!(job.output, JobOutput::MetadataOnly);
        let hashfilesize = if metadata_mode { 0 } else { hashfilesize_of(job)? };
        Ok(FetchState {
            remote_filesize: job.predicted_size,
            total_blocks: if job.predicted_size >= 0 { block_count(job.predicted_size) } else { 0 },
            hashfilesize,
            next_block: 0,
            pending: BTreeMap::new(),
            image_mode,
            metadata_mode,
            want_whole: image_mode,
            extent_iter: None,
            curr_extent: None,
            extents_path: None,
            md5: Md5::new(),
            chunk_start: 0,
            block_for_chunk_start: -1,
            hash_for_whole_block: false,
            last_whole: None,
            file_pos: 0,
            output_fsize: 0,
            received_bytes: 0,
            sparse_bytes: 0,
            done: false,
        })
    }

    fn is_done(&self) -> bool {
        if self.metadata_mode {
            return self.done;
        }
        self.done
            || (self.remote_filesize != -1
                && self.next_block >= self.total_blocks
                && self.pending.is_empty())
    }

    async fn apply_sparse_run<S: BlockSink>(
        &mut self,
        job: &mut TransferJob,
        sink: &mut Option<&mut S>,
        start: i64,
        blocks: i64,
    ) -> Result<(), TransferError> {
        for b in 0..blocks {
            if let Some(sidecar) = job.new_sidecar.as_mut() {
                sidecar.write_sparse_record((start / BLOCK_SIZE as i64) + b, self.remote_filesize)?;
            }
        }
        let len = blocks * BLOCK_SIZE as i64;
        match &mut job.output {
            JobOutput::Inline(file) => {
                fsutil::punch_hole(file, start, len)?;
            }
            // Patch mode: the received extent table travels with the patch
            // and reproduces the hole at apply time.
            JobOutput::Patch { .. } | JobOutput::MetadataOnly => {}
        }
        if let Some(s) = sink.as_deref_mut() {
            s.punch(start, len).await?;
        }
        self.output_fsize = self.output_fsize.max(start + len);
        self.sparse_bytes += len;
        self.next_block = (start + len) / BLOCK_SIZE as i64;
        Ok(())
    }

    async fn apply_whole_block<S: BlockSink>(
        &mut self,
        job: &mut TransferJob,
        sink: &mut Option<&mut S>,
        offset: i64,
        body: &[u8],
    ) -> Result<(), TransferError> {
        let mut rolling = Vec::with_capacity(body.len().div_ceil(CHUNK_SIZE));
        let mut hasher = BlockHasher::new();
        hasher.update(body, |a| rolling.push(a));
        let (strong, tail) = hasher.finalize();
        if let Some(t) = tail {
            rolling.push(t);
        }

        match &mut job.output {
            JobOutput::Inline(file) => {
                file.seek(SeekFrom::Start(offset as u64))?;
                file.write_all(body)?;
            }
            JobOutput::Patch { patch, .. } => {
                patch.write(offset, body, true)?;
            }
            JobOutput::MetadataOnly => {
                if let Some(s) = sink.as_deref_mut() {
                    s.write_at(offset, body).await?;
                } else {
                    return Err(TransferError::Corrupt("block data for metadata fetch".into()));
                }
            }
        }

        if let Some(sidecar) = job.new_sidecar.as_mut() {
            sidecar.write_record(
                offset / BLOCK_SIZE as i64,
                &BlockRecord { strong, rolling },
                self.remote_filesize,
            )?;
        }

        self.block_for_chunk_start = offset;
        self.chunk_start = offset + body.len() as i64;
        self.file_pos = self.chunk_start;
        self.output_fsize = self.output_fsize.max(self.file_pos);
        self.received_bytes += body.len() as i64;
        self.hash_for_whole_block = true;
        self.last_whole = Some((offset, strong));
        Ok(())
    }

    fn apply_update_chunk(
        &mut self,
        job: &mut TransferJob,
        offset: i64,
        body: &[u8],
    ) -> Result<(), TransferError> {
        if self.image_mode {
            return Err(TransferError::Corrupt("chunk update during image transfer".into()));
        }
        let block_offset = offset / BLOCK_SIZE as i64 * BLOCK_SIZE as i64;

        if block_offset != self.block_for_chunk_start {
            // First chunk of a new block: reset the running hash and
            // pre-fill the sidecar record from the base hashes.
            self.md5 = Md5::new();
            self.block_for_chunk_start = block_offset;
            self.chunk_start = block_offset;
            self.hash_for_whole_block = false;
            if let JobOutput::Patch { patch, .. } = &mut job.output {
                patch.commit_block();
            }
            let base_record = self.pending.get(&block_offset).cloned().flatten();
            if let (Some(sidecar), Some(rec)) = (job.new_sidecar.as_mut(), base_record) {
                sidecar.write_record(block_offset / BLOCK_SIZE as i64, &rec, self.remote_filesize)?;
            }
        }

        if self.chunk_start != offset {
            // Keep the block hash alive over the unchanged gap.
            self.hash_base_range(job, self.chunk_start, offset)?;
            self.chunk_start = offset;
        }

        self.md5.update(body);
        let adler = chunk_adler(body);

        match &mut job.output {
            JobOutput::Inline(file) => {
                file.seek(SeekFrom::Start(offset as u64))?;
                file.write_all(body)?;
            }
            JobOutput::Patch { patch, .. } => {
                patch.write(offset, body, true)?;
            }
            JobOutput::MetadataOnly => {
                return Err(TransferError::Corrupt("chunk data for metadata fetch".into()));
            }
        }

        if !body.is_empty() {
            if let Some(sidecar) = job.new_sidecar.as_mut() {
                let chunk_idx = (offset % BLOCK_SIZE as i64) as usize / CHUNK_SIZE;
                sidecar.write_rolling(block_offset / BLOCK_SIZE as i64, chunk_idx, adler)?;
            }
        }

        self.chunk_start = offset + body.len() as i64;
        self.file_pos = self.chunk_start;
        self.received_bytes += body.len() as i64;
        match &job.output {
            JobOutput::Inline(_) => {
                self.output_fsize = self.output_fsize.max(self.file_pos);
            }
            JobOutput::Patch { patch, .. } => {
                self.output_fsize = self.output_fsize.max(patch.output_fsize());
            }
            JobOutput::MetadataOnly => {}
        }
        Ok(())
    }

    fn apply_no_change(&mut self, job: &mut TransferJob, offset: i64) -> Result<(), TransferError> {
        let Some(record) = self.pending.remove(&offset) else {
            return Err(TransferError::Corrupt(format!("no-change for unrequested block {offset}")));
        };
        let Some(record) = record else {
            return Err(TransferError::Corrupt(format!(
                "no-change without base hashes at {offset}"
            )));
        };
        if let Some(sidecar) = job.new_sidecar.as_mut() {
            sidecar.write_record(offset / BLOCK_SIZE as i64, &record, self.remote_filesize)?;
        }
        let dest = (offset + BLOCK_SIZE as i64).min(self.remote_filesize.max(0));
        self.output_fsize = self.output_fsize.max(dest);
        Ok(())
    }

    fn check_block_hash(
        &mut self,
        job: &mut TransferJob,
        offset: i64,
        hash: &[u8; 16],
    ) -> Result<HashOutcome, TransferError> {
        if self.hash_for_whole_block {
            let (whole_offset, strong) = self
                .last_whole
                .take()
                .ok_or_else(|| TransferError::Corrupt("stray block hash".into()))?;
            self.hash_for_whole_block = false;
            if whole_offset != offset {
                return Err(TransferError::Corrupt(format!(
                    "block hash for {offset}, expected {whole_offset}"
                )));
            }
            if &strong != hash {
                // The peer hashed what it sent; a mismatch here cannot be
                // repaired by re-requesting the same data.
                return Err(TransferError::Hash);
            }
            if self.pending.remove(&offset).is_none() {
                return Err(TransferError::Corrupt(format!("hash for unrequested block {offset}")));
            }
            if let JobOutput::Patch { patch, .. } = &mut job.output {
                patch.commit_block();
            }
            return Ok(HashOutcome::Ok);
        }

        let mut load_whole = false;
        if offset == self.block_for_chunk_start && self.block_for_chunk_start != -1 {
            let dest = (offset + BLOCK_SIZE as i64).min(self.remote_filesize);
            if self.chunk_start < dest {
                if self.hash_base_range(job, self.chunk_start, dest).is_err() {
                    load_whole = true;
                }
                self.file_pos += dest - self.chunk_start;
                self.chunk_start = dest;
            }
        }
        self.block_for_chunk_start = -1;
        let computed: [u8; 16] = std::mem::replace(&mut self.md5, Md5::new()).finalize().into();

        if load_whole || &computed != hash {
            return Ok(HashOutcome::Mismatch);
        }

        if let Some(sidecar) = job.new_sidecar.as_mut() {
            sidecar.write_strong(offset / BLOCK_SIZE as i64, hash)?;
        }
        let dest = (offset + BLOCK_SIZE as i64).min(self.remote_filesize);
        self.output_fsize = self.output_fsize.max(dest);
        if self.pending.remove(&offset).is_none() {
            return Err(TransferError::Corrupt(format!("hash for unrequested block {offset}")));
        }
        if let JobOutput::Patch { patch, .. } = &mut job.output {
            patch.commit_block();
        }
        Ok(HashOutcome::Ok)
    }

    /// Feed base bytes [from, to) into the running block hash.
    fn hash_base_range(&mut self, job: &mut TransferJob, from: i64, to: i64) -> io::Result<()> {
        let base: &mut File = match &mut job.output {
            JobOutput::Inline(file) => file,
            JobOutput::Patch { base, .. } => base,
            JobOutput::MetadataOnly => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "no base file"));
            }
        };
        base.seek(SeekFrom::Start(from as u64))?;
        let mut remaining = (to - from) as usize;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let want = buf.len().min(remaining);
            base.read_exact(&mut buf[..want])?;
            self.md5.update(&buf[..want]);
            remaining -= want;
        }
        Ok(())
    }

    fn finalize(&mut self, job: &mut TransferJob) -> Result<(), TransferError> {
        match &mut job.output {
            JobOutput::Inline(file) => {
                if self.remote_filesize >= 0 {
                    file.set_len(self.remote_filesize as u64)?;
                }
                file.sync_data()?;
            }
            JobOutput::Patch { patch, .. } => {
                patch.sync()?;
            }
            JobOutput::MetadataOnly => {}
        }
        if let Some(sidecar) = job.new_sidecar.as_mut() {
            sidecar.sync()?;
        }
        Ok(())
    }

    /// Leave consistent partial state behind a failed transfer: the output
    /// size reflects what actually landed, and when the base covers more
    /// than we fetched its hash data is carried over.
    fn adjust_output_on_failure(&mut self, job: &mut TransferJob) -> Result<(), TransferError> {
        let mut filesize_out = match &job.output {
            JobOutput::Patch { patch, .. } => patch.output_fsize(),
            _ => self.output_fsize,
        };

        if self.hashfilesize > filesize_out {
            filesize_out = self.hashfilesize;
            if let (Some(new_sc), Some(base_sc)) =
                (job.new_sidecar.as_mut(), job.base_sidecar.as_mut())
            {
                new_sc.copy_tail_from(base_sc).ok();
            }
        }

        if let JobOutput::Patch { patch, .. } = &mut job.output {
            patch.invalidate_last()?;
            patch.write_size(filesize_out)?;
        }
        if let Some(sidecar) = job.new_sidecar.as_mut() {
            sidecar.set_logical_size(filesize_out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::peer::{self, PeerConfig};
    use std::path::Path;
    use tempfile::tempdir;

    /// Reconnector that spawns a fresh in-process peer per connection.
    struct LoopbackPeer {
        root: PathBuf,
        cfg: PeerConfig,
        pub connects: u32,
    }

    impl LoopbackPeer {
        fn new(root: &Path, cfg: PeerConfig) -> Self {
            LoopbackPeer { root: root.to_path_buf(), cfg, connects: 0 }
        }
    }

    impl Reconnector for LoopbackPeer {
        type Transport = tokio::io::DuplexStream;

        async fn connect(&mut self) -> io::Result<Self::Transport> {
            self.connects += 1;
            let (ours, theirs) = tokio::io::duplex(1 << 20);
            tokio::spawn(peer::serve(theirs, self.root.clone(), self.cfg.clone()));
            Ok(ours)
        }
    }

    fn rw_file(path: &Path) -> File {
        File::options().read(true).write(true).create(true).open(path).unwrap()
    }

    async fn fetch_full(dir: &Path, name: &str) -> (Vec<u8>, TransferResult) {
        let mut driver = SessionDriver::connect(
            LoopbackPeer::new(dir, PeerConfig::default()),
            "test".to_string(),
        )
        .await
        .unwrap();

        let out_path = dir.join("out");
        let mut job = TransferJob {
            remote_name: name.to_string(),
            output: JobOutput::Inline(rw_file(&out_path)),
            base_sidecar: None,
            new_sidecar: Some(SidecarFile::create(dir.join("out.hash")).unwrap()),
            predicted_size: -1,
        };
        let res = driver.fetch(&mut job).await.unwrap();
        (std::fs::read(&out_path).unwrap(), res)
    }

    #[tokio::test]
    async fn full_fetch_copies_peer_file() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..2 * BLOCK_SIZE as usize + 777).map(|i| (i % 241) as u8).collect();
        std::fs::write(dir.path().join("src"), &data).unwrap();

        let (out, res) = fetch_full(dir.path(), "src").await;
        assert_eq!(out, data);
        assert_eq!(res.size, data.len() as i64);
        assert_eq!(res.received_bytes, data.len() as i64);

        // The written sidecar matches a recomputation from the output.
        let mut f = File::open(dir.path().join("out")).unwrap();
        let mut sc = SidecarFile::open(dir.path().join("out.hash")).unwrap();
        assert!(crate::hashing::sidecar::verify_sidecar(&mut f, &mut sc).unwrap().is_empty());
    }

    #[tokio::test]
    async fn delta_fetch_writes_minimal_patch() {
        let dir = tempdir().unwrap();
        let base: Vec<u8> = vec![0xAA; (BLOCK_SIZE as usize) * 2];
        let mut target = base.clone();
        target[CHUNK_SIZE..2 * CHUNK_SIZE].fill(0xBB);
        std::fs::write(dir.path().join("target"), &target).unwrap();
        std::fs::write(dir.path().join("base"), &base).unwrap();

        let mut base_file = File::open(dir.path().join("base")).unwrap();
        let mut base_sidecar = SidecarFile::create(dir.path().join("base.hash")).unwrap();
        crate::hashing::sidecar::build_sidecar(&mut base_file, &mut base_sidecar).unwrap();

        let mut driver = SessionDriver::connect(
            LoopbackPeer::new(dir.path(), PeerConfig::default()),
            "test".to_string(),
        )
        .await
        .unwrap();

        let patch_path = dir.path().join("patch");
        let mut job = TransferJob {
            remote_name: "target".to_string(),
            output: JobOutput::Patch {
                base: File::open(dir.path().join("base")).unwrap(),
                patch: PatchWriter::new(rw_file(&patch_path)),
            },
            base_sidecar: Some(base_sidecar),
            new_sidecar: Some(SidecarFile::create(dir.path().join("new.hash")).unwrap()),
            predicted_size: target.len() as i64,
        };
        let res = driver.fetch(&mut job).await.unwrap();
        assert_eq!(res.size, target.len() as i64);
        // Only the changed chunk crossed the wire.
        assert_eq!(res.received_bytes, CHUNK_SIZE as i64);

        // Applying the patch reproduces the target byte-for-byte.
        let mut base_f = File::open(dir.path().join("base")).unwrap();
        let mut patch_f = File::open(&patch_path).unwrap();
        let out = rw_file(&dir.path().join("applied"));
        let (mut applied, _) =
            crate::patcher::apply_to_file(&mut base_f, &mut patch_f, None, out).unwrap();
        let mut got = Vec::new();
        applied.seek(SeekFrom::Start(0)).unwrap();
        applied.read_to_end(&mut got).unwrap();
        assert_eq!(got, target);

        // New sidecar: block 0 updated, block 1 copied from base.
        let mut sc = SidecarFile::open(dir.path().join("new.hash")).unwrap();
        assert_eq!(sc.logical_size().unwrap(), target.len() as i64);
        let rec0 = sc.read_record(0).unwrap().unwrap();
        assert_eq!(rec0.strong, crate::hashing::block_md5(&target[..BLOCK_SIZE as usize]));
    }

    #[tokio::test]
    async fn sparse_peer_file_transfers_no_data() {
        let dir = tempdir().unwrap();
        let data = vec![0u8; 3 * BLOCK_SIZE as usize];
        std::fs::write(dir.path().join("zeros"), &data).unwrap();

        let mut driver = SessionDriver::connect(
            LoopbackPeer::new(dir.path(), PeerConfig { detect_sparse: true }),
            "test".to_string(),
        )
        .await
        .unwrap();

        let out_path = dir.path().join("out");
        let mut job = TransferJob {
            remote_name: "zeros".to_string(),
            output: JobOutput::Inline(rw_file(&out_path)),
            base_sidecar: None,
            new_sidecar: Some(SidecarFile::create(dir.path().join("out.hash")).unwrap()),
            predicted_size: -1,
        };
        let res = driver.fetch(&mut job).await.unwrap();
        assert_eq!(res.received_bytes, 0);
        assert_eq!(res.sparse_bytes, data.len() as i64);
        assert_eq!(std::fs::metadata(&out_path).unwrap().len(), data.len() as u64);

        // All three sidecar records carry the sparse hash.
        let mut sc = SidecarFile::open(dir.path().join("out.hash")).unwrap();
        for b in 0..3 {
            assert!(sc.read_record(b).unwrap().unwrap().is_sparse());
        }
        if let Some(p) = res.sparse_extents_path {
            std::fs::remove_file(p).ok();
        }
    }

    #[tokio::test]
    async fn metadata_only_writes_marker_sidecar() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("meta"), b"irrelevant").unwrap();

        let mut driver = SessionDriver::connect(
            LoopbackPeer::new(dir.path(), PeerConfig::default()),
            "test".to_string(),
        )
        .await
        .unwrap();

        let mut job = TransferJob {
            remote_name: "meta".to_string(),
            output: JobOutput::MetadataOnly,
            base_sidecar: None,
            new_sidecar: Some(SidecarFile::create(dir.path().join("meta.hash")).unwrap()),
            predicted_size: -1,
        };
        driver.fetch(&mut job).await.unwrap();
        let mut sc = SidecarFile::open(dir.path().join("meta.hash")).unwrap();
        assert_eq!(sc.logical_size().unwrap(), METADATA_ONLY);
    }

    #[tokio::test]
    async fn missing_peer_file_surfaces_cannot_open() {
        let dir = tempdir().unwrap();
        let mut driver = SessionDriver::connect(
            LoopbackPeer::new(dir.path(), PeerConfig::default()),
            "test".to_string(),
        )
        .await
        .unwrap();

        let mut job = TransferJob {
            remote_name: "absent".to_string(),
            output: JobOutput::Inline(rw_file(&dir.path().join("out"))),
            base_sidecar: None,
            new_sidecar: None,
            predicted_size: -1,
        };
        match driver.fetch(&mut job).await {
            Err(TransferError::CannotOpen) => {}
            other => panic!("expected CannotOpen, got {other:?}"),
        }
    }

    struct VecQueue {
        jobs: Vec<TransferJob>,
        resets: u32,
    }

    impl QueueSource for VecQueue {
        fn next_job(&mut self) -> Option<TransferJob> {
            if self.jobs.is_empty() {
                None
            } else {
                Some(self.jobs.remove(0))
            }
        }

        fn unqueue(&mut self, job: TransferJob) {
            self.jobs.push(job);
        }

        fn reset_queue(&mut self) {
            self.resets += 1;
        }
    }

    #[tokio::test]
    async fn queued_mode_pipelines_multiple_files() {
        let dir = tempdir().unwrap();
        let a: Vec<u8> = vec![1u8; BLOCK_SIZE as usize + 10];
        let b: Vec<u8> = vec![2u8; 3000];
        std::fs::write(dir.path().join("a"), &a).unwrap();
        std::fs::write(dir.path().join("b"), &b).unwrap();

        let mut driver = SessionDriver::connect(
            LoopbackPeer::new(dir.path(), PeerConfig::default()),
            "test".to_string(),
        )
        .await
        .unwrap();

        let mut queue = VecQueue {
            jobs: vec![
                TransferJob {
                    remote_name: "a".to_string(),
                    output: JobOutput::Inline(rw_file(&dir.path().join("out_a"))),
                    base_sidecar: None,
                    new_sidecar: Some(SidecarFile::create(dir.path().join("a.hash")).unwrap()),
                    predicted_size: a.len() as i64,
                },
                TransferJob {
                    remote_name: "b".to_string(),
                    output: JobOutput::Inline(rw_file(&dir.path().join("out_b"))),
                    base_sidecar: None,
                    new_sidecar: Some(SidecarFile::create(dir.path().join("b.hash")).unwrap()),
                    predicted_size: b.len() as i64,
                },
            ],
            resets: 0,
        };

        let results = driver.fetch_queued(&mut queue).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(std::fs::read(dir.path().join("out_a")).unwrap(), a);
        assert_eq!(std::fs::read(dir.path().join("out_b")).unwrap(), b);
    }
}
