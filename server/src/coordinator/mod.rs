//! Per-client orchestration: one task per online client walking
//! discover -> decide -> transfer -> index -> reply. Commands arrive as
//! strings on the command pipe and preempt any wait; scheduled work is
//! decided from the client's update frequencies. A process-wide admission
//! semaphore caps concurrently running backups.

pub mod filelist;

use crate::cleanup::CleanupEngine;
use crate::config::Config;
use crate::db::{self, backups, clients, files, BackupKind, ClientRow, DbPool, NewBackup};
use crate::hashing::{file_sha512, sidecar::SidecarFile};
use crate::patcher::{self, PatchWriter};
use crate::protocol::session::{
    JobOutput, QueueSource, SessionDriver, TransferJob, TransferResult,
};
use crate::protocol::throttle::{RateLimiter, ThrottledReconnector};
use crate::protocol::{ClientConnector, TransferError};
use crate::store::FileStore;
use crate::vhd::writer::{VhdWriter, VhdWriterConfig};
use crate::vhd::{cbt::CbtFile, VhdFile, MBR_AREA};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

/// Files at or above this size travel as a patch stream applied against
/// the previous version; smaller ones are modified in an inline copy.
const PATCH_MODE_MIN_SIZE: i64 = 64 * 1024 * 1024;
/// Pause between failed backup attempts.
const FAILURE_BACKOFF: Duration = Duration::from_secs(60);
/// Idle poll for scheduled work.
const SCHEDULE_POLL: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(10);
/// The volume a client offers for image backups.
const IMAGE_VOLUME: &str = "C";

/// Explicit context threaded through constructors; background tasks borrow
/// this instead of reaching for process-wide state.
#[derive(Clone)]
pub struct CoreContext {
    pub db: DbPool,
    pub store: Arc<FileStore>,
    pub cleanup: Arc<CleanupEngine>,
    pub config: Config,
    pub admission: Arc<Semaphore>,
}

impl CoreContext {
    pub fn new(
        db: DbPool,
        store: Arc<FileStore>,
        cleanup: Arc<CleanupEngine>,
        config: Config,
    ) -> Self {
        let admission = Arc::new(Semaphore::new(config.max_sim_backups.max(1)));
        CoreContext { db, store, cleanup, config, admission }
    }
}

/// Typed form of the strings arriving on the command pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    StartBackup(BackupKind),
    Address(String),
    Exit,
}

impl ClientCommand {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        match trimmed {
            "START BACKUP FULL" => Ok(ClientCommand::StartBackup(BackupKind::FileFull)),
            "START BACKUP INCR" => Ok(ClientCommand::StartBackup(BackupKind::FileIncr)),
            "START IMAGE FULL" => Ok(ClientCommand::StartBackup(BackupKind::ImageFull)),
            "START IMAGE INCR" => Ok(ClientCommand::StartBackup(BackupKind::ImageIncr)),
            "exit" => Ok(ClientCommand::Exit),
            other => {
                if let Some(addr) = other.strip_prefix("address ") {
                    Ok(ClientCommand::Address(addr.trim().to_string()))
                } else {
                    anyhow::bail!("unknown command {other:?}")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Auth,
    WaitingSchedule,
    FullFile,
    IncrFile,
    FullImage,
    IncrImage,
    Post,
    Failed,
}

impl CoordinatorState {
    fn for_kind(kind: BackupKind) -> Self {
        match kind {
            BackupKind::FileFull => CoordinatorState::FullFile,
            BackupKind::FileIncr => CoordinatorState::IncrFile,
            BackupKind::ImageFull => CoordinatorState::FullImage,
            BackupKind::ImageIncr => CoordinatorState::IncrImage,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub state: CoordinatorState,
    pub done_bytes: i64,
    pub total_bytes: i64,
    pub current: Option<String>,
}

impl Default for Progress {
    fn default() -> Self {
        Progress { state: CoordinatorState::Idle, done_bytes: 0, total_bytes: 0, current: None }
    }
}

pub struct CoordinatorHandle {
    pub commands: mpsc::Sender<ClientCommand>,
    pub progress: watch::Receiver<Progress>,
    pub join: tokio::task::JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Feed a raw command-pipe string.
    pub async fn command_str(&self, raw: &str) -> anyhow::Result<()> {
        let cmd = ClientCommand::parse(raw)?;
        self.commands
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("coordinator gone"))
    }
}

/// When each backup kind last completed; input to the schedule decision.
#[derive(Debug, Default, Clone)]
pub struct LastRuns {
    pub file_full: Option<DateTime<Utc>>,
    pub file_incr: Option<DateTime<Utc>>,
    pub image_full: Option<DateTime<Utc>>,
    pub image_incr: Option<DateTime<Utc>>,
}

impl LastRuns {
    pub async fn load(db: &DbPool, client_id: i64) -> anyhow::Result<Self> {
        let at = |b: Option<db::BackupRow>| b.map(|b| b.start_time);
        Ok(LastRuns {
            file_full: at(backups::last_complete(db, client_id, BackupKind::FileFull).await?),
            file_incr: at(backups::last_complete(db, client_id, BackupKind::FileIncr).await?),
            image_full: at(backups::last_complete(db, client_id, BackupKind::ImageFull).await?),
            image_incr: at(backups::last_complete(db, client_id, BackupKind::ImageIncr).await?),
        })
    }
}

/// The schedule decision: full file when none exists or it aged out, then
/// incremental file, then the image pair with their own frequencies.
pub fn decide_backup(client: &ClientRow, last: &LastRuns, now: DateTime<Utc>) -> Option<BackupKind> {
    let aged = |t: Option<DateTime<Utc>>, freq: i64| {
        freq > 0 && t.map(|t| (now - t).num_seconds() >= freq).unwrap_or(true)
    };

    if aged(last.file_full, client.update_freq_full) {
        return Some(BackupKind::FileFull);
    }
    let last_file_any = last.file_full.max(last.file_incr);
    if last.file_full.is_some() && aged(last_file_any, client.update_freq_incr) {
        return Some(BackupKind::FileIncr);
    }
    if aged(last.image_full, client.update_freq_image_full) {
        return Some(BackupKind::ImageFull);
    }
    let last_image_any = last.image_full.max(last.image_incr);
    if last.image_full.is_some() && aged(last_image_any, client.update_freq_image_incr) {
        return Some(BackupKind::ImageIncr);
    }
    None
}

pub struct ClientCoordinator<C: ClientConnector> {
    ctx: CoreContext,
    connector: Arc<C>,
    client_id: i64,
    client_name: String,
    addr: String,
    /// One limiter per client, shared by every connection its sessions
    /// open (transfer, out-of-band, keepalive).
    limiter: Arc<RateLimiter>,
    cmd_rx: mpsc::Receiver<ClientCommand>,
    progress_tx: watch::Sender<Progress>,
}

impl<C: ClientConnector> ClientCoordinator<C> {
    pub async fn spawn(
        ctx: CoreContext,
        connector: Arc<C>,
        client_name: &str,
        addr: &str,
    ) -> anyhow::Result<CoordinatorHandle> {
        let client = clients::get_or_create(&ctx.db, client_name).await?;
        clients::set_addr(&ctx.db, client.id, addr).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (progress_tx, progress_rx) = watch::channel(Progress::default());

        let bytes_per_sec = match ctx.config.bandwidth_limit {
            0 => u64::MAX,
            limit => limit,
        };
        let coordinator = ClientCoordinator {
            limiter: RateLimiter::new(bytes_per_sec),
            ctx,
            connector,
            client_id: client.id,
            client_name: client_name.to_string(),
            addr: addr.to_string(),
            cmd_rx,
            progress_tx,
        };
        let join = tokio::spawn(coordinator.run());
        Ok(CoordinatorHandle { commands: cmd_tx, progress: progress_rx, join })
    }

    fn set_state(&self, state: CoordinatorState) {
        self.progress_tx.send_modify(|p| p.state = state);
    }

    async fn run(mut self) {
        info!(client = %self.client_name, "coordinator started");
        loop {
            self.set_state(CoordinatorState::WaitingSchedule);

            let decision = tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(ClientCommand::Exit) => break,
                    Some(ClientCommand::Address(addr)) => {
                        self.addr = addr;
                        clients::set_addr(&self.ctx.db, self.client_id, &self.addr).await.ok();
                        continue;
                    }
                    Some(ClientCommand::StartBackup(kind)) => Some(kind),
                },
                _ = tokio::time::sleep(SCHEDULE_POLL) => {
                    match self.scheduled_kind().await {
                        Ok(kind) => kind,
                        Err(e) => {
                            warn!(client = %self.client_name, error = %e, "schedule decision failed");
                            None
                        }
                    }
                }
            };

            let Some(kind) = decision else {
                self.set_state(CoordinatorState::Idle);
                continue;
            };

            match self.run_backup(kind).await {
                Ok(()) => self.set_state(CoordinatorState::Idle),
                Err(e) => {
                    warn!(client = %self.client_name, kind = kind.name(), error = %e, "backup failed");
                    self.set_state(CoordinatorState::Failed);
                    // Backoff, but stay responsive to commands.
                    tokio::select! {
                        _ = tokio::time::sleep(FAILURE_BACKOFF) => {}
                        cmd = self.cmd_rx.recv() => match cmd {
                            None | Some(ClientCommand::Exit) => break,
                            Some(ClientCommand::Address(addr)) => { self.addr = addr; }
                            Some(ClientCommand::StartBackup(k)) => {
                                if let Err(e) = self.run_backup(k).await {
                                    warn!(client = %self.client_name, error = %e, "manual retry failed");
                                }
                            }
                        },
                    }
                }
            }
        }
        info!(client = %self.client_name, "coordinator stopped");
    }

    async fn scheduled_kind(&self) -> anyhow::Result<Option<BackupKind>> {
        let Some(client) = clients::get(&self.ctx.db, self.client_id).await? else {
            return Ok(None);
        };
        let last = LastRuns::load(&self.ctx.db, self.client_id).await?;
        Ok(decide_backup(&client, &last, Utc::now()))
    }

    async fn run_backup(&mut self, kind: BackupKind) -> anyhow::Result<()> {
        // Admission: wait on the process-wide cap before anything starts.
        let _permit = Arc::clone(&self.ctx.admission).acquire_owned().await?;
        self.set_state(CoordinatorState::Auth);

        let reconnector = ThrottledReconnector::new(
            self.connector.reconnector(&self.addr),
            Arc::clone(&self.limiter),
        );
        let mut driver =
            SessionDriver::connect(reconnector, self.client_name.clone()).await?;
        driver.set_network_timeout(Duration::from_secs(self.ctx.config.network_timeout_secs));
        driver.set_reconnect_timeout(Duration::from_secs(self.ctx.config.reconnect_timeout_secs));

        let (ping_stop_tx, ping_stop_rx) = watch::channel(false);
        let ping = spawn_ping(
            Arc::clone(&self.connector),
            self.addr.clone(),
            self.client_name.clone(),
            Arc::clone(&self.limiter),
            self.progress_tx.subscribe(),
            ping_stop_rx,
        );

        self.set_state(CoordinatorState::for_kind(kind));
        let started = std::time::Instant::now();
        let result = if kind.is_image() {
            self.drive_image_backup(&mut driver, kind).await
        } else {
            self.drive_file_backup(&mut driver, kind).await
        };

        ping_stop_tx.send(true).ok();
        ping.await.ok();

        self.set_state(CoordinatorState::Post);
        match result {
            Ok(Some((backup_id, size_bytes))) => {
                backups::set_complete(
                    &self.ctx.db,
                    backup_id,
                    size_bytes,
                    started.elapsed().as_secs() as i64,
                )
                .await?;
                let files_used = files::logical_bytes_used(&self.ctx.db, self.client_id).await?;
                let images_used = backups::image_bytes_used(&self.ctx.db, self.client_id).await?;
                clients::set_usage(&self.ctx.db, self.client_id, files_used, images_used).await?;
                info!(
                    client = %self.client_name,
                    kind = kind.name(),
                    backup = backup_id,
                    size_bytes,
                    "backup complete"
                );
                Ok(())
            }
            Ok(None) => {
                debug!(client = %self.client_name, kind = kind.name(), "nothing to back up");
                Ok(())
            }
            // Failed rows stay complete=0; the cleanup engine reaps them
            // after the grace period.
            Err(e) => Err(e),
        }
    }

    async fn drive_file_backup<R: crate::protocol::Reconnector>(
        &self,
        driver: &mut SessionDriver<R>,
        kind: BackupKind,
    ) -> anyhow::Result<Option<(i64, i64)>> {
        let listing = driver.fetch_plain(filelist::FILELIST_NAME).await?;
        let new_list = filelist::parse(std::str::from_utf8(&listing)?)?;

        // Previous tree for diffing and hardlink reuse: the newest complete
        // file backup of either kind.
        let prev_full = backups::last_complete(&self.ctx.db, self.client_id, BackupKind::FileFull).await?;
        let prev_incr = backups::last_complete(&self.ctx.db, self.client_id, BackupKind::FileIncr).await?;
        let prev = match (prev_full.clone(), prev_incr) {
            (Some(f), Some(i)) => Some(if i.start_time > f.start_time { i } else { f }),
            (Some(f), None) => Some(f),
            (None, Some(i)) => Some(i),
            (None, None) => None,
        };

        let incremental = kind == BackupKind::FileIncr && prev.is_some();
        let old_list = match (&prev, incremental) {
            (Some(prev), true) => {
                let path = Path::new(&prev.path).join(".filelist");
                match std::fs::read_to_string(&path) {
                    Ok(text) => filelist::parse(&text)?,
                    Err(_) => Vec::new(),
                }
            }
            _ => Vec::new(),
        };
        let diff = filelist::diff(&old_list, &new_list);

        let parent_id = if kind == BackupKind::FileIncr {
            prev_full.as_ref().map(|b| b.id)
        } else {
            None
        };

        let client_dir = self.ctx.config.backup_root.join(&self.client_name);
        let stamp = Utc::now().format("%y%m%d-%H%M%S").to_string();
        let mut backup_dir = client_dir.join(&stamp);
        // Back-to-back runs within one second need distinct trees.
        let mut bump = 1;
        while backup_dir.exists() {
            backup_dir = client_dir.join(format!("{stamp}_{bump}"));
            bump += 1;
        }
        let hashes_dir = backup_dir.join(".hashes");
        let tmp_dir = backup_dir.join(".tmp");
        std::fs::create_dir_all(&hashes_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;

        let backup = backups::create(
            &self.ctx.db,
            &NewBackup {
                client_id: self.client_id,
                kind,
                path: backup_dir.to_string_lossy().into_owned(),
                parent_id,
            },
        )
        .await?;

        for dir in &diff.dirs {
            std::fs::create_dir_all(backup_dir.join(&dir.path))?;
        }

        let total_bytes: i64 = new_list.iter().filter(|e| !e.is_dir).map(|e| e.size).sum();
        self.progress_tx.send_modify(|p| {
            p.total_bytes = total_bytes;
            p.done_bytes = 0;
        });

        // Unchanged files: hardlink content and sidecar from the previous
        // tree, register a zero-reference row. A failed link falls back to
        // a fresh transfer.
        let mut to_transfer = diff.changed.clone();
        if incremental {
            let prev = prev.as_ref().expect("incremental implies previous");
            let prev_rows = files::rows_for_backup(&self.ctx.db, prev.id).await?;
            let by_path: HashMap<&str, &db::FileRow> =
                prev_rows.iter().map(|r| (r.fullpath.as_str(), r)).collect();

            for entry in &diff.unchanged {
                let prev_file = Path::new(&prev.path).join(&entry.path);
                let prev_hash = Path::new(&prev.path).join(".hashes").join(format!("{}.hash", entry.path));
                let new_file = backup_dir.join(&entry.path);
                let new_hash = hashes_dir.join(format!("{}.hash", entry.path));
                if let Some(parent) = new_file.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if let Some(parent) = new_hash.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                let linked = std::fs::hard_link(&prev_file, &new_file).is_ok();
                if !linked {
                    debug!(path = %entry.path, "hardlink reuse failed, transferring");
                    to_transfer.push(entry.clone());
                    continue;
                }
                std::fs::hard_link(&prev_hash, &new_hash)
                    .or_else(|_| std::fs::copy(&prev_hash, &new_hash).map(|_| ()))
                    .ok();

                if let Some(row) = by_path.get(prev_file.to_string_lossy().as_ref()) {
                    files::stage_insert(
                        &self.ctx.db,
                        &db::NewFileEntry {
                            backup_id: backup.id,
                            client_id: self.client_id,
                            fullpath: new_file.to_string_lossy().into_owned(),
                            hash: row.hash.clone(),
                            filesize: row.filesize,
                            rsize: 0,
                        },
                    )
                    .await?;
                }
                self.progress_tx.send_modify(|p| p.done_bytes += entry.size);
            }
        }

        // Changed files: queued chunk transfers, then dedup into place.
        let mut queue = BackupQueue::new(
            to_transfer,
            backup_dir.clone(),
            hashes_dir.clone(),
            tmp_dir.clone(),
            if incremental { prev.as_ref().map(|p| PathBuf::from(&p.path)) } else { None },
        );
        let results = driver.fetch_queued(&mut queue).await?;

        let mut transfer_errors = 0usize;
        for (name, result) in results {
            let Some(meta) = queue.metas.remove(&name) else {
                continue;
            };
            match result {
                Ok(res) => {
                    if let Err(e) = self.finalize_file(&backup_dir, backup.id, &meta, &res).await {
                        warn!(path = %meta.rel, error = %e, "failed to index transferred file");
                        transfer_errors += 1;
                    }
                    self.progress_tx.send_modify(|p| p.done_bytes += meta.size);
                    if let Some(p) = res.sparse_extents_path {
                        std::fs::remove_file(p).ok();
                    }
                }
                Err(e) => {
                    warn!(path = %meta.rel, error = %e, "file transfer failed");
                    transfer_errors += 1;
                }
            }
        }
        if transfer_errors > 0 {
            anyhow::bail!("{transfer_errors} files failed to transfer");
        }

        std::fs::write(backup_dir.join(".filelist"), filelist::serialize(&new_list))?;
        std::fs::remove_dir_all(&tmp_dir).ok();

        Ok(Some((backup.id, total_bytes)))
    }

    /// Apply any patch, hash the materialized content, and hand it to the
    /// dedup store.
    async fn finalize_file(
        &self,
        backup_dir: &Path,
        backup_id: i64,
        meta: &JobMeta,
        res: &TransferResult,
    ) -> anyhow::Result<()> {
        let content_tmp = if let Some((patch_path, base_path)) = &meta.patch {
            let mut base = File::open(base_path)?;
            let mut patch = File::open(patch_path)?;
            let mut extent_iter = match &res.sparse_extents_path {
                Some(p) => Some(crate::extents::ExtentIterator::new(File::open(p)?)?),
                None => None,
            };
            let out_path = meta.tmp_path.with_extension("applied");
            let out = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&out_path)?;
            patcher::apply_to_file(&mut base, &mut patch, extent_iter.as_mut(), out)?;
            std::fs::remove_file(patch_path).ok();
            out_path
        } else {
            meta.tmp_path.clone()
        };

        let (size, sha) = file_sha512(&content_tmp)?;
        let dest = backup_dir.join(&meta.rel);
        self.ctx
            .store
            .ingest(&content_tmp, &dest, &sha, size, self.client_id, backup_id)
            .await?;
        Ok(())
    }

    async fn drive_image_backup<R: crate::protocol::Reconnector>(
        &self,
        driver: &mut SessionDriver<R>,
        kind: BackupKind,
    ) -> anyhow::Result<Option<(i64, i64)>> {
        let volume_size = match driver.fetch_size(IMAGE_VOLUME).await {
            Ok(size) => size,
            Err(TransferError::CannotOpen) => {
                debug!(client = %self.client_name, "client offers no image volume");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let prev_image = {
            let full = backups::last_complete(&self.ctx.db, self.client_id, BackupKind::ImageFull).await?;
            let incr = backups::last_complete(&self.ctx.db, self.client_id, BackupKind::ImageIncr).await?;
            match (full, incr) {
                (Some(f), Some(i)) => Some(if i.start_time > f.start_time { i } else { f }),
                (Some(f), None) => Some(f),
                (None, Some(i)) => Some(i),
                (None, None) => None,
            }
        };
        // An incremental without a full to hang off becomes a full.
        let kind = if kind == BackupKind::ImageIncr && prev_image.is_none() {
            BackupKind::ImageFull
        } else {
            kind
        };
        let parent_id = if kind == BackupKind::ImageIncr {
            backups::last_complete(&self.ctx.db, self.client_id, BackupKind::ImageFull)
                .await?
                .map(|b| b.id)
        } else {
            None
        };

        let client_dir = self.ctx.config.backup_root.join(&self.client_name);
        std::fs::create_dir_all(&client_dir)?;
        let stamp = Utc::now().format("%y%m%d-%H%M%S").to_string();
        let mut vhd_path = client_dir.join(format!("Image_{IMAGE_VOLUME}_{stamp}.vhd"));
        let mut bump = 1;
        while vhd_path.exists() {
            vhd_path = client_dir.join(format!("Image_{IMAGE_VOLUME}_{stamp}_{bump}.vhd"));
            bump += 1;
        }
        let hash_path = vhd_path.with_extension("vhd.hash");

        let backup = backups::create(
            &self.ctx.db,
            &NewBackup {
                client_id: self.client_id,
                kind,
                path: vhd_path.to_string_lossy().into_owned(),
                parent_id,
            },
        )
        .await?;

        self.progress_tx.send_modify(|p| {
            p.total_bytes = volume_size;
            p.done_bytes = 0;
            p.current = Some(vhd_path.to_string_lossy().into_owned());
        });

        let vhd = VhdFile::create(&vhd_path, MBR_AREA + volume_size as u64)?;
        let mut new_sidecar = SidecarFile::create(&hash_path)?;
        new_sidecar.set_logical_size(volume_size)?;

        let prev_sidecar = prev_image
            .as_ref()
            .and_then(|b| SidecarFile::open_readonly(format!("{}.hash", b.path)).ok());

        let writer = VhdWriter::spawn(
            vhd,
            vhd_path.clone(),
            Some(SidecarFile::open(&hash_path)?),
            volume_size,
            VhdWriterConfig {
                temp_dir: self.ctx.config.backup_root.clone(),
                free_space_limit: self.ctx.config.free_space_limit,
                ..Default::default()
            },
            Some(Arc::clone(&self.ctx.cleanup) as Arc<dyn crate::store::SpaceReclaimer>),
        );
        let mut sink = writer.sink();

        let transfer = driver
            .fetch_image(IMAGE_VOLUME, volume_size, prev_sidecar, new_sidecar, &mut sink)
            .await;
        drop(sink);
        let stats = writer.finish().await?;

        let transfer = transfer?;
        if stats.has_error {
            anyhow::bail!("image writer failed");
        }

        // MBR/GPT header blob: into the reserved VHD area and alongside the
        // image for restore.
        match driver.fetch_plain(&format!("{IMAGE_VOLUME}.mbr")).await {
            Ok(blob) => {
                std::fs::write(vhd_path.with_extension("vhd.mbr"), &blob)?;
                let mut vhd = VhdFile::open(&vhd_path)?;
                let cap = blob.len().min(MBR_AREA as usize);
                vhd.write_at(0, &blob[..cap])?;
                vhd.flush()?;
            }
            Err(TransferError::CannotOpen) => {
                debug!(client = %self.client_name, "no mbr blob offered");
            }
            Err(e) => return Err(e.into()),
        }

        // Refresh the change-block tracking file from the new sidecar and
        // move ownership to this backup.
        let cbt_path = client_dir.join(format!("Image_{IMAGE_VOLUME}.cbt"));
        let mut cbt = CbtFile::create(&cbt_path, volume_size)?;
        let mut sidecar = SidecarFile::open_readonly(&hash_path)?;
        for block in 0..crate::hashing::block_count(volume_size) {
            if let Some(rec) = sidecar.read_record(block)? {
                let offset = block * crate::hashing::BLOCK_SIZE as i64;
                if rec.is_sparse() {
                    cbt.mark_sparse(offset)?;
                } else {
                    cbt.update(offset, &rec.strong)?;
                }
            }
        }
        cbt.sync()?;
        clients::set_cbt(
            &self.ctx.db,
            self.client_id,
            Some(cbt_path.to_string_lossy().as_ref()),
            Some(backup.id),
        )
        .await?;

        let size = transfer.received_bytes + transfer.sparse_bytes;
        Ok(Some((backup.id, size)))
    }
}

/// Keepalive loop: one ping every 10 seconds while a backup runs, logging
/// progress from the watch channel.
fn spawn_ping<C: ClientConnector>(
    connector: Arc<C>,
    addr: String,
    client_name: String,
    limiter: Arc<RateLimiter>,
    progress: watch::Receiver<Progress>,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut driver: Option<SessionDriver<ThrottledReconnector<C::R>>> = None;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PING_INTERVAL) => {}
                _ = stop.changed() => return,
            }
            if *stop.borrow() {
                return;
            }

            if driver.is_none() {
                let reconnector = ThrottledReconnector::new(
                    connector.reconnector(&addr),
                    Arc::clone(&limiter),
                );
                driver = SessionDriver::connect(reconnector, client_name.clone()).await.ok();
            }
            if let Some(d) = driver.as_mut() {
                if d.ping().await.is_err() {
                    driver = None;
                }
            }
            let p = progress.borrow().clone();
            debug!(
                client = %client_name,
                done = p.done_bytes,
                total = p.total_bytes,
                "backup keepalive"
            );
        }
    })
}

/// Per-file bookkeeping for one queued transfer.
struct JobMeta {
    rel: String,
    size: i64,
    tmp_path: PathBuf,
    /// (patch file, base file) when the file travelled as a patch stream.
    patch: Option<(PathBuf, PathBuf)>,
}

/// QueueSource over the changed-file list: jobs are prepared lazily as the
/// engine pulls them, so at most a window of temp files is open at once.
struct BackupQueue {
    pending: Vec<filelist::FileListEntry>,
    next: usize,
    backup_dir: PathBuf,
    hashes_dir: PathBuf,
    tmp_dir: PathBuf,
    prev_dir: Option<PathBuf>,
    metas: HashMap<String, JobMeta>,
    seq: u64,
}

impl BackupQueue {
    fn new(
        pending: Vec<filelist::FileListEntry>,
        backup_dir: PathBuf,
        hashes_dir: PathBuf,
        tmp_dir: PathBuf,
        prev_dir: Option<PathBuf>,
    ) -> Self {
        BackupQueue {
            pending,
            next: 0,
            backup_dir,
            hashes_dir,
            tmp_dir,
            prev_dir,
            metas: HashMap::new(),
            seq: 0,
        }
    }

    fn prepare(&mut self, entry: &filelist::FileListEntry) -> anyhow::Result<TransferJob> {
        self.seq += 1;
        let tmp_path = self.tmp_dir.join(format!("t{}", self.seq));

        let new_hash = self.hashes_dir.join(format!("{}.hash", entry.path));
        if let Some(parent) = new_hash.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let new_sidecar = SidecarFile::create(&new_hash)?;

        let prev_file = self.prev_dir.as_ref().map(|d| d.join(&entry.path));
        let prev_hash = self
            .prev_dir
            .as_ref()
            .map(|d| d.join(".hashes").join(format!("{}.hash", entry.path)));
        let base_usable = matches!(&prev_file, Some(p) if p.is_file())
            && matches!(&prev_hash, Some(p) if p.is_file());

        let (output, base_sidecar, patch_meta) = if base_usable && entry.size >= PATCH_MODE_MIN_SIZE
        {
            let base_path = prev_file.expect("base_usable checked");
            let patch_path = self.tmp_dir.join(format!("t{}.patch", self.seq));
            let patch_file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&patch_path)?;
            (
                JobOutput::Patch {
                    base: File::open(&base_path)?,
                    patch: PatchWriter::new(patch_file),
                },
                Some(SidecarFile::open_readonly(prev_hash.expect("base_usable checked"))?),
                Some((patch_path, base_path)),
            )
        } else if base_usable {
            // Inline: start from a copy of the previous version and let the
            // session modify it in place.
            std::fs::copy(prev_file.as_ref().expect("base_usable checked"), &tmp_path)?;
            let file = File::options().read(true).write(true).open(&tmp_path)?;
            (
                JobOutput::Inline(file),
                Some(SidecarFile::open_readonly(prev_hash.expect("base_usable checked"))?),
                None,
            )
        } else {
            let file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            (JobOutput::Inline(file), None, None)
        };

        self.metas.insert(
            entry.path.clone(),
            JobMeta {
                rel: entry.path.clone(),
                size: entry.size,
                tmp_path,
                patch: patch_meta,
            },
        );

        Ok(TransferJob {
            remote_name: entry.path.clone(),
            output,
            base_sidecar,
            new_sidecar: Some(new_sidecar),
            predicted_size: entry.size,
        })
    }
}

impl QueueSource for BackupQueue {
    fn next_job(&mut self) -> Option<TransferJob> {
        while self.next < self.pending.len() {
            let entry = self.pending[self.next].clone();
            self.next += 1;
            match self.prepare(&entry) {
                Ok(job) => return Some(job),
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "cannot prepare transfer job");
                }
            }
        }
        None
    }

    fn unqueue(&mut self, job: TransferJob) {
        self.metas.remove(&job.remote_name);
        if let Some(pos) = self.pending.iter().position(|e| e.path == job.remote_name) {
            // Re-run it on the next pull.
            if pos < self.next {
                self.next = pos;
            }
        }
    }

    fn reset_queue(&mut self) {}
}
