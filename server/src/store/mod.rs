//! Content-addressed file store: when a transferred file lands in a backup
//! tree it is either hardlinked from an existing entry with the same
//! (sha512, size) or copied and registered as the class's reference holder.
//! New index rows go through the `files_tmp` staging table; a background
//! flusher batches them into `files`.

use crate::db::{files, DbPool, FileRow, NewFileEntry};
use crate::fsutil;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Staged rows are flushed once this many pile up, or every flush interval.
const STAGING_FLUSH_ROWS: i64 = 100;
const STAGING_FLUSH_INTERVAL: Duration = Duration::from_secs(120);
const STAGING_POLL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("index error: {0}")]
    Db(#[from] anyhow::Error),
    #[error("out of space and reclamation failed")]
    NoSpace,
}

/// How an incoming file ended up on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Hardlinked,
    Reflinked,
    Copied,
}

/// Urgent-cleanup hook invoked when a write runs out of space. Returns
/// whether enough space was reclaimed to retry.
pub trait SpaceReclaimer: Send + Sync {
    fn reclaim(&self, needed: u64) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

pub struct FileStore {
    db: DbPool,
    /// Serializes the delete-stale-entry-and-retry loop so two sessions
    /// cannot race to delete the same victim.
    delete_mutex: Mutex<()>,
    reclaimer: std::sync::RwLock<Option<Arc<dyn SpaceReclaimer>>>,
}

impl FileStore {
    pub fn new(db: DbPool) -> Arc<Self> {
        Arc::new(FileStore {
            db,
            delete_mutex: Mutex::new(()),
            reclaimer: std::sync::RwLock::new(None),
        })
    }

    pub fn set_reclaimer(&self, reclaimer: Arc<dyn SpaceReclaimer>) {
        *self.reclaimer.write().expect("reclaimer lock poisoned") = Some(reclaimer);
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    /// Place the fully transferred `tmp_src` at `dest`, deduplicating
    /// against the newest existing entry of the same (hash, size) class.
    pub async fn ingest(
        &self,
        tmp_src: &Path,
        dest: &Path,
        hash: &[u8; 64],
        size: i64,
        client_id: i64,
        backup_id: i64,
    ) -> Result<StoreOutcome, StoreError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let guard = self.delete_mutex.lock().await;

        let mut outcome: Option<StoreOutcome> = None;
        loop {
            let cands = files::candidates(&self.db, hash, size).await?;
            let Some(cand) = cands.first() else {
                break;
            };

            match std::fs::hard_link(&cand.fullpath, dest) {
                Ok(()) => {
                    outcome = Some(StoreOutcome::Hardlinked);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // The entry's file is gone; drop the stale row and try
                    // the next candidate.
                    warn!(path = %cand.fullpath, "stale file index entry, removing");
                    files::delete_entry(&self.db, cand.id, cand.is_staged()).await?;
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, src = %cand.fullpath, "hardlink failed, trying reflink");
                    if fsutil::reflink(Path::new(&cand.fullpath), dest).is_ok() {
                        outcome = Some(StoreOutcome::Reflinked);
                        break;
                    }
                    match self.copy_with_reclaim(Path::new(&cand.fullpath), dest, size).await {
                        Ok(()) => {
                            outcome = Some(StoreOutcome::Copied);
                            break;
                        }
                        Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                            files::delete_entry(&self.db, cand.id, cand.is_staged()).await?;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let outcome = match outcome {
            Some(o) => {
                std::fs::remove_file(tmp_src).ok();
                o
            }
            None => {
                // First holder of this content: move the incoming file in.
                if std::fs::rename(tmp_src, dest).is_err() {
                    self.copy_with_reclaim(tmp_src, dest, size).await?;
                    std::fs::remove_file(tmp_src).ok();
                }
                StoreOutcome::Copied
            }
        };

        // The first row of a class carries the reference size.
        let class_empty = files::candidates(&self.db, hash, size).await?.is_empty();
        files::stage_insert(
            &self.db,
            &NewFileEntry {
                backup_id,
                client_id,
                fullpath: dest.to_string_lossy().into_owned(),
                hash: hash.to_vec(),
                filesize: size,
                rsize: if class_empty { size } else { 0 },
            },
        )
        .await?;

        drop(guard);

        if files::staging_count(&self.db).await? >= STAGING_FLUSH_ROWS {
            files::flush_staging(&self.db).await?;
        }
        Ok(outcome)
    }

    async fn copy_with_reclaim(
        &self,
        src: &Path,
        dest: &Path,
        size: i64,
    ) -> Result<(), StoreError> {
        match std::fs::copy(src, dest) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                std::fs::remove_file(dest).ok();
                let reclaimer = self.reclaimer.read().expect("reclaimer lock poisoned").clone();
                let Some(reclaimer) = reclaimer else {
                    return Err(StoreError::NoSpace);
                };
                if !reclaimer.reclaim(size.max(0) as u64).await {
                    return Err(StoreError::NoSpace);
                }
                // One retry after reclamation, then surface the error.
                match std::fs::copy(src, dest) {
                    Ok(_) => Ok(()),
                    Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                        std::fs::remove_file(dest).ok();
                        Err(StoreError::NoSpace)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A backup tree is going away: drop this entry and keep the class's
    /// reference size alive on its oldest surviving member.
    pub async fn release(&self, row: &FileRow) -> Result<(), StoreError> {
        let _guard = self.delete_mutex.lock().await;

        if row.rsize > 0 {
            if let Some(heir) = files::oldest_classmate(
                &self.db,
                &row.hash,
                row.filesize,
                row.id,
                row.is_staged(),
            )
            .await?
            {
                files::set_rsize(&self.db, heir.id, heir.is_staged(), row.rsize).await?;
            }
        }
        files::delete_entry(&self.db, row.id, row.is_staged()).await?;
        Ok(())
    }

    pub async fn flush_now(&self) -> Result<u64, StoreError> {
        Ok(files::flush_staging(&self.db).await?)
    }

    /// Background flusher: copies staged rows into the main table at the
    /// row threshold or on the interval, whichever comes first.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_flush = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(STAGING_POLL) => {}
                    _ = shutdown.changed() => {
                        if let Err(e) = store.flush_now().await {
                            warn!(error = %e, "final staging flush failed");
                        }
                        return;
                    }
                }

                let count = match files::staging_count(&store.db).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "staging count failed");
                        continue;
                    }
                };
                let interval_due = last_flush.elapsed() >= STAGING_FLUSH_INTERVAL;
                if count >= STAGING_FLUSH_ROWS || (count > 0 && interval_due) {
                    match store.flush_now().await {
                        Ok(n) => {
                            info!(rows = n, "flushed staged file entries");
                            last_flush = tokio::time::Instant::now();
                        }
                        Err(e) => warn!(error = %e, "staging flush failed"),
                    }
                }
            }
        })
    }
}
