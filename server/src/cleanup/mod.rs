//! Retention enforcement and space reclamation. The scheduled pass trims
//! each client down to its per-kind maximums inside the nightly window;
//! urgent passes (triggered by writers hitting ENOSPC or the low-space
//! gate) may dig further, down to the per-kind minimums. Incrementals go
//! before their parent full; a full with surviving dependents is skipped.

use crate::config::Config;
use crate::db::{self, backups, clients, files, BackupKind, BackupRow, ClientRow, DbPool};
use crate::fsutil;
use crate::store::{FileStore, SpaceReclaimer};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::Timelike;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

/// Grace period before a non-complete backup is reaped as an orphan.
pub const ORPHAN_GRACE_SECS: i64 = 300;

/// Kind order for deletion passes: incrementals strictly before fulls.
const KIND_ORDER: [BackupKind; 4] = [
    BackupKind::ImageIncr,
    BackupKind::ImageFull,
    BackupKind::FileIncr,
    BackupKind::FileFull,
];

pub struct CleanupEngine {
    db: DbPool,
    store: Arc<FileStore>,
    config: Config,
    /// Coarse lock: one cleanup or stats pass at a time.
    pass_mutex: Mutex<()>,
    interrupt: AtomicBool,
}

impl CleanupEngine {
    pub fn new(db: DbPool, store: Arc<FileStore>, config: Config) -> Arc<Self> {
        Arc::new(CleanupEngine {
            db,
            store,
            config,
            pass_mutex: Mutex::new(()),
            interrupt: AtomicBool::new(false),
        })
    }

    /// Abort a running pass within its next inner-loop check.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Nightly pass: reap orphans, enforce the per-kind maximums, rebuild
    /// usage counters.
    pub async fn run_scheduled(&self) -> anyhow::Result<()> {
        let _guard = self.pass_mutex.lock().await;
        self.interrupt.store(false, Ordering::Relaxed);

        self.reap_orphans().await?;

        for client in clients::list(&self.db).await? {
            if self.interrupted() {
                return Ok(());
            }
            for kind in KIND_ORDER {
                let (_, max) = client.retention(kind);
                self.enforce_bound(&client, kind, max).await?;
            }
        }

        self.rebuild_stats_locked().await?;
        Ok(())
    }

    /// Space-driven pass: free at least `needed` bytes on the backup
    /// volume, deleting down to the per-kind minimums. Returns whether the
    /// target was met.
    pub async fn urgent_cleanup(&self, needed: u64) -> anyhow::Result<bool> {
        let _guard = self.pass_mutex.lock().await;
        info!(needed, "urgent cleanup requested");

        let target_met = |root: &std::path::Path| -> bool {
            fsutil::free_space(root).map(|f| f >= needed).unwrap_or(false)
        };

        if target_met(&self.config.backup_root) {
            return Ok(true);
        }

        self.reap_orphans().await?;

        for kind in KIND_ORDER {
            for client in clients::list(&self.db).await? {
                let (min, _) = client.retention(kind);
                loop {
                    if self.interrupted() {
                        return Ok(false);
                    }
                    if target_met(&self.config.backup_root) {
                        self.rebuild_stats_locked().await?;
                        return Ok(true);
                    }
                    let deleted = self.delete_one_excess(&client, kind, min).await?;
                    if !deleted {
                        break;
                    }
                }
            }
        }

        self.rebuild_stats_locked().await?;
        Ok(target_met(&self.config.backup_root))
    }

    /// Enforce one bound: delete oldest-first while over the limit and a
    /// deletable candidate exists.
    async fn enforce_bound(
        &self,
        client: &ClientRow,
        kind: BackupKind,
        limit: i64,
    ) -> anyhow::Result<()> {
        loop {
            if self.interrupted() {
                return Ok(());
            }
            let count = backups::count_complete(&self.db, client.id, kind).await?;
            if count <= limit {
                return Ok(());
            }
            if !self.delete_one_excess(client, kind, limit).await? {
                warn!(
                    client = %client.name,
                    kind = kind.name(),
                    count,
                    limit,
                    "over retention limit but nothing deletable"
                );
                return Ok(());
            }
        }
    }

    /// Delete the oldest deletable backup of `kind` while the count
    /// exceeds `keep`. Fulls with surviving incrementals are skipped.
    async fn delete_one_excess(
        &self,
        client: &ClientRow,
        kind: BackupKind,
        keep: i64,
    ) -> anyhow::Result<bool> {
        let all = backups::list_complete_oldest_first(&self.db, client.id, kind).await?;
        if (all.len() as i64) <= keep {
            return Ok(false);
        }
        let excess = all.len() as i64 - keep;
        for candidate in all.into_iter().take(excess as usize) {
            if kind.is_full() && !backups::dependents(&self.db, candidate.id).await?.is_empty() {
                continue;
            }
            self.remove_backup(&candidate).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// GC non-complete backups past the grace period: failed or abandoned
    /// in-flight runs.
    pub async fn reap_orphans(&self) -> anyhow::Result<()> {
        for orphan in backups::incomplete_older_than(&self.db, ORPHAN_GRACE_SECS).await? {
            if self.interrupted() {
                return Ok(());
            }
            info!(backup = orphan.id, path = %orphan.path, "reaping orphaned backup");
            self.remove_backup(&orphan).await?;
        }
        Ok(())
    }

    /// The per-backup deletion sequence.
    pub async fn remove_backup(&self, backup: &BackupRow) -> anyhow::Result<()> {
        let kind = backup.kind();
        backups::mark_being_deleted(&self.db, backup.id).await?;

        if kind.is_image() {
            std::fs::remove_file(&backup.path).ok();
            std::fs::remove_file(format!("{}.hash", backup.path)).ok();
            std::fs::remove_file(format!("{}.mbr", backup.path)).ok();

            // CBT ownership dies with its backup.
            if let Some(client) = clients::get(&self.db, backup.client_id).await? {
                if client.cbt_backup_id == Some(backup.id) {
                    if let Some(path) = &client.cbt_path {
                        std::fs::remove_file(path).ok();
                    }
                    clients::set_cbt(&self.db, client.id, None, None).await?;
                }
            }
            clients::add_usage(&self.db, backup.client_id, 0, -backup.size_bytes).await?;
        } else {
            std::fs::remove_dir_all(&backup.path).ok();

            for row in files::rows_for_backup(&self.db, backup.id).await? {
                if self.interrupted() {
                    break;
                }
                self.store.release(&row).await?;
            }
            // File usage is recomputed by the stats rebuild at pass end.
        }

        backups::log_del_stat(&self.db, backup.id, backup.client_id, kind, backup.size_bytes)
            .await?;
        backups::delete_row(&self.db, backup.id).await?;
        info!(backup = backup.id, kind = kind.name(), "backup deleted");
        Ok(())
    }

    /// Rebuild per-client usage counters from the index. Interruptible so
    /// an urgent pass is never stuck behind bookkeeping.
    pub async fn rebuild_stats(&self) -> anyhow::Result<()> {
        let _guard = self.pass_mutex.lock().await;
        self.rebuild_stats_locked().await
    }

    async fn rebuild_stats_locked(&self) -> anyhow::Result<()> {
        self.store.flush_now().await?;
        for client in clients::list(&self.db).await? {
            if self.interrupted() {
                return Ok(());
            }
            let files_used = files::logical_bytes_used(&self.db, client.id).await?;
            let images_used = backups::image_bytes_used(&self.db, client.id).await?;
            clients::set_usage(&self.db, client.id, files_used, images_used).await?;
        }
        Ok(())
    }

    fn in_cleanup_window(&self, hour: u32) -> bool {
        let start = self.config.cleanup_window_start;
        let end = self.config.cleanup_window_end;
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    /// Background task: one scheduled pass per day, inside the window.
    pub fn spawn_scheduled(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_run_day: Option<chrono::NaiveDate> = None;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    _ = shutdown.changed() => {
                        engine.interrupt();
                        return;
                    }
                }
                let now = chrono::Utc::now();
                let today = now.date_naive();
                if engine.in_cleanup_window(now.hour()) && last_run_day != Some(today) {
                    info!("starting scheduled cleanup pass");
                    match engine.run_scheduled().await {
                        Ok(()) => {
                            last_run_day = Some(today);
                        }
                        Err(e) => warn!(error = %e, "scheduled cleanup failed"),
                    }
                }
            }
        })
    }
}

impl SpaceReclaimer for CleanupEngine {
    fn reclaim(&self, needed: u64) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            match self.urgent_cleanup(needed).await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(error = %e, "urgent cleanup failed");
                    false
                }
            }
        })
    }
}

/// Stats snapshot for logs and tooling.
pub async fn summarize(db: &DbPool) -> anyhow::Result<db::Stats> {
    db::get_stats(db).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewBackup;
    use tempfile::tempdir;

    struct Fixture {
        pool: DbPool,
        engine: Arc<CleanupEngine>,
        root: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let pool = crate::db::test_pool().await;
        let root = tempdir().unwrap();
        let store = FileStore::new(pool.clone());
        let config = Config {
            backup_root: root.path().to_path_buf(),
            ..Config::default()
        };
        let engine = CleanupEngine::new(pool.clone(), store, config);
        Fixture { pool, engine, root }
    }

    async fn make_backup(
        fx: &Fixture,
        client_id: i64,
        kind: BackupKind,
        name: &str,
        parent_id: Option<i64>,
        complete: bool,
    ) -> BackupRow {
        let path = fx.root.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        let row = backups::create(
            &fx.pool,
            &NewBackup {
                client_id,
                kind,
                path: path.to_string_lossy().into_owned(),
                parent_id,
            },
        )
        .await
        .unwrap();
        if complete {
            backups::set_complete(&fx.pool, row.id, 100, 1).await.unwrap();
        }
        backups::get(&fx.pool, row.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn retention_deletes_oldest_over_max() {
        let fx = fixture().await;
        let client = clients::get_or_create(&fx.pool, "c").await.unwrap();
        clients::set_retention(&fx.pool, client.id, BackupKind::FileFull, 1, 2).await.unwrap();
        let client = clients::get(&fx.pool, client.id).await.unwrap().unwrap();

        for i in 0..4 {
            make_backup(&fx, client.id, BackupKind::FileFull, &format!("f{i}"), None, true).await;
        }
        fx.engine
            .enforce_bound(&client, BackupKind::FileFull, 2)
            .await
            .unwrap();

        assert_eq!(
            backups::count_complete(&fx.pool, client.id, BackupKind::FileFull).await.unwrap(),
            2
        );
        // The two oldest trees are gone from disk.
        assert!(!fx.root.path().join("f0").exists());
        assert!(!fx.root.path().join("f1").exists());
        assert!(fx.root.path().join("f3").exists());
    }

    #[tokio::test]
    async fn full_with_dependents_is_skipped() {
        let fx = fixture().await;
        let client = clients::get_or_create(&fx.pool, "c").await.unwrap();
        clients::set_retention(&fx.pool, client.id, BackupKind::FileFull, 1, 1).await.unwrap();
        let client = clients::get(&fx.pool, client.id).await.unwrap().unwrap();

        let full0 = make_backup(&fx, client.id, BackupKind::FileFull, "full0", None, true).await;
        let _incr = make_backup(
            &fx,
            client.id,
            BackupKind::FileIncr,
            "incr0",
            Some(full0.id),
            true,
        )
        .await;
        let _full1 = make_backup(&fx, client.id, BackupKind::FileFull, "full1", None, true).await;

        fx.engine
            .enforce_bound(&client, BackupKind::FileFull, 1)
            .await
            .unwrap();

        // full0 still has a dependent incremental, so it survives even
        // though it is the oldest and the client is over its limit.
        assert!(backups::get(&fx.pool, full0.id).await.unwrap().is_some());
        assert_eq!(
            backups::count_complete(&fx.pool, client.id, BackupKind::FileFull).await.unwrap(),
            2
        );

        // After the incremental goes, the scheduled order deletes the full.
        let engine_order = fx.engine.clone();
        engine_order
            .enforce_bound(&client, BackupKind::FileIncr, 0)
            .await
            .unwrap();
        engine_order
            .enforce_bound(&client, BackupKind::FileFull, 1)
            .await
            .unwrap();
        assert!(backups::get(&fx.pool, full0.id).await.unwrap().is_none());
        assert_eq!(
            backups::count_complete(&fx.pool, client.id, BackupKind::FileFull).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn orphans_are_reaped() {
        let fx = fixture().await;
        let client = clients::get_or_create(&fx.pool, "c").await.unwrap();
        let orphan = make_backup(&fx, client.id, BackupKind::FileFull, "dead", None, false).await;

        // Age the row past the grace period.
        sqlx::query("UPDATE backups SET created_at = datetime('now', '-600 seconds') WHERE id = ?1")
            .bind(orphan.id)
            .execute(&fx.pool)
            .await
            .unwrap();

        fx.engine.reap_orphans().await.unwrap();
        assert!(backups::get(&fx.pool, orphan.id).await.unwrap().is_none());
        assert!(!fx.root.path().join("dead").exists());

        // The deletion left a del_stats row for the UI.
        let stats: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM del_stats")
            .fetch_one(&fx.pool)
            .await
            .unwrap();
        assert_eq!(stats.0, 1);
    }
}
