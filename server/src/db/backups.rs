use super::models::{BackupKind, BackupRow, NewBackup};
use super::DbPool;

const BACKUP_COLUMNS: &str = "id, client_id, kind, start_time, duration_secs, path, size_bytes, \
     complete, done, parent_id, being_deleted, created_at";

pub async fn create(pool: &DbPool, new: &NewBackup) -> anyhow::Result<BackupRow> {
    let backup = sqlx::query_as::<_, BackupRow>(&format!(
        "INSERT INTO backups (client_id, kind, path, parent_id) VALUES (?1, ?2, ?3, ?4) \
         RETURNING {BACKUP_COLUMNS}"
    ))
    .bind(new.client_id)
    .bind(new.kind as i64)
    .bind(&new.path)
    .bind(new.parent_id)
    .fetch_one(pool)
    .await?;

    Ok(backup)
}

pub async fn get(pool: &DbPool, id: i64) -> anyhow::Result<Option<BackupRow>> {
    let backup = sqlx::query_as::<_, BackupRow>(&format!(
        "SELECT {BACKUP_COLUMNS} FROM backups WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(backup)
}

/// Mark a backup finished. `complete` stays 0 for failed runs so the
/// cleanup engine reaps them later.
pub async fn set_complete(
    pool: &DbPool,
    id: i64,
    size_bytes: i64,
    duration_secs: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE backups SET complete = 1, done = 1, size_bytes = ?2, duration_secs = ?3 \
         WHERE id = ?1",
    )
    .bind(id)
    .bind(size_bytes)
    .bind(duration_secs)
    .execute(pool)
    .await?;
    Ok(())
}

/// The most recent complete backup of the given kind.
pub async fn last_complete(
    pool: &DbPool,
    client_id: i64,
    kind: BackupKind,
) -> anyhow::Result<Option<BackupRow>> {
    let backup = sqlx::query_as::<_, BackupRow>(&format!(
        "SELECT {BACKUP_COLUMNS} FROM backups \
         WHERE client_id = ?1 AND kind = ?2 AND complete = 1 AND being_deleted = 0 \
         ORDER BY start_time DESC, id DESC LIMIT 1"
    ))
    .bind(client_id)
    .bind(kind as i64)
    .fetch_optional(pool)
    .await?;

    Ok(backup)
}

pub async fn count_complete(pool: &DbPool, client_id: i64, kind: BackupKind) -> anyhow::Result<i64> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM backups \
         WHERE client_id = ?1 AND kind = ?2 AND complete = 1 AND being_deleted = 0",
    )
    .bind(client_id)
    .bind(kind as i64)
    .fetch_one(pool)
    .await?;

    Ok(count.0)
}

/// Complete backups of one kind, oldest first; the retention scan's order.
pub async fn list_complete_oldest_first(
    pool: &DbPool,
    client_id: i64,
    kind: BackupKind,
) -> anyhow::Result<Vec<BackupRow>> {
    let backups = sqlx::query_as::<_, BackupRow>(&format!(
        "SELECT {BACKUP_COLUMNS} FROM backups \
         WHERE client_id = ?1 AND kind = ?2 AND complete = 1 AND being_deleted = 0 \
         ORDER BY start_time ASC, id ASC"
    ))
    .bind(client_id)
    .bind(kind as i64)
    .fetch_all(pool)
    .await?;

    Ok(backups)
}

/// In-flight backups that overstayed the orphan grace period.
pub async fn incomplete_older_than(
    pool: &DbPool,
    age_secs: i64,
) -> anyhow::Result<Vec<BackupRow>> {
    let backups = sqlx::query_as::<_, BackupRow>(&format!(
        "SELECT {BACKUP_COLUMNS} FROM backups \
         WHERE complete = 0 AND being_deleted = 0 \
         AND created_at <= datetime('now', '-' || ?1 || ' seconds')"
    ))
    .bind(age_secs)
    .fetch_all(pool)
    .await?;

    Ok(backups)
}

/// Incrementals that still depend on this backup.
pub async fn dependents(pool: &DbPool, id: i64) -> anyhow::Result<Vec<BackupRow>> {
    let backups = sqlx::query_as::<_, BackupRow>(&format!(
        "SELECT {BACKUP_COLUMNS} FROM backups WHERE parent_id = ?1 AND being_deleted = 0 \
         ORDER BY start_time ASC, id ASC"
    ))
    .bind(id)
    .fetch_all(pool)
    .await?;

    Ok(backups)
}

pub async fn mark_being_deleted(pool: &DbPool, id: i64) -> anyhow::Result<()> {
    sqlx::query("UPDATE backups SET being_deleted = 1 WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_row(pool: &DbPool, id: i64) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM backups WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn log_del_stat(
    pool: &DbPool,
    backup_id: i64,
    client_id: i64,
    kind: BackupKind,
    size_bytes: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO del_stats (backup_id, client_id, kind, size_bytes) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(backup_id)
    .bind(client_id)
    .bind(kind as i64)
    .bind(size_bytes)
    .execute(pool)
    .await?;
    Ok(())
}

/// Sum of completed image backup sizes; file usage comes from the file
/// index rsize column instead.
pub async fn image_bytes_used(pool: &DbPool, client_id: i64) -> anyhow::Result<i64> {
    let sum: (Option<i64>,) = sqlx::query_as(
        "SELECT CAST(COALESCE(SUM(size_bytes), 0) AS BIGINT) FROM backups \
         WHERE client_id = ?1 AND kind IN (?2, ?3) AND complete = 1 AND being_deleted = 0",
    )
    .bind(client_id)
    .bind(BackupKind::ImageFull as i64)
    .bind(BackupKind::ImageIncr as i64)
    .fetch_one(pool)
    .await?;

    Ok(sum.0.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::clients;

    #[tokio::test]
    async fn lifecycle_and_retention_queries() {
        let pool = crate::db::test_pool().await;
        let client = clients::get_or_create(&pool, "c1").await.unwrap();

        let full = create(
            &pool,
            &NewBackup {
                client_id: client.id,
                kind: BackupKind::FileFull,
                path: "/tmp/full".into(),
                parent_id: None,
            },
        )
        .await
        .unwrap();
        assert!(!full.is_complete());

        set_complete(&pool, full.id, 1000, 5).await.unwrap();
        assert_eq!(count_complete(&pool, client.id, BackupKind::FileFull).await.unwrap(), 1);

        let incr = create(
            &pool,
            &NewBackup {
                client_id: client.id,
                kind: BackupKind::FileIncr,
                path: "/tmp/incr".into(),
                parent_id: Some(full.id),
            },
        )
        .await
        .unwrap();
        set_complete(&pool, incr.id, 10, 1).await.unwrap();

        let deps = dependents(&pool, full.id).await.unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].id, incr.id);

        let last = last_complete(&pool, client.id, BackupKind::FileFull).await.unwrap().unwrap();
        assert_eq!(last.id, full.id);

        mark_being_deleted(&pool, incr.id).await.unwrap();
        assert!(dependents(&pool, full.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphans_are_found_by_age() {
        let pool = crate::db::test_pool().await;
        let client = clients::get_or_create(&pool, "c2").await.unwrap();
        let b = create(
            &pool,
            &NewBackup {
                client_id: client.id,
                kind: BackupKind::FileFull,
                path: "/tmp/x".into(),
                parent_id: None,
            },
        )
        .await
        .unwrap();

        // Fresh rows are not orphans yet.
        assert!(incomplete_older_than(&pool, 300).await.unwrap().is_empty());
        // With a zero grace period the in-flight row qualifies.
        let orphans = incomplete_older_than(&pool, 0).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, b.id);
    }
}
