//! The content-addressed file index: the `files` table plus its `files_tmp`
//! staging twin. Lookups consult both; the store's flusher batch-copies
//! staged rows into the main table.

use super::models::{FileRow, NewFileEntry};
use super::DbPool;

const FILE_COLUMNS: &str = "id, backup_id, client_id, fullpath, hash, filesize, rsize, created_at";

fn union_select(where_clause: &str) -> String {
    format!(
        "SELECT {FILE_COLUMNS}, 0 AS staged FROM files WHERE {where_clause} \
         UNION ALL \
         SELECT {FILE_COLUMNS}, 1 AS staged FROM files_tmp WHERE {where_clause}"
    )
}

/// Insert a new entry into the staging table.
pub async fn stage_insert(pool: &DbPool, entry: &NewFileEntry) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO files_tmp (backup_id, client_id, fullpath, hash, filesize, rsize) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(entry.backup_id)
    .bind(entry.client_id)
    .bind(&entry.fullpath)
    .bind(&entry.hash)
    .bind(entry.filesize)
    .bind(entry.rsize)
    .execute(pool)
    .await?;
    Ok(())
}

/// All entries of one (hash, size) class, newest first. The dedup lookup
/// walks these until a hardlink source works.
pub async fn candidates(pool: &DbPool, hash: &[u8], filesize: i64) -> anyhow::Result<Vec<FileRow>> {
    let sql = format!(
        "{} ORDER BY created_at DESC, staged DESC, id DESC",
        union_select("hash = ?1 AND filesize = ?2")
    );
    let rows = sqlx::query_as::<_, FileRow>(&sql)
        .bind(hash)
        .bind(filesize)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Entries owned by one backup; the deletion sequence releases each.
pub async fn rows_for_backup(pool: &DbPool, backup_id: i64) -> anyhow::Result<Vec<FileRow>> {
    let sql = format!("{} ORDER BY staged, id", union_select("backup_id = ?1"));
    let rows = sqlx::query_as::<_, FileRow>(&sql)
        .bind(backup_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

fn table_of(staged: bool) -> &'static str {
    if staged {
        "files_tmp"
    } else {
        "files"
    }
}

pub async fn delete_entry(pool: &DbPool, id: i64, staged: bool) -> anyhow::Result<()> {
    sqlx::query(&format!("DELETE FROM {} WHERE id = ?1", table_of(staged)))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_rsize(pool: &DbPool, id: i64, staged: bool, rsize: i64) -> anyhow::Result<()> {
    sqlx::query(&format!("UPDATE {} SET rsize = ?2 WHERE id = ?1", table_of(staged)))
        .bind(id)
        .bind(rsize)
        .execute(pool)
        .await?;
    Ok(())
}

/// Oldest surviving member of a (hash, size) class, excluding one row;
/// the rsize moves here when its holder goes away.
pub async fn oldest_classmate(
    pool: &DbPool,
    hash: &[u8],
    filesize: i64,
    excluding_id: i64,
    excluding_staged: bool,
) -> anyhow::Result<Option<FileRow>> {
    let sql = format!(
        "{} ORDER BY created_at ASC, staged ASC, id ASC",
        union_select("hash = ?1 AND filesize = ?2")
    );
    let rows = sqlx::query_as::<_, FileRow>(&sql)
        .bind(hash)
        .bind(filesize)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .find(|r| !(r.id == excluding_id && r.is_staged() == excluding_staged)))
}

pub async fn staging_count(pool: &DbPool) -> anyhow::Result<i64> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files_tmp")
        .fetch_one(pool)
        .await?;
    Ok(count.0)
}

/// Batch-copy the staging table into `files` and clear it.
pub async fn flush_staging(pool: &DbPool) -> anyhow::Result<u64> {
    let mut tx = pool.begin().await?;
    let copied = sqlx::query(
        "INSERT INTO files (backup_id, client_id, fullpath, hash, filesize, rsize, created_at) \
         SELECT backup_id, client_id, fullpath, hash, filesize, rsize, created_at FROM files_tmp",
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();
    sqlx::query("DELETE FROM files_tmp").execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(copied)
}

/// Per-client logical usage: every distinct content the client references
/// counts once at full size, regardless of who holds the reference size.
pub async fn logical_bytes_used(pool: &DbPool, client_id: i64) -> anyhow::Result<i64> {
    let sum: (Option<i64>,) = sqlx::query_as(
        "SELECT CAST(COALESCE(SUM(filesize), 0) AS BIGINT) FROM ( \
             SELECT DISTINCT hash, filesize FROM ( \
                 SELECT hash, filesize FROM files WHERE client_id = ?1 \
                 UNION ALL \
                 SELECT hash, filesize FROM files_tmp WHERE client_id = ?1 \
             ) \
         )",
    )
    .bind(client_id)
    .fetch_one(pool)
    .await?;
    Ok(sum.0.unwrap_or(0))
}

/// Sum of rsize for one (hash, size) class across both tables; the dedup
/// invariant says this equals `filesize` while any row exists.
pub async fn class_rsize_sum(pool: &DbPool, hash: &[u8], filesize: i64) -> anyhow::Result<i64> {
    let rows = candidates(pool, hash, filesize).await?;
    Ok(rows.iter().map(|r| r.rsize).sum())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(backup_id: i64, hash: u8, rsize: i64) -> NewFileEntry {
        NewFileEntry {
            backup_id,
            client_id: 1,
            fullpath: format!("/b{backup_id}/f{hash}"),
            hash: vec![hash; 64],
            filesize: 100,
            rsize,
        }
    }

    #[tokio::test]
    async fn staged_rows_are_visible_and_flushable() {
        let pool = crate::db::test_pool().await;
        stage_insert(&pool, &entry(1, 0xAB, 100)).await.unwrap();

        let found = candidates(&pool, &[0xAB; 64], 100).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].is_staged());

        assert_eq!(flush_staging(&pool).await.unwrap(), 1);
        assert_eq!(staging_count(&pool).await.unwrap(), 0);

        let found = candidates(&pool, &[0xAB; 64], 100).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(!found[0].is_staged());
    }

    #[tokio::test]
    async fn class_sum_tracks_rsize_moves() {
        let pool = crate::db::test_pool().await;
        stage_insert(&pool, &entry(1, 0xCD, 100)).await.unwrap();
        stage_insert(&pool, &entry(2, 0xCD, 0)).await.unwrap();
        flush_staging(&pool).await.unwrap();

        assert_eq!(class_rsize_sum(&pool, &[0xCD; 64], 100).await.unwrap(), 100);

        let rows = candidates(&pool, &[0xCD; 64], 100).await.unwrap();
        let holder = rows.iter().find(|r| r.rsize > 0).unwrap();
        let other = oldest_classmate(&pool, &[0xCD; 64], 100, holder.id, holder.is_staged())
            .await
            .unwrap()
            .unwrap();
        set_rsize(&pool, other.id, other.is_staged(), holder.rsize).await.unwrap();
        delete_entry(&pool, holder.id, holder.is_staged()).await.unwrap();

        assert_eq!(class_rsize_sum(&pool, &[0xCD; 64], 100).await.unwrap(), 100);
    }
}
