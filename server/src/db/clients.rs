use super::models::ClientRow;
use super::DbPool;

const CLIENT_COLUMNS: &str = "id, name, addr, bytes_used_files, bytes_used_images, \
     min_file_full, max_file_full, min_file_incr, max_file_incr, \
     min_image_full, max_image_full, min_image_incr, max_image_incr, \
     update_freq_full, update_freq_incr, update_freq_image_full, update_freq_image_incr, \
     cbt_path, cbt_backup_id, created_at";

/// Fetch a client by name, creating it with default settings on first sight.
pub async fn get_or_create(pool: &DbPool, name: &str) -> anyhow::Result<ClientRow> {
    sqlx::query("INSERT OR IGNORE INTO clients (name) VALUES (?1)")
        .bind(name)
        .execute(pool)
        .await?;

    let client = sqlx::query_as::<_, ClientRow>(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients WHERE name = ?1"
    ))
    .bind(name)
    .fetch_one(pool)
    .await?;

    Ok(client)
}

pub async fn get(pool: &DbPool, id: i64) -> anyhow::Result<Option<ClientRow>> {
    let client = sqlx::query_as::<_, ClientRow>(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(client)
}

pub async fn list(pool: &DbPool) -> anyhow::Result<Vec<ClientRow>> {
    let clients = sqlx::query_as::<_, ClientRow>(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients ORDER BY name"
    ))
    .fetch_all(pool)
    .await?;

    Ok(clients)
}

pub async fn set_addr(pool: &DbPool, id: i64, addr: &str) -> anyhow::Result<()> {
    sqlx::query("UPDATE clients SET addr = ?2 WHERE id = ?1")
        .bind(id)
        .bind(addr)
        .execute(pool)
        .await?;
    Ok(())
}

/// Adjust the usage counters after a backup lands or is deleted.
pub async fn add_usage(
    pool: &DbPool,
    id: i64,
    files_delta: i64,
    images_delta: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE clients SET bytes_used_files = MAX(0, bytes_used_files + ?2), \
         bytes_used_images = MAX(0, bytes_used_images + ?3) WHERE id = ?1",
    )
    .bind(id)
    .bind(files_delta)
    .bind(images_delta)
    .execute(pool)
    .await?;
    Ok(())
}

/// Overwrite the usage counters; the stats rebuild uses this.
pub async fn set_usage(pool: &DbPool, id: i64, files: i64, images: i64) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE clients SET bytes_used_files = ?2, bytes_used_images = ?3 WHERE id = ?1",
    )
    .bind(id)
    .bind(files)
    .bind(images)
    .execute(pool)
    .await?;
    Ok(())
}

/// Hand CBT ownership to a newly completed image backup.
pub async fn set_cbt(
    pool: &DbPool,
    id: i64,
    cbt_path: Option<&str>,
    cbt_backup_id: Option<i64>,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE clients SET cbt_path = ?2, cbt_backup_id = ?3 WHERE id = ?1")
        .bind(id)
        .bind(cbt_path)
        .bind(cbt_backup_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_retention(
    pool: &DbPool,
    id: i64,
    kind: super::BackupKind,
    min: i64,
    max: i64,
) -> anyhow::Result<()> {
    let (min_col, max_col) = match kind {
        super::BackupKind::FileFull => ("min_file_full", "max_file_full"),
        super::BackupKind::FileIncr => ("min_file_incr", "max_file_incr"),
        super::BackupKind::ImageFull => ("min_image_full", "max_image_full"),
        super::BackupKind::ImageIncr => ("min_image_incr", "max_image_incr"),
    };
    sqlx::query(&format!(
        "UPDATE clients SET {min_col} = ?2, {max_col} = ?3 WHERE id = ?1"
    ))
    .bind(id)
    .bind(min)
    .bind(max)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_idempotent() {
        let pool = crate::db::test_pool().await;
        let a = get_or_create(&pool, "alpha").await.unwrap();
        let b = get_or_create(&pool, "alpha").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.max_file_full, 10);
    }

    #[tokio::test]
    async fn usage_never_goes_negative() {
        let pool = crate::db::test_pool().await;
        let c = get_or_create(&pool, "c").await.unwrap();
        add_usage(&pool, c.id, 100, 0).await.unwrap();
        add_usage(&pool, c.id, -500, 0).await.unwrap();
        let c = get(&pool, c.id).await.unwrap().unwrap();
        assert_eq!(c.bytes_used_files, 0);
    }
}
