pub mod backups;
pub mod clients;
pub mod files;
pub mod models;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

pub type DbPool = Pool<Sqlite>;

pub use models::{BackupKind, BackupRow, ClientRow, DelStatRow, FileRow, NewBackup, NewFileEntry};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Run database migrations using SQLx's built-in migration tracking.
pub async fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Server statistics
pub struct Stats {
    pub total_clients: i64,
    pub total_backups: i64,
    pub total_file_entries: i64,
    pub total_backup_bytes: i64,
}

/// Get server statistics
pub async fn get_stats(pool: &DbPool) -> anyhow::Result<Stats> {
    let total_clients: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM clients")
        .fetch_one(pool)
        .await?;

    let total_backups: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backups")
        .fetch_one(pool)
        .await?;

    let total_file_entries: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
        .fetch_one(pool)
        .await?;

    let total_backup_bytes: (Option<i64>,) =
        sqlx::query_as("SELECT CAST(COALESCE(SUM(size_bytes), 0) AS BIGINT) FROM backups WHERE complete = 1")
            .fetch_one(pool)
            .await?;

    Ok(Stats {
        total_clients: total_clients.0,
        total_backups: total_backups.0,
        total_file_entries: total_file_entries.0,
        total_backup_bytes: total_backup_bytes.0.unwrap_or(0),
    })
}

#[cfg(test)]
pub async fn test_pool() -> DbPool {
    // A shared-cache in-memory database keeps every pool connection on the
    // same data.
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .shared_cache(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
