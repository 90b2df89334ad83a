//! Database models for the backup index.
//!
//! Row structs map directly to the schema; numeric columns stay numeric.

use chrono::{DateTime, Utc};

// =============================================================================
// Backup kind
// =============================================================================

/// Matches the `kind` column in the `backups` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum BackupKind {
    FileFull = 0,
    FileIncr = 1,
    ImageFull = 2,
    ImageIncr = 3,
}

impl BackupKind {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(BackupKind::FileFull),
            1 => Some(BackupKind::FileIncr),
            2 => Some(BackupKind::ImageFull),
            3 => Some(BackupKind::ImageIncr),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackupKind::FileFull => "file_full",
            BackupKind::FileIncr => "file_incr",
            BackupKind::ImageFull => "image_full",
            BackupKind::ImageIncr => "image_incr",
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, BackupKind::ImageFull | BackupKind::ImageIncr)
    }

    pub fn is_full(&self) -> bool {
        matches!(self, BackupKind::FileFull | BackupKind::ImageFull)
    }

    /// The incremental kind depending on this full kind.
    pub fn incremental(&self) -> BackupKind {
        if self.is_image() {
            BackupKind::ImageIncr
        } else {
            BackupKind::FileIncr
        }
    }
}

// =============================================================================
// Clients
// =============================================================================

/// A backed-up host, with its retention limits and usage counters.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClientRow {
    pub id: i64,
    pub name: String,
    pub addr: Option<String>,
    pub bytes_used_files: i64,
    pub bytes_used_images: i64,
    pub min_file_full: i64,
    pub max_file_full: i64,
    pub min_file_incr: i64,
    pub max_file_incr: i64,
    pub min_image_full: i64,
    pub max_image_full: i64,
    pub min_image_incr: i64,
    pub max_image_incr: i64,
    /// Backup frequencies in seconds.
    pub update_freq_full: i64,
    pub update_freq_incr: i64,
    pub update_freq_image_full: i64,
    pub update_freq_image_incr: i64,
    /// Change-block tracking file of the latest completed image backup.
    pub cbt_path: Option<String>,
    pub cbt_backup_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl ClientRow {
    /// (min, max) retention bounds for a backup kind.
    pub fn retention(&self, kind: BackupKind) -> (i64, i64) {
        match kind {
            BackupKind::FileFull => (self.min_file_full, self.max_file_full),
            BackupKind::FileIncr => (self.min_file_incr, self.max_file_incr),
            BackupKind::ImageFull => (self.min_image_full, self.max_image_full),
            BackupKind::ImageIncr => (self.min_image_incr, self.max_image_incr),
        }
    }

    pub fn update_freq(&self, kind: BackupKind) -> i64 {
        match kind {
            BackupKind::FileFull => self.update_freq_full,
            BackupKind::FileIncr => self.update_freq_incr,
            BackupKind::ImageFull => self.update_freq_image_full,
            BackupKind::ImageIncr => self.update_freq_image_incr,
        }
    }
}

// =============================================================================
// Backups
// =============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BackupRow {
    pub id: i64,
    pub client_id: i64,
    pub kind: i64,
    pub start_time: DateTime<Utc>,
    pub duration_secs: i64,
    /// Root of the backup tree (file backups) or the VHD path (images).
    pub path: String,
    pub size_bytes: i64,
    pub complete: i64,
    pub done: i64,
    pub parent_id: Option<i64>,
    pub being_deleted: i64,
    pub created_at: DateTime<Utc>,
}

impl BackupRow {
    pub fn kind(&self) -> BackupKind {
        BackupKind::from_i64(self.kind).unwrap_or(BackupKind::FileFull)
    }

    pub fn is_complete(&self) -> bool {
        self.complete != 0
    }
}

/// Input for creating a backup row.
#[derive(Debug, Clone)]
pub struct NewBackup {
    pub client_id: i64,
    pub kind: BackupKind,
    pub path: String,
    pub parent_id: Option<i64>,
}

// =============================================================================
// File entries
// =============================================================================

/// One row of the content-addressed index. `rsize` carries the logical size
/// for exactly one member of each (hash, filesize) class; hardlinked
/// duplicates carry 0.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRow {
    pub id: i64,
    pub backup_id: i64,
    pub client_id: i64,
    pub fullpath: String,
    pub hash: Vec<u8>,
    pub filesize: i64,
    pub rsize: i64,
    pub created_at: DateTime<Utc>,
    /// 1 when the row still lives in the staging table.
    pub staged: i64,
}

impl FileRow {
    pub fn is_staged(&self) -> bool {
        self.staged != 0
    }
}

#[derive(Debug, Clone)]
pub struct NewFileEntry {
    pub backup_id: i64,
    pub client_id: i64,
    pub fullpath: String,
    pub hash: Vec<u8>,
    pub filesize: i64,
    pub rsize: i64,
}

// =============================================================================
// Deletion stats
// =============================================================================

/// UI-facing record of a deleted backup.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DelStatRow {
    pub id: i64,
    pub backup_id: i64,
    pub client_id: i64,
    pub kind: i64,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}
