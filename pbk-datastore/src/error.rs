//! Typed catalog errors.
//!
//! Functions return `anyhow::Error`. Failures callers have to react on are created from
//! [`CatalogError`] so they can be told apart with `downcast_ref`.

use pbk_api_types::{BackupId, BackupStatus, Lsn, TimeLineId};

use crate::status::StatusEvent;

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("backup {backup_id} is locked by {holder} ({mode}) - {hint}")]
    LockConflict {
        backup_id: BackupId,
        holder: String,
        mode: pbk_api_types::LockMode,
        hint: String,
    },
    #[error("timeout while waiting for lock on backup {backup_id} held by {holder}")]
    LockTimeout { backup_id: BackupId, holder: String },
    #[error("lost lock {lock} on backup {backup_id} - lock file vanished or was taken over")]
    LockLost { backup_id: BackupId, lock: String },
    #[error("backup {backup_id}: status {} does not allow {event}", status_text(.from))]
    StatusConflict {
        backup_id: BackupId,
        from: Option<BackupStatus>,
        event: StatusEvent,
    },
    #[error("backup {backup_id}: status {from} cannot be changed to {to} by the operator")]
    OperatorStatusConflict {
        backup_id: BackupId,
        from: BackupStatus,
        to: BackupStatus,
    },
    #[error("backup {backup_id}: {what} checksum mismatch (expected {expected:08x}, got {actual:08x})")]
    CrcMismatch {
        backup_id: BackupId,
        what: String,
        expected: u32,
        actual: u32,
    },
    #[error("backup {backup_id}: missing control file {file}")]
    MissingControlFile { backup_id: BackupId, file: String },
    #[error("backup {backup_id} does not exist")]
    BackupNotFound { backup_id: BackupId },
    #[error("backup {backup_id}: broken chain - {reason}")]
    BrokenChain { backup_id: BackupId, reason: String },
    #[error("no valid full backup found on timeline {timeline} or its ancestors")]
    NoValidFullBackup { timeline: TimeLineId },
    #[error(
        "backup from the past: start LSN {start_lsn} on timeline {timeline} is before stop LSN \
         {parent_stop_lsn} of parent backup {parent}"
    )]
    BackupFromThePast {
        parent: BackupId,
        parent_stop_lsn: Lsn,
        start_lsn: Lsn,
        timeline: TimeLineId,
    },
    #[error("backup {backup_id} has dependent backups: {children}")]
    HasDependents { backup_id: BackupId, children: String },
    #[error("backup {backup_id}: WAL segment {segment} is missing from the archive")]
    WalMissing { backup_id: BackupId, segment: String },
}

fn status_text(status: &Option<BackupStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "(none)".to_string(),
    }
}

impl CatalogError {
    /// Process exit code for an operation failing with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CatalogError::LockConflict { .. } => 3,
            CatalogError::LockTimeout { .. } => 4,
            CatalogError::LockLost { .. } => 5,
            CatalogError::StatusConflict { .. }
            | CatalogError::OperatorStatusConflict { .. } => 6,
            CatalogError::CrcMismatch { .. } | CatalogError::MissingControlFile { .. } => 7,
            CatalogError::BrokenChain { .. } | CatalogError::NoValidFullBackup { .. } => 8,
            CatalogError::BackupFromThePast { .. } => 9,
            CatalogError::HasDependents { .. } => 10,
            CatalogError::WalMissing { .. } => 11,
            CatalogError::BackupNotFound { .. } => 12,
        }
    }

    /// Metadata corruption, the backup has to be marked `CORRUPT`.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CatalogError::CrcMismatch { .. } | CatalogError::MissingControlFile { .. }
        )
    }

    /// Another live holder got in the way.
    pub fn is_lock_busy(&self) -> bool {
        matches!(
            self,
            CatalogError::LockConflict { .. } | CatalogError::LockTimeout { .. }
        )
    }
}

/// Classify an error as one of the catalog errors, if it is one.
pub fn catalog_error(err: &anyhow::Error) -> Option<&CatalogError> {
    err.downcast_ref::<CatalogError>()
}
