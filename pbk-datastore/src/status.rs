//! Backup status transitions.
//!
//! All legal transitions are listed in [`TRANSITIONS`]. Everything not in the table is rejected
//! with [`CatalogError::StatusConflict`].

use std::fmt;

use anyhow::Error;

use pbk_api_types::{BackupId, BackupStatus};

use crate::error::CatalogError;

/// Things that happen to a backup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusEvent {
    /// An operation starts taking the backup.
    Start,
    /// The data copy phase finished.
    CopyDone,
    /// The backup completed and got registered.
    Complete,
    /// The owning operation failed, or its abandoned lock was reclaimed.
    Fail,
    /// Metadata or data failed a check.
    Corrupt,
    /// An ancestor is invalid.
    Orphan,
    /// Validation passed.
    Validated,
    /// A merge claims the backup as part of the chain it folds.
    BeginMerge,
    /// All increments were folded into the backup.
    FinishMerge,
    /// The merged backup took over its final identity.
    FinalizeMerge,
    /// Removal starts.
    BeginDelete,
    /// Data was removed.
    FinishDelete,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusEvent::Start => "start",
            StatusEvent::CopyDone => "copy-done",
            StatusEvent::Complete => "complete",
            StatusEvent::Fail => "fail",
            StatusEvent::Corrupt => "corrupt",
            StatusEvent::Orphan => "orphan",
            StatusEvent::Validated => "validated",
            StatusEvent::BeginMerge => "begin-merge",
            StatusEvent::FinishMerge => "finish-merge",
            StatusEvent::FinalizeMerge => "finalize-merge",
            StatusEvent::BeginDelete => "begin-delete",
            StatusEvent::FinishDelete => "finish-delete",
        };
        f.write_str(text)
    }
}

use BackupStatus as S;
use StatusEvent as E;

/// `(current status, event) -> next status`, `None` is a backup that does not exist yet.
#[rustfmt::skip]
pub const TRANSITIONS: &[(Option<BackupStatus>, StatusEvent, BackupStatus)] = &[
    (None,           E::Start,         S::Running),

    (Some(S::Running),  E::CopyDone,      S::Done),
    (Some(S::Running),  E::Complete,      S::Ok),
    (Some(S::Done),     E::Complete,      S::Ok),
    (Some(S::Running),  E::Fail,          S::Error),
    (Some(S::Done),     E::Fail,          S::Error),

    (Some(S::Done),     E::Validated,     S::Ok),
    (Some(S::Ok),       E::Validated,     S::Ok),
    (Some(S::Orphan),   E::Validated,     S::Ok),

    (Some(S::Done),     E::Corrupt,       S::Corrupt),
    (Some(S::Ok),       E::Corrupt,       S::Corrupt),
    (Some(S::Error),    E::Corrupt,       S::Corrupt),
    (Some(S::Corrupt),  E::Corrupt,       S::Corrupt),
    (Some(S::Orphan),   E::Corrupt,       S::Corrupt),
    (Some(S::Merging),  E::Corrupt,       S::Corrupt),
    (Some(S::Merged),   E::Corrupt,       S::Corrupt),

    (Some(S::Done),     E::Orphan,        S::Orphan),
    (Some(S::Ok),       E::Orphan,        S::Orphan),
    (Some(S::Orphan),   E::Orphan,        S::Orphan),

    (Some(S::Ok),       E::BeginMerge,    S::Merging),
    (Some(S::Merging),  E::BeginMerge,    S::Merging),
    (Some(S::Merging),  E::FinishMerge,   S::Merged),
    (Some(S::Merged),   E::FinishMerge,   S::Merged),
    (Some(S::Merged),   E::FinalizeMerge, S::Ok),

    (Some(S::Done),     E::BeginDelete,   S::Deleting),
    (Some(S::Ok),       E::BeginDelete,   S::Deleting),
    (Some(S::Error),    E::BeginDelete,   S::Deleting),
    (Some(S::Corrupt),  E::BeginDelete,   S::Deleting),
    (Some(S::Orphan),   E::BeginDelete,   S::Deleting),
    (Some(S::Merging),  E::BeginDelete,   S::Deleting),
    (Some(S::Merged),   E::BeginDelete,   S::Deleting),
    (Some(S::Deleting), E::BeginDelete,   S::Deleting),
    (Some(S::Deleting), E::FinishDelete,  S::Deleted),
    (Some(S::Deleted),  E::FinishDelete,  S::Deleted),
];

/// Statuses an operator may set explicitly, and from which status.
#[rustfmt::skip]
pub const OPERATOR_TRANSITIONS: &[(BackupStatus, BackupStatus)] = &[
    (S::Ok,      S::Error),
    (S::Ok,      S::Corrupt),
    (S::Done,    S::Ok),
    (S::Done,    S::Error),
    (S::Error,   S::Ok),
    (S::Error,   S::Corrupt),
    (S::Corrupt, S::Ok),
    (S::Corrupt, S::Error),
    (S::Orphan,  S::Ok),
    (S::Orphan,  S::Error),
];

/// Look up the status `event` leads to from `current`.
pub fn next_status(
    backup_id: BackupId,
    current: Option<BackupStatus>,
    event: StatusEvent,
) -> Result<BackupStatus, Error> {
    TRANSITIONS
        .iter()
        .find(|(from, ev, _)| *from == current && *ev == event)
        .map(|(_, _, to)| *to)
        .ok_or_else(|| {
            CatalogError::StatusConflict {
                backup_id,
                from: current,
                event,
            }
            .into()
        })
}

/// Check an explicit status change requested by an operator.
pub fn check_operator_status(
    backup_id: BackupId,
    current: BackupStatus,
    target: BackupStatus,
) -> Result<(), Error> {
    if current == target
        || OPERATOR_TRANSITIONS
            .iter()
            .any(|(from, to)| *from == current && *to == target)
    {
        return Ok(());
    }
    Err(CatalogError::OperatorStatusConflict {
        backup_id,
        from: current,
        to: target,
    }
    .into())
}
