use std::fmt::Write as _;

use anyhow::Error;
use serde::Serialize;

use pbk_api_types::{BackupId, BackupMode, BackupStatus, LockMode, Lsn, TimeLineId};
use pbk_datastore::{catalog_error, BackupRecord, Catalog, CatalogError, LockOutcome, RunningState};

use super::{is_corruption, mark_corrupt};

/// What `show` reports about one backup.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupSummary {
    pub backup_id: BackupId,
    /// `None` if the control record is missing or unreadable.
    pub status: Option<BackupStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_mode: Option<BackupMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_backup_id: Option<BackupId>,
    pub current_tli: TimeLineId,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub data_bytes: u64,
    pub wal_bytes: u64,
    /// Live locks, as `<mode> by <holder>`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub locks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl BackupSummary {
    fn from_record(record: &BackupRecord) -> Self {
        Self {
            backup_id: record.backup_id,
            status: Some(record.status),
            backup_mode: Some(record.backup_mode),
            parent_backup_id: record.parent_backup_id,
            current_tli: record.current_tli,
            start_lsn: record.start_lsn,
            stop_lsn: record.stop_lsn,
            start_time: record.start_time,
            end_time: record.end_time,
            data_bytes: record.data_bytes,
            wal_bytes: record.wal_bytes,
            locks: Vec::new(),
            note: None,
        }
    }

    fn unreadable(backup_id: BackupId, note: String) -> Self {
        Self {
            backup_id,
            status: None,
            backup_mode: None,
            parent_backup_id: None,
            current_tli: 0,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            start_time: backup_id.start_time(),
            end_time: None,
            data_bytes: 0,
            wal_bytes: 0,
            locks: Vec::new(),
            note: Some(note),
        }
    }
}

/// Summaries of all backups of the catalog, oldest first.
///
/// Backups whose file list turns out damaged are marked `CORRUPT` on the way, if they are
/// not locked by someone else. Backups deleted meanwhile are left out.
pub fn show_backups(catalog: &Catalog) -> Result<Vec<BackupSummary>, Error> {
    let mut list = Vec::new();
    for backup_id in catalog.backup_ids()? {
        match show_backup(catalog, backup_id) {
            Ok(summary) => list.push(summary),
            Err(err)
                if matches!(catalog_error(&err), Some(CatalogError::BackupNotFound { .. })) =>
            {
                log::debug!("backup {backup_id} vanished while listing - {err}");
            }
            Err(err) => return Err(err),
        }
    }
    list.sort_by_key(|summary| (summary.start_time, summary.backup_id));
    Ok(list)
}

pub fn show_backup(catalog: &Catalog, backup_id: BackupId) -> Result<BackupSummary, Error> {
    let mut summary = match catalog.read(backup_id) {
        Ok(record) => {
            let mut summary = BackupSummary::from_record(&record);
            if record.status == BackupStatus::Running {
                summary.note = Some(match catalog.running_state(backup_id)? {
                    RunningState::Active => "backup in progress".to_string(),
                    RunningState::Abandoned => {
                        "owner is gone, will be marked ERROR by the next validate".to_string()
                    }
                });
            }
            summary
        }
        Err(err) if is_control_record_missing(&err) => {
            log::warn!("backup {backup_id}: {err}");
            BackupSummary::unreadable(backup_id, err.to_string())
        }
        Err(err) if is_corruption(&err) => {
            log::warn!("backup {backup_id}: {err}");
            mark_corrupt_if_free(catalog, backup_id);
            match catalog.read_unchecked(backup_id) {
                Ok(record) => {
                    let mut summary = BackupSummary::from_record(&record);
                    summary.note = Some(err.to_string());
                    summary
                }
                Err(_) => BackupSummary::unreadable(backup_id, err.to_string()),
            }
        }
        Err(err) => {
            if matches!(catalog_error(&err), Some(CatalogError::BackupNotFound { .. })) {
                return Err(err);
            }
            log::warn!("backup {backup_id}: {err}");
            BackupSummary::unreadable(backup_id, err.to_string())
        }
    };

    summary.locks = catalog
        .locks()
        .live_locks(backup_id)?
        .iter()
        .map(|info| format!("{} by {}", info.file.mode, info.holder_description()))
        .collect();
    Ok(summary)
}

fn is_control_record_missing(err: &Error) -> bool {
    matches!(
        catalog_error(err),
        Some(CatalogError::MissingControlFile { file, .. })
            if file == pbk_api_types::BACKUP_CONTROL_FILE
    )
}

fn mark_corrupt_if_free(catalog: &Catalog, backup_id: BackupId) {
    match catalog.locks().try_lock(backup_id, LockMode::Shared, None) {
        Ok(LockOutcome::Acquired(guard)) => mark_corrupt(catalog, backup_id, &guard),
        Ok(_) => log::warn!("backup {backup_id} is locked, not marking it CORRUPT"),
        Err(err) => log::error!("unable to lock backup {backup_id} - {err}"),
    }
}

/// Render summaries as a plain text table.
pub fn render_text(list: &[BackupSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<8} {:<6} {:<8} {:>4} {:<18} {:<18} {:<8} {}",
        "ID", "MODE", "STATUS", "TLI", "START LSN", "STOP LSN", "PARENT", "NOTE"
    );
    for summary in list {
        let text = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());
        let mut note = summary.note.clone().unwrap_or_default();
        if !summary.locks.is_empty() {
            if !note.is_empty() {
                note.push_str("; ");
            }
            note.push_str(&format!("locked: {}", summary.locks.join(", ")));
        }
        let _ = writeln!(
            out,
            "{:<8} {:<6} {:<8} {:>4} {:<18} {:<18} {:<8} {}",
            summary.backup_id.to_string(),
            text(summary.backup_mode.map(|mode| mode.to_string())),
            text(summary.status.map(|status| status.to_string())),
            summary.current_tli,
            summary.start_lsn.to_string(),
            summary.stop_lsn.to_string(),
            text(summary.parent_backup_id.map(|id| id.to_string())),
            note,
        );
    }
    out
}

pub fn render_json(list: &[BackupSummary]) -> Result<String, Error> {
    Ok(serde_json::to_string_pretty(list)?)
}

/// Set the status of a backup on operator request.
pub fn set_backup_status(
    catalog: &Catalog,
    backup_id: BackupId,
    status: BackupStatus,
) -> Result<BackupRecord, Error> {
    let guard = catalog.lock_for_update(backup_id, LockMode::Exclusive)?;
    let mut record = catalog.read_unchecked(backup_id)?;
    catalog.set_operator_status(&mut record, status, &guard)?;
    Ok(record)
}
