use std::fmt;

use anyhow::{bail, Error};

use pbk_api_types::{BackupId, BackupStatus, LockMode};
use pbk_datastore::chain::{chain_state, ChainState};
use pbk_datastore::{
    catalog_error, BackupLockGuard, BackupRecord, Catalog, CatalogError, LockOutcome,
    StatusEvent,
};

use super::{check_file, copy_with_crc, is_corruption, mark_corrupt};

#[derive(Clone, Debug)]
pub struct VerifyOptions {
    /// Check that the WAL needed by non-stream backups is archived.
    pub check_wal: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self { check_wal: true }
    }
}

/// Result of validating one backup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Valid, status is `OK` now.
    Ok,
    /// Not checked because another operation holds a conflicting lock.
    Skipped(String),
    /// A `RUNNING` backup without owner, marked `ERROR`.
    Reclaimed,
    /// Failed a check, marked `CORRUPT`.
    Corrupt(String),
    /// An ancestor is invalid, marked `ORPHAN`.
    Orphan(String),
    /// Not usable and left as it is (e.g. `ERROR`, interrupted merge or delete).
    Failed(String),
}

impl VerifyOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            VerifyOutcome::Reclaimed
                | VerifyOutcome::Corrupt(_)
                | VerifyOutcome::Orphan(_)
                | VerifyOutcome::Failed(_)
        )
    }
}

impl fmt::Display for VerifyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyOutcome::Ok => write!(f, "OK"),
            VerifyOutcome::Skipped(reason) => write!(f, "SKIPPED - {reason}"),
            VerifyOutcome::Reclaimed => write!(f, "ERROR - abandoned by its owner"),
            VerifyOutcome::Corrupt(reason) => write!(f, "CORRUPT - {reason}"),
            VerifyOutcome::Orphan(reason) => write!(f, "ORPHAN - {reason}"),
            VerifyOutcome::Failed(reason) => write!(f, "FAILED - {reason}"),
        }
    }
}

/// Outcome of every validated backup.
#[derive(Clone, Debug, Default)]
pub struct VerifyReport {
    pub outcomes: Vec<(BackupId, VerifyOutcome)>,
}

impl VerifyReport {
    pub fn outcome(&self, backup_id: BackupId) -> Option<&VerifyOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == backup_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn failed(&self) -> Vec<BackupId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_failure())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Aggregate error if any backup failed validation.
    pub fn check(&self) -> Result<(), Error> {
        let failed = self.failed();
        if failed.is_empty() {
            return Ok(());
        }
        let list: Vec<String> = failed.iter().map(|id| id.to_string()).collect();
        bail!(
            "validation failed for {} of {} backups: {}",
            failed.len(),
            self.outcomes.len(),
            list.join(", ")
        );
    }
}

/// Validate a single backup.
///
/// Returns an error if the backup failed validation or if it is busy.
pub fn verify_backup(
    catalog: &Catalog,
    backup_id: BackupId,
    options: &VerifyOptions,
) -> Result<VerifyOutcome, Error> {
    let list = catalog.list()?;
    let outcome = match lock_for_verify(catalog, backup_id)? {
        Ok(guard) => verify_backup_with_lock(catalog, backup_id, &list, options, &guard)?,
        Err(reason) => VerifyOutcome::Skipped(reason),
    };
    log::info!("backup {backup_id}: {outcome}");
    if outcome.is_failure() {
        bail!("backup {backup_id} failed validation: {outcome}");
    }
    Ok(outcome)
}

/// Validate every backup of the catalog, oldest first.
///
/// Statuses found on the way are used for the following backups, so the descendants of a
/// backup that turns out corrupt become orphans in the same run.
pub fn verify_all_backups(catalog: &Catalog, options: &VerifyOptions) -> Result<VerifyReport, Error> {
    let mut report = VerifyReport::default();
    let mut list = catalog.list()?;

    log::info!(
        "validating {} backups of instance '{}'",
        list.len(),
        catalog.name()
    );

    // backups without readable control record cannot be marked, only reported
    for backup_id in catalog.backup_ids()? {
        if list.iter().any(|record| record.backup_id == backup_id) {
            continue;
        }
        if let Err(err) = catalog.read_unchecked(backup_id) {
            log::warn!("backup {backup_id}: {err}");
            report
                .outcomes
                .push((backup_id, VerifyOutcome::Failed(err.to_string())));
        }
    }

    for idx in 0..list.len() {
        let backup_id = list[idx].backup_id;
        let outcome = match lock_for_verify(catalog, backup_id) {
            Ok(Ok(guard)) => verify_backup_with_lock(catalog, backup_id, &list, options, &guard),
            Ok(Err(reason)) => Ok(VerifyOutcome::Skipped(reason)),
            Err(err) => Err(err),
        };
        let outcome = outcome.unwrap_or_else(|err| VerifyOutcome::Failed(err.to_string()));

        match outcome {
            VerifyOutcome::Skipped(ref reason) => {
                log::warn!("SKIPPED: validate backup {backup_id} - {reason}")
            }
            ref outcome if outcome.is_failure() => log::error!("backup {backup_id}: {outcome}"),
            ref outcome => log::info!("backup {backup_id}: {outcome}"),
        }

        if let Ok(record) = catalog.read_unchecked(backup_id) {
            list[idx].status = record.status;
        }
        report.outcomes.push((backup_id, outcome));
    }

    Ok(report)
}

/// Shared lock for validation. The inner error is the reason to skip a busy backup.
fn lock_for_verify(
    catalog: &Catalog,
    backup_id: BackupId,
) -> Result<Result<BackupLockGuard, String>, Error> {
    match catalog
        .locks()
        .try_lock(backup_id, LockMode::Shared, catalog.config().wait_timeout())?
    {
        LockOutcome::Acquired(guard) => Ok(Ok(guard)),
        LockOutcome::Conflict(holder) | LockOutcome::TimedOut(holder) => Ok(Err(format!(
            "cannot lock, {} lock held by {}",
            holder.file.mode,
            holder.holder_description()
        ))),
    }
}

fn verify_backup_with_lock(
    catalog: &Catalog,
    backup_id: BackupId,
    list: &[BackupRecord],
    options: &VerifyOptions,
    guard: &BackupLockGuard,
) -> Result<VerifyOutcome, Error> {
    let mut record = catalog.read_unchecked(backup_id)?;

    match record.status {
        BackupStatus::Running => {
            // we hold a lock, so there is no live exclusive holder
            catalog.reclaim_abandoned(&mut record, guard)?;
            return Ok(VerifyOutcome::Reclaimed);
        }
        BackupStatus::Merging | BackupStatus::Merged => {
            return Ok(VerifyOutcome::Failed(
                "interrupted merge, run the merge again".to_string(),
            ));
        }
        BackupStatus::Deleting | BackupStatus::Deleted => {
            return Ok(VerifyOutcome::Failed(
                "interrupted delete, run the delete again".to_string(),
            ));
        }
        BackupStatus::Error | BackupStatus::Corrupt => {
            return Ok(VerifyOutcome::Failed(format!("status is {}", record.status)));
        }
        BackupStatus::Done | BackupStatus::Ok | BackupStatus::Orphan => {}
    }

    if let Err(err) = check_backup_data(catalog, &record, options) {
        if is_corruption(&err) || is_missing_wal(&err) || is_bad_file(&err) {
            mark_corrupt(catalog, backup_id, guard);
            return Ok(VerifyOutcome::Corrupt(err.to_string()));
        }
        return Err(err);
    }

    match chain_state(list, backup_id) {
        ChainState::Valid => {
            catalog.set_status(&mut record, StatusEvent::Validated, guard)?;
            Ok(VerifyOutcome::Ok)
        }
        ChainState::Invalid(ancestor) => {
            let status = list
                .iter()
                .find(|backup| backup.backup_id == ancestor)
                .map(|backup| backup.status.to_string())
                .unwrap_or_default();
            catalog.set_status(&mut record, StatusEvent::Orphan, guard)?;
            Ok(VerifyOutcome::Orphan(format!(
                "ancestor {ancestor} has status {status}"
            )))
        }
        ChainState::Broken => {
            catalog.set_status(&mut record, StatusEvent::Orphan, guard)?;
            Ok(VerifyOutcome::Orphan("parent chain is broken".to_string()))
        }
    }
}

/// Marker for stored files that do not match their file list entry.
#[derive(Debug)]
struct BadFile(String);

impl fmt::Display for BadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for BadFile {}

fn is_bad_file(err: &Error) -> bool {
    err.downcast_ref::<BadFile>().is_some()
}

fn is_missing_wal(err: &Error) -> bool {
    matches!(catalog_error(err), Some(CatalogError::WalMissing { .. }))
}

/// Check file list, stored files and WAL of a backup.
fn check_backup_data(
    catalog: &Catalog,
    record: &BackupRecord,
    options: &VerifyOptions,
) -> Result<(), Error> {
    let backup_id = record.backup_id;
    let content = catalog.read_content(record)?;
    let database = catalog.database_path(backup_id);

    for entry in content.files().iter().filter(|entry| !entry.unchanged) {
        let path = database.join(&entry.path);
        let mut reader = match catalog.storage().open(&path) {
            Ok(reader) => reader,
            Err(err) => return Err(BadFile(format!("file {} - {err}", entry.path)).into()),
        };
        let (size, crc) = copy_with_crc(&mut reader, &mut std::io::sink())?;
        if let Err(err) = check_file(backup_id, entry, size, crc) {
            return Err(BadFile(err.to_string()).into());
        }
    }

    if options.check_wal && !record.stream {
        catalog.wal_archive().check_range(
            backup_id,
            record.current_tli,
            record.start_lsn,
            record.stop_lsn,
        )?;
    }
    Ok(())
}
