use std::collections::BTreeMap;

use anyhow::{bail, Error};

use pbk_api_types::{BackupId, BackupStatus, LockMode};
use pbk_datastore::chain::{descendants, find_backup};
use pbk_datastore::{
    catalog_error, BackupLockGuard, BackupRecord, Catalog, CatalogError, LockOutcome,
    LockRenewer, StatusEvent,
};

use super::lock_backups;

/// Delete a backup, and with `cascade` everything built on top of it.
///
/// Returns the deleted backup ids, newest first. A backup is only removed from disk after
/// `DELETING` has been recorded for it, so an interrupted delete can be finished later.
pub fn delete_backup(
    catalog: &Catalog,
    backup_id: BackupId,
    cascade: bool,
) -> Result<Vec<BackupId>, Error> {
    let list = catalog.list()?;
    if find_backup(&list, backup_id).is_none() {
        return delete_unreadable(catalog, backup_id);
    }

    let victims = victims(&list, backup_id, cascade)?;
    let guards = lock_backups(catalog, &victims, LockMode::Exclusive)?;

    // the catalog may have changed before all locks were granted
    let relisted = victims_under_lock(catalog, backup_id, cascade)?;
    if relisted != victims {
        bail!("backups depending on {backup_id} changed while locking, please retry");
    }

    let guard_refs: Vec<&BackupLockGuard> = guards.iter().collect();
    let renewer = LockRenewer::spawn(
        catalog.locks(),
        &guard_refs,
        catalog.config().renew_interval(),
    )?;

    for guard in guards.iter() {
        renewer.check()?;
        let mut record = catalog.read_unchecked(guard.backup_id())?;
        // we hold the exclusive lock, so nobody is taking this backup anymore
        catalog.reclaim_abandoned(&mut record, guard)?;
        delete_locked(catalog, &mut record, guard)?;
    }

    log::info!(
        "deleted {} backup(s) of instance '{}'",
        victims.len(),
        catalog.name()
    );
    Ok(victims)
}

fn victims(list: &[BackupRecord], backup_id: BackupId, cascade: bool) -> Result<Vec<BackupId>, Error> {
    let dependents: Vec<&BackupRecord> = descendants(list, backup_id)
        .into_iter()
        .filter(|backup| {
            !matches!(backup.status, BackupStatus::Deleting | BackupStatus::Deleted)
        })
        .collect();

    if !cascade && !dependents.is_empty() {
        let children: Vec<String> = dependents
            .iter()
            .map(|backup| backup.backup_id.to_string())
            .collect();
        return Err(CatalogError::HasDependents {
            backup_id,
            children: children.join(", "),
        }
        .into());
    }

    let mut victims = vec![backup_id];
    victims.extend(dependents.iter().map(|backup| backup.backup_id));
    // children go before their parents
    victims.reverse();
    Ok(victims)
}

fn victims_under_lock(
    catalog: &Catalog,
    backup_id: BackupId,
    cascade: bool,
) -> Result<Vec<BackupId>, Error> {
    let list = catalog.list()?;
    if find_backup(&list, backup_id).is_none() {
        return Err(CatalogError::BackupNotFound { backup_id }.into());
    }
    victims(&list, backup_id, cascade)
}

/// A backup directory without readable control record: nothing can depend on it anymore.
fn delete_unreadable(catalog: &Catalog, backup_id: BackupId) -> Result<Vec<BackupId>, Error> {
    let err = match catalog.read_unchecked(backup_id) {
        Ok(_) => bail!("backup {backup_id} appeared while listing the catalog, please retry"),
        Err(err) => err,
    };
    match catalog_error(&err) {
        Some(CatalogError::MissingControlFile { .. }) => {}
        _ => return Err(err),
    }

    let _guard = catalog
        .locks()
        .acquire(backup_id, LockMode::Exclusive, catalog.config().wait_timeout())?;
    log::warn!("backup {backup_id} has no control record, removing its directory");
    catalog.remove_backup_dir(backup_id)?;
    Ok(vec![backup_id])
}

/// Drive one backup through `DELETING` and `DELETED` and remove it, the exclusive lock is held.
pub(crate) fn delete_locked(
    catalog: &Catalog,
    record: &mut BackupRecord,
    guard: &BackupLockGuard,
) -> Result<(), Error> {
    let backup_id = record.backup_id;
    if record.status != BackupStatus::Deleted {
        catalog.set_status(record, StatusEvent::BeginDelete, guard)?;
        catalog.remove_backup_data(backup_id)?;
        catalog.set_status(record, StatusEvent::FinishDelete, guard)?;
    }
    catalog.remove_backup_dir(backup_id)?;
    log::info!("backup {backup_id} removed");
    Ok(())
}

/// Finish deletes that were interrupted, returns the removed backup ids.
///
/// Backups locked by someone else are left for a later run.
pub fn finish_interrupted_deletes(catalog: &Catalog) -> Result<Vec<BackupId>, Error> {
    let mut removed = Vec::new();
    for backup in catalog.list()? {
        if !matches!(backup.status, BackupStatus::Deleting | BackupStatus::Deleted) {
            continue;
        }
        let backup_id = backup.backup_id;
        let guard = match catalog
            .locks()
            .try_lock(backup_id, LockMode::Exclusive, None)?
        {
            LockOutcome::Acquired(guard) => guard,
            LockOutcome::Conflict(holder) | LockOutcome::TimedOut(holder) => {
                log::warn!(
                    "SKIPPED: finish delete of backup {backup_id} - locked by {}",
                    holder.holder_description()
                );
                continue;
            }
        };
        let mut record = catalog.read_unchecked(backup_id)?;
        if !matches!(record.status, BackupStatus::Deleting | BackupStatus::Deleted) {
            continue;
        }
        log::info!("finishing interrupted delete of backup {backup_id}");
        delete_locked(catalog, &mut record, &guard)?;
        removed.push(backup_id);
    }
    Ok(removed)
}

/// Remove archived WAL no backup of the catalog needs anymore.
///
/// On every timeline that has backups, segments before the start of the oldest one are
/// removed. Returns the names of the removed (or, with `dry_run`, removable) segments.
pub fn purge_wal(catalog: &Catalog, dry_run: bool) -> Result<Vec<String>, Error> {
    let archive = catalog.wal_archive();
    let segment_size = archive.segment_size();

    let mut keep_from = BTreeMap::new();
    for backup in catalog.list()? {
        if matches!(backup.status, BackupStatus::Deleting | BackupStatus::Deleted) {
            continue;
        }
        let segno = backup.start_lsn.segment_number(segment_size);
        keep_from
            .entry(backup.current_tli)
            .and_modify(|first: &mut u64| *first = (*first).min(segno))
            .or_insert(segno);
    }

    if keep_from.is_empty() {
        log::info!("no backups in instance '{}', keeping all WAL", catalog.name());
        return Ok(Vec::new());
    }
    archive.purge(&keep_from, dry_run)
}
