use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use pbk_api_types::{
    BackupId, BackupMode, BackupStatus, LockMode, BACKUP_CONTENT_FILE, BACKUP_CONTROL_FILE,
    DATABASE_DIR,
};
use pbk_datastore::chain::{children, merge_segment};
use pbk_datastore::manifest::compute_crc;
use pbk_datastore::{
    catalog_error, BackupContent, BackupLockGuard, BackupRecord, Catalog, CatalogError,
    FileEntry, LockRenewer, StatusEvent,
};

use super::delete::delete_locked;
use super::{copy_stored_file, is_corruption, lock_backups, mark_corrupt, resolve_files};

/// Merge the chain of an incremental backup into a single full backup.
///
/// The result keeps the id of `backup_id`, so backups built on top of it stay valid. Its
/// ancestors are removed. The data is assembled in a staging directory next to the backup
/// and only swapped in once complete, every chain member records the merge target while the
/// merge runs. Running the merge again after an interruption finishes it.
pub fn merge_backup(catalog: &Catalog, backup_id: BackupId) -> Result<BackupRecord, Error> {
    let target_guard = lock_backups(catalog, &[backup_id], LockMode::Exclusive)?
        .pop()
        .ok_or_else(|| format_err!("no lock for backup {backup_id}"))?;

    let staging = staging_path(catalog, backup_id);
    let storage = catalog.storage();
    if !storage.exists(&catalog.backup_path(backup_id))?
        && storage.exists(&staging.join(BACKUP_CONTROL_FILE))?
    {
        log::info!("backup {backup_id}: resuming merge, moving merged data into place");
        storage.rename(&staging, &catalog.backup_path(backup_id))?;
    }

    let target = catalog.read_unchecked(backup_id)?;
    if target.is_full()
        && target.status == BackupStatus::Merged
        && target.merge_dest_backup == Some(backup_id)
    {
        log::info!("backup {backup_id}: data already merged, finishing the merge");
        let leftovers: Vec<BackupId> = catalog
            .list()?
            .into_iter()
            .filter(|backup| {
                backup.backup_id != backup_id && backup.merge_dest_backup == Some(backup_id)
            })
            .map(|backup| backup.backup_id)
            .collect();
        let guards = lock_backups(catalog, &leftovers, LockMode::Exclusive)?;
        let guard_refs: Vec<&BackupLockGuard> = guards.iter().collect();
        return finish_merge(catalog, backup_id, &target_guard, &guard_refs);
    }

    let list = catalog.list()?;
    let segment = merge_segment(&list, backup_id)?;
    check_mergeable(&list, &segment)?;

    let ids: Vec<BackupId> = segment
        .iter()
        .map(|member| member.backup_id)
        .filter(|id| *id != backup_id)
        .collect();
    let guards = lock_backups(catalog, &ids, LockMode::Exclusive)?;

    // the chain may have changed before all locks were granted
    let list = catalog.list()?;
    let segment = merge_segment(&list, backup_id)?;
    let locked: Vec<BackupId> = segment.iter().map(|member| member.backup_id).collect();
    if locked[..locked.len() - 1] != ids[..] {
        bail!("chain of backup {backup_id} changed while locking, please retry");
    }
    check_mergeable(&list, &segment)?;

    // same order as the segment, full backup first
    let mut guard_refs: Vec<&BackupLockGuard> = guards.iter().collect();
    guard_refs.push(&target_guard);
    let renewer = LockRenewer::spawn(
        catalog.locks(),
        &guard_refs,
        catalog.config().renew_interval(),
    )?;

    log::info!(
        "merging {} backups from {} into {backup_id}",
        segment.len(),
        segment[0].backup_id
    );

    // mark every member first, so an interruption from here on is resumable
    let mut members = Vec::with_capacity(segment.len());
    for (member, guard) in segment.iter().zip(guard_refs.iter()) {
        let mut record = match catalog.read(member.backup_id) {
            Ok(record) => record,
            Err(err) => {
                if is_corruption(&err) {
                    mark_corrupt(catalog, member.backup_id, guard);
                }
                return Err(err);
            }
        };
        record.merge_dest_backup = Some(backup_id);
        if record.status == BackupStatus::Merged {
            catalog.write(&record)?;
        } else {
            catalog.set_status(&mut record, StatusEvent::BeginMerge, guard)?;
        }
        members.push(record);
    }

    let merged = fold_into_staging(catalog, &members, &guard_refs, &staging)?;

    renewer.check()?;
    let mut full = members[0].clone();
    catalog.set_status(&mut full, StatusEvent::FinishMerge, guard_refs[0])?;

    // swap the merged data in
    renewer.check()?;
    catalog.remove_backup_dir(backup_id)?;
    storage.rename(&staging, &catalog.backup_path(backup_id))?;
    log::info!(
        "backup {backup_id}: merged data in place ({} bytes)",
        merged.data_bytes
    );

    let others = &guard_refs[..guard_refs.len() - 1];
    let result = finish_merge(catalog, backup_id, &target_guard, others);
    drop(renewer);
    result
}

fn staging_path(catalog: &Catalog, backup_id: BackupId) -> PathBuf {
    catalog.instance_path().join(format!("{backup_id}.merge"))
}

/// Refuse merges that would leave other backups without parent, or that start from a
/// backup whose result was never confirmed.
fn check_mergeable(list: &[BackupRecord], segment: &[BackupRecord]) -> Result<(), Error> {
    let target = segment[segment.len() - 1].backup_id;
    for member in segment {
        match member.status {
            BackupStatus::Ok | BackupStatus::Merging | BackupStatus::Merged => {}
            status => {
                return Err(CatalogError::StatusConflict {
                    backup_id: member.backup_id,
                    from: Some(status),
                    event: StatusEvent::BeginMerge,
                }
                .into())
            }
        }
        if member.backup_id == target {
            continue;
        }
        let outside: Vec<String> = children(list, member.backup_id)
            .into_iter()
            .filter(|child| !segment.iter().any(|m| m.backup_id == child.backup_id))
            .map(|child| child.backup_id.to_string())
            .collect();
        if !outside.is_empty() {
            return Err(CatalogError::HasDependents {
                backup_id: member.backup_id,
                children: outside.join(", "),
            }
            .into());
        }
    }
    Ok(())
}

/// Copy the newest version of every file of the chain into the staging directory and write
/// its file list and control record.
fn fold_into_staging(
    catalog: &Catalog,
    members: &[BackupRecord],
    guards: &[&BackupLockGuard],
    staging: &Path,
) -> Result<BackupRecord, Error> {
    let target = &members[members.len() - 1];
    let storage = catalog.storage();

    // leftovers of an interrupted attempt
    storage.remove_dir_all(staging)?;
    storage.create_dir_all(staging)?;

    let database = staging.join(DATABASE_DIR);
    let mut content = BackupContent::new();
    for (entry, source) in resolve_files(catalog, members)? {
        if let Err(err) = copy_stored_file(catalog, source, &entry, &database.join(&entry.path)) {
            if matches!(catalog_error(&err), Some(CatalogError::CrcMismatch { .. })) {
                if let Some(guard) = guards.iter().find(|guard| guard.backup_id() == source) {
                    mark_corrupt(catalog, source, guard);
                }
            }
            return Err(err);
        }
        content.add_file(FileEntry {
            unchanged: false,
            ..entry
        })?;
    }

    let data = content.encode()?;
    storage.replace(&staging.join(BACKUP_CONTENT_FILE), &data)?;

    let mut merged = target.clone();
    merged.backup_mode = BackupMode::Full;
    merged.parent_backup_id = None;
    merged.parent_tli = 0;
    merged.status = BackupStatus::Merged;
    merged.merge_dest_backup = Some(target.backup_id);
    merged.content_crc = compute_crc(&data);
    merged.data_bytes = content.stored_bytes();

    // written last, its presence marks the staging directory complete
    storage.replace(&staging.join(BACKUP_CONTROL_FILE), merged.to_json()?.as_bytes())?;
    Ok(merged)
}

/// Remove the absorbed ancestors and mark the merged backup `OK`.
fn finish_merge(
    catalog: &Catalog,
    backup_id: BackupId,
    target_guard: &BackupLockGuard,
    ancestors: &[&BackupLockGuard],
) -> Result<BackupRecord, Error> {
    for guard in ancestors {
        let mut record = catalog.read_unchecked(guard.backup_id())?;
        delete_locked(catalog, &mut record, guard)?;
    }

    let mut record = catalog.read(backup_id)?;
    record.merge_dest_backup = None;
    catalog.set_status(&mut record, StatusEvent::FinalizeMerge, target_guard)?;
    log::info!("backup {backup_id}: merge finished");
    Ok(record)
}
