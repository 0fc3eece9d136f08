use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use pbk_api_types::{BackupId, BackupStatus, LockMode};
use pbk_datastore::chain::{check_chain_lsn, resolve_chain};
use pbk_datastore::{catalog_error, BackupLockGuard, BackupRecord, Catalog, CatalogError, FileEntry};

use super::{check_file, is_corruption, lock_chain, mark_corrupt, resolve_files, CrcReader};

/// Receives the files of a restored backup.
pub trait RestoreTarget {
    /// Create the file at `path` (relative to the data directory).
    fn create(&mut self, path: &str) -> Result<Box<dyn Write + '_>, Error>;

    /// Called once after all files were written.
    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Restore into a local directory, which must be empty or not exist yet.
pub struct DirectoryTarget {
    path: PathBuf,
}

impl DirectoryTarget {
    pub fn new(path: &Path) -> Result<Self, Error> {
        match std::fs::read_dir(path) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    bail!("restore target directory {path:?} is not empty");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(path)
                    .map_err(|err| format_err!("unable to create {path:?} - {err}"))?;
            }
            Err(err) => bail!("unable to read restore target {path:?} - {err}"),
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl RestoreTarget for DirectoryTarget {
    fn create(&mut self, path: &str) -> Result<Box<dyn Write + '_>, Error> {
        FileEntry::check_path(path)?;
        let path = self.path.join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format_err!("unable to create {parent:?} - {err}"))?;
        }
        let file = std::fs::File::create(&path)
            .map_err(|err| format_err!("unable to create {path:?} - {err}"))?;
        Ok(Box::new(std::io::BufWriter::new(file)))
    }
}

#[derive(Clone, Debug, Default)]
pub struct RestoreOptions {
    /// Skip the status and WAL checks of the chain members.
    pub no_validate: bool,
}

/// Restore `backup_id` including the data of its whole chain.
///
/// Every chain member stays locked shared until all files are written. Returns the chain
/// that was restored, full backup first.
pub fn restore_backup(
    catalog: &Catalog,
    backup_id: BackupId,
    target: &mut dyn RestoreTarget,
    options: &RestoreOptions,
) -> Result<Vec<BackupRecord>, Error> {
    let chain = resolve_chain(&catalog.list()?, backup_id, !options.no_validate)?;
    let guards = lock_chain(catalog, &chain, LockMode::Shared)?;

    // re-read under the locks, the chain may have been merged or marked meanwhile
    let mut locked = Vec::with_capacity(chain.len());
    for (member, guard) in chain.iter().zip(guards.iter()) {
        match catalog.read(member.backup_id) {
            Ok(record) => locked.push(record),
            Err(err) => {
                if is_corruption(&err) {
                    mark_corrupt(catalog, member.backup_id, guard);
                }
                return Err(err);
            }
        }
    }
    let chain = resolve_chain(&locked, backup_id, !options.no_validate)?;
    for member in chain.iter() {
        if matches!(
            member.status,
            BackupStatus::Running | BackupStatus::Deleting | BackupStatus::Deleted
        ) {
            return Err(CatalogError::BrokenChain {
                backup_id,
                reason: format!("chain member {} has status {}", member.backup_id, member.status),
            }
            .into());
        }
    }
    check_chain_lsn(&chain)?;
    if !options.no_validate {
        check_chain_wal(catalog, &chain, &guards)?;
    }

    log::info!(
        "restoring backup {backup_id} from a chain of {} backups",
        chain.len()
    );

    let files = resolve_files(catalog, &chain)?;
    for (entry, source) in files.iter() {
        if let Err(err) = restore_file(catalog, *source, entry, target) {
            if matches!(catalog_error(&err), Some(CatalogError::CrcMismatch { .. })) {
                if let Some(guard) = guard_for(&guards, *source) {
                    mark_corrupt(catalog, *source, guard);
                }
            }
            return Err(err);
        }
    }
    target.finish()?;

    log::info!("restored {} files of backup {backup_id}", files.len());
    Ok(chain)
}

/// Every non-stream member needs its WAL range in the archive to be recoverable.
fn check_chain_wal(
    catalog: &Catalog,
    chain: &[BackupRecord],
    guards: &[BackupLockGuard],
) -> Result<(), Error> {
    let archive = catalog.wal_archive();
    for member in chain.iter().filter(|member| !member.stream) {
        if let Err(err) = archive.check_range(
            member.backup_id,
            member.current_tli,
            member.start_lsn,
            member.stop_lsn,
        ) {
            if matches!(catalog_error(&err), Some(CatalogError::WalMissing { .. })) {
                if let Some(guard) = guard_for(guards, member.backup_id) {
                    mark_corrupt(catalog, member.backup_id, guard);
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

fn guard_for(guards: &[BackupLockGuard], backup_id: BackupId) -> Option<&BackupLockGuard> {
    guards.iter().find(|guard| guard.backup_id() == backup_id)
}

fn restore_file(
    catalog: &Catalog,
    source: BackupId,
    entry: &FileEntry,
    target: &mut dyn RestoreTarget,
) -> Result<(), Error> {
    let path = catalog.database_path(source).join(&entry.path);
    let reader = catalog.storage().open(&path)?;
    let mut reader = CrcReader::new(reader);
    {
        let mut writer = target.create(&entry.path)?;
        std::io::copy(&mut reader, &mut writer)
            .map_err(|err| format_err!("restoring {} failed - {err}", entry.path))?;
        writer.flush()?;
    }
    let (size, crc) = reader.finish();
    check_file(source, entry, size, crc)
}
