//! Backup operations on top of the catalog in pbk-datastore.
//!
//! Every operation takes the locks it needs before it looks at the state it acts on,
//! re-reads that state under the lock, and records failures in the backup status before it
//! returns.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use anyhow::{format_err, Error};

use pbk_api_types::{BackupId, BackupStatus, LockMode};
use pbk_datastore::{
    catalog_error, BackupContent, BackupLockGuard, BackupRecord, Catalog, CatalogError,
    FileEntry, LockOutcome,
};

mod archive;
pub use archive::*;

mod create;
pub use create::*;

mod delete;
pub use delete::*;

mod instance;
pub use instance::*;

mod merge;
pub use merge::*;

mod restore;
pub use restore::*;

mod status;
pub use status::*;

mod verify;
pub use verify::*;

/// Lock every member of a chain, failing fast on the first busy one.
///
/// Nothing stays locked on failure. Conflicts name the member and, if it is being merged or
/// deleted, say so.
pub(crate) fn lock_chain(
    catalog: &Catalog,
    chain: &[BackupRecord],
    mode: LockMode,
) -> Result<Vec<BackupLockGuard>, Error> {
    let ids: Vec<BackupId> = chain.iter().map(|member| member.backup_id).collect();
    lock_backups(catalog, &ids, mode)
}

pub(crate) fn lock_backups(
    catalog: &Catalog,
    ids: &[BackupId],
    mode: LockMode,
) -> Result<Vec<BackupLockGuard>, Error> {
    let wait = catalog.config().wait_timeout();
    let mut guards = Vec::with_capacity(ids.len());
    for &backup_id in ids {
        match catalog.locks().try_lock(backup_id, mode, wait)? {
            LockOutcome::Acquired(guard) => guards.push(guard),
            LockOutcome::Conflict(holder) => {
                return Err(CatalogError::LockConflict {
                    backup_id,
                    holder: holder.holder_description(),
                    mode: holder.file.mode,
                    hint: busy_hint(catalog, backup_id),
                }
                .into());
            }
            LockOutcome::TimedOut(holder) => {
                return Err(CatalogError::LockTimeout {
                    backup_id,
                    holder: holder.holder_description(),
                }
                .into());
            }
        }
    }
    Ok(guards)
}

fn busy_hint(catalog: &Catalog, backup_id: BackupId) -> String {
    match catalog.read_unchecked(backup_id).map(|record| record.status) {
        Ok(BackupStatus::Merging | BackupStatus::Merged) => {
            format!("backup {backup_id} is mid-merge, retry after the merge finished")
        }
        Ok(BackupStatus::Deleting) => format!("backup {backup_id} is being deleted"),
        Ok(BackupStatus::Running) => format!("backup {backup_id} is still being taken"),
        _ => "backup is in use by another operation".to_string(),
    }
}

/// Persist `CORRUPT` for a backup whose metadata or data failed a check.
///
/// Only logs if that is not possible, the caller reports the original problem.
pub(crate) fn mark_corrupt(catalog: &Catalog, backup_id: BackupId, guard: &BackupLockGuard) {
    let result = catalog
        .read_unchecked(backup_id)
        .and_then(|mut record| {
            catalog.set_status(&mut record, pbk_datastore::StatusEvent::Corrupt, guard)
        });
    if let Err(err) = result {
        log::error!("unable to mark backup {backup_id} as CORRUPT - {err}");
    }
}

/// Whether an error means the backup itself is damaged.
pub(crate) fn is_corruption(err: &Error) -> bool {
    catalog_error(err).map_or(false, CatalogError::is_corruption)
}

/// Reader computing size and CRC32 of everything read through it.
pub(crate) struct CrcReader<R> {
    inner: R,
    hasher: crc32fast::Hasher,
    size: u64,
}

impl<R: Read> CrcReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            size: 0,
        }
    }

    pub fn finish(self) -> (u64, u32) {
        (self.size, self.hasher.finalize())
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        self.size += count as u64;
        Ok(count)
    }
}

/// Copy everything from `reader` to `writer`, returns size and CRC32 of the data.
pub(crate) fn copy_with_crc(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
) -> Result<(u64, u32), Error> {
    let mut reader = CrcReader::new(reader);
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let count = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        writer.write_all(&buffer[..count])?;
    }
    writer.flush()?;
    Ok(reader.finish())
}

/// Copy a stored file of `source` to `path`, checking it against its file list entry.
pub(crate) fn copy_stored_file(
    catalog: &Catalog,
    source: BackupId,
    entry: &FileEntry,
    path: &Path,
) -> Result<(), Error> {
    let from = catalog.database_path(source).join(&entry.path);
    let mut reader = catalog.storage().open(&from)?;
    let mut writer = catalog.storage().create(path)?;
    let (size, crc) = copy_with_crc(&mut reader, &mut writer)?;
    check_file(source, entry, size, crc)
}

/// Compare size and checksum of a stored file with its file list entry.
pub(crate) fn check_file(backup_id: BackupId, entry: &FileEntry, size: u64, crc: u32) -> Result<(), Error> {
    if size != entry.size {
        return Err(format_err!(
            "backup {backup_id}: file {} has size {size}, expected {}",
            entry.path,
            entry.size
        ));
    }
    if crc != entry.crc {
        return Err(CatalogError::CrcMismatch {
            backup_id,
            what: entry.path.clone(),
            expected: entry.crc,
            actual: crc,
        }
        .into());
    }
    Ok(())
}

/// For every file of the last chain member, the entry describing its data and the backup
/// storing that data.
pub(crate) fn resolve_files(
    catalog: &Catalog,
    chain: &[BackupRecord],
) -> Result<Vec<(FileEntry, BackupId)>, Error> {
    let target = chain
        .last()
        .ok_or_else(|| format_err!("cannot resolve files of an empty chain"))?;

    let contents = chain
        .iter()
        .map(|record| catalog.read_content(record))
        .collect::<Result<Vec<BackupContent>, Error>>()?;

    let mut result = Vec::new();
    for entry in contents[contents.len() - 1].files() {
        let mut found = None;
        for (record, content) in chain.iter().zip(contents.iter()).rev() {
            match content.lookup(&entry.path) {
                Some(stored) if !stored.unchanged => {
                    found = Some((stored.clone(), record.backup_id));
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        let found = found.ok_or_else(|| CatalogError::BrokenChain {
            backup_id: target.backup_id,
            reason: format!("no backup in the chain stores the data of {}", entry.path),
        })?;
        result.push(found);
    }
    Ok(result)
}

/// Size and checksum of every file of the last chain member, by path.
pub(crate) fn chain_file_index(
    catalog: &Catalog,
    chain: &[BackupRecord],
) -> Result<HashMap<String, (u64, u32)>, Error> {
    Ok(resolve_files(catalog, chain)?
        .into_iter()
        .map(|(entry, _)| (entry.path, (entry.size, entry.crc)))
        .collect())
}
