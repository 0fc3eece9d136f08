use std::io::Read;
use std::time::{Duration, Instant};

use anyhow::{bail, Error};

use pbk_api_types::{BackupId, BackupMode, LockMode, Lsn, TimeLineId};
use pbk_datastore::chain::{check_lsn_order, find_parent_chain, resolve_chain};
use pbk_datastore::{
    catalog_error, BackupContent, BackupLockGuard, BackupRecord, Catalog, CatalogError, FileEntry,
    LockRenewer, StatusEvent,
};

use super::{chain_file_index, check_file, copy_with_crc, lock_chain};

/// Files below this directory are WAL copied into stream backups.
const STREAM_WAL_DIR: &str = "pg_wal/";

const WAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Where a backup starts.
#[derive(Clone, Copy, Debug)]
pub struct BackupStart {
    pub start_lsn: Lsn,
    pub timeline: TimeLineId,
}

/// A file the database cluster wants backed up.
#[derive(Clone, Debug)]
pub struct SourceFile {
    /// Relative to the data directory.
    pub path: String,
    pub is_datafile: bool,
}

/// The database side of a backup.
///
/// Calls happen in order: [`timeline`](Self::timeline), [`start`](Self::start),
/// [`files`](Self::files) and [`open`](Self::open) for each file, [`stop`](Self::stop).
pub trait BackupSource {
    /// Timeline the cluster currently runs on.
    fn timeline(&mut self) -> Result<TimeLineId, Error>;

    /// Put the cluster into backup mode.
    fn start(&mut self) -> Result<BackupStart, Error>;

    fn files(&mut self) -> Result<Vec<SourceFile>, Error>;

    fn open(&mut self, path: &str) -> Result<Box<dyn Read + '_>, Error>;

    /// Leave backup mode, returns the stop position.
    fn stop(&mut self) -> Result<Lsn, Error>;
}

#[derive(Clone, Debug)]
pub struct BackupOptions {
    pub mode: BackupMode,
    /// WAL needed for consistency is part of the source files.
    pub stream: bool,
    /// Leave the backup `DONE` instead of checking the copied files.
    pub no_validate: bool,
}

impl BackupOptions {
    pub fn new(mode: BackupMode) -> Self {
        Self {
            mode,
            stream: false,
            no_validate: false,
        }
    }
}

/// Take a new backup.
///
/// Incremental backups lock their parent chain shared for the whole run, so the chain can
/// neither be merged nor deleted underneath them.
pub fn create_backup(
    catalog: &Catalog,
    source: &mut dyn BackupSource,
    options: &BackupOptions,
) -> Result<BackupRecord, Error> {
    let (backup_id, guard) = catalog.allocate_backup()?;
    log::info!(
        "starting {} backup {backup_id} of instance '{}'",
        options.mode,
        catalog.name()
    );

    let mut parent_guards = Vec::new();
    let prepared = prepare_backup(catalog, source, options, backup_id, &mut parent_guards);

    let (mut record, parent_files) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            discard_unregistered(catalog, backup_id);
            return Err(err);
        }
    };

    let mut guards: Vec<&BackupLockGuard> = vec![&guard];
    guards.extend(parent_guards.iter());
    let renewer =
        match LockRenewer::spawn(catalog.locks(), &guards, catalog.config().renew_interval()) {
            Ok(renewer) => renewer,
            Err(err) => {
                discard_unregistered(catalog, backup_id);
                return Err(err);
            }
        };

    let result = copy_and_register(
        catalog,
        source,
        options,
        &mut record,
        &parent_files,
        &guard,
        &renewer,
    );

    drop(renewer);

    match result {
        Ok(()) => {
            log::info!("backup {backup_id} completed with status {}", record.status);
            Ok(record)
        }
        Err(err) => {
            log::error!("backup {backup_id} failed - {err}");
            if catalog.read_unchecked(backup_id).is_err() {
                discard_unregistered(catalog, backup_id);
                return Err(err);
            }
            record.end_time = Some(catalog.now());
            if let Err(status_err) = catalog.set_status(&mut record, StatusEvent::Fail, &guard) {
                log::error!("unable to mark backup {backup_id} as ERROR - {status_err}");
            }
            Err(err)
        }
    }
}

/// Drop the directory of a backup that never got a control record.
fn discard_unregistered(catalog: &Catalog, backup_id: BackupId) {
    if let Err(err) = catalog.remove_backup_dir(backup_id) {
        log::error!("unable to remove backup directory of {backup_id} - {err}");
    }
}

type ParentFiles = std::collections::HashMap<String, (u64, u32)>;

fn prepare_backup(
    catalog: &Catalog,
    source: &mut dyn BackupSource,
    options: &BackupOptions,
    backup_id: BackupId,
    parent_guards: &mut Vec<BackupLockGuard>,
) -> Result<(BackupRecord, ParentFiles), Error> {
    let tli = source.timeline()?;

    let mut parent_chain = Vec::new();
    if options.mode.is_incremental() {
        let history = catalog.timeline_history(tli)?;
        let chain = find_parent_chain(&catalog.list()?, &history)?;
        *parent_guards = lock_chain(catalog, &chain, LockMode::Shared)?;

        // statuses may have changed before the locks were granted
        parent_chain = chain
            .iter()
            .map(|member| catalog.read(member.backup_id))
            .collect::<Result<Vec<_>, Error>>()?;
        resolve_chain(&parent_chain, parent_chain[parent_chain.len() - 1].backup_id, true)?;
        if let Some(member) = parent_chain.iter().find(|member| !member.status.is_valid()) {
            return Err(CatalogError::BrokenChain {
                backup_id: member.backup_id,
                reason: format!("parent chain member has status {}", member.status),
            }
            .into());
        }
    }

    let start = source.start()?;
    if start.timeline != tli {
        bail!(
            "timeline changed from {tli} to {} while starting backup {backup_id}",
            start.timeline
        );
    }

    let parent = parent_chain.last();
    if let Some(parent) = parent {
        check_lsn_order(parent, start.start_lsn, start.timeline)?;
        log::info!(
            "parent backup {} (stop LSN {}), start LSN {}",
            parent.backup_id,
            parent.stop_lsn,
            start.start_lsn
        );
    }

    let record = BackupRecord::new(
        backup_id,
        options.mode,
        parent,
        start.start_lsn,
        start.timeline,
        options.stream,
    )?;

    let parent_files = if parent_chain.is_empty() {
        ParentFiles::new()
    } else {
        chain_file_index(catalog, &parent_chain)?
    };

    Ok((record, parent_files))
}

fn copy_and_register(
    catalog: &Catalog,
    source: &mut dyn BackupSource,
    options: &BackupOptions,
    record: &mut BackupRecord,
    parent_files: &ParentFiles,
    guard: &BackupLockGuard,
    renewer: &LockRenewer,
) -> Result<(), Error> {
    let backup_id = record.backup_id;
    catalog.set_status(record, StatusEvent::Start, guard)?;

    let database = catalog.database_path(backup_id);
    let mut content = BackupContent::new();
    let mut wal_bytes = 0;

    for file in source.files()? {
        FileEntry::check_path(&file.path)?;
        let path = database.join(&file.path);
        let (size, crc) = {
            let mut reader = source.open(&file.path)?;
            let mut writer = catalog.storage().create(&path)?;
            copy_with_crc(&mut reader, &mut writer)?
        };

        let unchanged = match parent_files.get(&file.path) {
            Some((parent_size, parent_crc)) => *parent_size == size && *parent_crc == crc,
            None => false,
        };
        if unchanged {
            catalog.storage().remove(&path)?;
        }
        if options.stream && file.path.starts_with(STREAM_WAL_DIR) {
            wal_bytes += size;
        }

        content.add_file(FileEntry {
            path: file.path,
            size,
            crc,
            is_datafile: file.is_datafile,
            unchanged,
        })?;
    }

    let stop_lsn = source.stop()?;
    if stop_lsn < record.start_lsn {
        bail!(
            "backup {backup_id}: stop LSN {stop_lsn} is before start LSN {}",
            record.start_lsn
        );
    }

    record.content_crc = catalog.write_content(backup_id, &content)?;
    record.stop_lsn = stop_lsn;
    record.data_bytes = content.stored_bytes();
    record.wal_bytes = wal_bytes;
    record.end_time = Some(catalog.now());

    if !options.stream {
        wait_for_wal(catalog, record, renewer)?;
    }

    renewer.check()?;
    catalog.set_status(record, StatusEvent::CopyDone, guard)?;

    if options.no_validate {
        log::info!("backup {backup_id} is not validated, leaving it DONE");
        return Ok(());
    }

    for entry in content.files().iter().filter(|entry| !entry.unchanged) {
        let path = database.join(&entry.path);
        let mut reader = catalog.storage().open(&path)?;
        let (size, crc) = copy_with_crc(&mut reader, &mut std::io::sink())?;
        check_file(backup_id, entry, size, crc)?;
    }

    renewer.check()?;
    catalog.set_status(record, StatusEvent::Complete, guard)?;
    Ok(())
}

/// Wait up to the archive timeout until the WAL range of a non-stream backup is archived.
fn wait_for_wal(
    catalog: &Catalog,
    record: &BackupRecord,
    renewer: &LockRenewer,
) -> Result<(), Error> {
    let archive = catalog.wal_archive();
    let deadline = Instant::now() + catalog.config().archive_timeout();
    let mut waiting = false;
    loop {
        let err = match archive.check_range(
            record.backup_id,
            record.current_tli,
            record.start_lsn,
            record.stop_lsn,
        ) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let now = Instant::now();
        if now >= deadline || !matches!(catalog_error(&err), Some(CatalogError::WalMissing { .. }))
        {
            return Err(err);
        }
        if !waiting {
            log::info!("backup {}: waiting for WAL archiving - {err}", record.backup_id);
            waiting = true;
        }
        renewer.check()?;
        std::thread::sleep(WAL_POLL_INTERVAL.min(deadline - now));
    }
}
