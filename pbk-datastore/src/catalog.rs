use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use rand::Rng;

use pbk_api_types::common_regex::{BACKUP_ID_REGEX, INSTANCE_NAME_REGEX};
use pbk_api_types::{
    BackupId, BackupStatus, CatalogConfig, LockMode, TimeLineId, BACKUPS_DIR,
    BACKUP_CONTENT_FILE, BACKUP_CONTROL_FILE, DATABASE_DIR, LOCKS_DIR, WAL_DIR,
};

use crate::clock::{Clock, ProcessIdentity, SystemClock};
use crate::error::{catalog_error, CatalogError};
use crate::lock::{BackupLockGuard, LockManager, LockOutcome};
use crate::manifest::{compute_crc, BackupContent, BackupRecord};
use crate::status::{check_operator_status, next_status, StatusEvent};
use crate::storage::{CatalogStorage, LocalStorage};
use crate::wal::{TimelineHistory, WalArchive};

const ID_ALLOCATION_ATTEMPTS: usize = 60;

/// Whether a `RUNNING` backup still has an owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunningState {
    /// A live exclusive lock exists.
    Active,
    /// No live exclusive lock, the owner is gone.
    Abandoned,
}

/// The backup catalog of one database instance.
///
/// Layout below the catalog base directory:
///
/// ```text
/// backups/<instance>/<backup_id>/backup.control
/// backups/<instance>/<backup_id>/backup_content.control
/// backups/<instance>/<backup_id>/database/...
/// wal/<instance>/...
/// locks/<backup_id>_<holder>_<r|w>
/// ```
///
/// Nothing is cached, every query scans the storage again.
pub struct Catalog {
    base: PathBuf,
    instance: String,
    storage: Arc<dyn CatalogStorage>,
    clock: Arc<dyn Clock>,
    config: CatalogConfig,
    locks: LockManager,
}

impl Catalog {
    pub fn new(
        base: &Path,
        instance: &str,
        storage: Arc<dyn CatalogStorage>,
        clock: Arc<dyn Clock>,
        identity: Arc<ProcessIdentity>,
        config: CatalogConfig,
    ) -> Result<Self, Error> {
        if !INSTANCE_NAME_REGEX.is_match(instance) {
            bail!("invalid instance name '{instance}'");
        }
        config.check()?;

        let locks = LockManager::new(
            Arc::clone(&storage),
            Arc::clone(&clock),
            identity,
            base.join(LOCKS_DIR),
            &config,
        );

        Ok(Self {
            base: base.to_path_buf(),
            instance: instance.to_string(),
            storage,
            clock,
            config,
            locks,
        })
    }

    /// Open an existing instance on the local file system, using its stored configuration.
    pub fn open_local(base: &Path, instance: &str) -> Result<Self, Error> {
        let config = pbk_config::config(base, instance)?;
        let catalog = Self::new(
            base,
            instance,
            Arc::new(LocalStorage::new()),
            Arc::new(SystemClock),
            Arc::new(ProcessIdentity::current()?),
            config,
        )?;
        if !catalog.storage.exists(&catalog.instance_path())? {
            bail!("instance '{instance}' does not exist in catalog {base:?}");
        }
        Ok(catalog)
    }

    /// Create the directories of this instance, and the catalog itself if needed.
    pub fn add_instance(&self) -> Result<(), Error> {
        self.storage.create_dir_all(&self.base.join(BACKUPS_DIR))?;
        self.storage.create_dir_all(self.locks.lock_dir())?;
        if !self.storage.create_dir(&self.instance_path())? {
            bail!("instance '{}' already exists", self.instance);
        }
        self.storage.create_dir_all(&self.wal_path())?;
        log::info!("instance '{}' initialized in {:?}", self.instance, self.base);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.instance
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn CatalogStorage> {
        &self.storage
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn instance_path(&self) -> PathBuf {
        self.base.join(BACKUPS_DIR).join(&self.instance)
    }

    pub fn backup_path(&self, backup_id: BackupId) -> PathBuf {
        self.instance_path().join(backup_id.to_string())
    }

    pub fn control_path(&self, backup_id: BackupId) -> PathBuf {
        self.backup_path(backup_id).join(BACKUP_CONTROL_FILE)
    }

    pub fn content_path(&self, backup_id: BackupId) -> PathBuf {
        self.backup_path(backup_id).join(BACKUP_CONTENT_FILE)
    }

    /// Directory holding the copied data files of a backup.
    pub fn database_path(&self, backup_id: BackupId) -> PathBuf {
        self.backup_path(backup_id).join(DATABASE_DIR)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.base.join(WAL_DIR).join(&self.instance)
    }

    pub fn wal_archive(&self) -> WalArchive {
        WalArchive::new(
            Arc::clone(&self.storage),
            self.wal_path(),
            self.config.wal_segment_size,
        )
    }

    pub fn timeline_history(&self, tli: TimeLineId) -> Result<TimelineHistory, Error> {
        self.wal_archive().timeline_history(tli)
    }

    /// Ids of all backup directories, oldest first.
    pub fn backup_ids(&self) -> Result<Vec<BackupId>, Error> {
        let mut list = Vec::new();
        for name in self.storage.list(&self.instance_path(), "")? {
            if !BACKUP_ID_REGEX.is_match(&name) {
                continue;
            }
            match name.parse::<BackupId>() {
                Ok(backup_id) => list.push(backup_id),
                Err(err) => log::warn!("ignoring directory {name} - {err}"),
            }
        }
        list.sort_unstable();
        Ok(list)
    }

    /// Read a control record without checking the file list.
    pub fn read_unchecked(&self, backup_id: BackupId) -> Result<BackupRecord, Error> {
        match self.storage.read(&self.control_path(backup_id))? {
            Some(data) => {
                let record = BackupRecord::from_data(&data)
                    .map_err(|err| format_err!("backup {backup_id}: {err}"))?;
                if record.backup_id != backup_id {
                    bail!(
                        "backup {backup_id}: control file belongs to backup {}",
                        record.backup_id
                    );
                }
                Ok(record)
            }
            None => {
                if self.storage.exists(&self.backup_path(backup_id))? {
                    Err(CatalogError::MissingControlFile {
                        backup_id,
                        file: BACKUP_CONTROL_FILE.to_string(),
                    }
                    .into())
                } else {
                    Err(CatalogError::BackupNotFound { backup_id }.into())
                }
            }
        }
    }

    /// Read a control record and verify the file list checksum.
    pub fn read(&self, backup_id: BackupId) -> Result<BackupRecord, Error> {
        let record = self.read_unchecked(backup_id)?;
        if content_expected(record.status) {
            self.read_content(&record)?;
        }
        Ok(record)
    }

    /// Atomically replace the control record.
    pub fn write(&self, record: &BackupRecord) -> Result<(), Error> {
        let data = record.to_json()?;
        self.storage
            .replace(&self.control_path(record.backup_id), data.as_bytes())
    }

    pub fn read_content(&self, record: &BackupRecord) -> Result<BackupContent, Error> {
        let backup_id = record.backup_id;
        let data = self
            .storage
            .read(&self.content_path(backup_id))?
            .ok_or_else(|| CatalogError::MissingControlFile {
                backup_id,
                file: BACKUP_CONTENT_FILE.to_string(),
            })?;

        let actual = compute_crc(&data);
        if actual != record.content_crc {
            return Err(CatalogError::CrcMismatch {
                backup_id,
                what: BACKUP_CONTENT_FILE.to_string(),
                expected: record.content_crc,
                actual,
            }
            .into());
        }
        BackupContent::decode(&data).map_err(|err| format_err!("backup {backup_id}: {err}"))
    }

    /// Atomically write the file list, returns its checksum.
    pub fn write_content(&self, backup_id: BackupId, content: &BackupContent) -> Result<u32, Error> {
        let data = content.encode()?;
        self.storage.replace(&self.content_path(backup_id), &data)?;
        Ok(compute_crc(&data))
    }

    /// All readable backups ordered by start time. Unreadable ones are logged and left out.
    pub fn list(&self) -> Result<Vec<BackupRecord>, Error> {
        let mut list = Vec::new();
        for backup_id in self.backup_ids()? {
            match self.read_unchecked(backup_id) {
                Ok(record) => list.push(record),
                Err(err) => log::warn!("skipping backup {backup_id} - {err}"),
            }
        }
        list.sort_by_key(|record| (record.start_time, record.backup_id));
        Ok(list)
    }

    /// Strict read of every backup, keeping the failures.
    pub fn scan(&self) -> Result<Vec<(BackupId, Result<BackupRecord, Error>)>, Error> {
        Ok(self
            .backup_ids()?
            .into_iter()
            .map(|backup_id| (backup_id, self.read(backup_id)))
            .collect())
    }

    /// Claim the id of a new backup starting now.
    ///
    /// The id is locked exclusively before its directory is created. If the second is taken
    /// already, the next one is tried.
    pub fn allocate_backup(&self) -> Result<(BackupId, BackupLockGuard), Error> {
        let mut backup_id = BackupId::from_start_time(self.now())?;
        for _ in 0..ID_ALLOCATION_ATTEMPTS {
            if let LockOutcome::Acquired(guard) =
                self.locks.try_lock(backup_id, LockMode::Exclusive, None)?
            {
                if self.storage.create_dir(&self.backup_path(backup_id))? {
                    return Ok((backup_id, guard));
                }
            }
            log::debug!("backup id {backup_id} is taken, trying the next one");
            backup_id = backup_id.next();
        }
        bail!("unable to allocate a backup id in instance '{}'", self.instance);
    }

    /// Apply `event` to the persisted status of a backup and write the record.
    ///
    /// The current status is taken from disk. Status changes need an exclusive lock, except
    /// for the verdicts of a validation and the reclaim of an abandoned backup.
    pub fn set_status(
        &self,
        record: &mut BackupRecord,
        event: StatusEvent,
        guard: &BackupLockGuard,
    ) -> Result<(), Error> {
        let backup_id = record.backup_id;
        if guard.backup_id() != backup_id {
            bail!("lock {guard:?} does not cover backup {backup_id}");
        }

        let current = match self.storage.read(&self.control_path(backup_id))? {
            Some(data) => Some(BackupRecord::from_data(&data)?.status),
            None => None,
        };

        if guard.mode() != LockMode::Exclusive && !shared_lock_suffices(event, current) {
            bail!("backup {backup_id}: '{event}' needs an exclusive lock");
        }

        let status = next_status(backup_id, current, event)?;
        if let Some(current) = current {
            if current != record.status {
                log::warn!(
                    "backup {backup_id}: status changed from {} to {current} meanwhile",
                    record.status
                );
            }
        }

        let previous = record.status;
        record.status = status;
        if let Err(err) = self.write(record) {
            record.status = previous;
            return Err(err);
        }

        match current {
            Some(current) if current != status => {
                log::info!("backup {backup_id}: status {current} -> {status}")
            }
            None => log::info!("backup {backup_id}: status {status}"),
            _ => log::debug!("backup {backup_id}: status stays {status} ({event})"),
        }
        Ok(())
    }

    /// Explicit status change requested by an operator, needs an exclusive lock.
    pub fn set_operator_status(
        &self,
        record: &mut BackupRecord,
        target: BackupStatus,
        guard: &BackupLockGuard,
    ) -> Result<(), Error> {
        let backup_id = record.backup_id;
        if guard.backup_id() != backup_id || guard.mode() != LockMode::Exclusive {
            bail!("backup {backup_id}: changing the status needs an exclusive lock");
        }
        let current = self.read_unchecked(backup_id)?.status;
        check_operator_status(backup_id, current, target)?;

        record.status = target;
        self.write(record)?;
        log::info!("backup {backup_id}: status {current} -> {target} (set by operator)");
        Ok(())
    }

    /// Lock a backup for a status change, retrying a bounded number of times while it is busy.
    pub fn lock_for_update(
        &self,
        backup_id: BackupId,
        mode: LockMode,
    ) -> Result<BackupLockGuard, Error> {
        let attempts = self.config.status_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.locks.acquire(backup_id, mode, self.config.wait_timeout()) {
                Ok(guard) => return Ok(guard),
                Err(err) => err,
            };
            let busy = catalog_error(&err).map_or(false, CatalogError::is_lock_busy);
            if !busy || attempt >= attempts {
                return Err(err);
            }
            let delay = self.retry_delay(attempt);
            log::info!(
                "backup {backup_id} is busy, retry {attempt}/{} in {}ms",
                attempts - 1,
                delay.as_millis()
            );
            std::thread::sleep(delay);
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.poll_interval().as_millis() as u64;
        let max = base << attempt.min(6);
        Duration::from_millis(rand::thread_rng().gen_range(base..=max).max(1))
    }

    /// Whether the owner of a `RUNNING` backup is still alive.
    pub fn running_state(&self, backup_id: BackupId) -> Result<RunningState, Error> {
        let active = self
            .locks
            .live_locks(backup_id)?
            .iter()
            .any(|info| info.file.mode == LockMode::Exclusive);
        Ok(if active {
            RunningState::Active
        } else {
            RunningState::Abandoned
        })
    }

    /// Mark a `RUNNING` backup whose owner vanished as `ERROR`.
    ///
    /// Holding any lock on the backup proves there is no live exclusive holder. Returns whether
    /// the backup was reclaimed.
    pub fn reclaim_abandoned(
        &self,
        record: &mut BackupRecord,
        guard: &BackupLockGuard,
    ) -> Result<bool, Error> {
        if record.status != BackupStatus::Running {
            return Ok(false);
        }
        log::warn!(
            "backup {} is RUNNING but its owner is gone, marking it ERROR",
            record.backup_id
        );
        record.end_time = Some(self.now());
        self.set_status(record, StatusEvent::Fail, guard)?;
        Ok(true)
    }

    /// Remove data files and file list of a backup, keeping the control record.
    pub fn remove_backup_data(&self, backup_id: BackupId) -> Result<(), Error> {
        self.storage.remove_dir_all(&self.database_path(backup_id))?;
        self.storage.remove(&self.content_path(backup_id))?;
        Ok(())
    }

    /// Remove what is left of a backup directory.
    pub fn remove_backup_dir(&self, backup_id: BackupId) -> Result<(), Error> {
        self.storage.remove_dir_all(&self.backup_path(backup_id))
    }
}

/// Statuses whose file list must be present and intact.
fn content_expected(status: BackupStatus) -> bool {
    matches!(
        status,
        BackupStatus::Done | BackupStatus::Ok | BackupStatus::Orphan
    )
}

fn shared_lock_suffices(event: StatusEvent, current: Option<BackupStatus>) -> bool {
    match event {
        StatusEvent::Corrupt | StatusEvent::Orphan | StatusEvent::Validated => true,
        StatusEvent::Fail => current == Some(BackupStatus::Running),
        _ => false,
    }
}
