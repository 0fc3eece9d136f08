//! Advisory backup locks.
//!
//! A lock is a file in the catalog wide `locks` directory, named
//! `<backup_id>_<holder>_<r|w>`. Holders are separate processes, so there is no shared memory
//! to coordinate through. Acquiring a lock works like this:
//!
//! 1. scan the claims on the backup, delete every claim older than the TTL and give up
//!    (or poll) if a live conflicting claim remains
//! 2. create our own claim, marked in flight and stamped with the current time
//! 3. scan again: a conflicting claim that showed up meanwhile means somebody raced us, so we
//!    delete our claim and start over after a randomized pause. Claims in flight count here
//!    regardless of their age.
//! 4. if our claim is still there, mark it held, which makes it final
//!
//! Every claim is created before its owner checks for others, so of two racing processes the
//! one checking last always sees the other one's claim. Both may back off, but both can never
//! proceed.
//!
//! Claims are created with their content in one step (see [`CatalogStorage::create_new`]), so
//! their age always comes from the same clock as the TTL checks, never from file times.
//!
//! Holders renew the timestamp while working (see [`LockRenewer`]), a lock that was not renewed
//! for longer than the TTL is considered abandoned and removed by the next contender.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use rand::Rng;
use serde::{Deserialize, Serialize};

use pbk_api_types::common_regex::LOCK_FILE_REGEX;
use pbk_api_types::{BackupId, CatalogConfig, LockMode};

use crate::clock::{Clock, ProcessIdentity};
use crate::error::CatalogError;
use crate::storage::CatalogStorage;

/// Parsed lock file name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockFile {
    pub backup_id: BackupId,
    pub holder: String,
    pub mode: LockMode,
}

impl LockFile {
    pub fn parse(name: &str) -> Option<Self> {
        let caps = LOCK_FILE_REGEX.captures(name)?;
        Some(Self {
            backup_id: caps[1].parse().ok()?,
            holder: caps[2].to_string(),
            mode: LockMode::from_suffix(&caps[3]).ok()?,
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}_{}", self.backup_id, self.holder, self.mode.suffix())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimState {
    /// Created, the race check is still running.
    InFlight,
    Held,
}

/// What a claim contains.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct LockContent {
    pub backup_id: BackupId,
    pub mode: LockMode,
    pub state: ClaimState,
    pub pid: u32,
    pub hostname: String,
    /// Creation or last renewal, epoch seconds.
    pub timestamp: i64,
}

/// A claim found in the lock directory.
#[derive(Clone, Debug)]
pub struct LockInfo {
    pub file: LockFile,
    /// `None` if the file is unreadable.
    pub content: Option<LockContent>,
    /// Timestamp from the content, the file's mtime for unreadable files.
    pub timestamp: i64,
}

impl LockInfo {
    pub fn is_expired(&self, now: i64, ttl: i64) -> bool {
        now - self.timestamp > ttl
    }

    /// Unreadable claims count as in flight.
    pub fn in_flight(&self) -> bool {
        self.content
            .as_ref()
            .map_or(true, |content| content.state == ClaimState::InFlight)
    }

    /// Human readable holder description for messages.
    pub fn holder_description(&self) -> String {
        match &self.content {
            Some(content) if content.state == ClaimState::Held => {
                format!("pid {} on {}", content.pid, content.hostname)
            }
            Some(content) => format!(
                "pid {} on {} (claim in flight)",
                content.pid, content.hostname
            ),
            None => format!("{} (unreadable claim)", self.file.holder),
        }
    }
}

/// Result of a lock attempt that did not hit an I/O error.
pub enum LockOutcome {
    Acquired(BackupLockGuard),
    /// A live conflicting lock exists and no waiting was requested.
    Conflict(LockInfo),
    /// A live conflicting lock still existed when the wait timeout expired.
    TimedOut(LockInfo),
}

impl LockOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LockOutcome::Conflict(_) | LockOutcome::TimedOut(_))
    }
}

enum Claim {
    Acquired(BackupLockGuard),
    Busy(LockInfo),
    Raced(LockInfo),
    /// Our own claim was removed by someone else before it became final.
    Vanished(LockFile),
}

struct LockManagerImpl {
    storage: Arc<dyn CatalogStorage>,
    clock: Arc<dyn Clock>,
    identity: Arc<ProcessIdentity>,
    lock_dir: PathBuf,
    ttl: i64,
    poll_interval: Duration,
    race_retries: u32,
}

/// Creates, renews and releases backup locks in one lock directory.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockManagerImpl>,
}

impl LockManager {
    pub fn new(
        storage: Arc<dyn CatalogStorage>,
        clock: Arc<dyn Clock>,
        identity: Arc<ProcessIdentity>,
        lock_dir: PathBuf,
        config: &CatalogConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LockManagerImpl {
                storage,
                clock,
                identity,
                lock_dir,
                ttl: config.lock_ttl(),
                poll_interval: config.poll_interval(),
                race_retries: config.lock_race_retries,
            }),
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.inner.lock_dir
    }

    pub fn ttl(&self) -> i64 {
        self.inner.ttl
    }

    fn lock_path(&self, file: &LockFile) -> PathBuf {
        self.inner.lock_dir.join(file.file_name())
    }

    /// All claims referencing `backup_id`, including expired ones.
    pub fn list_locks(&self, backup_id: BackupId) -> Result<Vec<LockInfo>, Error> {
        let storage = &self.inner.storage;
        let prefix = format!("{backup_id}_");

        let mut list = Vec::new();
        for name in storage.list(&self.inner.lock_dir, &prefix)? {
            let file = match LockFile::parse(&name) {
                Some(file) if file.backup_id == backup_id => file,
                _ => continue, // temporary files of a renewal, foreign files
            };
            let path = self.lock_path(&file);

            let data = match storage.read(&path)? {
                Some(data) => data,
                None => continue, // released meanwhile
            };

            let content = match serde_json::from_slice::<LockContent>(&data) {
                Ok(content) => Some(content),
                Err(err) => {
                    log::debug!("unable to parse lock file {name} - {err}");
                    None
                }
            };

            let timestamp = match &content {
                Some(content) => content.timestamp,
                None => match storage.modified(&path)? {
                    Some(mtime) => mtime,
                    None => continue,
                },
            };

            list.push(LockInfo {
                file,
                content,
                timestamp,
            });
        }
        Ok(list)
    }

    /// Live (not expired) claims on `backup_id`.
    pub fn live_locks(&self, backup_id: BackupId) -> Result<Vec<LockInfo>, Error> {
        let now = self.inner.clock.now();
        let ttl = self.inner.ttl;
        Ok(self
            .list_locks(backup_id)?
            .into_iter()
            .filter(|info| !info.is_expired(now, ttl))
            .collect())
    }

    /// Remove every expired claim on `backup_id`, returns how many were removed.
    pub fn expire_stale(&self, backup_id: BackupId) -> Result<usize, Error> {
        let now = self.inner.clock.now();
        let mut removed = 0;
        for info in self.list_locks(backup_id)? {
            if info.is_expired(now, self.inner.ttl) && self.remove_stale(&info, now)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn remove_stale(&self, info: &LockInfo, now: i64) -> Result<bool, Error> {
        log::warn!(
            "removing stale {} lock {} on backup {} (last renewed {}s ago)",
            info.file.mode,
            info.file.file_name(),
            info.file.backup_id,
            now - info.timestamp,
        );
        self.inner.storage.remove(&self.lock_path(&info.file))
    }

    fn claim_once(&self, backup_id: BackupId, mode: LockMode) -> Result<Claim, Error> {
        let storage = &self.inner.storage;
        let ttl = self.inner.ttl;

        let now = self.inner.clock.now();
        let mut busy = None;
        for info in self.list_locks(backup_id)? {
            if info.is_expired(now, ttl) {
                self.remove_stale(&info, now)?;
                continue;
            }
            if busy.is_none() && mode.conflicts_with(info.file.mode) {
                busy = Some(info);
            }
        }
        if let Some(info) = busy {
            return Ok(Claim::Busy(info));
        }

        let file = LockFile {
            backup_id,
            holder: self.inner.identity.next_holder(),
            mode,
        };
        let path = self.lock_path(&file);
        let claim = self.content_for(&file, ClaimState::InFlight);
        if !storage.create_new(&path, &serde_json::to_vec(&claim)?)? {
            bail!("lock file {:?} already exists", path);
        }

        // the guard removes the claim again on every early return below
        let guard = BackupLockGuard {
            manager: self.clone(),
            file,
            released: false,
        };

        let now = self.inner.clock.now();
        for info in self.list_locks(backup_id)? {
            if info.file == guard.file || !mode.conflicts_with(info.file.mode) {
                continue;
            }
            // a racer's claim in flight is never stale here
            if !info.in_flight() && info.is_expired(now, ttl) {
                continue;
            }
            return Ok(Claim::Raced(info));
        }

        // someone may have taken our claim for stale meanwhile
        let current = storage
            .read(&path)?
            .and_then(|data| serde_json::from_slice::<LockContent>(&data).ok());
        if current.as_ref() != Some(&claim) {
            let mut guard = guard;
            guard.released = true;
            return Ok(Claim::Vanished(guard.file.clone()));
        }

        self.write_content(&guard.file, &path, ClaimState::Held)?;

        Ok(Claim::Acquired(guard))
    }

    fn content_for(&self, file: &LockFile, state: ClaimState) -> LockContent {
        LockContent {
            backup_id: file.backup_id,
            mode: file.mode,
            state,
            pid: self.inner.identity.pid(),
            hostname: self.inner.identity.hostname().to_string(),
            timestamp: self.inner.clock.now(),
        }
    }

    fn write_content(&self, file: &LockFile, path: &Path, state: ClaimState) -> Result<(), Error> {
        let data = serde_json::to_vec(&self.content_for(file, state))?;
        self.inner.storage.replace(path, &data)
    }

    fn race_backoff(&self, attempt: u32) -> Duration {
        let base = self.inner.poll_interval.as_millis() as u64;
        let factor = 1u64 << attempt.min(4);
        let millis = rand::thread_rng().gen_range(base / 2..=base * factor);
        Duration::from_millis(millis.max(1))
    }

    /// Try to lock `backup_id`.
    ///
    /// With `wait` set, a conflicting lock is polled until it goes away or the timeout
    /// expires. Only I/O problems are returned as error.
    pub fn try_lock(
        &self,
        backup_id: BackupId,
        mode: LockMode,
        wait: Option<Duration>,
    ) -> Result<LockOutcome, Error> {
        let deadline = wait.map(|wait| Instant::now() + wait);
        let mut races = 0;

        loop {
            match self.claim_once(backup_id, mode)? {
                Claim::Acquired(guard) => {
                    log::debug!("acquired {mode} lock {}", guard.file.file_name());
                    return Ok(LockOutcome::Acquired(guard));
                }
                Claim::Busy(holder) => {
                    let deadline = match deadline {
                        None => return Ok(LockOutcome::Conflict(holder)),
                        Some(deadline) => deadline,
                    };
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(LockOutcome::TimedOut(holder));
                    }
                    std::thread::sleep(self.inner.poll_interval.min(deadline - now));
                }
                Claim::Raced(other) => {
                    races += 1;
                    if races > self.inner.race_retries {
                        log::warn!(
                            "giving up {mode} lock on backup {backup_id} after {} lock races",
                            races - 1
                        );
                        return Ok(LockOutcome::Conflict(other));
                    }
                    log::info!(
                        "lock race condition on backup {backup_id} with {} - retry {races}/{}",
                        other.file.file_name(),
                        self.inner.race_retries,
                    );
                    std::thread::sleep(self.race_backoff(races));
                }
                Claim::Vanished(file) => {
                    races += 1;
                    if races > self.inner.race_retries {
                        return Err(CatalogError::LockLost {
                            backup_id,
                            lock: file.file_name(),
                        }
                        .into());
                    }
                    log::warn!(
                        "lock claim {} on backup {backup_id} was removed by someone else - \
                         retry {races}/{}",
                        file.file_name(),
                        self.inner.race_retries,
                    );
                    std::thread::sleep(self.race_backoff(races));
                }
            }
        }
    }

    /// Like [`try_lock`](Self::try_lock), but conflicts are returned as [`CatalogError`].
    pub fn acquire(
        &self,
        backup_id: BackupId,
        mode: LockMode,
        wait: Option<Duration>,
    ) -> Result<BackupLockGuard, Error> {
        match self.try_lock(backup_id, mode, wait)? {
            LockOutcome::Acquired(guard) => Ok(guard),
            LockOutcome::Conflict(holder) => Err(CatalogError::LockConflict {
                backup_id,
                holder: holder.holder_description(),
                mode: holder.file.mode,
                hint: "backup is in use by another operation".to_string(),
            }
            .into()),
            LockOutcome::TimedOut(holder) => Err(CatalogError::LockTimeout {
                backup_id,
                holder: holder.holder_description(),
            }
            .into()),
        }
    }

    /// Refresh the timestamp of a held lock.
    pub fn renew(&self, guard: &BackupLockGuard) -> Result<(), Error> {
        self.renew_file(&guard.file)
    }

    fn renew_file(&self, file: &LockFile) -> Result<(), Error> {
        let path = self.lock_path(file);
        if !self.inner.storage.exists(&path)? {
            return Err(CatalogError::LockLost {
                backup_id: file.backup_id,
                lock: file.file_name(),
            }
            .into());
        }
        self.write_content(file, &path, ClaimState::Held)
    }

    /// Release a lock, reporting errors. Dropping the guard releases it as well.
    pub fn release(&self, mut guard: BackupLockGuard) -> Result<(), Error> {
        guard.released = true;
        let path = self.lock_path(&guard.file);
        if !self.inner.storage.remove(&path)? {
            log::warn!("lock {} was already gone on release", guard.file.file_name());
        }
        Ok(())
    }
}

/// A held backup lock, removed from disk when dropped.
pub struct BackupLockGuard {
    manager: LockManager,
    file: LockFile,
    released: bool,
}

impl BackupLockGuard {
    #[inline]
    pub fn backup_id(&self) -> BackupId {
        self.file.backup_id
    }

    #[inline]
    pub fn mode(&self) -> LockMode {
        self.file.mode
    }

    pub fn lock_file(&self) -> &LockFile {
        &self.file
    }
}

impl std::fmt::Debug for BackupLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BackupLockGuard")
            .field("file", &self.file.file_name())
            .finish()
    }
}

impl Drop for BackupLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let path = self.manager.lock_path(&self.file);
        if let Err(err) = self.manager.inner.storage.remove(&path) {
            log::error!("unable to release lock {:?} - {}", path, err);
        }
    }
}

/// Background thread renewing a set of locks until dropped.
pub struct LockRenewer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    lost: Arc<Mutex<Option<CatalogError>>>,
}

impl LockRenewer {
    pub fn spawn(
        manager: &LockManager,
        guards: &[&BackupLockGuard],
        interval: Duration,
    ) -> Result<Self, Error> {
        let files: Vec<LockFile> = guards.iter().map(|guard| guard.file.clone()).collect();
        let manager = manager.clone();
        let lost = Arc::new(Mutex::new(None));
        let lost2 = Arc::clone(&lost);
        let (stop, stop_rx) = bounded::<()>(0);

        let handle = std::thread::Builder::new()
            .name("lock renewer".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                for file in files.iter() {
                    if let Err(err) = manager.renew_file(file) {
                        log::error!("unable to renew lock {} - {}", file.file_name(), err);
                        if let Ok(catalog_err) = err.downcast::<CatalogError>() {
                            let mut lost = lost2.lock().unwrap();
                            if lost.is_none() {
                                *lost = Some(catalog_err);
                            }
                        }
                    }
                }
            })
            .map_err(|err| format_err!("unable to spawn lock renewer - {err}"))?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
            lost,
        })
    }

    /// Fails if one of the renewed locks was lost.
    pub fn check(&self) -> Result<(), Error> {
        let lost = self.lost.lock().unwrap();
        match &*lost {
            Some(CatalogError::LockLost { backup_id, lock }) => Err(CatalogError::LockLost {
                backup_id: *backup_id,
                lock: lock.clone(),
            }
            .into()),
            Some(other) => Err(format_err!("lock renewal failed - {other}")),
            None => Ok(()),
        }
    }
}

impl Drop for LockRenewer {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("lock renewer thread panicked");
            }
        }
    }
}
