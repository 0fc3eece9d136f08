#![allow(dead_code)]

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use tempfile::TempDir;

use pbk_api_types::{BackupId, BackupMode, CatalogConfig, Lsn, TimeLineId};
use pbk_datastore::{
    BackupRecord, Catalog, CatalogStorage, LocalStorage, ManualClock, ProcessIdentity,
};
use probackup::backup::{create_backup, BackupOptions, BackupSource, BackupStart, SourceFile};

pub const INSTANCE: &str = "main";
pub const LOCK_TTL: i64 = 60;
pub const SEGMENT_SIZE: u64 = 1024 * 1024;

/// A catalog in a temporary directory, shared by several simulated processes.
pub struct TestCatalog {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
}

impl TestCatalog {
    pub fn new() -> Result<Self, Error> {
        Self::with_clock(ManualClock::new(1_700_000_000))
    }

    /// A catalog whose clock starts at the real time, so file times and the clock agree
    /// until the test moves the clock.
    pub fn starting_now() -> Result<Self, Error> {
        Self::with_clock(ManualClock::starting_now())
    }

    fn with_clock(clock: ManualClock) -> Result<Self, Error> {
        let _ = env_logger::builder().is_test(true).try_init();
        let env = Self {
            dir: tempfile::tempdir()?,
            clock: Arc::new(clock),
        };
        env.process(1)?.add_instance()?;
        Ok(env)
    }

    pub fn config() -> CatalogConfig {
        CatalogConfig {
            lock_ttl: LOCK_TTL as u64,
            lock_poll_interval: 5,
            wal_segment_size: SEGMENT_SIZE,
            archive_timeout: 0,
            ..Default::default()
        }
    }

    /// The catalog as seen by process `pid`.
    pub fn process(&self, pid: u32) -> Result<Catalog, Error> {
        self.process_with_config(pid, Self::config())
    }

    pub fn process_with_config(&self, pid: u32, config: CatalogConfig) -> Result<Catalog, Error> {
        self.process_on(pid, config, Arc::new(LocalStorage::without_fsync()))
    }

    /// The catalog as seen by process `pid` through `storage`.
    pub fn process_on(
        &self,
        pid: u32,
        config: CatalogConfig,
        storage: Arc<dyn CatalogStorage>,
    ) -> Result<Catalog, Error> {
        Catalog::new(
            self.dir.path(),
            INSTANCE,
            storage,
            self.clock.clone(),
            Arc::new(ProcessIdentity::new(pid, "testhost")),
            config,
        )
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Let time pass until locks that are not renewed expire.
    pub fn expire_locks(&self) {
        self.clock.advance(LOCK_TTL + 1);
    }
}

type Hook = Box<dyn Fn(&LocalStorage, &Path) + Send + Sync>;

/// Local storage calling hooks after some operations, to play a concurrent process.
#[derive(Default)]
pub struct HookedStorage {
    inner: LocalStorage,
    after_create_new: Option<Hook>,
    after_remove: Option<Hook>,
    after_list: Option<Hook>,
}

impl HookedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the path of every file created by `create_new`.
    pub fn after_create_new(
        mut self,
        hook: impl Fn(&LocalStorage, &Path) + Send + Sync + 'static,
    ) -> Self {
        self.after_create_new = Some(Box::new(hook));
        self
    }

    /// Called with the path of every removed file.
    pub fn after_remove(
        mut self,
        hook: impl Fn(&LocalStorage, &Path) + Send + Sync + 'static,
    ) -> Self {
        self.after_remove = Some(Box::new(hook));
        self
    }

    /// Called with the directory of every listing, after the names were read.
    pub fn after_list(
        mut self,
        hook: impl Fn(&LocalStorage, &Path) + Send + Sync + 'static,
    ) -> Self {
        self.after_list = Some(Box::new(hook));
        self
    }
}

impl CatalogStorage for HookedStorage {
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, Error> {
        self.inner.read(path)
    }

    fn replace(&self, path: &Path, data: &[u8]) -> Result<(), Error> {
        self.inner.replace(path, data)
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> Result<bool, Error> {
        let created = self.inner.create_new(path, data)?;
        if let (true, Some(hook)) = (created, &self.after_create_new) {
            hook(&self.inner, path);
        }
        Ok(created)
    }

    fn remove(&self, path: &Path) -> Result<bool, Error> {
        let removed = self.inner.remove(path)?;
        if let Some(hook) = &self.after_remove {
            hook(&self.inner, path);
        }
        Ok(removed)
    }

    fn list(&self, dir: &Path, prefix: &str) -> Result<Vec<String>, Error> {
        let names = self.inner.list(dir, prefix)?;
        if let Some(hook) = &self.after_list {
            hook(&self.inner, dir);
        }
        Ok(names)
    }

    fn modified(&self, path: &Path) -> Result<Option<i64>, Error> {
        self.inner.modified(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        self.inner.rename(from, to)
    }

    fn create_dir(&self, path: &Path) -> Result<bool, Error> {
        self.inner.create_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), Error> {
        self.inner.create_dir_all(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), Error> {
        self.inner.remove_dir_all(path)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>, Error> {
        self.inner.open(path)
    }

    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>, Error> {
        self.inner.create(path)
    }
}

/// Database cluster kept in memory.
pub struct MemorySource {
    pub timeline: TimeLineId,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub files: Vec<(String, Vec<u8>)>,
    /// Reading this file fails.
    pub fail_on: Option<String>,
}

impl MemorySource {
    pub fn new(start_lsn: u64, stop_lsn: u64, files: &[(&str, &[u8])]) -> Self {
        Self {
            timeline: 1,
            start_lsn: Lsn(start_lsn),
            stop_lsn: Lsn(stop_lsn),
            files: files
                .iter()
                .map(|(path, data)| (path.to_string(), data.to_vec()))
                .collect(),
            fail_on: None,
        }
    }
}

impl BackupSource for MemorySource {
    fn timeline(&mut self) -> Result<TimeLineId, Error> {
        Ok(self.timeline)
    }

    fn start(&mut self) -> Result<BackupStart, Error> {
        Ok(BackupStart {
            start_lsn: self.start_lsn,
            timeline: self.timeline,
        })
    }

    fn files(&mut self) -> Result<Vec<SourceFile>, Error> {
        Ok(self
            .files
            .iter()
            .map(|(path, _)| SourceFile {
                path: path.clone(),
                is_datafile: path.starts_with("base/"),
            })
            .collect())
    }

    fn open(&mut self, path: &str) -> Result<Box<dyn Read + '_>, Error> {
        if self.fail_on.as_deref() == Some(path) {
            bail!("read error on {path}");
        }
        let data = self
            .files
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, data)| data.as_slice())
            .ok_or_else(|| format_err!("no such file {path}"))?;
        Ok(Box::new(data))
    }

    fn stop(&mut self) -> Result<Lsn, Error> {
        Ok(self.stop_lsn)
    }
}

/// Take a stream backup, one minute after the previous one.
pub fn take_backup(
    catalog: &Catalog,
    clock: &ManualClock,
    mode: BackupMode,
    source: &mut MemorySource,
) -> Result<BackupRecord, Error> {
    clock.advance(60);
    let mut options = BackupOptions::new(mode);
    options.stream = true;
    create_backup(catalog, source, &options)
}

pub fn ids(list: &[BackupRecord]) -> Vec<BackupId> {
    list.iter().map(|record| record.backup_id).collect()
}

pub fn read_file(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap_or_else(|err| panic!("unable to read {path:?} - {err}"))
}
