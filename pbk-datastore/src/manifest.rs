use std::path::{Component, Path};

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use pbk_api_types::{BackupId, BackupMode, BackupStatus, Lsn, TimeLineId};

/// The control record of a backup (`backup.control`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BackupRecord {
    pub backup_id: BackupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_backup_id: Option<BackupId>,
    pub status: BackupStatus,
    pub backup_mode: BackupMode,
    /// WAL needed for consistency was copied into the backup itself.
    #[serde(default)]
    pub stream: bool,
    pub start_lsn: Lsn,
    #[serde(default)]
    pub stop_lsn: Lsn,
    /// Epoch seconds.
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub current_tli: TimeLineId,
    #[serde(default)]
    pub parent_tli: TimeLineId,
    /// CRC32 of `backup_content.control`.
    #[serde(default)]
    pub content_crc: u32,
    #[serde(default)]
    pub data_bytes: u64,
    #[serde(default)]
    pub wal_bytes: u64,
    /// Set on every chain member while a merge into this backup id is in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_dest_backup: Option<BackupId>,
}

impl BackupRecord {
    /// A record for a backup that has not started yet (no status transition applied).
    pub fn new(
        backup_id: BackupId,
        backup_mode: BackupMode,
        parent: Option<&BackupRecord>,
        start_lsn: Lsn,
        current_tli: TimeLineId,
        stream: bool,
    ) -> Result<Self, Error> {
        match (backup_mode, parent) {
            (BackupMode::Full, Some(parent)) => {
                bail!("full backup {backup_id} cannot have parent {}", parent.backup_id)
            }
            (mode, None) if mode.is_incremental() => {
                bail!("{mode} backup {backup_id} needs a parent backup")
            }
            _ => {}
        }

        Ok(Self {
            backup_id,
            parent_backup_id: parent.map(|p| p.backup_id),
            status: BackupStatus::Running,
            backup_mode,
            stream,
            start_lsn,
            stop_lsn: Lsn::INVALID,
            start_time: backup_id.start_time(),
            end_time: None,
            current_tli,
            parent_tli: parent.map(|p| p.current_tli).unwrap_or(0),
            content_crc: 0,
            data_bytes: 0,
            wal_bytes: 0,
            merge_dest_backup: None,
        })
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.backup_mode == BackupMode::Full
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_data(data: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(data).map_err(|err| format_err!("unable to parse backup control record - {err}"))
    }
}

/// One file of a backup.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct FileEntry {
    /// Path relative to the data directory.
    pub path: String,
    pub size: u64,
    /// CRC32 of the stored data.
    pub crc: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_datafile: bool,
    /// Not copied, the data is found in an ancestor backup.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unchanged: bool,
}

impl FileEntry {
    pub fn check_path(path: &str) -> Result<(), Error> {
        let mut components = Path::new(path).components().peekable();
        if components.peek().is_none() {
            bail!("empty file path in backup");
        }
        for component in components {
            if !matches!(component, Component::Normal(_)) {
                bail!("invalid file path {path:?} in backup");
            }
        }
        Ok(())
    }
}

/// The file list of a backup (`backup_content.control`), one JSON object per line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupContent {
    files: Vec<FileEntry>,
}

impl BackupContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, entry: FileEntry) -> Result<(), Error> {
        FileEntry::check_path(&entry.path)?;
        if self.lookup(&entry.path).is_some() {
            bail!("duplicate file {:?} in backup", entry.path);
        }
        self.files.push(entry);
        Ok(())
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files[..]
    }

    pub fn lookup(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|entry| entry.path == path)
    }

    /// Bytes actually stored in this backup.
    pub fn stored_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter(|entry| !entry.unchanged)
            .map(|entry| entry.size)
            .sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        for entry in self.files.iter() {
            serde_json::to_writer(&mut data, entry)?;
            data.push(b'\n');
        }
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut content = BackupContent::new();
        for (lineno, line) in data.split(|b| *b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            let entry: FileEntry = serde_json::from_slice(line).map_err(|err| {
                format_err!("unable to parse file list line {} - {}", lineno + 1, err)
            })?;
            content.add_file(entry)?;
        }
        Ok(content)
    }
}

/// CRC32 as stored in the control record.
pub fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
