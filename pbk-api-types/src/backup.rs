use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use crate::common_regex::BACKUP_ID_REGEX;

const BASE36_DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Identifies a backup inside an instance catalog.
///
/// The id is the backup start time (epoch seconds), printed in upper case base36. Ordering ids
/// therefore orders backups by start time.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct BackupId(i64);

impl BackupId {
    pub fn from_start_time(start_time: i64) -> Result<Self, Error> {
        if start_time <= 0 {
            bail!("invalid backup start time {start_time}");
        }
        Ok(Self(start_time))
    }

    #[inline]
    pub fn start_time(&self) -> i64 {
        self.0
    }

    /// The id used when a backup started in the same second already claimed this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.0 as u64;
        let mut buf = Vec::with_capacity(13);
        loop {
            buf.push(BASE36_DIGITS[(value % 36) as usize]);
            value /= 36;
            if value == 0 {
                break;
            }
        }
        buf.reverse();
        // only ascii digits were pushed
        f.write_str(std::str::from_utf8(&buf).map_err(|_| fmt::Error)?)
    }
}

impl FromStr for BackupId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if !BACKUP_ID_REGEX.is_match(s) {
            bail!("invalid backup id {s:?}");
        }
        let mut value: i64 = 0;
        for c in s.bytes() {
            let digit = match c {
                b'0'..=b'9' => c - b'0',
                b'A'..=b'Z' => c - b'A' + 10,
                _ => bail!("invalid backup id {s:?}"),
            };
            value = match value.checked_mul(36).and_then(|v| v.checked_add(digit as i64)) {
                Some(value) => value,
                None => bail!("backup id {s:?} out of range"),
            };
        }
        BackupId::from_start_time(value)
    }
}

serde_plain::derive_deserialize_from_fromstr!(BackupId, "valid backup id");
serde_plain::derive_serialize_from_display!(BackupId);

/// Backup status.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupStatus {
    /// The backup is being taken (or its owner crashed, see the lock).
    Running,
    /// Data copy finished, not validated yet.
    Done,
    /// Completed and valid.
    Ok,
    /// Failed before completion.
    Error,
    /// Metadata or data failed validation.
    Corrupt,
    /// One of the ancestors is invalid.
    Orphan,
    /// Part of a chain currently being merged.
    Merging,
    /// Data folded into this backup, merge not yet finalized.
    Merged,
    /// Removal in progress.
    Deleting,
    /// Data removed, only the control record is left.
    Deleted,
}
serde_plain::derive_display_from_serialize!(BackupStatus);
serde_plain::derive_fromstr_from_deserialize!(BackupStatus);

impl BackupStatus {
    /// Statuses a chain member may have for descendants to be usable.
    #[inline]
    pub fn is_valid(self) -> bool {
        matches!(self, BackupStatus::Ok | BackupStatus::Done)
    }

    /// Statuses that break every chain passing through the backup.
    #[inline]
    pub fn is_bad(self) -> bool {
        matches!(
            self,
            BackupStatus::Error
                | BackupStatus::Corrupt
                | BackupStatus::Orphan
                | BackupStatus::Deleting
                | BackupStatus::Deleted
        )
    }

    pub fn iter() -> impl Iterator<Item = BackupStatus> {
        [
            BackupStatus::Running,
            BackupStatus::Done,
            BackupStatus::Ok,
            BackupStatus::Error,
            BackupStatus::Corrupt,
            BackupStatus::Orphan,
            BackupStatus::Merging,
            BackupStatus::Merged,
            BackupStatus::Deleting,
            BackupStatus::Deleted,
        ]
        .into_iter()
    }
}

/// Backup modes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupMode {
    /// Complete copy of all data files.
    Full,
    /// Changed blocks found by scanning the archived WAL.
    Page,
    /// Changed blocks found by comparing every data file.
    Delta,
    /// Changed blocks taken from the change tracking map.
    Ptrack,
}
serde_plain::derive_display_from_serialize!(BackupMode);
serde_plain::derive_fromstr_from_deserialize!(BackupMode);

impl BackupMode {
    #[inline]
    pub fn is_incremental(self) -> bool {
        self != BackupMode::Full
    }
}
