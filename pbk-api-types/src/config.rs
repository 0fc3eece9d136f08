use std::time::Duration;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

fn default_lock_ttl() -> u64 {
    180
}

fn default_lock_poll_interval() -> u64 {
    100
}

fn default_lock_race_retries() -> u32 {
    10
}

fn default_status_retry_attempts() -> u32 {
    3
}

fn default_wal_segment_size() -> u64 {
    16 * 1024 * 1024
}

fn default_archive_timeout() -> u64 {
    300
}

/// Tunables of the backup catalog.
///
/// Every property is optional in the configuration file.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CatalogConfig {
    /// Seconds after which a lock file that was not renewed counts as abandoned.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: u64,
    /// Seconds between lock renewals. Defaults to half the TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_renew_interval: Option<u64>,
    /// Seconds to wait for a conflicting lock to go away. Zero means fail at once.
    #[serde(default)]
    pub lock_wait_timeout: u64,
    /// Milliseconds between two polls while waiting for a lock.
    #[serde(default = "default_lock_poll_interval")]
    pub lock_poll_interval: u64,
    /// How often a lock acquisition is retried after losing a race.
    #[serde(default = "default_lock_race_retries")]
    pub lock_race_retries: u32,
    /// How often a status transition retries to get its lock.
    #[serde(default = "default_status_retry_attempts")]
    pub status_retry_attempts: u32,
    /// WAL segment size in bytes.
    #[serde(default = "default_wal_segment_size")]
    pub wal_segment_size: u64,
    /// Seconds a backup waits for the WAL it needs to show up in the archive.
    #[serde(default = "default_archive_timeout")]
    pub archive_timeout: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            lock_ttl: default_lock_ttl(),
            lock_renew_interval: None,
            lock_wait_timeout: 0,
            lock_poll_interval: default_lock_poll_interval(),
            lock_race_retries: default_lock_race_retries(),
            status_retry_attempts: default_status_retry_attempts(),
            wal_segment_size: default_wal_segment_size(),
            archive_timeout: default_archive_timeout(),
        }
    }
}

impl CatalogConfig {
    pub fn lock_ttl(&self) -> i64 {
        self.lock_ttl as i64
    }

    /// Always shorter than the TTL.
    pub fn renew_interval(&self) -> Duration {
        match self.lock_renew_interval {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_millis((self.lock_ttl * 1000 / 2).max(1)),
        }
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        match self.lock_wait_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval.max(1))
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.lock_ttl == 0 {
            bail!("lock-ttl must be greater than zero");
        }
        if let Some(renew) = self.lock_renew_interval {
            if renew == 0 || renew >= self.lock_ttl {
                bail!(
                    "lock-renew-interval ({renew}s) must be between 1 and lock-ttl ({}s)",
                    self.lock_ttl
                );
            }
        }
        if !self.wal_segment_size.is_power_of_two()
            || !(1024 * 1024..=1024 * 1024 * 1024).contains(&self.wal_segment_size)
        {
            bail!(
                "wal-segment-size {} is not a power of two between 1MiB and 1GiB",
                self.wal_segment_size
            );
        }
        Ok(())
    }
}
