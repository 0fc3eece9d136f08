//! Time and process identity sources.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use anyhow::Error;

/// Wall clock used for lock timestamps and backup start/end times.
pub trait Clock: Send + Sync {
    /// Current time in epoch seconds.
    fn now(&self) -> i64;
}

/// The real system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        proxmox_time::epoch_i64()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    /// Starts at the current system time.
    pub fn starting_now() -> Self {
        Self::new(proxmox_time::epoch_i64())
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Identity used to label lock files.
///
/// A holder label is `<pid>-<sequence>@<host>`, the sequence tells apart several locks taken
/// by the same process. Characters of the host name that are not allowed in lock file names
/// are replaced by `-`.
#[derive(Debug)]
pub struct ProcessIdentity {
    pid: u32,
    hostname: String,
    host_label: String,
    sequence: AtomicU64,
}

impl ProcessIdentity {
    pub fn new(pid: u32, hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        let mut host_label: String = hostname
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        if host_label.is_empty() {
            host_label.push_str("unknown");
        }
        Self {
            pid,
            hostname,
            host_label,
            sequence: AtomicU64::new(0),
        }
    }

    /// Identity of the running process.
    pub fn current() -> Result<Self, Error> {
        let hostname = nix::unistd::gethostname()?;
        Ok(Self::new(
            std::process::id(),
            hostname.to_string_lossy().into_owned(),
        ))
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[inline]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// A fresh holder label for a new lock claim.
    pub fn next_holder(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}@{}", self.pid, seq, self.host_label)
    }
}
