//! This crate implements the backup catalog: storage access, locking and the backup
//! lifecycle.
//!
//! # Catalog layout
//!
//! A catalog holds the backups of one or more database instances. Every backup is a
//! directory named after its id (the start time in base36) containing a control record
//! (`backup.control`), a file list (`backup_content.control`) and the copied data files.
//! Incremental backups reference their parent by id, a chain always starts with a full
//! backup.
//!
//! Control records and file lists are only ever replaced atomically (write a temporary
//! file, then rename it), so a reader sees either the old or the new version. The file
//! list is protected by a checksum stored in the control record.
//!
//! # Locking
//!
//! Operations are separate processes which possibly run on different hosts sharing the
//! catalog storage, so `flock` style locks are not an option. Each backup is instead
//! protected by lock files in the catalog wide `locks` directory, see [`lock`] for the
//! protocol. Locks carry a timestamp which their holder renews periodically, a lock that
//! was not renewed for longer than the TTL belongs to a crashed process and may be
//! removed by anyone.
//!
//! Which lock an operation needs:
//!
//! | operation | lock |
//! |-|-|
//! | backup | exclusive on the new backup, shared on every chain member it builds on |
//! | validate, show | shared on each backup, busy backups are skipped |
//! | restore | shared on every chain member |
//! | merge | exclusive on every member of the merged chain segment |
//! | delete | exclusive on the backup and, when cascading, its descendants |
//! | set-status | exclusive |
//!
//! Status changes follow the table in [`status`]. A `RUNNING` backup is only touched by
//! another process if no live exclusive lock exists for it, it is then marked `ERROR`.

pub mod catalog;
pub mod chain;
pub mod clock;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod status;
pub mod storage;
pub mod wal;

pub use catalog::{Catalog, RunningState};
pub use clock::{Clock, ManualClock, ProcessIdentity, SystemClock};
pub use error::{catalog_error, CatalogError};
pub use lock::{BackupLockGuard, LockInfo, LockManager, LockOutcome, LockRenewer};
pub use manifest::{BackupContent, BackupRecord, FileEntry};
pub use status::StatusEvent;
pub use storage::{CatalogStorage, LocalStorage};
pub use wal::{PushOutcome, TimelineHistory, WalArchive, WalSegment};
