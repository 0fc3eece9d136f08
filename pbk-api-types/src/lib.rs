//! Basic types used by most of the backup catalog code.

mod backup;
pub use backup::*;

mod lsn;
pub use lsn::*;

mod lock;
pub use lock::*;

mod config;
pub use config::*;

pub mod common_regex;

/// File name of a backup's control record.
pub const BACKUP_CONTROL_FILE: &str = "backup.control";

/// File name of a backup's file list.
pub const BACKUP_CONTENT_FILE: &str = "backup_content.control";

/// File name of the per instance configuration.
pub const INSTANCE_CONFIG_FILE: &str = "pg_probackup.conf";

/// Sub directory of a backup holding the copied data files.
pub const DATABASE_DIR: &str = "database";

pub const BACKUPS_DIR: &str = "backups";
pub const WAL_DIR: &str = "wal";
pub const LOCKS_DIR: &str = "locks";
