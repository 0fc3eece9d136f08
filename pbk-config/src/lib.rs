//! Per instance catalog configuration.
//!
//! The configuration lives next to the backups of an instance
//! (`backups/<instance>/pg_probackup.conf`) as JSON. A missing file means all defaults.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{format_err, Error};

use proxmox_sys::fs::{file_read_optional_string, open_file_locked, replace_file, CreateOptions};

use pbk_api_types::{CatalogConfig, BACKUPS_DIR, INSTANCE_CONFIG_FILE};

/// Held while the configuration is modified.
pub struct ConfigLockGuard(#[allow(dead_code)] File);

pub fn config_path(base: &Path, instance: &str) -> PathBuf {
    base.join(BACKUPS_DIR).join(instance).join(INSTANCE_CONFIG_FILE)
}

fn lock_path(base: &Path, instance: &str) -> PathBuf {
    base.join(BACKUPS_DIR)
        .join(instance)
        .join(format!(".{INSTANCE_CONFIG_FILE}.lck"))
}

/// Get exclusive lock
pub fn lock_config(base: &Path, instance: &str) -> Result<ConfigLockGuard, Error> {
    let path = lock_path(base, instance);
    let file = open_file_locked(&path, Duration::new(10, 0), true, CreateOptions::new())
        .map_err(|err| format_err!("unable to lock configuration of instance '{instance}' - {err}"))?;
    Ok(ConfigLockGuard(file))
}

pub fn config(base: &Path, instance: &str) -> Result<CatalogConfig, Error> {
    let path = config_path(base, instance);
    let config = match file_read_optional_string(&path)? {
        Some(content) if !content.trim().is_empty() => serde_json::from_str(&content)
            .map_err(|err| format_err!("unable to parse {path:?} - {err}"))?,
        _ => CatalogConfig::default(),
    };
    config
        .check()
        .map_err(|err| format_err!("invalid configuration in {path:?} - {err}"))?;
    Ok(config)
}

/// Atomically write the configuration, callers hold [`lock_config`].
pub fn save_config(base: &Path, instance: &str, config: &CatalogConfig) -> Result<(), Error> {
    config.check()?;
    let path = config_path(base, instance);
    let raw = serde_json::to_string_pretty(config)?;
    replace_file(&path, raw.as_bytes(), CreateOptions::new(), true)
}
