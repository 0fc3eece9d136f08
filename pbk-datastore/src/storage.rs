//! Path addressed storage the catalog lives on.
//!
//! The catalog only needs a handful of primitives. The two that carry the concurrency guarantees
//! are [`CatalogStorage::replace`], which must be atomic (readers see either the old or the new
//! content, never a mix), and [`CatalogStorage::create_new`], which must fail if the path
//! already exists and must never expose a partially written file.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use rand::Rng;

use proxmox_sys::fs::{create_path, file_get_optional_contents, replace_file, CreateOptions};

pub trait CatalogStorage: Send + Sync {
    /// Read a whole file, `None` if it does not exist.
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, Error>;

    /// Atomically replace (or create) a file.
    fn replace(&self, path: &Path, data: &[u8]) -> Result<(), Error>;

    /// Create a file holding `data`, returns `false` if it already existed.
    fn create_new(&self, path: &Path, data: &[u8]) -> Result<bool, Error>;

    /// Remove a file, returns `false` if it did not exist.
    fn remove(&self, path: &Path) -> Result<bool, Error>;

    /// Names of the entries in `dir` starting with `prefix`. A missing directory is empty.
    fn list(&self, dir: &Path, prefix: &str) -> Result<Vec<String>, Error>;

    /// Modification time in epoch seconds, `None` if the file does not exist.
    fn modified(&self, path: &Path) -> Result<Option<i64>, Error>;

    /// Atomically rename a file or directory.
    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error>;

    /// Create a single directory, returns `false` if it already existed.
    fn create_dir(&self, path: &Path) -> Result<bool, Error>;

    /// Create a directory including all missing parents.
    fn create_dir_all(&self, path: &Path) -> Result<(), Error>;

    /// Remove a directory tree, a missing directory is not an error.
    fn remove_dir_all(&self, path: &Path) -> Result<(), Error>;

    /// Open a (possibly large) file for streaming reads.
    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>, Error>;

    /// Create or truncate a file for streaming writes, parent directories are created.
    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>, Error>;

    fn exists(&self, path: &Path) -> Result<bool, Error> {
        Ok(self.modified(path)?.is_some())
    }
}

/// Storage on a local file system.
#[derive(Clone, Debug, Default)]
pub struct LocalStorage {
    fsync: bool,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self { fsync: true }
    }

    /// Skip fsync on replaced files, only useful for tests.
    pub fn without_fsync() -> Self {
        Self { fsync: false }
    }
}

impl CatalogStorage for LocalStorage {
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, Error> {
        file_get_optional_contents(path)
    }

    fn replace(&self, path: &Path, data: &[u8]) -> Result<(), Error> {
        // writes a temporary file in the same directory and renames it over the target
        replace_file(path, data, CreateOptions::new(), self.fsync)
            .map_err(|err| format_err!("unable to replace {path:?} - {err}"))
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> Result<bool, Error> {
        // the content goes into a private file first, linking it into place fails if the
        // target exists
        let tmp = private_temp_path(path)?;
        let result = (|| -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)?;
            file.write_all(data)?;
            if self.fsync {
                file.sync_all()?;
            }
            std::fs::hard_link(&tmp, path)
        })();
        if let Err(err) = std::fs::remove_file(&tmp) {
            log::debug!("unable to remove temporary file {tmp:?} - {err}");
        }
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(format_err!("unable to create {path:?} - {err}")),
        }
    }

    fn remove(&self, path: &Path) -> Result<bool, Error> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(format_err!("unable to remove {path:?} - {err}")),
        }
    }

    fn list(&self, dir: &Path, prefix: &str) -> Result<Vec<String>, Error> {
        let read_dir = match std::fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(format_err!("unable to list {dir:?} - {err}")),
        };

        let mut names = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                if name.starts_with(prefix) {
                    names.push(name);
                }
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    fn modified(&self, path: &Path) -> Result<Option<i64>, Error> {
        match std::fs::metadata(path) {
            Ok(stat) => Ok(Some(stat.mtime())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(format_err!("unable to stat {path:?} - {err}")),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        std::fs::rename(from, to)
            .map_err(|err| format_err!("unable to rename {from:?} to {to:?} - {err}"))
    }

    fn create_dir(&self, path: &Path) -> Result<bool, Error> {
        match std::fs::create_dir(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(format_err!("unable to create directory {path:?} - {err}")),
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), Error> {
        create_path(path, None, None)
            .map_err(|err: Error| format_err!("unable to create directory {path:?} - {err}"))?;
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), Error> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(format_err!("removing directory {path:?} failed - {err}")),
        }
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>, Error> {
        let file = std::fs::File::open(path)
            .map_err(|err| format_err!("unable to open {path:?} - {err}"))?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>, Error> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)
            .map_err(|err| format_err!("unable to create {path:?} - {err}"))?;
        Ok(Box::new(std::io::BufWriter::new(file)))
    }
}

/// `<dir>/.<name>.tmp_<random>`, hidden from prefix listings of `<dir>`.
fn private_temp_path(path: &Path) -> Result<PathBuf, Error> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format_err!("invalid file name {path:?}"))?;
    let suffix: u64 = rand::thread_rng().gen();
    Ok(path.with_file_name(format!(".{name}.tmp_{suffix:016x}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_storage_primitives() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let storage = LocalStorage::without_fsync();

        let file = dir.path().join("a_1");
        assert!(storage.create_new(&file, b"first")?);
        assert!(!storage.create_new(&file, b"second")?);
        assert_eq!(storage.read(&file)?.as_deref(), Some(&b"first"[..]));
        // no temporary files are left behind
        assert_eq!(storage.list(dir.path(), "")?, vec!["a_1".to_string()]);

        storage.replace(&file, b"content")?;
        assert_eq!(storage.read(&file)?.as_deref(), Some(&b"content"[..]));

        storage.replace(&dir.path().join("b_1"), b"")?;
        assert_eq!(storage.list(dir.path(), "a_")?, vec!["a_1".to_string()]);
        assert_eq!(storage.list(&dir.path().join("missing"), "")?.len(), 0);

        assert!(storage.remove(&file)?);
        assert!(!storage.remove(&file)?);
        assert_eq!(storage.read(&file)?, None);
        assert_eq!(storage.modified(&file)?, None);

        let nested = dir.path().join("x/y/data");
        let mut writer = storage.create(&nested)?;
        writer.write_all(b"0123")?;
        writer.flush()?;
        drop(writer);
        let mut data = Vec::new();
        storage.open(&nested)?.read_to_end(&mut data)?;
        assert_eq!(data, b"0123");
        Ok(())
    }
}
