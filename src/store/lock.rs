use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{ImportError, Result};

const LOCK_FILE: &str = ".lock";

/// Exclusive ownership of a data directory for the lifetime of one run.
/// The lock is released when the guard is dropped.
#[derive(Debug)]
pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    /// Create `data_dir` if needed and lock it, failing fast when another
    /// importer process already owns it.
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|_| ImportError::Locked(data_dir.display().to_string()))?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly (normally handled by Drop).
    pub fn release(self) -> Result<()> {
        self.file.unlock()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_owner_is_refused_until_release() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("transition_data");

        let guard = DataDirLock::acquire(&data_dir).unwrap();
        assert!(guard.path().exists());
        let err = DataDirLock::acquire(&data_dir).unwrap_err();
        assert_eq!(err.code(), "locked");

        guard.release().unwrap();
        let _again = DataDirLock::acquire(&data_dir).unwrap();
    }
}
