//! Scoped output file
//!
//! Writes land in a hidden temporary file in the target's directory. A
//! successful [`OutputHandle::commit`] syncs it and renames it over the
//! target; dropping the handle instead removes it.

use crate::error::WriteError;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const TEMP_PREFIX: &str = ".duckport-";
const TEMP_SUFFIX: &str = ".tmp";

/// Temporary output file bound to its final path
#[derive(Debug)]
pub struct OutputHandle {
    file: NamedTempFile,
    target: PathBuf,
}

impl OutputHandle {
    /// Create the target's directory and a temporary file inside it
    pub fn acquire(target: &Path) -> Result<Self, WriteError> {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|source| WriteError::Create {
            dir: dir.to_path_buf(),
            source,
        })?;

        let file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(dir)
            .map_err(|source| WriteError::Create {
                dir: dir.to_path_buf(),
                source,
            })?;

        debug!(temp = %file.path().display(), target = %target.display(), "Acquired output");
        Ok(Self {
            file,
            target: target.to_path_buf(),
        })
    }

    /// Path of the temporary file
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Final path the output is renamed to
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn file_mut(&mut self) -> &mut File {
        self.file.as_file_mut()
    }

    /// Sync the temporary file and rename it over the target.
    ///
    /// Returns the size of the committed file in bytes.
    pub fn commit(mut self) -> Result<u64, WriteError> {
        let temp = self.file.path().to_path_buf();
        let io_err = |source| WriteError::Io {
            path: temp.clone(),
            source,
        };

        self.file.as_file_mut().flush().map_err(io_err)?;
        // Reopen by path: some writers replace the file instead of using ours
        File::open(&temp)
            .and_then(|f| f.sync_all())
            .map_err(io_err)?;
        let bytes = fs::metadata(&temp).map_err(io_err)?.len();

        self.file
            .persist(&self.target)
            .map_err(|e| WriteError::Persist {
                path: self.target.clone(),
                source: e.error,
            })?;

        debug!(target = %self.target.display(), bytes, "Committed output");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(TEMP_PREFIX))
            .collect()
    }

    #[test]
    fn test_commit_moves_file_into_place() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/out.csv");

        let mut handle = OutputHandle::acquire(&target).unwrap();
        assert!(!target.exists());
        assert!(handle.path().starts_with(dir.path().join("nested")));
        handle.file_mut().write_all(b"a,b\n").unwrap();

        assert_eq!(handle.commit().unwrap(), 4);
        assert_eq!(fs::read_to_string(&target).unwrap(), "a,b\n");
        assert!(leftovers(&dir.path().join("nested")).is_empty());
    }

    #[test]
    fn test_drop_removes_temp_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.parquet");

        let mut handle = OutputHandle::acquire(&target).unwrap();
        handle.file_mut().write_all(b"partial").unwrap();
        drop(handle);

        assert!(!target.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn test_commit_replaces_existing_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.jsonl");
        fs::write(&target, "old").unwrap();

        let mut handle = OutputHandle::acquire(&target).unwrap();
        handle.file_mut().write_all(b"{}\n").unwrap();
        handle.commit().unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "{}\n");
    }

    #[test]
    fn test_parent_is_a_file() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "x").unwrap();

        let err = OutputHandle::acquire(&blocker.join("out.csv")).unwrap_err();
        assert!(matches!(err, WriteError::Create { .. }));
    }
}
