//! Numbered checkpoint files in a shared directory.
//!
//! Each family of checkpoints uses its own file-name prefix
//! (`<prefix><N>.<ext>`). The current index of a family is the largest `N`
//! among matching files; a fresh directory has index 0.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A naming scheme for one kind of checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFamily {
    pub prefix: String,
    pub extension: String,
}

impl CheckpointFamily {
    pub const HPC_PREFIX: &'static str = "hpc_ckpt_";
    pub const REGULAR_PREFIX: &'static str = "run_ckpt_";
    pub const EXTENSION: &'static str = "ckpt";

    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    /// Checkpoints written in response to a preemption notice.
    pub fn hpc() -> Self {
        Self::new(Self::HPC_PREFIX, Self::EXTENSION)
    }

    /// Checkpoints written on request by the training loop.
    pub fn regular() -> Self {
        Self::new(Self::REGULAR_PREFIX, Self::EXTENSION)
    }

    pub fn file_name(&self, index: u64) -> String {
        format!("{}{}.{}", self.prefix, index, self.extension)
    }

    /// Index encoded in `file_name`, if it belongs to this family.
    ///
    /// All digits between the last occurrence of the prefix and the family
    /// extension are concatenated; names with no digits there, and in-flight
    /// `.part` files, are not indexed.
    pub fn index_of(&self, file_name: &str) -> Option<u64> {
        if file_name.ends_with(".part") {
            return None;
        }
        let start = file_name.rfind(&self.prefix)? + self.prefix.len();
        let suffix = &file_name[start..];
        let stem = suffix
            .strip_suffix(self.extension.as_str())
            .and_then(|rest| rest.strip_suffix('.'))
            .unwrap_or(suffix);
        let digits: String = stem
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        if digits.is_empty() {
            tracing::debug!(file_name, prefix = %self.prefix, "Ignoring checkpoint without index");
            return None;
        }
        digits.parse().ok()
    }
}

/// Index and path queries over one checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if needed.
    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// All indexed files of `family`, sorted by index.
    pub fn list(&self, family: &CheckpointFamily) -> io::Result<Vec<(u64, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(index) = family.index_of(name) {
                found.push((index, entry.path()));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Largest index of `family`, or 0 when there is none.
    pub fn max_index(&self, family: &CheckpointFamily) -> io::Result<u64> {
        Ok(self
            .list(family)?
            .last()
            .map(|(index, _)| *index)
            .unwrap_or(0))
    }

    /// Path the next checkpoint of `family` should be written to.
    pub fn path_for_next(&self, family: &CheckpointFamily) -> io::Result<PathBuf> {
        let next = self.max_index(family)? + 1;
        Ok(self.dir.join(family.file_name(next)))
    }

    /// Path of the checkpoint with the current index of `family`.
    pub fn path_for_latest(&self, family: &CheckpointFamily) -> io::Result<PathBuf> {
        let index = self.max_index(family)?;
        Ok(self.dir.join(family.file_name(index)))
    }

    /// Latest checkpoint of `family`, if any file of that family exists.
    ///
    /// Returns the listed file itself, which may be named differently from
    /// [`path_for_latest`](Self::path_for_latest) (`hpc_ckpt_05.ckpt`).
    pub fn latest(&self, family: &CheckpointFamily) -> io::Result<Option<PathBuf>> {
        Ok(self.list(family)?.pop().map(|(_, path)| path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn test_max_index_picks_largest() {
        let dir = tempdir().unwrap();
        for name in ["ckpt_1", "ckpt_3", "ckpt_7"] {
            touch(dir.path(), name);
        }
        let store = CheckpointStore::new(dir.path());
        let family = CheckpointFamily::new("ckpt_", "ckpt");

        assert_eq!(store.max_index(&family).unwrap(), 7);
        assert_eq!(
            store.path_for_next(&family).unwrap(),
            dir.path().join("ckpt_8.ckpt")
        );
        assert_eq!(
            store.path_for_latest(&family).unwrap(),
            dir.path().join("ckpt_7.ckpt")
        );
    }

    #[test]
    fn test_missing_or_empty_dir_is_zero() {
        let dir = tempdir().unwrap();
        let family = CheckpointFamily::hpc();

        let empty = CheckpointStore::new(dir.path());
        assert_eq!(empty.max_index(&family).unwrap(), 0);
        assert!(empty.latest(&family).unwrap().is_none());

        let missing = CheckpointStore::new(dir.path().join("does-not-exist"));
        assert_eq!(missing.max_index(&family).unwrap(), 0);
        assert_eq!(
            missing.path_for_next(&family).unwrap(),
            dir.path().join("does-not-exist").join("hpc_ckpt_1.ckpt")
        );
    }

    #[test]
    fn test_families_do_not_mix() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "hpc_ckpt_4.ckpt");
        touch(dir.path(), "run_ckpt_9.ckpt");
        touch(dir.path(), "run_ckpt_2.ckpt");
        let store = CheckpointStore::new(dir.path());

        assert_eq!(store.max_index(&CheckpointFamily::hpc()).unwrap(), 4);
        assert_eq!(store.max_index(&CheckpointFamily::regular()).unwrap(), 9);
        assert_eq!(store.list(&CheckpointFamily::regular()).unwrap().len(), 2);
    }

    #[test]
    fn test_index_of() {
        let family = CheckpointFamily::hpc();
        assert_eq!(family.index_of("hpc_ckpt_12.ckpt"), Some(12));
        assert_eq!(family.index_of("old_hpc_ckpt_3.ckpt"), Some(3));
        assert_eq!(family.index_of("hpc_ckpt_.ckpt"), None);
        assert_eq!(family.index_of("run_ckpt_5.ckpt"), None);
        assert_eq!(family.index_of("hpc_ckpt_5.ckpt.part"), None);
    }

    #[test]
    fn test_digits_in_extension_are_not_part_of_index() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "hpc_ckpt_3.h5");
        touch(dir.path(), "hpc_ckpt_1.h5");
        let store = CheckpointStore::new(dir.path());
        let family = CheckpointFamily::new("hpc_ckpt_", "h5");

        assert_eq!(family.index_of("hpc_ckpt_3.h5"), Some(3));
        assert_eq!(store.max_index(&family).unwrap(), 3);
        let latest = store.latest(&family).unwrap().unwrap();
        assert_eq!(latest, dir.path().join("hpc_ckpt_3.h5"));
        assert!(latest.exists());
        assert_eq!(
            store.path_for_next(&family).unwrap(),
            dir.path().join("hpc_ckpt_4.h5")
        );
    }

    #[test]
    fn test_latest_returns_listed_file() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "hpc_ckpt_05.ckpt");
        let store = CheckpointStore::new(dir.path());
        assert_eq!(
            store.latest(&CheckpointFamily::hpc()).unwrap(),
            Some(dir.path().join("hpc_ckpt_05.ckpt"))
        );
    }

    #[test]
    fn test_orphaned_part_file_not_indexed() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "hpc_ckpt_1.ckpt");
        touch(dir.path(), "hpc_ckpt_2.ckpt.part");
        let store = CheckpointStore::new(dir.path());
        assert_eq!(
            store.latest(&CheckpointFamily::hpc()).unwrap(),
            Some(dir.path().join("hpc_ckpt_1.ckpt"))
        );
    }

    #[test]
    fn test_path_for_next_is_idempotent() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "hpc_ckpt_2.ckpt");
        let store = CheckpointStore::new(dir.path());
        let family = CheckpointFamily::hpc();
        let first = store.path_for_next(&family).unwrap();
        let second = store.path_for_next(&family).unwrap();
        assert_eq!(first, second);
    }
}
