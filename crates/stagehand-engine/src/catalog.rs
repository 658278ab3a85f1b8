//! Sandbox snapshots for change detection
//!
//! After a download populates a sandbox, a catalog records the (mtime,
//! size) of every regular file. The next upload consults it and sends only
//! entries that changed. Catalogs are rebuilt from a directory scan, never
//! mutated in place, and have no on-disk form.

use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use stagehand_types::{CatalogEntry, Error, Result, EXEC_RENAME_BASENAME};
use tracing::debug;

/// Basename → (mtime, size) snapshot of one directory
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl FileCatalog {
    /// Scan a directory into a fresh catalog
    ///
    /// Directories are skipped; so is the staged executable (nothing with
    /// the executable rename stem is ever a candidate for sending back).
    pub fn build(dir: &Path) -> Result<Self> {
        Self::scan(dir, None)
    }

    /// Build a catalog that mimics spool-time state: every entry carries
    /// the given time and the size sentinel, so only a strictly newer
    /// mtime counts as a change
    pub fn build_spooled(dir: &Path, spool_time: i64) -> Result<Self> {
        Self::scan(dir, Some(spool_time))
    }

    fn scan(dir: &Path, spool_time: Option<i64>) -> Result<Self> {
        let mut entries = HashMap::new();
        let read = std::fs::read_dir(dir)
            .map_err(|e| Error::io(format!("failed to scan {}: {e}", dir.display())))?;
        for dent in read {
            let dent = dent.map_err(|e| Error::io(format!("scan error: {e}")))?;
            let name = dent.file_name().to_string_lossy().to_string();
            if is_excluded(&name) {
                continue;
            }
            let meta = match dent.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_dir() {
                continue;
            }
            let entry = match spool_time {
                Some(time) => CatalogEntry {
                    modification_time: time,
                    file_size: -1,
                },
                None => CatalogEntry {
                    modification_time: mtime_secs(&meta),
                    file_size: meta.len() as i64,
                },
            };
            entries.insert(name, entry);
        }
        debug!("catalogued {} file(s) under {}", entries.len(), dir.display());
        Ok(Self { entries })
    }

    /// Look up a file; a miss means the file is new
    pub fn lookup(&self, name: &str) -> Option<CatalogEntry> {
        self.entries.get(name).copied()
    }

    /// Number of catalogued files
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names under `dir` that are new or changed relative to this catalog
    ///
    /// The scan skips directories and the excluded basenames, mirroring
    /// [`FileCatalog::build`].
    pub fn changed_files(&self, dir: &Path) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        let read = std::fs::read_dir(dir)
            .map_err(|e| Error::io(format!("failed to scan {}: {e}", dir.display())))?;
        for dent in read {
            let dent = dent.map_err(|e| Error::io(format!("scan error: {e}")))?;
            let name = dent.file_name().to_string_lossy().to_string();
            if is_excluded(&name) {
                continue;
            }
            let meta = match dent.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_dir() {
                continue;
            }
            let send = match self.lookup(&name) {
                None => true,
                Some(entry) => entry.is_changed(mtime_secs(&meta), meta.len() as i64),
            };
            if send {
                changed.push(name);
            }
        }
        changed.sort();
        Ok(changed)
    }
}

/// The staged executable never re-enters a transfer list
fn is_excluded(name: &str) -> bool {
    let stem = EXEC_RENAME_BASENAME
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(EXEC_RENAME_BASENAME);
    name.starts_with(stem)
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_build_skips_directories_and_exec() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::write(dir.path().join(EXEC_RENAME_BASENAME), b"binary").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let catalog = FileCatalog::build(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.lookup("a.txt").is_some());
        assert!(catalog.lookup(EXEC_RENAME_BASENAME).is_none());
    }

    #[test]
    fn test_changed_files_detects_size_change() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"one").unwrap();
        fs::write(dir.path().join("b.txt"), b"two").unwrap();

        let catalog = FileCatalog::build(dir.path()).unwrap();
        assert!(catalog.changed_files(dir.path()).unwrap().is_empty());

        fs::write(dir.path().join("a.txt"), b"longer content").unwrap();
        fs::write(dir.path().join("new.txt"), b"fresh").unwrap();
        let changed = catalog.changed_files(dir.path()).unwrap();
        assert_eq!(changed, vec!["a.txt".to_string(), "new.txt".to_string()]);
    }

    #[test]
    fn test_spooled_catalog_uses_mtime_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"content").unwrap();

        // Spool time far in the future: nothing is newer, so nothing
        // changed even though sizes differ from the sentinel.
        let catalog = FileCatalog::build_spooled(dir.path(), i64::MAX).unwrap();
        assert!(catalog.changed_files(dir.path()).unwrap().is_empty());

        // Spool time in the past: every file is newer.
        let catalog = FileCatalog::build_spooled(dir.path(), 0).unwrap();
        assert_eq!(catalog.changed_files(dir.path()).unwrap().len(), 1);
    }
}
