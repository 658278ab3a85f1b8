//! Append-only transfer statistics log
//!
//! Each completed transfer appends one delimited attribute record. The log
//! lives under the service's log directory and rotates to `<name>.old`
//! once it exceeds its size cap.

use std::path::PathBuf;

use stagehand_types::{FileTransferStats, Result, STATS_LOG_MAX_BYTES};
use stagehand_wire::AttrRecord;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Record delimiter between log entries
const DELIMITER: &str = "***\n";

/// Append-only statistics log with size-capped rotation
#[derive(Debug, Clone)]
pub struct StatsLog {
    path: PathBuf,
    max_bytes: u64,
}

impl StatsLog {
    /// Open (lazily) a statistics log at `path`
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            max_bytes: STATS_LOG_MAX_BYTES,
        }
    }

    /// Override the rotation threshold, for tests
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Append one per-file statistics record
    ///
    /// Logging failures are reported but callers treat them as non-fatal;
    /// a transfer never fails because its statistics could not be logged.
    pub async fn append(&self, stats: &FileTransferStats) -> Result<()> {
        self.rotate_if_needed().await;

        let mut record = AttrRecord::new()
            .with_str("TransferFileName", stats.file_name.clone())
            .with_str("TransferProtocol", stats.protocol.clone())
            .with_int("TransferTotalBytes", stats.bytes as i64)
            .with_bool("TransferSuccess", stats.success);
        if !stats.url.is_empty() {
            record = record.with_str("TransferUrl", stats.url.clone());
        }
        if let Some(error) = &stats.error {
            record = record.with_str("TransferError", error.clone());
        }
        if let Some(elapsed) = stats.elapsed {
            record = record.with_int("ElapsedTimeSeconds", elapsed.as_secs() as i64);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| stagehand_types::Error::io(format!("stats log open failed: {e}")))?;
        file.write_all(format!("{record}{DELIMITER}").as_bytes())
            .await
            .map_err(|e| stagehand_types::Error::io(format!("stats log write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| stagehand_types::Error::io(format!("stats log flush failed: {e}")))?;
        debug!("logged transfer stats for {}", stats.file_name);
        Ok(())
    }

    async fn rotate_if_needed(&self) {
        let Ok(meta) = tokio::fs::metadata(&self.path).await else {
            return;
        };
        if meta.len() <= self.max_bytes {
            return;
        }
        let mut old = self.path.clone().into_os_string();
        old.push(".old");
        if let Err(e) = tokio::fs::rename(&self.path, &old).await {
            warn!("failed to rotate stats log {}: {e}", self.path.display());
        } else {
            debug!("rotated stats log to {:?}", old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(name: &str) -> FileTransferStats {
        FileTransferStats {
            file_name: name.to_string(),
            url: "http://example/x.dat".to_string(),
            protocol: "http".to_string(),
            bytes: 1_048_576,
            success: true,
            error: None,
            elapsed: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_parse_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = StatsLog::new(dir.path().join("transfer_stats"));

        log.append(&stats("x.dat")).await.unwrap();
        log.append(&stats("y.dat")).await.unwrap();

        let text = tokio::fs::read_to_string(dir.path().join("transfer_stats"))
            .await
            .unwrap();
        let entries: Vec<&str> = text.split(DELIMITER).filter(|s| !s.is_empty()).collect();
        assert_eq!(entries.len(), 2);
        let record = AttrRecord::parse(entries[0]).unwrap();
        assert_eq!(record.get_str("TransferProtocol"), Some("http"));
        assert_eq!(record.get_int("TransferTotalBytes"), Some(1_048_576));
    }

    #[tokio::test]
    async fn test_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer_stats");
        let log = StatsLog::new(path.clone()).with_max_bytes(64);

        log.append(&stats("first.dat")).await.unwrap();
        // Now over the cap; the next append rotates first.
        log.append(&stats("second.dat")).await.unwrap();

        let old = dir.path().join("transfer_stats.old");
        assert!(old.exists());
        let current = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(current.contains("second.dat"));
        assert!(!current.contains("first.dat"));
    }
}
