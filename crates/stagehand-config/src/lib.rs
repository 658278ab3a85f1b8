//! Configuration management for the stagehand transfer engine
//!
//! Provides a typed configuration with sensible defaults, loading from
//! TOML/YAML/JSON files, and overrides from the canonical environment
//! tunables (`ENABLE_URL_TRANSFERS`, `FILETRANSFER_PLUGINS`, …).
//!
//! # Examples
//!
//! ```rust
//! use stagehand_config::{Config, ConfigBuilder};
//!
//! let config = ConfigBuilder::new().add_defaults().build().unwrap();
//! assert!(config.transfers.enable_url_transfers);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Main configuration for the transfer engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transfer and plugin behaviour
    pub transfers: TransferConfig,
    /// Credential delegation behaviour
    pub delegation: DelegationConfig,
    /// Transfer-queue coordinator settings
    pub queue: QueueConfig,
    /// Filesystem locations the service writes to
    pub paths: PathConfig,
    /// Session limits and timeouts
    pub limits: LimitConfig,
}

/// Transfer and plugin behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Allow URL items in transfer lists (tunable `ENABLE_URL_TRANSFERS`)
    pub enable_url_transfers: bool,
    /// Allow batching plugins (tunable `ENABLE_MULTIFILE_TRANSFER_PLUGINS`)
    pub enable_multifile_plugins: bool,
    /// Plugin binaries probed at startup (tunable `FILETRANSFER_PLUGINS`)
    pub plugin_paths: Vec<PathBuf>,
    /// Run plugins as the service principal instead of the job identity
    /// (tunable `RUN_FILETRANSFER_PLUGINS_WITH_ROOT`)
    ///
    /// Leaving this off means plugins drop to the job's identity, which can
    /// change dynamic-loader search behaviour for plugins linked against
    /// libraries only readable by the service principal.
    pub run_plugins_with_root: bool,
    /// Request signed counterparts for object-store URLs (tunable
    /// `SIGN_S3_URLS`)
    pub sign_s3_urls: bool,
    /// Seconds a single plugin invocation may run before it is killed
    pub plugin_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enable_url_transfers: true,
            enable_multifile_plugins: true,
            plugin_paths: Vec::new(),
            run_plugins_with_root: false,
            sign_s3_urls: true,
            plugin_timeout_secs: 20 * 60,
        }
    }
}

/// Credential delegation behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Delegate a refreshable credential instead of copying the file
    /// (tunable `DELEGATE_JOB_GSI_CREDENTIALS`)
    pub enabled: bool,
    /// Lifetime in seconds of a delegated credential; 0 means unlimited
    /// (tunable `DELEGATE_JOB_GSI_CREDENTIALS_LIFETIME`)
    pub lifetime_secs: u64,
    /// Fraction of the lifetime after which a refresh is attempted
    /// (tunable `DELEGATE_JOB_GSI_CREDENTIALS_REFRESH`)
    pub refresh_fraction: f64,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lifetime_secs: 24 * 60 * 60,
            refresh_fraction: 0.25,
        }
    }
}

/// Transfer-queue coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Contact string of the queue coordinator; empty disables admission
    /// control and every session proceeds immediately
    pub contact: String,
    /// Expression evaluated against the job to produce the accounting user
    /// (tunable `TRANSFER_QUEUE_USER_EXPR`)
    pub user_expr: String,
    /// Interval between keep-alives while waiting for or holding a slot
    pub keep_alive_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            contact: String::new(),
            user_expr: String::new(),
            keep_alive_secs: 60,
        }
    }
}

/// Filesystem locations the service writes to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Root under which per-job spool directories are created
    pub spool_root: PathBuf,
    /// Statistics log file (tunable `FILE_TRANSFER_STATS_LOG`); empty
    /// disables the log
    pub stats_log: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            spool_root: PathBuf::from("spool"),
            stats_log: PathBuf::new(),
        }
    }
}

/// Session limits and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Maximum directory depth the transfer-list builder descends
    pub max_list_depth: u32,
    /// Seconds a blocking wire operation may take before failing
    pub io_timeout_secs: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_list_depth: 20,
            io_timeout_secs: 20 * 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.transfers.enable_url_transfers);
        assert!(config.transfers.enable_multifile_plugins);
        assert!(!config.transfers.run_plugins_with_root);
        assert!(config.transfers.sign_s3_urls);
        assert!(config.queue.contact.is_empty());
        assert_eq!(config.limits.max_list_depth, 20);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [transfers]
            enable_url_transfers = false
            "#,
        )
        .unwrap();
        assert!(!config.transfers.enable_url_transfers);
        assert!(config.transfers.sign_s3_urls);
        assert_eq!(config.delegation.lifetime_secs, 24 * 60 * 60);
    }
}
