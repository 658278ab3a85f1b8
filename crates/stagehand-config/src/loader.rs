//! Configuration loader with common loading patterns

use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};
use crate::{Config, ConfigBuilder};

/// Configuration loader wrapping [`ConfigBuilder`] for the usual cases
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the default locations plus the environment
    pub fn load_default() -> ConfigResult<Config> {
        let mut builder = ConfigBuilder::new().add_defaults();

        for path in Self::default_config_paths() {
            if path.exists() {
                builder = builder.add_source_file(&path);
                break;
            }
        }

        builder.add_env_overrides().build()
    }

    /// Load configuration from a specific file plus the environment
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Config> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "configuration file not found",
                ),
            });
        }

        ConfigBuilder::new()
            .add_defaults()
            .add_source_file(path)
            .add_env_overrides()
            .build()
    }

    /// Candidate default configuration file locations, most local first
    fn default_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("stagehand.toml"),
            PathBuf::from("stagehand.yaml"),
        ];
        if let Ok(home) = std::env::var("HOME") {
            paths.push(PathBuf::from(home).join(".config/stagehand/config.toml"));
        }
        paths.push(PathBuf::from("/etc/stagehand/config.toml"));
        paths
    }
}
