//! Layered configuration building
//!
//! Sources are applied in order: defaults, then each file, then the
//! canonical environment tunables. File documents may specify any subset
//! of sections; later sources win field-by-field. The layering itself is
//! the `config` crate's; this module contributes the defaults source, the
//! format detection, and the mapping from the canonical flat tunable
//! names to their configuration fields.

use std::path::{Path, PathBuf};

use config::{ConfigBuilder as ConfigBuilderInner, File, FileFormat};

use crate::error::{ConfigError, ConfigResult};
use crate::Config;

/// Value shape of a canonical tunable, for parsing its override string
#[derive(Debug, Clone, Copy)]
enum TunableKind {
    Bool,
    Int,
    Float,
    Str,
    List,
}

/// Canonical environment tunables recognised as overrides, each paired
/// with the configuration key it sets and the shape its value parses as
const ENV_TUNABLES: &[(&str, &str, TunableKind)] = &[
    (
        "ENABLE_URL_TRANSFERS",
        "transfers.enable_url_transfers",
        TunableKind::Bool,
    ),
    (
        "ENABLE_MULTIFILE_TRANSFER_PLUGINS",
        "transfers.enable_multifile_plugins",
        TunableKind::Bool,
    ),
    (
        "FILETRANSFER_PLUGINS",
        "transfers.plugin_paths",
        TunableKind::List,
    ),
    (
        "RUN_FILETRANSFER_PLUGINS_WITH_ROOT",
        "transfers.run_plugins_with_root",
        TunableKind::Bool,
    ),
    ("SIGN_S3_URLS", "transfers.sign_s3_urls", TunableKind::Bool),
    (
        "DELEGATE_JOB_GSI_CREDENTIALS",
        "delegation.enabled",
        TunableKind::Bool,
    ),
    (
        "DELEGATE_JOB_GSI_CREDENTIALS_LIFETIME",
        "delegation.lifetime_secs",
        TunableKind::Int,
    ),
    (
        "DELEGATE_JOB_GSI_CREDENTIALS_REFRESH",
        "delegation.refresh_fraction",
        TunableKind::Float,
    ),
    (
        "TRANSFER_QUEUE_USER_EXPR",
        "queue.user_expr",
        TunableKind::Str,
    ),
    ("FILE_TRANSFER_STATS_LOG", "paths.stats_log", TunableKind::Str),
];

/// Builder assembling a [`Config`] from layered sources
#[derive(Debug)]
pub struct ConfigBuilder {
    inner: ConfigBuilderInner<config::builder::DefaultState>,
    files: Vec<PathBuf>,
    use_env: bool,
}

impl ConfigBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            inner: config::Config::builder(),
            files: Vec::new(),
            use_env: false,
        }
    }

    /// Start from the built-in defaults (always implied; kept for call-site
    /// symmetry with explicit sources)
    pub fn add_defaults(self) -> Self {
        self
    }

    /// Add a configuration file source; later files override earlier ones
    pub fn add_source_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.files.push(path.as_ref().to_path_buf());
        self
    }

    /// Apply the canonical environment tunables after all file sources
    pub fn add_env_overrides(mut self) -> Self {
        self.use_env = true;
        self
    }

    /// Merge all sources and produce the final configuration
    pub fn build(mut self) -> ConfigResult<Config> {
        // Start with defaults as the base configuration.
        let defaults_value = serde_yaml::to_value(Config::default()).map_err(|e| {
            ConfigError::Serialization {
                message: format!("failed to serialize defaults: {e}"),
            }
        })?;
        self.inner = self
            .inner
            .add_source(config::Config::try_from(&defaults_value)?);

        for path in &self.files {
            if path.exists() {
                self.inner = self
                    .inner
                    .add_source(File::from(path.clone()).format(Self::detect_format(path)));
            }
        }

        if self.use_env {
            for (name, key, kind) in ENV_TUNABLES.iter().copied() {
                let Ok(raw) = std::env::var(name) else {
                    continue;
                };
                self.inner = self.inner.set_override(key, parse_override(name, kind, &raw)?)?;
            }
        }

        let merged = self.inner.build()?;
        let result: Config = merged.try_deserialize()?;
        Self::validate(&result)?;
        Ok(result)
    }

    /// Detect file format from extension
    fn detect_format(path: &Path) -> FileFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("json") => FileFormat::Json,
            _ => FileFormat::Yaml,
        }
    }

    /// Validate the configuration
    fn validate(config: &Config) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&config.delegation.refresh_fraction) {
            return Err(ConfigError::Validation {
                message: format!(
                    "delegation.refresh_fraction must be within [0, 1], got {}",
                    config.delegation.refresh_fraction
                ),
            });
        }
        if config.limits.max_list_depth == 0 {
            return Err(ConfigError::Validation {
                message: "limits.max_list_depth must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpret an environment string according to the tunable's shape
fn parse_override(name: &str, kind: TunableKind, raw: &str) -> ConfigResult<config::Value> {
    let invalid = |message: String| ConfigError::InvalidOverride {
        name: name.to_string(),
        message,
    };
    match kind {
        TunableKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(config::Value::from(true)),
            "false" | "no" | "0" => Ok(config::Value::from(false)),
            other => Err(invalid(format!("expected a boolean, got {other:?}"))),
        },
        TunableKind::Int => raw
            .parse::<i64>()
            .map(config::Value::from)
            .map_err(|e| invalid(e.to_string())),
        TunableKind::Float => raw
            .parse::<f64>()
            .map(config::Value::from)
            .map_err(|e| invalid(e.to_string())),
        TunableKind::Str => Ok(config::Value::from(raw.to_string())),
        TunableKind::List => {
            let items: Vec<config::Value> = raw
                .split([',', ':'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| config::Value::from(s.to_string()))
                .collect();
            Ok(config::Value::from(items))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_build_defaults() {
        let config = ConfigBuilder::new().add_defaults().build().unwrap();
        assert!(config.transfers.sign_s3_urls);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[transfers]\nsign_s3_urls = false").unwrap();

        let config = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(file.path())
            .build()
            .unwrap();
        assert!(!config.transfers.sign_s3_urls);
        // Untouched fields keep their defaults.
        assert!(config.transfers.enable_url_transfers);
    }

    #[test]
    fn test_later_file_wins() {
        let mut first = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(first, "[limits]\nmax_list_depth = 5").unwrap();
        let mut second = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(second, "limits:\n  max_list_depth: 7").unwrap();

        let config = ConfigBuilder::new()
            .add_source_file(first.path())
            .add_source_file(second.path())
            .build()
            .unwrap();
        assert_eq!(config.limits.max_list_depth, 7);
    }

    #[test]
    fn test_invalid_refresh_fraction_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[delegation]\nrefresh_fraction = 1.5").unwrap();

        let result = ConfigBuilder::new().add_source_file(file.path()).build();
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_unknown_extension_reads_as_yaml() {
        let mut file = tempfile::Builder::new().suffix(".conf").tempfile().unwrap();
        writeln!(file, "queue:\n  keep_alive_secs: 45").unwrap();

        let config = ConfigBuilder::new().add_source_file(file.path()).build().unwrap();
        assert_eq!(config.queue.keep_alive_secs, 45);
    }

    #[test]
    fn test_override_parsing() {
        let value = parse_override("SIGN_S3_URLS", TunableKind::Bool, "no").unwrap();
        assert!(!value.into_bool().unwrap());
        assert!(parse_override("SIGN_S3_URLS", TunableKind::Bool, "maybe").is_err());
        assert!(
            parse_override("DELEGATE_JOB_GSI_CREDENTIALS_LIFETIME", TunableKind::Int, "x")
                .is_err()
        );

        let list = parse_override(
            "FILETRANSFER_PLUGINS",
            TunableKind::List,
            "/usr/libexec/curl_plugin, /usr/libexec/s3_plugin",
        )
        .unwrap();
        assert_eq!(list.into_array().unwrap().len(), 2);
    }
}
