//! Error types for configuration loading

use std::path::PathBuf;

/// Result alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Errors produced while loading or validating configuration
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// Reading a configuration file failed
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        /// File that could not be read
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A configuration source could not be read, parsed, or merged
    #[error("configuration source error: {source}")]
    Source {
        /// Underlying error from the configuration library
        #[from]
        source: config::ConfigError,
    },

    /// An environment override had an unusable value
    #[error("invalid value for {name}: {message}")]
    InvalidOverride {
        /// Tunable name
        name: String,
        /// Why the value was rejected
        message: String,
    },

    /// The merged configuration failed validation
    #[error("invalid configuration: {message}")]
    Validation {
        /// What was wrong
        message: String,
    },

    /// Serializing configuration for writing failed
    #[error("serialization error: {message}")]
    Serialization {
        /// Serializer error message
        message: String,
    },
}
