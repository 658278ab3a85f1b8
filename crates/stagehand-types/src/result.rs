//! Result type alias for stagehand operations

use crate::error::Error;

/// Result type used throughout the stagehand crates
pub type Result<T> = std::result::Result<T, Error>;
