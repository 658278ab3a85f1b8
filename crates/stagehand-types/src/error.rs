//! Error types and failure classification for stagehand transfers
//!
//! Every failure in the engine is reduced to a policy decision: retry the
//! whole session later, or stop and hold the job with a structured reason.
//! The [`Error`] enum carries enough context to make that call, and
//! [`FailureInfo`] is the flattened form that travels in transfer acks and
//! session summaries.

use std::path::PathBuf;

use crate::types::TransferDirection;

/// Structured hold codes surfaced to the job-management layer
///
/// The numeric values are part of the ack wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum HoldCode {
    /// The download side failed to write or fetch a file
    DownloadFileError = 12,
    /// The upload side failed to read or push a file
    UploadFileError = 13,
    /// The go-ahead exchange produced an unusable answer
    InvalidTransferGoAhead = 14,
    /// The transfer-queue coordinator refused or dropped the slot
    TransferQueueError = 30,
    /// The sender would exceed the receiver's input byte limit
    MaxTransferInputSizeExceeded = 32,
    /// The sender would exceed the receiver's output byte limit
    MaxTransferOutputSizeExceeded = 33,
}

impl HoldCode {
    /// Numeric wire value of this hold code
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Map a numeric wire value back to a hold code
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            12 => Some(Self::DownloadFileError),
            13 => Some(Self::UploadFileError),
            14 => Some(Self::InvalidTransferGoAhead),
            30 => Some(Self::TransferQueueError),
            32 => Some(Self::MaxTransferInputSizeExceeded),
            33 => Some(Self::MaxTransferOutputSizeExceeded),
            _ => None,
        }
    }
}

/// Main error type for stagehand operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Local I/O operation failed without a more specific classification
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// The peer stream violated the framing protocol
    #[error("protocol error: {message}")]
    Protocol {
        /// What the framer expected versus what arrived
        message: String,
    },

    /// A network read or write failed or timed out
    #[error("network error: {message}")]
    Network {
        /// Error message from the transport
        message: String,
    },

    /// Opening or writing a sandbox file failed
    #[error("failed to write {path}: {message}")]
    WriteFailed {
        /// Destination path that could not be written
        path: PathBuf,
        /// Underlying error message
        message: String,
    },

    /// Opening or reading a source file failed
    #[error("failed to read {path}: {message}")]
    ReadFailed {
        /// Source path that could not be read
        path: PathBuf,
        /// Underlying error message
        message: String,
    },

    /// A transfer would exceed the peer's byte limit
    #[error("transfer of {attempted} bytes exceeds {direction} limit of {limit} bytes")]
    QuotaExceeded {
        /// Which side's limit was exceeded
        direction: TransferDirection,
        /// Limit in bytes
        limit: i64,
        /// Bytes the transfer would have consumed
        attempted: i64,
    },

    /// An incoming filename escaped the sandbox
    #[error("illegal sandbox path: {name}")]
    IllegalPath {
        /// The offending filename as it arrived on the wire
        name: String,
    },

    /// An external transfer plugin failed
    #[error("plugin failed for {url}: {message}")]
    Plugin {
        /// URL the plugin was asked to move
        url: String,
        /// Failure description, from the plugin if it produced one
        message: String,
        /// Whether the plugin classified the failure as transient
        retryable: bool,
    },

    /// The transfer-queue coordinator reported a failure
    #[error("transfer queue error: {message}")]
    Queue {
        /// Failure description from the coordinator exchange
        message: String,
        /// Whether the slot request may be retried later
        retryable: bool,
    },

    /// Reuse-cache operation failed
    #[error("reuse cache error: {message}")]
    Cache {
        /// Failure description
        message: String,
    },

    /// URL signing request failed or was refused
    #[error("signing error: {message}")]
    Sign {
        /// Failure description
        message: String,
    },

    /// Credential delegation failed
    #[error("credential delegation error: {message}")]
    Delegation {
        /// Failure description
        message: String,
    },

    /// Configuration is missing or invalid
    #[error("configuration error: {message}")]
    Config {
        /// What was wrong with the configuration
        message: String,
    },

    /// A blocking operation exceeded its deadline
    #[error("operation timed out after {seconds} seconds")]
    Timeout {
        /// Seconds waited before giving up
        seconds: u64,
    },

    /// The session was aborted by its host
    #[error("transfer cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the session may be retried after a backoff
    ///
    /// Transient network faults and protocol violations (the peer likely
    /// restarted) are retryable; permanent I/O failures, quota violations,
    /// and path-safety violations are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Protocol { .. } | Self::Timeout { .. } => true,
            Self::Plugin { retryable, .. } | Self::Queue { retryable, .. } => *retryable,
            Self::Io { .. }
            | Self::WriteFailed { .. }
            | Self::ReadFailed { .. }
            | Self::QuotaExceeded { .. }
            | Self::IllegalPath { .. }
            | Self::Config { .. }
            | Self::Delegation { .. }
            | Self::Cancelled => false,
            // Reuse and signing failures fall back to a normal transfer and
            // should never terminate a session on their own.
            Self::Cache { .. } | Self::Sign { .. } => true,
        }
    }

    /// The hold code a non-retryable failure maps to, given which side the
    /// failure occurred on
    pub fn hold(&self, direction: TransferDirection) -> HoldCode {
        match self {
            Self::QuotaExceeded { direction, .. } => match direction {
                TransferDirection::Download => HoldCode::MaxTransferOutputSizeExceeded,
                TransferDirection::Upload => HoldCode::MaxTransferInputSizeExceeded,
            },
            Self::Queue { .. } => HoldCode::TransferQueueError,
            _ => match direction {
                TransferDirection::Download => HoldCode::DownloadFileError,
                TransferDirection::Upload => HoldCode::UploadFileError,
            },
        }
    }

    /// Create a generic I/O error from a message
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a reuse-cache error
    pub fn cache<S: Into<String>>(message: S) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create a signing error
    pub fn sign<S: Into<String>>(message: S) -> Self {
        Self::Sign {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

/// Flattened failure report carried in transfer acks and summaries
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FailureInfo {
    /// Whether the caller may retry the session after a backoff
    pub try_again: bool,
    /// Structured hold code, when the failure is permanent
    pub hold_code: Option<i32>,
    /// Finer-grained subcode (an OS errno where one applies, else 0)
    pub hold_subcode: i64,
    /// Human-readable reason surfaced to the job-management layer
    pub reason: String,
}

impl FailureInfo {
    /// Build a failure report from an error, attributing it to one side
    pub fn from_error(error: &Error, direction: TransferDirection) -> Self {
        let try_again = error.is_retryable();
        Self {
            try_again,
            hold_code: if try_again {
                None
            } else {
                Some(error.hold(direction).code())
            },
            hold_subcode: 0,
            reason: error.to_string(),
        }
    }

    /// Attach an OS error subcode
    pub fn with_subcode(mut self, subcode: i64) -> Self {
        self.hold_subcode = subcode;
        self
    }
}
