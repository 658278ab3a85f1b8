//! Core data types shared across the stagehand crates

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::FailureInfo;

/// Fixed basename under which the job executable travels and is staged
///
/// The receiver excludes this name (and anything sharing its stem) from
/// output change detection so a job never ships its own executable back.
pub const EXEC_RENAME_BASENAME: &str = "condor_exec.exe";

/// Zero-byte marker written into the tmp-spool when a download is complete
/// and ready to rotate into the real spool
pub const COMMIT_MARKER: &str = ".ccommit.con";

/// Slack allowed above a peer's byte limit before the sender stops emitting
pub const MAX_BYTES_SLACK: i64 = 64 * 1024;

/// Size at which the statistics log is rotated to `<name>.old`
pub const STATS_LOG_MAX_BYTES: u64 = 5_000_000;

/// Which way bytes flow in a session, named from the engine's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransferDirection {
    /// Sending sandbox contents to the peer
    Upload,
    /// Receiving sandbox contents from the peer
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

/// Recognised checksum algorithms for reuse negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChecksumKind {
    /// SHA-256
    Sha256,
    /// BLAKE3
    Blake3,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            _ => Err(()),
        }
    }
}

/// A planned file or URL move, produced by the transfer-list builder
///
/// Items order themselves so that destination-URL work comes first (those
/// transfers may mutate the set of framed-channel items, e.g. by signing),
/// then framed-channel transfers (credentials must land before plugins
/// run), then source-URL fetches.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransferItem {
    /// Source path on the sender, or the source URL
    pub src_name: String,
    /// URL scheme of the source, empty for local files
    pub src_scheme: String,
    /// Basename the item travels under; empty means the basename of
    /// `src_name`
    pub dest_name: String,
    /// Destination directory relative to the receiver's sandbox
    pub dest_dir: PathBuf,
    /// Destination URL; empty means the engine's own framed transport
    pub dest_url: String,
    /// File mode bits of the source, where the platform reports them
    pub file_mode: Option<u32>,
    /// Size of the source in bytes; 0 for directories and URLs
    pub file_size: i64,
    /// Whether this item is a directory entry (sent as a mkdir)
    pub is_directory: bool,
    /// Whether the source is a symlink
    pub is_symlink: bool,
    /// Whether the source is a domain socket (never transferred)
    pub is_domain_socket: bool,
}

impl TransferItem {
    /// Create a plain framed-channel item for a local file
    pub fn local<S: Into<String>>(src_name: S) -> Self {
        Self {
            src_name: src_name.into(),
            src_scheme: String::new(),
            dest_name: String::new(),
            dest_dir: PathBuf::new(),
            dest_url: String::new(),
            file_mode: None,
            file_size: 0,
            is_directory: false,
            is_symlink: false,
            is_domain_socket: false,
        }
    }

    /// Basename this item travels under on the wire, joined with the
    /// destination directory
    pub fn wire_name(&self) -> String {
        let base = if !self.dest_name.is_empty() {
            self.dest_name.clone()
        } else {
            std::path::Path::new(&self.src_name)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.src_name.clone())
        };
        if self.dest_dir.as_os_str().is_empty() {
            base
        } else {
            self.dest_dir.join(base).display().to_string()
        }
    }

    /// Create an item whose source is a URL fetched by the receiver
    pub fn from_url<S: Into<String>>(url: S, scheme: S) -> Self {
        Self {
            src_name: url.into(),
            src_scheme: scheme.into(),
            ..Self::local("")
        }
    }

    /// Whether the source is a URL
    pub fn has_src_url(&self) -> bool {
        !self.src_scheme.is_empty()
    }

    /// Whether the destination is a URL
    pub fn has_dest_url(&self) -> bool {
        !self.dest_url.is_empty()
    }

    /// URL scheme of the destination, empty when the destination is local
    pub fn dest_scheme(&self) -> &str {
        self.dest_url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .unwrap_or("")
    }

    /// Whether this item moves over the engine's own framed transport
    pub fn is_framed(&self) -> bool {
        !self.has_src_url() && !self.has_dest_url()
    }

    fn order_class(&self) -> u8 {
        if self.has_dest_url() {
            0
        } else if self.has_src_url() {
            2
        } else {
            1
        }
    }
}

impl Ord for TransferItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_class()
            .cmp(&other.order_class())
            .then_with(|| match self.order_class() {
                0 => (self.dest_scheme(), self.dest_url.as_str())
                    .cmp(&(other.dest_scheme(), other.dest_url.as_str())),
                2 => (self.src_scheme.as_str(), self.src_name.as_str())
                    .cmp(&(other.src_scheme.as_str(), other.src_name.as_str())),
                _ => self.src_name.cmp(&other.src_name),
            })
    }
}

impl PartialOrd for TransferItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Snapshot entry for one sandbox file: (mtime, size)
///
/// A size of −1 is a sentinel meaning the entry came from a spool-time
/// catalog and comparison must use "mtime strictly newer" only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CatalogEntry {
    /// Modification time, seconds since the epoch
    pub modification_time: i64,
    /// File size in bytes, or −1 for mtime-only comparison
    pub file_size: i64,
}

impl CatalogEntry {
    /// Whether a file with the given (mtime, size) counts as changed
    /// relative to this entry
    pub fn is_changed(&self, mtime: i64, size: i64) -> bool {
        if self.file_size < 0 {
            mtime > self.modification_time
        } else {
            mtime != self.modification_time || size != self.file_size
        }
    }
}

/// Per-file statistics, primarily from plugin transfers
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FileTransferStats {
    /// Local filename the bytes landed in or came from
    pub file_name: String,
    /// URL involved, empty for framed-channel transfers
    pub url: String,
    /// Protocol used, e.g. `http` or `cedar`
    pub protocol: String,
    /// Bytes moved for this file
    pub bytes: u64,
    /// Whether this file's transfer succeeded
    pub success: bool,
    /// Error description for a failed transfer
    pub error: Option<String>,
    /// Wall-clock time the transfer took
    pub elapsed: Option<Duration>,
}

/// In-flight progress report published on the session event channel
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ProgressInfo {
    /// Bytes moved so far
    pub bytes_so_far: u64,
    /// Files completed so far
    pub files_so_far: u64,
    /// File currently in flight
    pub current_file: String,
}

/// Final summary of a transfer session, the engine's return value
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransferSummary {
    /// Whether every framed-channel item arrived intact
    pub success: bool,
    /// Failure report when `success` is false
    pub failure: Option<FailureInfo>,
    /// Total bytes moved across the wire and by plugins
    pub bytes: u64,
    /// Number of files moved
    pub files: u64,
    /// Wall-clock duration of the session
    pub duration: Duration,
    /// Per-file statistics records
    pub file_stats: Vec<FileTransferStats>,
    /// Files deposited into the spool by this session
    pub spooled_files: Vec<String>,
    /// Transport statistics blob from the channel, if it reports one
    pub tcp_stats: Option<String>,
}

impl TransferSummary {
    /// An empty successful summary
    pub fn success() -> Self {
        Self {
            success: true,
            failure: None,
            bytes: 0,
            files: 0,
            duration: Duration::ZERO,
            file_stats: Vec::new(),
            spooled_files: Vec::new(),
            tcp_stats: None,
        }
    }

    /// A failed summary carrying a structured reason
    pub fn failure(info: FailureInfo) -> Self {
        Self {
            success: false,
            failure: Some(info),
            ..Self::success()
        }
    }

    /// Whether the caller may retry the session
    pub fn try_again(&self) -> bool {
        self.failure.as_ref().map(|f| f.try_again).unwrap_or(false)
    }
}

/// Event published by a session task to its host
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Periodic progress update
    Progress(ProgressInfo),
    /// Terminal update; the session task exits after sending this
    Final(TransferSummary),
}

/// What the peer's negotiated protocol revision supports
///
/// Derived from the peer version string before a session starts; every
/// field defaults to the current revision's capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCapabilities {
    /// Peer understands the xfer-info preamble
    pub xfer_info: bool,
    /// Peer participates in the go-ahead exchange
    pub go_ahead: bool,
    /// Peer exchanges final transfer acks
    pub transfer_ack: bool,
    /// Peer answers reuse-info queries (sub-command 8)
    pub reuse_info: bool,
    /// Peer signs object-store URLs (sub-command 9) and expects URL
    /// commands to be encrypted
    pub s3_urls: bool,
}

impl Default for PeerCapabilities {
    fn default() -> Self {
        Self {
            xfer_info: true,
            go_ahead: true,
            transfer_ack: true,
            reuse_info: true,
            s3_urls: true,
        }
    }
}

impl PeerCapabilities {
    /// Capabilities of a peer predating every negotiated extension
    pub fn legacy() -> Self {
        Self {
            xfer_info: false,
            go_ahead: false,
            transfer_ack: false,
            reuse_info: false,
            s3_urls: false,
        }
    }
}
