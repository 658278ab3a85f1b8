//! Job records: the typed attribute sets that drive a transfer session
//!
//! A job record is a read-only key/value view of the job handed to the
//! engine by the queue manager. Attribute values are typed (string, int,
//! bool, or an unevaluated expression) and list-valued attributes use the
//! comma-separated convention of the submission language.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::Error;
use crate::result::Result;
use crate::types::ChecksumKind;

/// Working directory of the job on the submission side
pub const ATTR_IWD: &str = "Iwd";
/// Cluster component of the job id
pub const ATTR_CLUSTER_ID: &str = "ClusterId";
/// Process component of the job id
pub const ATTR_PROC_ID: &str = "ProcId";
/// Owning principal of the job
pub const ATTR_OWNER: &str = "Owner";
/// Comma-separated list of input files and URLs
pub const ATTR_TRANSFER_INPUT_FILES: &str = "TransferInputFiles";
/// Comma-separated list of output files to return
pub const ATTR_TRANSFER_OUTPUT_FILES: &str = "TransferOutputFiles";
/// Semicolon-separated `source=target` output rename rules
pub const ATTR_TRANSFER_OUTPUT_REMAPS: &str = "TransferOutputRemaps";
/// URL prefix under which outputs are delivered to an object store
pub const ATTR_OUTPUT_DESTINATION: &str = "OutputDestination";
/// Files that must be encrypted on the wire regardless of channel default
pub const ATTR_ENCRYPT_INPUT_FILES: &str = "EncryptInputFiles";
/// Files that must not be encrypted on the wire
pub const ATTR_DONT_ENCRYPT_INPUT_FILES: &str = "DontEncryptInputFiles";
/// Path to the job executable
pub const ATTR_JOB_CMD: &str = "Cmd";
/// Path to the user log
pub const ATTR_ULOG_FILE: &str = "UserLog";
/// Path to the job credential file
pub const ATTR_X509_USER_PROXY: &str = "X509UserProxy";
/// Declared checksum of the executable, as `<kind>:<hex>`
pub const ATTR_EXECUTABLE_CHECKSUM: &str = "ExecutableChecksum";
/// Intermediate files spooled by previous runs, always sent on final upload
pub const ATTR_SPOOLED_INTERMEDIATE_FILES: &str = "SpooledIntermediateFiles";
/// Upper bound on bytes the job may upload
pub const ATTR_MAX_UPLOAD_BYTES: &str = "MaxUploadBytes";
/// Upper bound on bytes the job may download
pub const ATTR_MAX_DOWNLOAD_BYTES: &str = "MaxDownloadBytes";
/// Per-job transfer plugin overrides, as `scheme=path;…`
pub const ATTR_TRANSFER_PLUGINS: &str = "TransferPlugins";
/// Largest number of files a multi-file plugin batch may carry
pub const ATTR_PLUGIN_BATCH_SIZE: &str = "TransferPluginBatchSize";
/// Identity string under which queue slots are accounted
pub const ATTR_TRANSFER_QUEUE_USER: &str = "TransferQueueUser";

/// A typed attribute value in a job record
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum AttrValue {
    /// A string literal
    Str(String),
    /// An integer literal
    Int(i64),
    /// A boolean literal
    Bool(bool),
    /// An unevaluated expression, kept in source form
    Expr(String),
}

impl AttrValue {
    /// View this value as a string, if it is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// View this value as an integer, if it is one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// View this value as a boolean, if it is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Read-only view of a job handed to the transfer engine
///
/// Constructed once from the queue manager's record and never mutated by
/// the engine.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct JobRecord {
    attrs: HashMap<String, AttrValue>,
}

impl JobRecord {
    /// Create a job record with the four required attributes
    pub fn new(cluster_id: i64, proc_id: i64, owner: &str, iwd: &str) -> Self {
        let mut attrs = HashMap::new();
        attrs.insert(ATTR_CLUSTER_ID.to_string(), AttrValue::Int(cluster_id));
        attrs.insert(ATTR_PROC_ID.to_string(), AttrValue::Int(proc_id));
        attrs.insert(ATTR_OWNER.to_string(), AttrValue::Str(owner.to_string()));
        attrs.insert(ATTR_IWD.to_string(), AttrValue::Str(iwd.to_string()));
        Self { attrs }
    }

    /// Set an attribute, returning the record for chaining
    pub fn with_attr<S: Into<String>>(mut self, name: S, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    /// Set a string attribute
    pub fn with_str<S: Into<String>, V: Into<String>>(self, name: S, value: V) -> Self {
        self.with_attr(name, AttrValue::Str(value.into()))
    }

    /// Set an integer attribute
    pub fn with_int<S: Into<String>>(self, name: S, value: i64) -> Self {
        self.with_attr(name, AttrValue::Int(value))
    }

    /// Look up a raw attribute
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Look up a string attribute
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(AttrValue::as_str)
    }

    /// Look up an integer attribute
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.attrs.get(name).and_then(AttrValue::as_int)
    }

    /// Verify the required attributes are present and well-typed
    pub fn validate(&self) -> Result<()> {
        for name in [ATTR_IWD, ATTR_OWNER] {
            if self.get_str(name).is_none() {
                return Err(Error::config(format!("job record missing {name}")));
            }
        }
        for name in [ATTR_CLUSTER_ID, ATTR_PROC_ID] {
            if self.get_int(name).is_none() {
                return Err(Error::config(format!("job record missing {name}")));
            }
        }
        Ok(())
    }

    /// Working directory on the submission side
    pub fn iwd(&self) -> PathBuf {
        PathBuf::from(self.get_str(ATTR_IWD).unwrap_or_default())
    }

    /// Cluster component of the job id
    pub fn cluster_id(&self) -> i64 {
        self.get_int(ATTR_CLUSTER_ID).unwrap_or(-1)
    }

    /// Process component of the job id
    pub fn proc_id(&self) -> i64 {
        self.get_int(ATTR_PROC_ID).unwrap_or(-1)
    }

    /// Owning principal of the job
    pub fn owner(&self) -> &str {
        self.get_str(ATTR_OWNER).unwrap_or("")
    }

    /// `<cluster>.<proc>` form of the job id, used in logs and queue requests
    pub fn job_id(&self) -> String {
        format!("{}.{}", self.cluster_id(), self.proc_id())
    }

    /// Declared input files and URLs, in submission order
    pub fn input_files(&self) -> Vec<String> {
        self.list_attr(ATTR_TRANSFER_INPUT_FILES)
    }

    /// Declared output files, in submission order
    pub fn output_files(&self) -> Vec<String> {
        self.list_attr(ATTR_TRANSFER_OUTPUT_FILES)
    }

    /// Intermediate files from previous runs, always sent on a final upload
    pub fn spooled_intermediate_files(&self) -> Vec<String> {
        self.list_attr(ATTR_SPOOLED_INTERMEDIATE_FILES)
    }

    /// Files that must be encrypted on the wire
    pub fn encrypt_files(&self) -> Vec<String> {
        self.list_attr(ATTR_ENCRYPT_INPUT_FILES)
    }

    /// Files that must not be encrypted on the wire
    pub fn dont_encrypt_files(&self) -> Vec<String> {
        self.list_attr(ATTR_DONT_ENCRYPT_INPUT_FILES)
    }

    /// Output rename rules as `(source, target)` pairs
    ///
    /// Parsed from the `source=target[;…]` convention; malformed clauses are
    /// skipped.
    pub fn output_remaps(&self) -> Vec<(String, String)> {
        self.get_str(ATTR_TRANSFER_OUTPUT_REMAPS)
            .map(parse_remap_list)
            .unwrap_or_default()
    }

    /// URL prefix under which outputs are delivered, if any
    pub fn output_destination(&self) -> Option<&str> {
        self.get_str(ATTR_OUTPUT_DESTINATION)
    }

    /// Path to the job executable, if declared
    pub fn executable(&self) -> Option<&str> {
        self.get_str(ATTR_JOB_CMD)
    }

    /// Path to the job credential file, if declared
    pub fn credential_path(&self) -> Option<&str> {
        self.get_str(ATTR_X509_USER_PROXY)
    }

    /// Declared executable checksum, parsed from `<kind>:<hex>`
    pub fn executable_checksum(&self) -> Option<(ChecksumKind, String)> {
        let raw = self.get_str(ATTR_EXECUTABLE_CHECKSUM)?;
        let (kind, digest) = raw.split_once(':')?;
        let kind = kind.parse().ok()?;
        if digest.is_empty() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some((kind, digest.to_ascii_lowercase()))
    }

    /// Upper bound on bytes the job may upload, negative meaning unlimited
    pub fn max_upload_bytes(&self) -> i64 {
        self.get_int(ATTR_MAX_UPLOAD_BYTES).unwrap_or(-1)
    }

    /// Upper bound on bytes the job may download, negative meaning unlimited
    pub fn max_download_bytes(&self) -> i64 {
        self.get_int(ATTR_MAX_DOWNLOAD_BYTES).unwrap_or(-1)
    }

    /// Per-job plugin overrides as `(scheme, path)` pairs
    pub fn plugin_overrides(&self) -> Vec<(String, String)> {
        self.get_str(ATTR_TRANSFER_PLUGINS)
            .map(parse_remap_list)
            .unwrap_or_default()
    }

    /// Largest number of files a multi-file plugin batch may carry
    pub fn plugin_batch_size(&self) -> Option<usize> {
        self.get_int(ATTR_PLUGIN_BATCH_SIZE)
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n > 0)
    }

    /// Identity under which queue slots are accounted
    ///
    /// Uses the job's own `TransferQueueUser` when set, else the owner
    /// prefixed the way the coordinator expects.
    pub fn queue_user(&self) -> String {
        self.get_str(ATTR_TRANSFER_QUEUE_USER)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Owner_{}", self.owner()))
    }

    fn list_attr(&self, name: &str) -> Vec<String> {
        self.get_str(name)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parse a `key=value[;key=value…]` list, skipping malformed clauses
fn parse_remap_list(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|clause| {
            let (src, dst) = clause.split_once('=')?;
            let src = src.trim();
            let dst = dst.trim();
            if src.is_empty() || dst.is_empty() {
                return None;
            }
            Some((src.to_string(), dst.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> JobRecord {
        JobRecord::new(17, 0, "alice", "/home/alice/job")
            .with_str(ATTR_TRANSFER_INPUT_FILES, "a.txt, b.bin, d/")
            .with_str(ATTR_TRANSFER_OUTPUT_REMAPS, "out.dat=results/out.dat;bad")
            .with_str(ATTR_EXECUTABLE_CHECKSUM, "sha256:DEADbeef00")
            .with_int(ATTR_MAX_DOWNLOAD_BYTES, 4096)
    }

    #[test]
    fn test_required_attrs() {
        assert!(sample_job().validate().is_ok());
        let incomplete = JobRecord::default();
        assert!(incomplete.validate().is_err());
    }

    #[test]
    fn test_list_parsing() {
        let job = sample_job();
        assert_eq!(job.input_files(), vec!["a.txt", "b.bin", "d/"]);
        assert!(job.output_files().is_empty());
    }

    #[test]
    fn test_remap_parsing_skips_malformed() {
        let job = sample_job();
        assert_eq!(
            job.output_remaps(),
            vec![("out.dat".to_string(), "results/out.dat".to_string())]
        );
    }

    #[test]
    fn test_executable_checksum() {
        let job = sample_job();
        let (kind, digest) = job.executable_checksum().unwrap();
        assert_eq!(kind, ChecksumKind::Sha256);
        assert_eq!(digest, "deadbeef00");

        let job = sample_job().with_str(ATTR_EXECUTABLE_CHECKSUM, "sha256:not-hex");
        assert!(job.executable_checksum().is_none());
    }

    #[test]
    fn test_queue_user_defaults_to_owner() {
        assert_eq!(sample_job().queue_user(), "Owner_alice");
        let job = sample_job().with_str(ATTR_TRANSFER_QUEUE_USER, "group_physics");
        assert_eq!(job.queue_user(), "group_physics");
    }

    #[test]
    fn test_limits_default_to_unlimited() {
        let job = sample_job();
        assert_eq!(job.max_upload_bytes(), -1);
        assert_eq!(job.max_download_bytes(), 4096);
    }
}
