//! Plugin discovery and the scheme → plugin table
//!
//! At service startup every configured plugin binary is probed with a
//! capability query (`-classad`) and its attribute output decides which URL
//! schemes it serves and whether it can batch. A job may carry an inline
//! override table that wins over the global one; overrides run with
//! restricted privilege and are assumed batching-capable.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use stagehand_wire::AttrRecord;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Attribute identifying a capability record as a transfer plugin
pub const ATTR_PLUGIN_TYPE: &str = "PluginType";
/// Comma-separated URL schemes a plugin serves
pub const ATTR_SUPPORTED_METHODS: &str = "SupportedMethods";
/// Whether a plugin accepts batched transfer lists
pub const ATTR_MULTIPLE_FILE_SUPPORT: &str = "MultipleFileSupport";
/// Plugin revision, informational
pub const ATTR_PLUGIN_VERSION: &str = "PluginVersion";

/// Expected value of [`ATTR_PLUGIN_TYPE`]
const PLUGIN_TYPE_FILE_TRANSFER: &str = "FileTransfer";

/// How long a capability probe may run
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// Scheme → plugin table with per-plugin capability flags
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    by_scheme: HashMap<String, PathBuf>,
    multifile: HashMap<PathBuf, bool>,
    job_supplied: HashSet<PathBuf>,
}

impl PluginRegistry {
    /// Probe every candidate binary and build the global table
    ///
    /// A probe failure disables that plugin only; discovery never fails as
    /// a whole. When `enable_multifile` is off, batching capability is
    /// ignored even if a plugin advertises it.
    pub async fn discover(candidates: &[PathBuf], enable_multifile: bool) -> Self {
        let mut registry = Self::default();
        for path in candidates {
            match probe(path).await {
                Ok(caps) => {
                    let multi = enable_multifile && caps.multifile;
                    for scheme in caps.schemes {
                        registry.register(&scheme, path, multi);
                    }
                }
                Err(reason) => {
                    warn!("disabling transfer plugin {}: {reason}", path.display());
                }
            }
        }
        info!(
            "transfer plugin discovery complete: {} scheme(s) served",
            registry.by_scheme.len()
        );
        registry
    }

    /// Register one scheme → plugin mapping
    ///
    /// A registered `https` plugin implicitly serves `s3`, whose signed
    /// counterparts are https URLs.
    pub fn register(&mut self, scheme: &str, plugin: &Path, multifile: bool) {
        let scheme = scheme.to_ascii_lowercase();
        debug!(
            "registering plugin {} for scheme {scheme} (multifile: {multifile})",
            plugin.display()
        );
        self.by_scheme.insert(scheme.clone(), plugin.to_path_buf());
        self.multifile.insert(plugin.to_path_buf(), multifile);
        if scheme == "https" && !self.by_scheme.contains_key("s3") {
            self.by_scheme.insert("s3".to_string(), plugin.to_path_buf());
        }
    }

    /// Overlay a job's inline `scheme=path` override table
    ///
    /// Overridden plugins are assumed batching-capable and are marked
    /// job-supplied so the invoker runs them with restricted privilege.
    pub fn with_job_overrides(&self, overrides: &[(String, String)]) -> Self {
        let mut merged = self.clone();
        for (scheme, path) in overrides {
            let path = PathBuf::from(path);
            merged.register(scheme, &path, true);
            merged.job_supplied.insert(path);
        }
        merged
    }

    /// Plugin serving the given URL scheme, if any
    pub fn plugin_for(&self, scheme: &str) -> Option<&Path> {
        self.by_scheme
            .get(&scheme.to_ascii_lowercase())
            .map(PathBuf::as_path)
    }

    /// Whether a plugin accepts batched transfer lists
    pub fn is_multifile(&self, plugin: &Path) -> bool {
        self.multifile.get(plugin).copied().unwrap_or(false)
    }

    /// Whether a plugin came from a job override rather than the service
    /// configuration
    pub fn is_job_supplied(&self, plugin: &Path) -> bool {
        self.job_supplied.contains(plugin)
    }

    /// Schemes currently served, for logs and capability advertising
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.by_scheme.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

/// Parsed capability probe output
struct Capabilities {
    schemes: Vec<String>,
    multifile: bool,
}

async fn probe(path: &Path) -> Result<Capabilities, String> {
    let child = Command::new(path)
        .arg("-classad")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(PROBE_TIMEOUT, child)
        .await
        .map_err(|_| "capability probe timed out".to_string())?
        .map_err(|e| format!("failed to spawn: {e}"))?;

    if !output.status.success() {
        return Err(format!("capability probe exited with {}", output.status));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let record =
        AttrRecord::parse(&text).map_err(|e| format!("unparseable capability record: {e}"))?;

    match record.get_str(ATTR_PLUGIN_TYPE) {
        Some(PLUGIN_TYPE_FILE_TRANSFER) => {}
        other => {
            return Err(format!("not a file-transfer plugin (PluginType = {other:?})"));
        }
    }

    let schemes: Vec<String> = record
        .get_str(ATTR_SUPPORTED_METHODS)
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    if schemes.is_empty() {
        return Err("plugin advertises no supported methods".to_string());
    }

    Ok(Capabilities {
        schemes,
        multifile: record.get_bool(ATTR_MULTIPLE_FILE_SUPPORT).unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    /// Write an executable shell script advertising the given capabilities
    fn fake_plugin(dir: &Path, name: &str, methods: &str, multifile: bool) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "#!/bin/sh\necho 'PluginType = \"FileTransfer\"'\n\
             echo 'SupportedMethods = \"{methods}\"'\n\
             echo 'MultipleFileSupport = {multifile}'"
        )
        .unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn test_discovery_and_scheme_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let curl = fake_plugin(dir.path(), "curl_plugin", "http,https", false);
        let multi = fake_plugin(dir.path(), "multi_plugin", "ftp", true);

        let registry =
            PluginRegistry::discover(&[curl.clone(), multi.clone()], true).await;

        assert_eq!(registry.plugin_for("http"), Some(curl.as_path()));
        assert_eq!(registry.plugin_for("HTTP"), Some(curl.as_path()));
        assert_eq!(registry.plugin_for("ftp"), Some(multi.as_path()));
        assert_eq!(registry.plugin_for("gopher"), None);
        assert!(!registry.is_multifile(&curl));
        assert!(registry.is_multifile(&multi));
    }

    #[tokio::test]
    async fn test_https_implies_s3() {
        let dir = tempfile::tempdir().unwrap();
        let curl = fake_plugin(dir.path(), "curl_plugin", "https", false);
        let registry = PluginRegistry::discover(&[curl.clone()], true).await;
        assert_eq!(registry.plugin_for("s3"), Some(curl.as_path()));
    }

    #[tokio::test]
    async fn test_multifile_disabled_globally() {
        let dir = tempfile::tempdir().unwrap();
        let multi = fake_plugin(dir.path(), "multi_plugin", "ftp", true);
        let registry = PluginRegistry::discover(&[multi.clone()], false).await;
        assert!(!registry.is_multifile(&multi));
    }

    #[tokio::test]
    async fn test_broken_plugin_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = fake_plugin(dir.path(), "good", "http", false);
        let missing = dir.path().join("missing");

        let registry = PluginRegistry::discover(&[missing, good.clone()], true).await;
        assert_eq!(registry.plugin_for("http"), Some(good.as_path()));
        assert_eq!(registry.schemes(), vec!["http".to_string()]);
    }

    #[tokio::test]
    async fn test_job_override_wins_and_is_marked() {
        let dir = tempfile::tempdir().unwrap();
        let global = fake_plugin(dir.path(), "global", "http", false);
        let registry = PluginRegistry::discover(&[global], true).await;

        let override_path = dir.path().join("job_plugin");
        let merged = registry
            .with_job_overrides(&[("http".to_string(), override_path.display().to_string())]);

        assert_eq!(merged.plugin_for("http"), Some(override_path.as_path()));
        assert!(merged.is_multifile(&override_path));
        assert!(merged.is_job_supplied(&override_path));
    }
}
