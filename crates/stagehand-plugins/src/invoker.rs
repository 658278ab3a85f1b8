//! Spawning transfer plugins and collecting their result records
//!
//! Two invocation shapes exist. A single transfer passes `src dst` as
//! positional arguments and reads attribute lines from stdout. A multi
//! transfer materialises an input file of attribute records, passes
//! `-infile <in> -outfile <out> [-upload]`, and parses the output file as a
//! parallel sequence of result records. Either way a non-zero exit is a
//! failure classified by the plugin's own error report.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use stagehand_types::{Error, FileTransferStats, Result};
use stagehand_wire::AttrRecord;
use tokio::process::Command;
use tracing::{debug, warn};

/// Local filename attribute in a multi-transfer input record
pub const ATTR_LOCAL_FILE_NAME: &str = "LocalFileName";
/// URL attribute in a multi-transfer input record
pub const ATTR_URL: &str = "Url";
/// Filename attribute in a result record
pub const ATTR_TRANSFER_FILE_NAME: &str = "TransferFileName";
/// URL attribute in a result record
pub const ATTR_TRANSFER_URL: &str = "TransferUrl";
/// Success flag in a result record
pub const ATTR_TRANSFER_SUCCESS: &str = "TransferSuccess";
/// Error description in a failed result record
pub const ATTR_TRANSFER_ERROR: &str = "TransferError";
/// Protocol reported in a result record
pub const ATTR_TRANSFER_PROTOCOL: &str = "TransferProtocol";
/// Bytes moved, reported in a result record
pub const ATTR_TRANSFER_TOTAL_BYTES: &str = "TransferTotalBytes";
/// Whether the plugin classified its failure as transient
pub const ATTR_TRANSFER_RETRYABLE: &str = "TransferRetryable";

/// Credential directory environment variable propagated to plugins
pub const ENV_CREDS_DIR: &str = "_CONDOR_CREDS";
/// Credential file environment variable propagated to plugins
pub const ENV_USER_PROXY: &str = "X509_USER_PROXY";
/// Job attribute file environment variable propagated to plugins
pub const ENV_JOB_AD: &str = "_CONDOR_JOB_AD";
/// Machine attribute file environment variable propagated to plugins
pub const ENV_MACHINE_AD: &str = "_CONDOR_MACHINE_AD";

/// Plugin exit codes treated as transient, following the curl convention
/// (connect failure, partial file, read error, operation timeout,
/// send/receive error)
const RETRYABLE_EXITS: &[i32] = &[7, 18, 26, 28, 55, 56];

/// Identity a plugin child process runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginPrivilege {
    /// Run as the service principal; see the configuration caveat about
    /// dynamic-loader search paths
    Service,
    /// Drop to the job's identity before exec
    Job {
        /// Numeric uid to run under
        uid: u32,
        /// Numeric gid to run under
        gid: u32,
    },
}

/// Files and directories exported to plugin children
#[derive(Debug, Clone, Default)]
pub struct PluginEnvironment {
    /// Credential directory (`_CONDOR_CREDS`)
    pub creds_dir: Option<PathBuf>,
    /// Credential file (`X509_USER_PROXY`)
    pub proxy_file: Option<PathBuf>,
    /// Job attribute file (`_CONDOR_JOB_AD`)
    pub job_ad: Option<PathBuf>,
    /// Machine attribute file (`_CONDOR_MACHINE_AD`)
    pub machine_ad: Option<PathBuf>,
}

/// One transfer in a multi-transfer batch
#[derive(Debug, Clone)]
pub struct PluginRequest {
    /// URL to fetch from or push to
    pub url: String,
    /// Local file the bytes land in or come from
    pub local_file: PathBuf,
}

/// Spawns plugins and shapes their output into statistics records
#[derive(Debug, Clone)]
pub struct PluginInvoker {
    env: PluginEnvironment,
    privilege: PluginPrivilege,
    timeout: Duration,
}

impl PluginInvoker {
    /// Create an invoker with the given child environment and privilege
    pub fn new(env: PluginEnvironment, privilege: PluginPrivilege, timeout: Duration) -> Self {
        Self {
            env,
            privilege,
            timeout,
        }
    }

    /// Run a single-transfer plugin: `plugin <src> <dst>`
    ///
    /// Attribute lines on stdout become the statistics record. A non-zero
    /// exit is classified by exit code into retryable or permanent.
    pub async fn invoke_single(
        &self,
        plugin: &Path,
        src: &str,
        dst: &str,
    ) -> Result<FileTransferStats> {
        debug!("invoking {} for {src} -> {dst}", plugin.display());
        let started = Instant::now();
        let mut command = Command::new(plugin);
        command.arg(src).arg(dst).stdout(Stdio::piped());
        self.prepare(&mut command);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| Error::Plugin {
                url: src.to_string(),
                message: format!(
                    "plugin {} timed out after {}s",
                    plugin.display(),
                    self.timeout.as_secs()
                ),
                retryable: true,
            })?
            .map_err(|e| Error::Plugin {
                url: src.to_string(),
                message: format!("failed to spawn {}: {e}", plugin.display()),
                retryable: false,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let record = AttrRecord::parse(&stdout).unwrap_or_default();

        let mut stats = stats_from_record(&record);
        if stats.url.is_empty() {
            stats.url = src.to_string();
        }
        stats.elapsed = Some(started.elapsed());

        if output.status.success() {
            stats.success = true;
            return Ok(stats);
        }

        let exit = output.status.code().unwrap_or(-1);
        let message = record
            .get_str(ATTR_TRANSFER_ERROR)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} exited with code {exit}", plugin.display()));
        warn!("plugin transfer failed for {src}: {message}");
        Err(Error::Plugin {
            url: src.to_string(),
            message,
            retryable: RETRYABLE_EXITS.contains(&exit),
        })
    }

    /// Run a multi-transfer plugin over a batch of requests
    ///
    /// The input file carries one record per request, in submission order;
    /// the output file must come back parallel. Returns one statistics
    /// record per request. A malformed output record fails the whole batch
    /// as a protocol error.
    pub async fn invoke_multi(
        &self,
        plugin: &Path,
        requests: &[PluginRequest],
        upload: bool,
        work_dir: &Path,
    ) -> Result<Vec<FileTransferStats>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            "invoking {} for a batch of {} transfer(s)",
            plugin.display(),
            requests.len()
        );

        let infile = work_dir.join(".stage_plugin_in");
        let outfile = work_dir.join(".stage_plugin_out");
        let records: Vec<AttrRecord> = requests
            .iter()
            .map(|req| {
                AttrRecord::new()
                    .with_str(ATTR_URL, req.url.clone())
                    .with_str(ATTR_LOCAL_FILE_NAME, req.local_file.display().to_string())
            })
            .collect();
        tokio::fs::write(&infile, AttrRecord::write_sequence(&records))
            .await
            .map_err(|e| Error::io(format!("failed to write plugin input file: {e}")))?;

        let mut command = Command::new(plugin);
        command
            .arg("-infile")
            .arg(&infile)
            .arg("-outfile")
            .arg(&outfile)
            .stdout(Stdio::null());
        if upload {
            command.arg("-upload");
        }
        self.prepare(&mut command);

        let batch_url = &requests[0].url;
        let status = tokio::time::timeout(self.timeout, command.status())
            .await
            .map_err(|_| Error::Plugin {
                url: batch_url.clone(),
                message: format!(
                    "plugin {} timed out after {}s",
                    plugin.display(),
                    self.timeout.as_secs()
                ),
                retryable: true,
            })?
            .map_err(|e| Error::Plugin {
                url: batch_url.clone(),
                message: format!("failed to spawn {}: {e}", plugin.display()),
                retryable: false,
            })?;

        let out_text = tokio::fs::read_to_string(&outfile).await.map_err(|e| {
            Error::Plugin {
                url: batch_url.clone(),
                message: format!(
                    "plugin {} produced no output file: {e} (exit {status})",
                    plugin.display()
                ),
                retryable: false,
            }
        });
        // The exchange files are scratch; they must not linger in a spool
        // that later rotates into the sandbox.
        let _ = tokio::fs::remove_file(&infile).await;
        let _ = tokio::fs::remove_file(&outfile).await;
        let out_records = AttrRecord::parse_sequence(&out_text?)?;

        let mut results = Vec::with_capacity(out_records.len());
        for record in &out_records {
            // Every result record must identify its transfer and outcome;
            // anything less is a contract violation by the plugin.
            record.require_str(ATTR_TRANSFER_FILE_NAME)?;
            record.require_bool(ATTR_TRANSFER_SUCCESS)?;
            results.push(stats_from_record(record));
        }
        if results.len() != requests.len() {
            return Err(Error::protocol(format!(
                "plugin {} answered {} of {} transfers",
                plugin.display(),
                results.len(),
                requests.len()
            )));
        }
        Ok(results)
    }

    fn prepare(&self, command: &mut Command) {
        command
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.env.creds_dir {
            command.env(ENV_CREDS_DIR, dir);
        }
        if let Some(file) = &self.env.proxy_file {
            command.env(ENV_USER_PROXY, file);
        }
        if let Some(file) = &self.env.job_ad {
            command.env(ENV_JOB_AD, file);
        }
        if let Some(file) = &self.env.machine_ad {
            command.env(ENV_MACHINE_AD, file);
        }
        #[cfg(unix)]
        if let PluginPrivilege::Job { uid, gid } = self.privilege {
            command.uid(uid).gid(gid);
        }
    }
}

/// Shape a plugin result record into the engine's statistics type
fn stats_from_record(record: &AttrRecord) -> FileTransferStats {
    FileTransferStats {
        file_name: record
            .get_str(ATTR_TRANSFER_FILE_NAME)
            .unwrap_or("")
            .to_string(),
        url: record.get_str(ATTR_TRANSFER_URL).unwrap_or("").to_string(),
        protocol: record
            .get_str(ATTR_TRANSFER_PROTOCOL)
            .unwrap_or("")
            .to_string(),
        bytes: record
            .get_int(ATTR_TRANSFER_TOTAL_BYTES)
            .and_then(|b| u64::try_from(b).ok())
            .unwrap_or(0),
        success: record.get_bool(ATTR_TRANSFER_SUCCESS).unwrap_or(false),
        error: record.get_str(ATTR_TRANSFER_ERROR).map(str::to_string),
        elapsed: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn invoker() -> PluginInvoker {
        PluginInvoker::new(
            PluginEnvironment::default(),
            PluginPrivilege::Service,
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_single_success_with_stats() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script(
            dir.path(),
            "http_plugin",
            "echo 'TransferProtocol = \"http\"'\n\
             echo 'TransferTotalBytes = 1048576'\n\
             exit 0",
        );

        let stats = invoker()
            .invoke_single(&plugin, "http://example/x.dat", "/sandbox/x.dat")
            .await
            .unwrap();
        assert!(stats.success);
        assert_eq!(stats.protocol, "http");
        assert_eq!(stats.bytes, 1_048_576);
        assert_eq!(stats.url, "http://example/x.dat");
        assert!(stats.elapsed.is_some());
    }

    #[tokio::test]
    async fn test_single_failure_classification() {
        let dir = tempfile::tempdir().unwrap();
        let transient = script(dir.path(), "transient", "exit 7");
        let permanent = script(dir.path(), "permanent", "exit 2");

        let err = invoker()
            .invoke_single(&transient, "http://example/a", "/sandbox/a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Plugin { retryable: true, .. }));

        let err = invoker()
            .invoke_single(&permanent, "http://example/a", "/sandbox/a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Plugin { retryable: false, .. }));
    }

    #[tokio::test]
    async fn test_multi_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        // Answers every input record in order, failing the second.
        let plugin = script(
            dir.path(),
            "multi",
            r#"
while [ "$1" ]; do
  case "$1" in
    -infile) IN="$2"; shift ;;
    -outfile) OUT="$2"; shift ;;
  esac
  shift
done
cat > "$OUT" <<'EOF'
TransferFileName = "x"
TransferUrl = "http://example/x"
TransferSuccess = true
TransferTotalBytes = 100

TransferFileName = "y"
TransferUrl = "http://example/y"
TransferSuccess = false
TransferError = "server said 404"
EOF
"#,
        );

        let requests = vec![
            PluginRequest {
                url: "http://example/x".into(),
                local_file: dir.path().join("x"),
            },
            PluginRequest {
                url: "http://example/y".into(),
                local_file: dir.path().join("y"),
            },
        ];
        let results = invoker()
            .invoke_multi(&plugin, &requests, false, dir.path())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert_eq!(results[0].bytes, 100);
        assert!(!results[1].success);
        assert_eq!(results[1].error.as_deref(), Some("server said 404"));
    }

    #[tokio::test]
    async fn test_multi_malformed_output_fails_batch() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script(
            dir.path(),
            "bad_multi",
            r#"
while [ "$1" ]; do
  case "$1" in
    -outfile) OUT="$2"; shift ;;
  esac
  shift
done
echo 'TransferUrl = "http://example/x"' > "$OUT"
"#,
        );

        let requests = vec![PluginRequest {
            url: "http://example/x".into(),
            local_file: dir.path().join("x"),
        }];
        let err = invoker()
            .invoke_multi(&plugin, &requests, false, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_environment_propagation() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = script(
            dir.path(),
            "env_probe",
            r#"[ "$_CONDOR_CREDS" = "/creds" ] && [ "$X509_USER_PROXY" = "/proxy" ] || exit 3"#,
        );

        let invoker = PluginInvoker::new(
            PluginEnvironment {
                creds_dir: Some(PathBuf::from("/creds")),
                proxy_file: Some(PathBuf::from("/proxy")),
                job_ad: None,
                machine_ad: None,
            },
            PluginPrivilege::Service,
            Duration::from_secs(10),
        );
        invoker
            .invoke_single(&plugin, "http://example/a", "/sandbox/a")
            .await
            .unwrap();
    }
}
