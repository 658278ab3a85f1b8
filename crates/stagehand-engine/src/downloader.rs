//! The receiver-side state machine
//!
//! A download reads the xfer-info preamble, answers the go-ahead exchange,
//! then dispatches commands until end-of-stream: file payloads, mkdirs,
//! delegated credentials, URL fetches (batched per multi-file plugin and
//! flushed at loop end), and the structured sub-commands (upload reports,
//! reuse queries, sign requests). Incoming names pass through the remap
//! table and must stay inside the sandbox; anything else is diverted to
//! the null sink and surfaces as a hold. Non-final sessions deliver
//! transactionally through the tmp-spool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stagehand_cache::{Reservation, ReuseCache};
use stagehand_config::Config;
use stagehand_plugins::invoker::{
    ATTR_TRANSFER_ERROR, ATTR_TRANSFER_FILE_NAME, ATTR_TRANSFER_PROTOCOL, ATTR_TRANSFER_SUCCESS,
    ATTR_TRANSFER_TOTAL_BYTES, ATTR_TRANSFER_URL,
};
use stagehand_plugins::{PluginInvoker, PluginRegistry, PluginRequest};
use stagehand_queue::{QueueCoordinator, SlotRequest, TransferQueueClient};
use stagehand_types::{
    ChecksumKind, Error, FailureInfo, FileTransferStats, JobRecord, PeerCapabilities,
    ProgressInfo, Result, TransferDirection, TransferEvent, TransferSummary,
    EXEC_RENAME_BASENAME,
};
use stagehand_wire::framer::{
    ATTR_REUSE_CHECKSUMS, ATTR_REUSE_HAVE, ATTR_REUSE_KINDS, ATTR_REUSE_NAMES, ATTR_REUSE_SIZES,
    ATTR_REUSE_TAG, ATTR_SIGNED_URLS, ATTR_SIGN_URLS, ATTR_SUBCOMMAND,
};
use stagehand_wire::{
    AttrRecord, Framer, GoAhead, GoAheadInfo, TransferAck, TransferCommand, TransferSubCommand,
    WireChannel,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::paths::{apply_remaps, resolve_sandbox_path, url_has_traversal};
use crate::spool::SpoolDirs;
use crate::stats::StatsLog;

/// Signs object-store URLs on behalf of the peer
///
/// The actual signing authority (credential service, presign library)
/// stays behind this seam so the state machine can be tested without one.
/// Returning `None` declines the URL; the peer abandons that item.
pub trait UrlSigner: Send + Sync {
    /// Produce a signed counterpart for a URL, or decline
    fn sign(&self, url: &str) -> Option<String>;
}

impl<F> UrlSigner for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn sign(&self, url: &str) -> Option<String> {
        self(url)
    }
}

/// Receiver side of one transfer session
pub struct Downloader {
    job: JobRecord,
    config: Arc<Config>,
    peer: PeerCapabilities,
    registry: PluginRegistry,
    invoker: PluginInvoker,
    coordinator: Arc<dyn QueueCoordinator>,
    sandbox: PathBuf,
    final_transfer: bool,
    cache: Option<ReuseCache>,
    signer: Option<Arc<dyn UrlSigner>>,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,

    first_error: Option<Error>,
    drain_rest: bool,
    bytes: u64,
    files: u64,
    stats: Vec<FileTransferStats>,
    arrived: Vec<String>,
    url_batch: Vec<(PathBuf, PluginRequest)>,
    pending_reuse: HashMap<String, (ChecksumKind, String)>,
    reservation: Option<Reservation>,
}

impl Downloader {
    /// Create a downloader delivering into `sandbox`
    ///
    /// A non-final session writes through the tmp-spool beside `sandbox`
    /// and commits at stream end; a final session writes directly.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: JobRecord,
        config: Arc<Config>,
        peer: PeerCapabilities,
        registry: PluginRegistry,
        invoker: PluginInvoker,
        coordinator: Arc<dyn QueueCoordinator>,
        sandbox: PathBuf,
        final_transfer: bool,
    ) -> Self {
        Self {
            job,
            config,
            peer,
            registry,
            invoker,
            coordinator,
            sandbox,
            final_transfer,
            cache: None,
            signer: None,
            events: None,
            first_error: None,
            drain_rest: false,
            bytes: 0,
            files: 0,
            stats: Vec::new(),
            arrived: Vec::new(),
            url_batch: Vec::new(),
            pending_reuse: HashMap::new(),
            reservation: None,
        }
    }

    /// Attach a reuse cache
    pub fn with_cache(mut self, cache: ReuseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attach a URL signing authority
    pub fn with_signer(mut self, signer: Arc<dyn UrlSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Publish progress and the final summary on this channel
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Drive the session to completion, returning the summary
    pub async fn run<C: WireChannel>(&mut self, framer: &mut Framer<C>) -> TransferSummary {
        let started = Instant::now();
        let spool = SpoolDirs::at(self.sandbox.clone());
        let result = self.drive(framer, &spool).await;

        // The reservation guard releases any unclaimed cache space on
        // every exit path, including aborts.
        self.reservation = None;

        let mut summary = match result {
            Ok(peer_ack) => self.reconcile(peer_ack),
            Err(error) => {
                warn!("download aborted: {error}");
                TransferSummary::failure(FailureInfo::from_error(
                    &error,
                    TransferDirection::Download,
                ))
            }
        };
        summary.bytes = self.bytes;
        summary.files = self.files;
        summary.duration = started.elapsed();
        summary.file_stats = std::mem::take(&mut self.stats);
        summary.spooled_files = std::mem::take(&mut self.arrived);
        summary.tcp_stats = framer.channel_mut().tcp_stats();

        if !self.config.paths.stats_log.as_os_str().is_empty() {
            let log = StatsLog::new(self.config.paths.stats_log.clone());
            for stats in &summary.file_stats {
                if let Err(e) = log.append(stats).await {
                    warn!("stats log append failed: {e}");
                }
            }
        }

        if let Some(events) = &self.events {
            let _ = events.send(TransferEvent::Final(summary.clone()));
        }
        summary
    }

    async fn drive<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        spool: &SpoolDirs,
    ) -> Result<TransferAck> {
        if self.final_transfer {
            tokio::fs::create_dir_all(&self.sandbox)
                .await
                .map_err(|e| Error::WriteFailed {
                    path: self.sandbox.clone(),
                    message: e.to_string(),
                })?;
        } else {
            spool.ensure().await?;
        }
        let write_root = spool.write_root(self.final_transfer).to_path_buf();

        let sandbox_size = if self.peer.xfer_info {
            framer.recv_xfer_info().await?
        } else {
            0
        };

        if self.peer.go_ahead {
            match self.acquire_slot(sandbox_size).await {
                Ok(mut slot) => {
                    framer
                        .send_go_ahead(&GoAheadInfo {
                            go_ahead: GoAhead::Always,
                            timeout_secs: Some(self.config.queue.keep_alive_secs),
                            max_transfer_bytes: self.job.max_download_bytes(),
                        })
                        .await?;
                    let peer_go_ahead = framer.recv_go_ahead().await?;
                    let loop_result = if peer_go_ahead.go_ahead == GoAhead::Failed {
                        Err(Error::Queue {
                            message: "peer refused transfer go-ahead".to_string(),
                            retryable: true,
                        })
                    } else {
                        self.command_loop(framer, &write_root).await
                    };
                    if loop_result.is_ok() {
                        // Plugin fetches are part of the admitted session;
                        // the slot goes back only once they finish.
                        self.flush_url_batches(&write_root).await;
                    }
                    slot.release().await.ok();
                    loop_result?;
                }
                Err(error) => {
                    framer
                        .send_go_ahead(&GoAheadInfo {
                            go_ahead: GoAhead::Failed,
                            timeout_secs: None,
                            max_transfer_bytes: -1,
                        })
                        .await?;
                    return Err(error);
                }
            }
        } else {
            self.command_loop(framer, &write_root).await?;
            self.flush_url_batches(&write_root).await;
        }

        if !self.final_transfer && self.first_error.is_none() {
            spool.mark_commit().await?;
            match spool.commit().await {
                Ok(rotated) => self.arrived = rotated,
                Err(error) => self.record_error(error),
            }
        }

        if self.peer.transfer_ack {
            let peer_ack = framer.recv_ack().await?;
            let own_ack = match &self.first_error {
                None => TransferAck::success(),
                Some(error) => TransferAck::failure(FailureInfo::from_error(
                    error,
                    TransferDirection::Download,
                )),
            };
            framer.send_ack(&own_ack).await?;
            Ok(peer_ack)
        } else {
            Ok(TransferAck::success())
        }
    }

    async fn command_loop<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        write_root: &Path,
    ) -> Result<()> {
        loop {
            let command = framer.recv_command().await?;
            match command {
                TransferCommand::Finished => return Ok(()),
                TransferCommand::File
                | TransferCommand::EnableEncryption
                | TransferCommand::DisableEncryption => {
                    self.receive_file(framer, write_root, command).await?;
                }
                TransferCommand::DelegateCredential => {
                    self.receive_credential(framer, write_root).await?;
                }
                TransferCommand::DownloadUrl => {
                    self.receive_url(framer, write_root).await?;
                }
                TransferCommand::Mkdir => {
                    self.receive_mkdir(framer, write_root).await?;
                }
                TransferCommand::Other => {
                    self.receive_subcommand(framer, write_root).await?;
                }
            }
        }
    }

    async fn receive_file<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        write_root: &Path,
        command: TransferCommand,
    ) -> Result<()> {
        match command {
            TransferCommand::EnableEncryption => framer.channel_mut().set_encryption(Some(true)),
            TransferCommand::DisableEncryption => framer.channel_mut().set_encryption(Some(false)),
            _ => {}
        }
        let wire_name = framer.recv_filename().await?;
        let mapped = apply_remaps(&wire_name, &self.job.output_remaps());

        let mut dest: Option<PathBuf> = None;
        match resolve_sandbox_path(write_root, &mapped) {
            Ok(path) => dest = Some(path),
            Err(error) => {
                // Diverted to the null sink; the hold surfaces at session
                // end.
                self.record_error(error);
            }
        }
        if self.drain_rest {
            dest = None;
        }

        let limit = if dest.is_none() || self.job.max_download_bytes() < 0 {
            -1
        } else {
            (self.job.max_download_bytes() - self.bytes as i64).max(0)
        };

        let mut file = match &dest {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.ok();
                }
                match tokio::fs::File::create(path).await {
                    Ok(file) => Some(file),
                    Err(e) => {
                        self.record_error(Error::WriteFailed {
                            path: path.clone(),
                            message: e.to_string(),
                        });
                        self.drain_rest = true;
                        None
                    }
                }
            }
            None => None,
        };

        let received = framer.recv_file(file.as_mut(), limit).await;
        framer.channel_mut().set_encryption(None);
        drop(file);

        match received {
            Ok((got, mode)) => {
                self.bytes += got;
                self.files += 1;
                if let Some(path) = &dest {
                    self.apply_mode(path, &mapped, mode).await;
                    self.maybe_ingest(path, &mapped).await;
                    self.arrived.push(mapped.clone());
                }
                self.progress(&mapped);
            }
            Err(error @ (Error::Network { .. } | Error::Protocol { .. })) => {
                // Stream state is undefined; tear the session down.
                return Err(error);
            }
            Err(error) => {
                // Permanent local failure: keep consuming the stream so
                // the sender can finish cleanly.
                self.record_error(error);
                self.drain_rest = true;
            }
        }
        Ok(())
    }

    async fn receive_credential<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        write_root: &Path,
    ) -> Result<()> {
        let wire_name = framer.recv_filename().await?;
        let (data, lifetime) = framer.recv_credential().await?;
        match resolve_sandbox_path(write_root, &wire_name) {
            Ok(path) => {
                if let Err(e) = tokio::fs::write(&path, &data).await {
                    self.record_error(Error::Delegation {
                        message: format!("failed to store credential: {e}"),
                    });
                } else {
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let _ = tokio::fs::set_permissions(
                            &path,
                            std::fs::Permissions::from_mode(0o600),
                        )
                        .await;
                    }
                    debug!(
                        "stored delegated credential {wire_name} (lifetime {lifetime}s)"
                    );
                    self.files += 1;
                    self.arrived.push(wire_name.clone());
                }
            }
            Err(error) => self.record_error(error),
        }
        Ok(())
    }

    async fn receive_url<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        write_root: &Path,
    ) -> Result<()> {
        let wire_name = framer.recv_filename().await?;
        let url = framer.channel_mut().recv_str().await?;
        framer.channel_mut().expect_end_of_message().await?;

        if !self.config.transfers.enable_url_transfers {
            self.record_error(Error::config(format!(
                "URL transfers are disabled; cannot fetch {url}"
            )));
            return Ok(());
        }
        let mapped = apply_remaps(&wire_name, &self.job.output_remaps());
        let dest = match resolve_sandbox_path(write_root, &mapped) {
            Ok(path) => path,
            Err(error) => {
                self.record_error(error);
                return Ok(());
            }
        };

        let scheme = url.split("://").next().unwrap_or("").to_ascii_lowercase();
        let registry = self.registry.with_job_overrides(&self.job.plugin_overrides());
        let Some(plugin) = registry.plugin_for(&scheme).map(Path::to_path_buf) else {
            self.record_error(Error::Plugin {
                url: url.clone(),
                message: format!("no plugin handles scheme {scheme}"),
                retryable: false,
            });
            return Ok(());
        };

        if registry.is_multifile(&plugin) && self.config.transfers.enable_multifile_plugins {
            // Buffered until end-of-stream, then fetched one batch per
            // plugin in submission order.
            self.url_batch.push((
                plugin,
                PluginRequest {
                    url,
                    local_file: dest,
                },
            ));
            return Ok(());
        }

        match self.invoker.invoke_single(&plugin, &url, &dest.display().to_string()).await {
            Ok(mut stats) => {
                if stats.file_name.is_empty() {
                    stats.file_name = mapped.clone();
                }
                self.bytes += stats.bytes;
                self.files += 1;
                self.arrived.push(mapped.clone());
                self.stats.push(stats);
                self.progress(&mapped);
            }
            Err(error) => {
                self.stats.push(FileTransferStats {
                    file_name: mapped,
                    url: String::new(),
                    protocol: scheme,
                    bytes: 0,
                    success: false,
                    error: Some(error.to_string()),
                    elapsed: None,
                });
                self.record_error(error);
            }
        }
        Ok(())
    }

    async fn receive_mkdir<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        write_root: &Path,
    ) -> Result<()> {
        let wire_name = framer.recv_filename().await?;
        let mode = framer.recv_mkdir().await?;
        let mode = if mode == 0 { 0o700 } else { mode };

        let path = match resolve_sandbox_path(write_root, &wire_name) {
            Ok(path) => path,
            Err(error) => {
                self.record_error(error);
                return Ok(());
            }
        };

        if path.is_dir() {
            return Ok(());
        }
        if path.exists() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                self.record_error(Error::WriteFailed {
                    path: path.clone(),
                    message: format!("cannot replace with directory: {e}"),
                });
                return Ok(());
            }
        }
        if let Err(e) = tokio::fs::create_dir_all(&path).await {
            self.record_error(Error::WriteFailed {
                path: path.clone(),
                message: e.to_string(),
            });
            return Ok(());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await;
        }
        Ok(())
    }

    async fn receive_subcommand<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        write_root: &Path,
    ) -> Result<()> {
        let _name = framer.recv_filename().await?;
        let record = framer.recv_record().await?;
        let subcommand = TransferSubCommand::from_code(record.require_int(ATTR_SUBCOMMAND)?)?;
        match subcommand {
            TransferSubCommand::UploadUrl => {
                let stats = FileTransferStats {
                    file_name: record.get_str(ATTR_TRANSFER_FILE_NAME).unwrap_or("").to_string(),
                    url: record.get_str(ATTR_TRANSFER_URL).unwrap_or("").to_string(),
                    protocol: record.get_str(ATTR_TRANSFER_PROTOCOL).unwrap_or("").to_string(),
                    bytes: record
                        .get_int(ATTR_TRANSFER_TOTAL_BYTES)
                        .and_then(|b| u64::try_from(b).ok())
                        .unwrap_or(0),
                    success: record.get_bool(ATTR_TRANSFER_SUCCESS).unwrap_or(false),
                    error: record.get_str(ATTR_TRANSFER_ERROR).map(str::to_string),
                    elapsed: None,
                };
                if !stats.success {
                    self.record_error(Error::Plugin {
                        url: stats.url.clone(),
                        message: stats
                            .error
                            .clone()
                            .unwrap_or_else(|| "peer reported upload failure".to_string()),
                        retryable: false,
                    });
                }
                self.stats.push(stats);
            }
            TransferSubCommand::ReuseInfo => {
                let response = self.answer_reuse(&record, write_root).await;
                framer.send_record(&response).await?;
            }
            TransferSubCommand::SignUrls => {
                let response = self.answer_sign(&record);
                framer.send_record(&response).await?;
            }
        }
        Ok(())
    }

    /// Satisfy what we can from the cache and reserve space for the rest
    ///
    /// Every failure in here is non-fatal: an empty answer simply means
    /// the peer transfers everything normally.
    async fn answer_reuse(&mut self, record: &AttrRecord, write_root: &Path) -> AttrRecord {
        let mut have: Vec<String> = Vec::new();
        let Some(cache) = self.cache.clone() else {
            return AttrRecord::new().with_list(ATTR_REUSE_HAVE, have);
        };

        let names = record.get_list(ATTR_REUSE_NAMES).unwrap_or(&[]).to_vec();
        let checksums = record.get_list(ATTR_REUSE_CHECKSUMS).unwrap_or(&[]).to_vec();
        let kinds = record.get_list(ATTR_REUSE_KINDS).unwrap_or(&[]).to_vec();
        let sizes = record.get_list(ATTR_REUSE_SIZES).unwrap_or(&[]).to_vec();
        let tag = record.get_str(ATTR_REUSE_TAG).unwrap_or("").to_string();

        let expected_tag = format!("Owner_{}", self.job.owner());
        if tag != expected_tag {
            warn!("reuse query under foreign tag {tag}; answering empty");
            return AttrRecord::new().with_list(ATTR_REUSE_HAVE, have);
        }
        if names.len() != checksums.len() || names.len() != kinds.len() {
            warn!("malformed reuse query; answering empty");
            return AttrRecord::new().with_list(ATTR_REUSE_HAVE, have);
        }

        let mut missing_bytes: u64 = 0;
        for (idx, name) in names.iter().enumerate() {
            let Ok(kind) = kinds[idx].parse::<ChecksumKind>() else {
                continue;
            };
            let digest = checksums[idx].clone();
            let Ok(dest) = resolve_sandbox_path(write_root, name) else {
                continue;
            };
            match cache.retrieve_file(&dest, &digest, kind, &tag).await {
                Ok(true) => {
                    if name == EXEC_RENAME_BASENAME {
                        self.force_exec_mode(&dest).await;
                    }
                    self.arrived.push(name.clone());
                    self.files += 1;
                    have.push(name.clone());
                }
                Ok(false) => {
                    missing_bytes += sizes
                        .get(idx)
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(0);
                    self.pending_reuse.insert(name.clone(), (kind, digest));
                }
                Err(e) => {
                    debug!("reuse retrieval failed for {name}: {e}");
                }
            }
        }

        if missing_bytes > 0 {
            match cache.reserve_space(missing_bytes, Duration::from_secs(3600), &expected_tag) {
                Ok(reservation) => self.reservation = Some(reservation),
                Err(e) => {
                    debug!("no cache reservation for incoming files: {e}");
                    self.pending_reuse.clear();
                }
            }
        }

        info!(
            "reuse query answered: {} of {} satisfied from cache",
            have.len(),
            names.len()
        );
        AttrRecord::new().with_list(ATTR_REUSE_HAVE, have)
    }

    /// Sign acceptable URLs, leaving unacceptable slots empty
    fn answer_sign(&self, record: &AttrRecord) -> AttrRecord {
        let urls = record.get_list(ATTR_SIGN_URLS).unwrap_or(&[]).to_vec();
        let prefix = self.job.output_destination().map(str::to_string);

        let signed: Vec<String> = urls
            .iter()
            .map(|url| {
                let acceptable = prefix
                    .as_deref()
                    .map(|p| url.starts_with(p))
                    .unwrap_or(false)
                    && !url_has_traversal(url)
                    && url.starts_with("s3://");
                if !acceptable {
                    return String::new();
                }
                self.signer
                    .as_ref()
                    .and_then(|signer| signer.sign(url))
                    .unwrap_or_default()
            })
            .collect();
        AttrRecord::new().with_list(ATTR_SIGNED_URLS, signed)
    }

    /// Fetch buffered URLs, one batch per plugin, preserving submission
    /// order
    async fn flush_url_batches(&mut self, write_root: &Path) {
        if self.url_batch.is_empty() {
            return;
        }
        let batches = std::mem::take(&mut self.url_batch);
        let mut grouped: Vec<(PathBuf, Vec<PluginRequest>)> = Vec::new();
        for (plugin, request) in batches {
            match grouped.last_mut() {
                Some((last, requests)) if *last == plugin => requests.push(request),
                _ => grouped.push((plugin, vec![request])),
            }
        }

        for (plugin, requests) in grouped {
            let result = self
                .invoker
                .invoke_multi(&plugin, &requests, false, write_root)
                .await;
            match result {
                Ok(results) => {
                    for stats in results {
                        if stats.success {
                            self.bytes += stats.bytes;
                            self.files += 1;
                            self.arrived.push(stats.file_name.clone());
                        } else if self.first_error.is_none() {
                            self.first_error = Some(Error::Plugin {
                                url: stats.url.clone(),
                                message: stats
                                    .error
                                    .clone()
                                    .unwrap_or_else(|| "plugin reported failure".to_string()),
                                retryable: false,
                            });
                        }
                        self.stats.push(stats);
                    }
                }
                Err(error) => self.record_error(error),
            }
        }
    }

    async fn acquire_slot(&self, sandbox_size: u64) -> Result<stagehand_queue::QueueSlot> {
        let client = TransferQueueClient::new(
            self.coordinator.as_ref(),
            Duration::from_secs(self.config.limits.io_timeout_secs),
        );
        client
            .acquire(SlotRequest {
                direction: TransferDirection::Download,
                sandbox_bytes: sandbox_size,
                file_name: self.sandbox.display().to_string(),
                job_id: self.job.job_id(),
                queue_user: crate::uploader::queue_user(&self.config, &self.job),
                keep_alive_secs: self.config.queue.keep_alive_secs,
            })
            .await
    }

    /// A received executable is always runnable; everything else keeps the
    /// sender's mode where the platform reports one
    async fn apply_mode(&self, path: &Path, name: &str, mode: Option<u32>) {
        if Path::new(name)
            .file_name()
            .map(|n| n == EXEC_RENAME_BASENAME)
            .unwrap_or(false)
        {
            self.force_exec_mode(path).await;
            return;
        }
        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await;
        }
        #[cfg(not(unix))]
        let _ = mode;
    }

    async fn force_exec_mode(&self, path: &Path) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await;
        }
        #[cfg(not(unix))]
        let _ = path;
    }

    /// Ingest a just-received file the peer declared a checksum for
    async fn maybe_ingest(&mut self, path: &Path, name: &str) {
        let Some((kind, digest)) = self.pending_reuse.remove(name) else {
            return;
        };
        let (Some(cache), Some(reservation)) = (&self.cache, &self.reservation) else {
            return;
        };
        if let Err(e) = cache.cache_file(path, &digest, kind, reservation).await {
            debug!("cache ingestion skipped for {name}: {e}");
        }
    }

    fn record_error(&mut self, error: Error) {
        warn!("download item failed: {error}");
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }

    fn progress(&self, current_file: &str) {
        if let Some(events) = &self.events {
            let _ = events.send(TransferEvent::Progress(ProgressInfo {
                bytes_so_far: self.bytes,
                files_so_far: self.files,
                current_file: current_file.to_string(),
            }));
        }
    }

    fn reconcile(&mut self, peer_ack: TransferAck) -> TransferSummary {
        if let Some(error) = self.first_error.take() {
            return TransferSummary::failure(FailureInfo::from_error(
                &error,
                TransferDirection::Download,
            ));
        }
        if !peer_ack.success {
            let info = peer_ack.failure.unwrap_or(FailureInfo {
                try_again: true,
                hold_code: None,
                hold_subcode: 0,
                reason: "peer reported failure without detail".to_string(),
            });
            return TransferSummary::failure(info);
        }
        TransferSummary::success()
    }
}
