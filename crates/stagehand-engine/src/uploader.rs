//! The sender-side state machine
//!
//! An upload walks `BuildList → NegotiateReuse → NegotiateSigning →
//! Emit(item)* → EmitEnd → AwaitDownloadAck`. Local failures are recorded
//! (first one wins) without stopping the stream, so as many bytes as
//! possible reach the peer; protocol-stream failures abort immediately.
//! The final ack exchange reconciles both sides' views of the session.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use stagehand_cache::file_digest;
use stagehand_config::Config;
use stagehand_plugins::{PluginInvoker, PluginRegistry, PluginRequest};
use stagehand_queue::{QueueCoordinator, SlotRequest, TransferQueueClient};
use stagehand_types::{
    ChecksumKind, Error, FailureInfo, FileTransferStats, JobRecord, PeerCapabilities,
    ProgressInfo, Result, TransferDirection, TransferEvent, TransferItem, TransferSummary,
    MAX_BYTES_SLACK,
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

use crate::list::TransferPlan;
use crate::paths::url_has_traversal;

/// Sender side of one transfer session
pub struct Uploader {
    job: JobRecord,
    config: Arc<Config>,
    peer: PeerCapabilities,
    registry: PluginRegistry,
    invoker: PluginInvoker,
    coordinator: Arc<dyn QueueCoordinator>,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,

    first_error: Option<Error>,
    stats: Vec<FileTransferStats>,
    bytes: u64,
    files: u64,
}

impl Uploader {
    /// Create an uploader for a job
    pub fn new(
        job: JobRecord,
        config: Arc<Config>,
        peer: PeerCapabilities,
        registry: PluginRegistry,
        invoker: PluginInvoker,
        coordinator: Arc<dyn QueueCoordinator>,
    ) -> Self {
        Self {
            job,
            config,
            peer,
            registry,
            invoker,
            coordinator,
            events: None,
            first_error: None,
            stats: Vec::new(),
            bytes: 0,
            files: 0,
        }
    }

    /// Publish progress and the final summary on this channel
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Drive the session to completion, returning the summary
    ///
    /// Stream-level errors surface as a retryable failed summary; local
    /// errors are folded into the ack exchange.
    pub async fn run<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        mut plan: TransferPlan,
    ) -> TransferSummary {
        let started = Instant::now();
        let result = self.drive(framer, &mut plan).await;
        let mut summary = match result {
            Ok(peer_ack) => self.reconcile(peer_ack),
            Err(error) => {
                warn!("upload aborted: {error}");
                TransferSummary::failure(FailureInfo::from_error(
                    &error,
                    TransferDirection::Upload,
                ))
            }
        };
        summary.bytes = self.bytes;
        summary.files = self.files;
        summary.duration = started.elapsed();
        summary.file_stats = std::mem::take(&mut self.stats);
        summary.tcp_stats = framer.channel_mut().tcp_stats();

        if let Some(events) = &self.events {
            let _ = events.send(TransferEvent::Final(summary.clone()));
        }
        summary
    }

    async fn drive<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        plan: &mut TransferPlan,
    ) -> Result<TransferAck> {
        let sandbox_size = plan.framed_bytes();
        if self.peer.xfer_info {
            framer.send_xfer_info(sandbox_size).await?;
        }

        let mut peer_max_bytes: i64 = -1;
        if self.peer.go_ahead {
            let peer_go_ahead = framer.recv_go_ahead().await?;
            if peer_go_ahead.go_ahead == GoAhead::Failed {
                return Err(Error::Queue {
                    message: "peer refused transfer go-ahead".to_string(),
                    retryable: true,
                });
            }
            peer_max_bytes = peer_go_ahead.max_transfer_bytes;

            let slot = self.acquire_slot(sandbox_size).await;
            match slot {
                Ok(mut slot) => {
                    framer.send_go_ahead(&GoAheadInfo::always()).await?;
                    // The grant covers the rest of the session; the slot is
                    // given back when the session ends.
                    let release_result = self.emit_all(framer, plan, peer_max_bytes).await;
                    slot.release().await.ok();
                    release_result?;
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
            self.emit_all(framer, plan, peer_max_bytes).await?;
        }

        framer.send_command(TransferCommand::Finished).await?;

        if self.peer.transfer_ack {
            let own_ack = match &self.first_error {
                None => TransferAck::success(),
                Some(error) => TransferAck::failure(FailureInfo::from_error(
                    error,
                    TransferDirection::Upload,
                )),
            };
            framer.send_ack(&own_ack).await?;
            framer.recv_ack().await
        } else {
            Ok(TransferAck::success())
        }
    }

    /// Negotiations plus the item emission loop
    async fn emit_all<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        plan: &mut TransferPlan,
        peer_max_bytes: i64,
    ) -> Result<()> {
        if self.peer.reuse_info {
            self.negotiate_reuse(framer, plan).await?;
        }
        if self.peer.s3_urls && self.config.transfers.sign_s3_urls {
            self.negotiate_signing(framer, plan).await?;
        }

        let effective_max = match (self.job.max_upload_bytes(), peer_max_bytes) {
            (-1, peer) => peer,
            (own, -1) => own,
            (own, peer) => own.min(peer),
        };

        if let Some(credential) = plan.credential.take() {
            self.send_credential(framer, &credential).await?;
        }

        let items = std::mem::take(&mut plan.items);
        let mut batch: Vec<(TransferItem, PluginRequest)> = Vec::new();
        let mut batch_plugin: Option<std::path::PathBuf> = None;

        for item in items {
            if item.has_dest_url() {
                let scheme = item.dest_scheme().to_string();
                let plugin = match self.registry.plugin_for(&scheme) {
                    Some(plugin) => plugin.to_path_buf(),
                    None => {
                        self.record_error(Error::Plugin {
                            url: item.dest_url.clone(),
                            message: format!("no plugin handles scheme {scheme}"),
                            retryable: false,
                        });
                        continue;
                    }
                };
                if self.registry.is_multifile(&plugin)
                    && self.config.transfers.enable_multifile_plugins
                {
                    if batch_plugin.as_deref() != Some(plugin.as_path()) {
                        self.flush_batch(framer, &mut batch, batch_plugin.take()).await?;
                        batch_plugin = Some(plugin);
                    }
                    let request = PluginRequest {
                        url: item.dest_url.clone(),
                        local_file: Path::new(&item.src_name).to_path_buf(),
                    };
                    batch.push((item, request));
                    if let Some(limit) = self.job.plugin_batch_size() {
                        if batch.len() >= limit {
                            self.flush_batch(framer, &mut batch, batch_plugin.take()).await?;
                        }
                    }
                    continue;
                }
                self.flush_batch(framer, &mut batch, batch_plugin.take()).await?;
                self.upload_single(framer, &plugin, &item).await?;
                continue;
            }

            // Destination-URL items are contiguous at the head of the
            // sorted plan; anything else ends the open batch.
            self.flush_batch(framer, &mut batch, batch_plugin.take()).await?;

            if item.is_directory {
                self.send_mkdir(framer, &item).await?;
            } else if item.has_src_url() {
                self.send_url(framer, &item).await?;
            } else {
                if effective_max >= 0
                    && self.bytes as i64 + item.file_size > effective_max + MAX_BYTES_SLACK
                {
                    self.record_error(Error::QuotaExceeded {
                        direction: TransferDirection::Upload,
                        limit: effective_max,
                        attempted: self.bytes as i64 + item.file_size,
                    });
                    // The cap is terminal: nothing further may be emitted.
                    break;
                }
                self.send_framed_file(framer, &item).await?;
            }
        }
        self.flush_batch(framer, &mut batch, batch_plugin.take()).await?;
        Ok(())
    }

    async fn acquire_slot(&self, sandbox_size: u64) -> Result<stagehand_queue::QueueSlot> {
        let client = TransferQueueClient::new(
            self.coordinator.as_ref(),
            std::time::Duration::from_secs(self.config.limits.io_timeout_secs),
        );
        client
            .acquire(SlotRequest {
                direction: TransferDirection::Upload,
                sandbox_bytes: sandbox_size,
                file_name: String::new(),
                job_id: self.job.job_id(),
                queue_user: queue_user(&self.config, &self.job),
                keep_alive_secs: self.config.queue.keep_alive_secs,
            })
            .await
    }

    /// Propose the checksummed items for reuse and drop what the peer
    /// already holds
    ///
    /// Only the executable carries a declared checksum today; the exchange
    /// is shaped as parallel lists so more can join without a wire change.
    /// Failures here are non-fatal: the files simply transfer normally.
    async fn negotiate_reuse<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        plan: &mut TransferPlan,
    ) -> Result<()> {
        let Some((kind, digest)) = self.job.executable_checksum() else {
            return Ok(());
        };
        let exec_item = plan
            .items
            .iter()
            .find(|item| item.is_framed() && item.wire_name() == stagehand_types::EXEC_RENAME_BASENAME);
        let Some(exec_item) = exec_item else {
            return Ok(());
        };

        let record = AttrRecord::new()
            .with_int(ATTR_SUBCOMMAND, TransferSubCommand::ReuseInfo.code())
            .with_list(ATTR_REUSE_NAMES, vec![exec_item.wire_name()])
            .with_list(ATTR_REUSE_CHECKSUMS, vec![digest])
            .with_list(ATTR_REUSE_KINDS, vec![kind.to_string()])
            .with_str(ATTR_REUSE_TAG, format!("Owner_{}", self.job.owner()))
            .with_list(ATTR_REUSE_SIZES, vec![exec_item.file_size.to_string()]);

        framer.send_command(TransferCommand::Other).await?;
        framer.send_filename("").await?;
        framer.send_record(&record).await?;

        let response = framer.recv_record().await?;
        let cached: HashSet<String> = response
            .get_list(ATTR_REUSE_HAVE)
            .unwrap_or(&[])
            .iter()
            .cloned()
            .collect();
        if !cached.is_empty() {
            info!("peer satisfied {} file(s) from its reuse cache", cached.len());
            plan.items.retain(|item| !cached.contains(&item.wire_name()));
        }
        Ok(())
    }

    /// Ask the peer to sign eligible object-store destination URLs
    ///
    /// URLs outside the permitted destination prefix, or containing an
    /// upward traversal, are never offered. An empty response slot
    /// abandons that item.
    async fn negotiate_signing<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        plan: &mut TransferPlan,
    ) -> Result<()> {
        let Some(prefix) = self.job.output_destination().map(str::to_string) else {
            return Ok(());
        };
        let eligible: Vec<String> = plan
            .items
            .iter()
            .filter(|item| item.dest_scheme() == "s3")
            .filter(|item| item.dest_url.starts_with(&prefix))
            .filter(|item| !url_has_traversal(&item.dest_url))
            .map(|item| item.dest_url.clone())
            .collect();
        if eligible.is_empty() {
            return Ok(());
        }

        let record = AttrRecord::new()
            .with_int(ATTR_SUBCOMMAND, TransferSubCommand::SignUrls.code())
            .with_list(ATTR_SIGN_URLS, eligible.clone());
        framer.send_command(TransferCommand::Other).await?;
        framer.send_filename("").await?;
        framer.send_record(&record).await?;

        let response = framer.recv_record().await?;
        let signed = response.require_list(ATTR_SIGNED_URLS)?.to_vec();
        if signed.len() != eligible.len() {
            return Err(Error::protocol(format!(
                "sign response answered {} of {} URLs",
                signed.len(),
                eligible.len()
            )));
        }

        let mut abandoned = 0usize;
        plan.items.retain_mut(|item| {
            let Some(idx) = eligible.iter().position(|url| *url == item.dest_url) else {
                return true;
            };
            if signed[idx].is_empty() {
                abandoned += 1;
                false
            } else {
                item.dest_url = signed[idx].clone();
                true
            }
        });
        if abandoned > 0 {
            warn!("{abandoned} destination URL(s) abandoned: peer declined to sign");
        }
        Ok(())
    }

    async fn send_credential<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        item: &TransferItem,
    ) -> Result<()> {
        if !self.config.delegation.enabled {
            // Delegation disabled: the credential file travels as plain
            // bytes instead of a refreshable delegation.
            return self.send_framed_file(framer, item).await;
        }
        let data = match tokio::fs::read(&item.src_name).await {
            Ok(data) => data,
            Err(e) => {
                self.record_error(Error::ReadFailed {
                    path: Path::new(&item.src_name).to_path_buf(),
                    message: e.to_string(),
                });
                return Ok(());
            }
        };
        framer.send_command(TransferCommand::DelegateCredential).await?;
        framer.send_filename(&item.wire_name()).await?;
        framer
            .send_credential(&data, self.config.delegation.lifetime_secs)
            .await?;
        self.files += 1;
        debug!("delegated credential {}", item.wire_name());
        Ok(())
    }

    async fn send_mkdir<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        item: &TransferItem,
    ) -> Result<()> {
        framer.send_command(TransferCommand::Mkdir).await?;
        framer.send_filename(&item.wire_name()).await?;
        framer.send_mkdir(item.file_mode.unwrap_or(0)).await?;
        Ok(())
    }

    async fn send_url<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        item: &TransferItem,
    ) -> Result<()> {
        if !self.config.transfers.enable_url_transfers {
            self.record_error(Error::config(format!(
                "URL transfers are disabled; cannot fetch {}",
                item.src_name
            )));
            return Ok(());
        }
        // URLs may embed credentials; an object-store-aware peer expects
        // them encrypted.
        if self.peer.s3_urls {
            framer.channel_mut().set_encryption(Some(true));
        }
        framer.send_command(TransferCommand::DownloadUrl).await?;
        framer
            .send_filename(crate::paths::url_basename(&item.src_name))
            .await?;
        framer.channel_mut().send_str(&item.src_name).await?;
        framer.channel_mut().end_of_message().await?;
        framer.channel_mut().set_encryption(None);
        self.files += 1;
        Ok(())
    }

    async fn send_framed_file<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        item: &TransferItem,
    ) -> Result<()> {
        let wire_name = item.wire_name();
        let mut file = match tokio::fs::File::open(&item.src_name).await {
            Ok(file) => file,
            Err(e) => {
                self.record_error(Error::ReadFailed {
                    path: Path::new(&item.src_name).to_path_buf(),
                    message: e.to_string(),
                });
                return Ok(());
            }
        };

        let command = if self.job.encrypt_files().iter().any(|n| *n == wire_name) {
            TransferCommand::EnableEncryption
        } else if self.job.dont_encrypt_files().iter().any(|n| *n == wire_name) {
            TransferCommand::DisableEncryption
        } else {
            TransferCommand::File
        };
        match command {
            TransferCommand::EnableEncryption => framer.channel_mut().set_encryption(Some(true)),
            TransferCommand::DisableEncryption => framer.channel_mut().set_encryption(Some(false)),
            _ => {}
        }

        framer.send_command(command).await?;
        framer.send_filename(&wire_name).await?;
        let sent = framer
            .send_file(&mut file, item.file_size.max(0) as u64, item.file_mode)
            .await?;
        framer.channel_mut().set_encryption(None);

        self.bytes += sent;
        self.files += 1;
        self.progress(&wire_name);
        Ok(())
    }

    /// Upload one destination URL with a single-shot plugin and report the
    /// outcome in-band
    async fn upload_single<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        plugin: &Path,
        item: &TransferItem,
    ) -> Result<()> {
        let outcome = self
            .invoker
            .invoke_single(plugin, &item.src_name, &item.dest_url)
            .await;
        let stats = match outcome {
            Ok(mut stats) => {
                if stats.file_name.is_empty() {
                    stats.file_name = item.wire_name();
                }
                stats.url = item.dest_url.clone();
                stats
            }
            Err(error) => {
                let stats = FileTransferStats {
                    file_name: item.wire_name(),
                    url: item.dest_url.clone(),
                    protocol: item.dest_scheme().to_string(),
                    bytes: 0,
                    success: false,
                    error: Some(error.to_string()),
                    elapsed: None,
                };
                self.record_error(error);
                stats
            }
        };
        self.report_upload(framer, &stats).await
    }

    /// Flush an accumulated multi-file upload batch
    ///
    /// One plugin invocation moves the whole batch; a per-item result
    /// record then reports each outcome to the peer. Encryption is pinned
    /// for the duration of the flush so every record of the batch sees the
    /// same choice.
    async fn flush_batch<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        batch: &mut Vec<(TransferItem, PluginRequest)>,
        plugin: Option<std::path::PathBuf>,
    ) -> Result<()> {
        let Some(plugin) = plugin else {
            debug_assert!(batch.is_empty());
            return Ok(());
        };
        if batch.is_empty() {
            return Ok(());
        }
        let drained: Vec<(TransferItem, PluginRequest)> = std::mem::take(batch);
        let requests: Vec<PluginRequest> = drained.iter().map(|(_, req)| req.clone()).collect();
        let work_dir = self.job.iwd();

        let pinned = self.peer.s3_urls;
        if pinned {
            framer.channel_mut().set_encryption(Some(true));
        }

        let results = self
            .invoker
            .invoke_multi(&plugin, &requests, true, &work_dir)
            .await;
        match results {
            Ok(results) => {
                for ((item, _), mut stats) in drained.into_iter().zip(results) {
                    if stats.file_name.is_empty() {
                        stats.file_name = item.wire_name();
                    }
                    if !stats.success && self.first_error.is_none() {
                        self.first_error = Some(Error::Plugin {
                            url: stats.url.clone(),
                            message: stats
                                .error
                                .clone()
                                .unwrap_or_else(|| "plugin reported failure".to_string()),
                            retryable: false,
                        });
                    }
                    self.report_upload(framer, &stats).await?;
                }
            }
            Err(error) => {
                for (item, _) in drained {
                    let stats = FileTransferStats {
                        file_name: item.wire_name(),
                        url: item.dest_url.clone(),
                        protocol: item.dest_scheme().to_string(),
                        bytes: 0,
                        success: false,
                        error: Some(error.to_string()),
                        elapsed: None,
                    };
                    self.report_upload(framer, &stats).await?;
                }
                self.record_error(error);
            }
        }

        if pinned {
            framer.channel_mut().set_encryption(None);
        }
        Ok(())
    }

    /// Send a sub-command-7 record describing one completed URL upload
    async fn report_upload<C: WireChannel>(
        &mut self,
        framer: &mut Framer<C>,
        stats: &FileTransferStats,
    ) -> Result<()> {
        let mut record = AttrRecord::new()
            .with_int(ATTR_SUBCOMMAND, TransferSubCommand::UploadUrl.code())
            .with_str(
                stagehand_plugins::invoker::ATTR_TRANSFER_FILE_NAME,
                stats.file_name.clone(),
            )
            .with_str(
                stagehand_plugins::invoker::ATTR_TRANSFER_URL,
                stats.url.clone(),
            )
            .with_bool(
                stagehand_plugins::invoker::ATTR_TRANSFER_SUCCESS,
                stats.success,
            )
            .with_str(
                stagehand_plugins::invoker::ATTR_TRANSFER_PROTOCOL,
                stats.protocol.clone(),
            )
            .with_int(
                stagehand_plugins::invoker::ATTR_TRANSFER_TOTAL_BYTES,
                stats.bytes as i64,
            );
        if let Some(error) = &stats.error {
            record = record.with_str(
                stagehand_plugins::invoker::ATTR_TRANSFER_ERROR,
                error.clone(),
            );
        }

        framer.send_command(TransferCommand::Other).await?;
        framer.send_filename(&stats.file_name).await?;
        framer.send_record(&record).await?;

        self.bytes += stats.bytes;
        if stats.success {
            self.files += 1;
        }
        self.stats.push(stats.clone());
        self.progress(&stats.file_name);
        Ok(())
    }

    fn record_error(&mut self, error: Error) {
        warn!("upload item failed: {error}");
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

    /// Merge the peer's ack with the locally recorded first failure
    fn reconcile(&mut self, peer_ack: TransferAck) -> TransferSummary {
        if let Some(error) = self.first_error.take() {
            return TransferSummary::failure(FailureInfo::from_error(
                &error,
                TransferDirection::Upload,
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

/// Accounting user for a slot request: the configured site expression
/// wins over the job's own choice
pub(crate) fn queue_user(config: &Config, job: &JobRecord) -> String {
    if config.queue.user_expr.is_empty() {
        job.queue_user()
    } else {
        config.queue.user_expr.clone()
    }
}

/// Verify a staged executable against its declared checksum
///
/// Used by callers that stage the executable out-of-band and want the
/// declared digest honoured end-to-end.
pub async fn verify_executable(path: &Path, kind: ChecksumKind, digest: &str) -> Result<bool> {
    Ok(file_digest(kind, path).await? == digest.to_ascii_lowercase())
}
