//! Frame-level protocol helpers built on a [`WireChannel`]
//!
//! Every exchange of the transfer protocol (command headers, file
//! payloads, mkdir records, the xfer-info preamble, go-ahead messages,
//! and the final ack pair) is framed here so the uploader and downloader
//! state machines never touch raw segments. Numeric command codes stay in
//! [`crate::command`]; attribute names stay in this module.

use stagehand_types::{Error, FailureInfo, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::channel::WireChannel;
use crate::command::TransferCommand;
use crate::record::AttrRecord;

/// Result attribute of go-ahead and ack records
pub const ATTR_RESULT: &str = "Result";
/// Keep-alive timeout adjustment in a go-ahead record, seconds
pub const ATTR_TIMEOUT: &str = "Timeout";
/// Byte limit the peer enforces, in a go-ahead record
pub const ATTR_MAX_TRANSFER_BYTES: &str = "MaxTransferBytes";
/// Estimated sandbox size in the xfer-info preamble
pub const ATTR_SANDBOX_SIZE: &str = "SandboxSize";
/// Sub-command selector inside a structured record
pub const ATTR_SUBCOMMAND: &str = "SubCommand";
/// Retry flag in an ack record
pub const ATTR_TRY_AGAIN: &str = "TryAgain";
/// Hold code in an ack record
pub const ATTR_HOLD_CODE: &str = "HoldCode";
/// Hold subcode in an ack record
pub const ATTR_HOLD_SUBCODE: &str = "HoldSubCode";
/// Hold reason in an ack record
pub const ATTR_HOLD_REASON: &str = "HoldReason";
/// Parallel filename list in a reuse-info record
pub const ATTR_REUSE_NAMES: &str = "FileNames";
/// Parallel checksum list in a reuse-info record
pub const ATTR_REUSE_CHECKSUMS: &str = "Checksums";
/// Parallel checksum-kind list in a reuse-info record
pub const ATTR_REUSE_KINDS: &str = "ChecksumTypes";
/// Principal tag in a reuse-info record
pub const ATTR_REUSE_TAG: &str = "Tag";
/// Parallel size list in a reuse-info record
pub const ATTR_REUSE_SIZES: &str = "Sizes";
/// Files the receiver satisfied from its cache, in a reuse response
pub const ATTR_REUSE_HAVE: &str = "CachedFiles";
/// Parallel URL list in a sign-urls record
pub const ATTR_SIGN_URLS: &str = "SignList";
/// Parallel signed-URL list in a sign-urls response
pub const ATTR_SIGNED_URLS: &str = "SignedUrls";

/// Chunk size for file payloads
const FILE_CHUNK: usize = 64 * 1024;

/// Outcome of a go-ahead exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAhead {
    /// The transfer may not proceed
    Failed,
    /// The next file may proceed
    Once,
    /// The rest of the session may proceed
    Always,
}

impl GoAhead {
    /// Numeric wire value
    pub fn code(&self) -> i64 {
        match self {
            Self::Failed => -1,
            Self::Once => 1,
            Self::Always => 2,
        }
    }

    /// Decode a wire value
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            -1 => Ok(Self::Failed),
            1 => Ok(Self::Once),
            2 => Ok(Self::Always),
            other => Err(Error::protocol(format!("unknown go-ahead value {other}"))),
        }
    }
}

/// A go-ahead message exchanged between peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoAheadInfo {
    /// Grant, scope, or refusal
    pub go_ahead: GoAhead,
    /// Keep-alive timeout adjustment requested by the sender, seconds
    pub timeout_secs: Option<u64>,
    /// Byte limit the sender of this message enforces; negative means none
    pub max_transfer_bytes: i64,
}

impl GoAheadInfo {
    /// A session-wide grant with no byte limit
    pub fn always() -> Self {
        Self {
            go_ahead: GoAhead::Always,
            timeout_secs: None,
            max_transfer_bytes: -1,
        }
    }
}

/// Final ack record summarising one side's view of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferAck {
    /// Whether this side considers the session successful
    pub success: bool,
    /// Failure details when `success` is false
    pub failure: Option<FailureInfo>,
}

impl TransferAck {
    /// A success ack
    pub fn success() -> Self {
        Self {
            success: true,
            failure: None,
        }
    }

    /// A failure ack
    pub fn failure(info: FailureInfo) -> Self {
        Self {
            success: false,
            failure: Some(info),
        }
    }

    fn to_record(&self) -> AttrRecord {
        let mut record = AttrRecord::new().with_int(ATTR_RESULT, i64::from(self.success));
        if let Some(failure) = &self.failure {
            record.insert(ATTR_TRY_AGAIN, crate::record::RecordValue::Bool(failure.try_again));
            record.insert(
                ATTR_HOLD_CODE,
                crate::record::RecordValue::Int(i64::from(failure.hold_code.unwrap_or(0))),
            );
            record.insert(
                ATTR_HOLD_SUBCODE,
                crate::record::RecordValue::Int(failure.hold_subcode),
            );
            record.insert(
                ATTR_HOLD_REASON,
                crate::record::RecordValue::Str(failure.reason.clone()),
            );
        }
        record
    }

    fn from_record(record: &AttrRecord) -> Result<Self> {
        let success = record.require_int(ATTR_RESULT)? != 0;
        if success {
            return Ok(Self::success());
        }
        let hold_code = record.get_int(ATTR_HOLD_CODE).unwrap_or(0);
        Ok(Self::failure(FailureInfo {
            try_again: record.get_bool(ATTR_TRY_AGAIN).unwrap_or(true),
            hold_code: (hold_code != 0).then_some(hold_code as i32),
            hold_subcode: record.get_int(ATTR_HOLD_SUBCODE).unwrap_or(0),
            reason: record.get_str(ATTR_HOLD_REASON).unwrap_or("").to_string(),
        }))
    }
}

/// Frame encoder/decoder owning a channel
#[derive(Debug)]
pub struct Framer<C> {
    chan: C,
}

impl<C: WireChannel> Framer<C> {
    /// Wrap a channel
    pub fn new(chan: C) -> Self {
        Self { chan }
    }

    /// Access the underlying channel
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.chan
    }

    /// Unwrap the underlying channel
    pub fn into_inner(self) -> C {
        self.chan
    }

    /// Send a command header: command code then end-of-message
    pub async fn send_command(&mut self, command: TransferCommand) -> Result<()> {
        self.chan.send_int(command.code()).await?;
        self.chan.end_of_message().await
    }

    /// Receive a command header
    pub async fn recv_command(&mut self) -> Result<TransferCommand> {
        let code = self.chan.recv_int().await?;
        self.chan.expect_end_of_message().await?;
        TransferCommand::from_code(code)
    }

    /// Send the filename part of a transfer header
    pub async fn send_filename(&mut self, name: &str) -> Result<()> {
        self.chan.send_str(name).await?;
        self.chan.end_of_message().await
    }

    /// Receive the filename part of a transfer header
    pub async fn recv_filename(&mut self) -> Result<String> {
        let name = self.chan.recv_str().await?;
        self.chan.expect_end_of_message().await?;
        Ok(name)
    }

    /// Send an attribute record as one message
    pub async fn send_record(&mut self, record: &AttrRecord) -> Result<()> {
        self.chan.send_str(&record.to_string()).await?;
        self.chan.end_of_message().await
    }

    /// Receive an attribute record
    pub async fn recv_record(&mut self) -> Result<AttrRecord> {
        let text = self.chan.recv_str().await?;
        self.chan.expect_end_of_message().await?;
        AttrRecord::parse(&text)
    }

    /// Send a file payload: mode, size, then length-prefixed chunks
    ///
    /// Returns the bytes actually sent.
    pub async fn send_file(
        &mut self,
        file: &mut File,
        size: u64,
        mode: Option<u32>,
    ) -> Result<u64> {
        self.chan
            .send_int(mode.map_or(-1, i64::from))
            .await?;
        self.chan.send_int(size as i64).await?;

        let mut remaining = size;
        let mut buf = vec![0u8; FILE_CHUNK];
        while remaining > 0 {
            let want = remaining.min(FILE_CHUNK as u64) as usize;
            let got = file
                .read(&mut buf[..want])
                .await
                .map_err(|e| Error::io(format!("file read failed: {e}")))?;
            if got == 0 {
                return Err(Error::protocol(format!(
                    "file shrank mid-transfer: {remaining} bytes short"
                )));
            }
            self.chan.send_bytes(&buf[..got]).await?;
            remaining -= got as u64;
        }
        self.chan.end_of_message().await?;
        Ok(size)
    }

    /// Receive a file payload into `file`, or drain it when `file` is
    /// `None` (the null sink used for illegal paths)
    ///
    /// When the declared size exceeds `limit` (non-negative), the payload
    /// is drained to keep the wire in a defined state and a quota error is
    /// returned. Returns (bytes received, sender's mode bits).
    pub async fn recv_file(
        &mut self,
        mut file: Option<&mut File>,
        limit: i64,
    ) -> Result<(u64, Option<u32>)> {
        let mode_raw = self.chan.recv_int().await?;
        let mode = u32::try_from(mode_raw).ok();
        let size = self.chan.recv_int().await?;
        if size < 0 {
            return Err(Error::protocol(format!("negative file size {size}")));
        }

        let over_quota = limit >= 0 && size > limit;
        if over_quota {
            file = None;
        }

        let mut received: u64 = 0;
        let mut write_error: Option<Error> = None;
        while received < size as u64 {
            let chunk = self.chan.recv_bytes().await?;
            received += chunk.len() as u64;
            if received > size as u64 {
                return Err(Error::protocol("file payload overran declared size"));
            }
            if write_error.is_none() {
                if let Some(out) = file.as_deref_mut() {
                    if let Err(e) = out.write_all(&chunk).await {
                        // Keep draining so the sender's stream completes;
                        // the caller surfaces this as a permanent failure.
                        write_error = Some(Error::io(format!("file write failed: {e}")));
                        file = None;
                    }
                }
            }
        }
        self.chan.expect_end_of_message().await?;
        if write_error.is_none() {
            if let Some(out) = file.as_deref_mut() {
                if let Err(e) = out.flush().await {
                    write_error = Some(Error::io(format!("file flush failed: {e}")));
                }
            }
        }

        if over_quota {
            return Err(Error::QuotaExceeded {
                direction: stagehand_types::TransferDirection::Download,
                limit,
                attempted: size,
            });
        }
        if let Some(e) = write_error {
            return Err(e);
        }
        Ok((received, mode))
    }

    /// Send a mkdir record: mode bits only
    pub async fn send_mkdir(&mut self, mode: u32) -> Result<()> {
        self.chan.send_int(i64::from(mode)).await?;
        self.chan.end_of_message().await
    }

    /// Receive a mkdir record
    pub async fn recv_mkdir(&mut self) -> Result<u32> {
        let mode = self.chan.recv_int().await?;
        self.chan.expect_end_of_message().await?;
        u32::try_from(mode).map_err(|_| Error::protocol(format!("bad directory mode {mode}")))
    }

    /// Send the xfer-info preamble
    pub async fn send_xfer_info(&mut self, sandbox_size: u64) -> Result<()> {
        let record = AttrRecord::new().with_int(ATTR_SANDBOX_SIZE, sandbox_size as i64);
        self.send_record(&record).await
    }

    /// Receive the xfer-info preamble
    pub async fn recv_xfer_info(&mut self) -> Result<u64> {
        let record = self.recv_record().await?;
        let size = record.require_int(ATTR_SANDBOX_SIZE)?;
        u64::try_from(size).map_err(|_| Error::protocol(format!("bad sandbox size {size}")))
    }

    /// Send a go-ahead message
    pub async fn send_go_ahead(&mut self, info: &GoAheadInfo) -> Result<()> {
        let mut record = AttrRecord::new().with_int(ATTR_RESULT, info.go_ahead.code());
        if let Some(timeout) = info.timeout_secs {
            record.insert(ATTR_TIMEOUT, crate::record::RecordValue::Int(timeout as i64));
        }
        record.insert(
            ATTR_MAX_TRANSFER_BYTES,
            crate::record::RecordValue::Int(info.max_transfer_bytes),
        );
        self.send_record(&record).await
    }

    /// Receive a go-ahead message
    pub async fn recv_go_ahead(&mut self) -> Result<GoAheadInfo> {
        let record = self.recv_record().await?;
        Ok(GoAheadInfo {
            go_ahead: GoAhead::from_code(record.require_int(ATTR_RESULT)?)?,
            timeout_secs: record
                .get_int(ATTR_TIMEOUT)
                .and_then(|t| u64::try_from(t).ok()),
            max_transfer_bytes: record.get_int(ATTR_MAX_TRANSFER_BYTES).unwrap_or(-1),
        })
    }

    /// Send a final ack
    pub async fn send_ack(&mut self, ack: &TransferAck) -> Result<()> {
        self.send_record(&ack.to_record()).await
    }

    /// Receive the peer's final ack
    pub async fn recv_ack(&mut self) -> Result<TransferAck> {
        let record = self.recv_record().await?;
        TransferAck::from_record(&record)
    }

    /// Send a delegated credential as one message
    pub async fn send_credential(&mut self, data: &[u8], lifetime_secs: u64) -> Result<()> {
        self.chan.delegate_credential(data, lifetime_secs).await?;
        self.chan.end_of_message().await
    }

    /// Receive a delegated credential
    pub async fn recv_credential(&mut self) -> Result<(Vec<u8>, u64)> {
        let cred = self.chan.accept_credential().await?;
        self.chan.expect_end_of_message().await?;
        Ok(cred)
    }
}
