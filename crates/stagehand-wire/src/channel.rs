//! The byte-channel abstraction under the framer
//!
//! [`WireChannel`] hides whether the duplex underneath is an encrypted
//! socket, a relayed stream, or an in-process pair, so the uploader and
//! downloader state machines can be driven by synthetic transcripts in
//! tests. The channel deals in typed segments (integers, strings, byte
//! blocks) delimited by end-of-message boundaries, with per-message
//! encryption toggling and a credential-delegation primitive.

use async_trait::async_trait;
use stagehand_types::{Error, Result};
use tokio::sync::mpsc;

/// A reliable ordered duplex with end-of-message framing
///
/// Send and receive calls are suspension points; every implementation must
/// fail with [`Error::Network`] when the peer goes away and with
/// [`Error::Protocol`] when the incoming segment has the wrong type.
#[async_trait]
pub trait WireChannel: Send {
    /// Send one integer segment
    async fn send_int(&mut self, value: i64) -> Result<()>;

    /// Receive one integer segment
    async fn recv_int(&mut self) -> Result<i64>;

    /// Send one string segment
    async fn send_str(&mut self, value: &str) -> Result<()>;

    /// Receive one string segment
    async fn recv_str(&mut self) -> Result<String>;

    /// Send one byte-block segment
    async fn send_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Receive one byte-block segment
    async fn recv_bytes(&mut self) -> Result<Vec<u8>>;

    /// Seal the current outgoing message
    async fn end_of_message(&mut self) -> Result<()>;

    /// Consume the peer's message seal; anything else is a hard protocol
    /// error
    async fn expect_end_of_message(&mut self) -> Result<()>;

    /// Delegate a credential to the peer (sent inside the current message)
    async fn delegate_credential(&mut self, data: &[u8], lifetime_secs: u64) -> Result<()>;

    /// Accept a delegated credential from the peer
    async fn accept_credential(&mut self) -> Result<(Vec<u8>, u64)>;

    /// Force encryption on (`Some(true)`), off (`Some(false)`), or back to
    /// the channel default (`None`) for subsequent segments
    fn set_encryption(&mut self, mode: Option<bool>);

    /// Whether segments sent right now would be encrypted
    fn encryption_active(&self) -> bool;

    /// Short peer description for logs
    fn peer_description(&self) -> String;

    /// Transport statistics blob, where the implementation keeps one
    fn tcp_stats(&self) -> Option<String> {
        None
    }
}

/// One typed segment travelling through a [`MemoryChannel`]
#[derive(Debug, Clone)]
enum Segment {
    Int(i64, bool),
    Str(String, bool),
    Bytes(Vec<u8>, bool),
    Cred(Vec<u8>, u64),
    Eom,
}

/// In-process channel pair used by the test suites
///
/// Each data segment records whether it was "encrypted" when sent, and the
/// receiving side keeps a trace of those flags so tests can assert what a
/// batch or a URL command looked like on the wire.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: Option<mpsc::UnboundedSender<Segment>>,
    rx: mpsc::UnboundedReceiver<Segment>,
    default_encrypt: bool,
    crypto_override: Option<bool>,
    crypto_trace: Vec<bool>,
}

impl MemoryChannel {
    /// Create a connected pair with encryption off by default
    pub fn pair() -> (Self, Self) {
        Self::pair_with_default(false)
    }

    /// Create a connected pair with the given channel-default encryption
    pub fn pair_with_default(default_encrypt: bool) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let make = |tx, rx| Self {
            tx: Some(tx),
            rx,
            default_encrypt,
            crypto_override: None,
            crypto_trace: Vec::new(),
        };
        (make(tx_a, rx_b), make(tx_b, rx_a))
    }

    /// Tear the channel down, as a dying peer would
    pub fn sever(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    /// Encryption flags of every data segment received so far, in order
    pub fn crypto_trace(&self) -> &[bool] {
        &self.crypto_trace
    }

    fn push(&mut self, segment: Segment) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| Error::network("channel closed"))?
            .send(segment)
            .map_err(|_| Error::network("peer hung up"))
    }

    async fn pull(&mut self) -> Result<Segment> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::network("peer closed the channel"))
    }
}

#[async_trait]
impl WireChannel for MemoryChannel {
    async fn send_int(&mut self, value: i64) -> Result<()> {
        let enc = self.encryption_active();
        self.push(Segment::Int(value, enc))
    }

    async fn recv_int(&mut self) -> Result<i64> {
        match self.pull().await? {
            Segment::Int(value, enc) => {
                self.crypto_trace.push(enc);
                Ok(value)
            }
            other => Err(Error::protocol(format!("expected integer, got {other:?}"))),
        }
    }

    async fn send_str(&mut self, value: &str) -> Result<()> {
        let enc = self.encryption_active();
        self.push(Segment::Str(value.to_string(), enc))
    }

    async fn recv_str(&mut self) -> Result<String> {
        match self.pull().await? {
            Segment::Str(value, enc) => {
                self.crypto_trace.push(enc);
                Ok(value)
            }
            other => Err(Error::protocol(format!("expected string, got {other:?}"))),
        }
    }

    async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        let enc = self.encryption_active();
        self.push(Segment::Bytes(data.to_vec(), enc))
    }

    async fn recv_bytes(&mut self) -> Result<Vec<u8>> {
        match self.pull().await? {
            Segment::Bytes(data, enc) => {
                self.crypto_trace.push(enc);
                Ok(data)
            }
            other => Err(Error::protocol(format!(
                "expected byte block, got {other:?}"
            ))),
        }
    }

    async fn end_of_message(&mut self) -> Result<()> {
        self.push(Segment::Eom)
    }

    async fn expect_end_of_message(&mut self) -> Result<()> {
        match self.pull().await? {
            Segment::Eom => Ok(()),
            other => Err(Error::protocol(format!(
                "expected end-of-message, got {other:?}"
            ))),
        }
    }

    async fn delegate_credential(&mut self, data: &[u8], lifetime_secs: u64) -> Result<()> {
        self.push(Segment::Cred(data.to_vec(), lifetime_secs))
    }

    async fn accept_credential(&mut self) -> Result<(Vec<u8>, u64)> {
        match self.pull().await? {
            Segment::Cred(data, lifetime) => Ok((data, lifetime)),
            other => Err(Error::protocol(format!(
                "expected delegated credential, got {other:?}"
            ))),
        }
    }

    fn set_encryption(&mut self, mode: Option<bool>) {
        self.crypto_override = mode;
    }

    fn encryption_active(&self) -> bool {
        self.crypto_override.unwrap_or(self.default_encrypt)
    }

    fn peer_description(&self) -> String {
        "<memory>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_typed_segments_round_trip() {
        let (mut a, mut b) = MemoryChannel::pair();

        a.send_int(42).await.unwrap();
        a.send_str("hello").await.unwrap();
        a.send_bytes(b"payload").await.unwrap();
        a.end_of_message().await.unwrap();

        assert_eq!(b.recv_int().await.unwrap(), 42);
        assert_eq!(b.recv_str().await.unwrap(), "hello");
        assert_eq!(b.recv_bytes().await.unwrap(), b"payload");
        b.expect_end_of_message().await.unwrap();
    }

    #[tokio::test]
    async fn test_type_mismatch_is_protocol_error() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.send_str("not an int").await.unwrap();
        let err = b.recv_int().await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_missing_eom_is_protocol_error() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.send_int(1).await.unwrap();
        let err = b.expect_end_of_message().await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_severed_channel_is_network_error() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.sever();
        assert!(matches!(
            b.recv_int().await.unwrap_err(),
            Error::Network { .. }
        ));
        assert!(matches!(
            a.send_int(1).await.unwrap_err(),
            Error::Network { .. }
        ));
    }

    #[tokio::test]
    async fn test_encryption_toggle_recorded() {
        let (mut a, mut b) = MemoryChannel::pair();

        a.send_int(1).await.unwrap();
        a.set_encryption(Some(true));
        a.send_int(2).await.unwrap();
        a.set_encryption(None);
        a.send_int(3).await.unwrap();

        for _ in 0..3 {
            b.recv_int().await.unwrap();
        }
        assert_eq!(b.crypto_trace(), &[false, true, false]);
    }

    #[tokio::test]
    async fn test_credential_delegation() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.delegate_credential(b"proxy bytes", 3600).await.unwrap();
        let (data, lifetime) = b.accept_credential().await.unwrap();
        assert_eq!(data, b"proxy bytes");
        assert_eq!(lifetime, 3600);
    }
}
