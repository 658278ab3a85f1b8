//! Transfer-queue coordinator client
//!
//! Concurrent transfers are gated by an external coordinator. A session
//! asks for a slot (declaring direction, sandbox size, the file it is
//! about to move, and the accounting user), keeps the request alive while
//! pending, and holds the slot for the rest of the session once granted.
//! Release is idempotent and guaranteed: a [`QueueSlot`] that is dropped
//! without an explicit release hands itself to a background task.
//!
//! The coordinator wire protocol hides behind [`QueueCoordinator`] so the
//! engine can be driven against in-process fakes; [`ImmediateCoordinator`]
//! is the degenerate implementation used when admission control is
//! disabled.

#![deny(missing_docs)]
#![warn(clippy::all)]

use std::time::Duration;

use async_trait::async_trait;
use stagehand_types::{Error, Result, TransferDirection};
use tracing::{debug, warn};

/// A slot request as presented to the coordinator
#[derive(Debug, Clone)]
pub struct SlotRequest {
    /// Which way the requesting session moves bytes
    pub direction: TransferDirection,
    /// Estimated sandbox size in bytes, for coordinator scheduling
    pub sandbox_bytes: u64,
    /// Full name of the file about to move, for observability
    pub file_name: String,
    /// Job identifier, `<cluster>.<proc>`
    pub job_id: String,
    /// Accounting user evaluated from the job
    pub queue_user: String,
    /// Interval at which the requester promises keep-alives, seconds
    pub keep_alive_secs: u64,
}

/// Coordinator's answer to a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    /// Still queued; the coordinator may adjust the keep-alive deadline
    Pending {
        /// Replacement keep-alive timeout, when the coordinator wants one
        new_timeout: Option<Duration>,
    },
    /// Granted for the rest of the session
    Granted,
    /// Refused; the session fails with a queue hold
    Refused {
        /// Whether the request may be retried later
        retryable: bool,
        /// Coordinator-supplied reason
        reason: String,
    },
}

/// One slot acquisition in progress on the coordinator
#[async_trait]
pub trait SlotSession: Send {
    /// Wait for the next status change, up to the keep-alive interval
    async fn poll(&mut self) -> Result<SlotStatus>;

    /// Refresh the coordinator's deadline for this request
    async fn keep_alive(&mut self) -> Result<()>;

    /// Give the slot back; must be safe to call more than once
    async fn release(&mut self) -> Result<()>;
}

/// A coordinator the engine can request slots from
#[async_trait]
pub trait QueueCoordinator: Send + Sync {
    /// Submit a slot request, returning the in-progress acquisition
    async fn begin(&self, request: SlotRequest) -> Result<Box<dyn SlotSession>>;
}

/// Degenerate coordinator granting every request immediately
///
/// Used when no coordinator contact is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateCoordinator;

struct ImmediateSession;

#[async_trait]
impl SlotSession for ImmediateSession {
    async fn poll(&mut self) -> Result<SlotStatus> {
        Ok(SlotStatus::Granted)
    }

    async fn keep_alive(&mut self) -> Result<()> {
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl QueueCoordinator for ImmediateCoordinator {
    async fn begin(&self, _request: SlotRequest) -> Result<Box<dyn SlotSession>> {
        Ok(Box::new(ImmediateSession))
    }
}

/// A granted slot; holds the coordinator session until released
pub struct QueueSlot {
    session: Option<Box<dyn SlotSession>>,
}

impl std::fmt::Debug for QueueSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSlot")
            .field("held", &self.session.is_some())
            .finish()
    }
}

impl QueueSlot {
    /// Refresh the coordinator's deadline for the held slot
    pub async fn keep_alive(&mut self) -> Result<()> {
        match self.session.as_mut() {
            Some(session) => session.keep_alive().await,
            None => Ok(()),
        }
    }

    /// Give the slot back; further calls are no-ops
    pub async fn release(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.release().await?;
            debug!("transfer-queue slot released");
        }
        Ok(())
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        // A dropped-but-unreleased slot still goes back: hand the session
        // to the runtime when one is available, else release synchronously
        // by best effort on the coordinator's own timeout.
        if let Some(mut session) = self.session.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = session.release().await {
                        warn!("failed to release abandoned queue slot: {e}");
                    }
                });
            } else {
                warn!("queue slot dropped outside a runtime; relying on coordinator timeout");
            }
        }
    }
}

/// Client driving slot acquisition against a coordinator
pub struct TransferQueueClient<'a> {
    coordinator: &'a dyn QueueCoordinator,
    acquire_timeout: Duration,
}

impl<'a> TransferQueueClient<'a> {
    /// Create a client with an overall acquisition deadline
    pub fn new(coordinator: &'a dyn QueueCoordinator, acquire_timeout: Duration) -> Self {
        Self {
            coordinator,
            acquire_timeout,
        }
    }

    /// Acquire a slot, polling with keep-alives until granted or refused
    ///
    /// A pending answer may carry an adjusted keep-alive timeout from the
    /// coordinator, which replaces the interval for subsequent polls. The
    /// grant applies for the rest of the session.
    pub async fn acquire(&self, request: SlotRequest) -> Result<QueueSlot> {
        debug!(
            "requesting {} slot for {} ({} bytes, user {})",
            request.direction, request.job_id, request.sandbox_bytes, request.queue_user
        );
        let mut session = self.coordinator.begin(request.clone()).await?;

        let acquire = async {
            loop {
                match session.poll().await? {
                    SlotStatus::Granted => {
                        debug!("slot granted for {}", request.job_id);
                        return Ok(QueueSlot {
                            session: Some(session),
                        });
                    }
                    SlotStatus::Pending { new_timeout } => {
                        if let Some(timeout) = new_timeout {
                            debug!(
                                "coordinator adjusted keep-alive timeout to {}s",
                                timeout.as_secs()
                            );
                        }
                        session.keep_alive().await?;
                    }
                    SlotStatus::Refused { retryable, reason } => {
                        return Err(Error::Queue {
                            message: reason,
                            retryable,
                        });
                    }
                }
            }
        };

        match tokio::time::timeout(self.acquire_timeout, acquire).await {
            Ok(result) => result,
            Err(_) => Err(Error::Queue {
                message: format!(
                    "no slot granted within {}s",
                    self.acquire_timeout.as_secs()
                ),
                retryable: true,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Grants after a fixed number of pending polls, counting releases
    struct CountingCoordinator {
        pending_polls: usize,
        releases: Arc<AtomicUsize>,
    }

    struct CountingSession {
        remaining: usize,
        releases: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SlotSession for CountingSession {
        async fn poll(&mut self) -> Result<SlotStatus> {
            if self.remaining == 0 {
                Ok(SlotStatus::Granted)
            } else {
                self.remaining -= 1;
                Ok(SlotStatus::Pending {
                    new_timeout: Some(Duration::from_secs(120)),
                })
            }
        }

        async fn keep_alive(&mut self) -> Result<()> {
            Ok(())
        }

        async fn release(&mut self) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl QueueCoordinator for CountingCoordinator {
        async fn begin(&self, _request: SlotRequest) -> Result<Box<dyn SlotSession>> {
            Ok(Box::new(CountingSession {
                remaining: self.pending_polls,
                releases: Arc::clone(&self.releases),
            }))
        }
    }

    fn request() -> SlotRequest {
        SlotRequest {
            direction: TransferDirection::Download,
            sandbox_bytes: 11_364,
            file_name: "/sandbox/a.txt".into(),
            job_id: "17.0".into(),
            queue_user: "Owner_alice".into(),
            keep_alive_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_acquire_after_pending() {
        let releases = Arc::new(AtomicUsize::new(0));
        let coordinator = CountingCoordinator {
            pending_polls: 3,
            releases: Arc::clone(&releases),
        };
        let client = TransferQueueClient::new(&coordinator, Duration::from_secs(5));

        let mut slot = client.acquire(request()).await.unwrap();
        slot.release().await.unwrap();
        // Release is idempotent.
        slot.release().await.unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refusal_maps_to_queue_error() {
        struct Refusing;
        struct RefusingSession;

        #[async_trait]
        impl SlotSession for RefusingSession {
            async fn poll(&mut self) -> Result<SlotStatus> {
                Ok(SlotStatus::Refused {
                    retryable: true,
                    reason: "queue full".into(),
                })
            }
            async fn keep_alive(&mut self) -> Result<()> {
                Ok(())
            }
            async fn release(&mut self) -> Result<()> {
                Ok(())
            }
        }

        #[async_trait]
        impl QueueCoordinator for Refusing {
            async fn begin(&self, _request: SlotRequest) -> Result<Box<dyn SlotSession>> {
                Ok(Box::new(RefusingSession))
            }
        }

        let client = TransferQueueClient::new(&Refusing, Duration::from_secs(5));
        let err = client.acquire(request()).await.unwrap_err();
        assert!(matches!(err, Error::Queue { retryable: true, .. }));
    }

    #[tokio::test]
    async fn test_drop_releases_slot() {
        let releases = Arc::new(AtomicUsize::new(0));
        let coordinator = CountingCoordinator {
            pending_polls: 0,
            releases: Arc::clone(&releases),
        };
        let client = TransferQueueClient::new(&coordinator, Duration::from_secs(5));

        let slot = client.acquire(request()).await.unwrap();
        drop(slot);
        // The drop path hands the release to the runtime.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_immediate_coordinator_grants() {
        let client =
            TransferQueueClient::new(&ImmediateCoordinator, Duration::from_secs(1));
        let mut slot = client.acquire(request()).await.unwrap();
        slot.keep_alive().await.unwrap();
        slot.release().await.unwrap();
    }
}
