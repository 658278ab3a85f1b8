//! Session ownership: one task per transfer, typed events to the host
//!
//! The host hands a connected channel and a prepared state machine to the
//! [`SessionManager`], which runs the session as its own task and returns
//! a [`TransferSession`] handle. The session publishes
//! [`TransferEvent::Progress`] updates and exactly one
//! [`TransferEvent::Final`] on its event channel; aborting the task closes
//! the channel, so the host observes an EOF rather than a hang. Session
//! keys are cryptographically random; a collision can only mean a broken
//! RNG and is treated as a fatal programming error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use stagehand_types::{TransferEvent, TransferSummary};
use stagehand_wire::{Framer, WireChannel};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::downloader::Downloader;
use crate::list::TransferPlan;
use crate::uploader::Uploader;

/// Owner of all live transfer sessions, keyed by random transfer key
#[derive(Debug, Default, Clone)]
pub struct SessionManager {
    live: Arc<Mutex<HashMap<Uuid, tokio::task::AbortHandle>>>,
}

impl SessionManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an upload session on its own task
    pub fn start_upload<C>(
        &self,
        uploader: Uploader,
        framer: Framer<C>,
        plan: TransferPlan,
    ) -> TransferSession
    where
        C: WireChannel + 'static,
    {
        self.spawn(|events| {
            let mut uploader = uploader.with_events(events);
            let mut framer = framer;
            tokio::spawn(async move {
                uploader.run(&mut framer, plan).await;
            })
        })
    }

    /// Start a download session on its own task
    pub fn start_download<C>(&self, downloader: Downloader, framer: Framer<C>) -> TransferSession
    where
        C: WireChannel + 'static,
    {
        self.spawn(|events| {
            let mut downloader = downloader.with_events(events);
            let mut framer = framer;
            tokio::spawn(async move {
                downloader.run(&mut framer).await;
            })
        })
    }

    /// Abort a session by key; unknown keys are ignored
    pub fn abort(&self, key: Uuid) {
        if let Some(handle) = self.live.lock().expect("session table poisoned").get(&key) {
            handle.abort();
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.live.lock().expect("session table poisoned").len()
    }

    /// Whether no sessions are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn<F>(&self, start: F) -> TransferSession
    where
        F: FnOnce(mpsc::UnboundedSender<TransferEvent>) -> JoinHandle<()>,
    {
        let key = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = start(events_tx);

        let mut live = self.live.lock().expect("session table poisoned");
        // Keys come from a CSPRNG; a collision means the process cannot be
        // trusted to keep sessions apart.
        assert!(
            live.insert(key, task.abort_handle()).is_none(),
            "transfer key collision"
        );
        drop(live);
        debug!("session {key} started ({} live)", self.len());

        TransferSession {
            key,
            events: events_rx,
            task,
            manager: Arc::clone(&self.live),
        }
    }
}

/// Host-side handle to one running session
pub struct TransferSession {
    key: Uuid,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    task: JoinHandle<()>,
    manager: Arc<Mutex<HashMap<Uuid, tokio::task::AbortHandle>>>,
}

impl TransferSession {
    /// The session's transfer key
    pub fn key(&self) -> Uuid {
        self.key
    }

    /// Next event from the session; `None` once the session is gone
    /// (finished or aborted)
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Wait for the final summary, discarding progress updates
    ///
    /// Returns `None` when the session was aborted before producing one.
    pub async fn wait(mut self) -> Option<TransferSummary> {
        let mut summary = None;
        while let Some(event) = self.events.recv().await {
            if let TransferEvent::Final(final_summary) = event {
                summary = Some(final_summary);
            }
        }
        let _ = (&mut self.task).await;
        summary
    }

    /// Abort the session
    ///
    /// The task is killed at its next suspension point; scoped resources
    /// (queue slot, cache reservation, plugin children, open files) are
    /// released by their guards, and the event channel closes. Aborting
    /// twice is a no-op.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.manager
            .lock()
            .expect("session table poisoned")
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_config::Config;
    use stagehand_plugins::{PluginEnvironment, PluginInvoker, PluginPrivilege, PluginRegistry};
    use stagehand_queue::ImmediateCoordinator;
    use stagehand_types::{JobRecord, PeerCapabilities};
    use stagehand_wire::MemoryChannel;
    use std::time::Duration;

    fn invoker() -> PluginInvoker {
        PluginInvoker::new(
            PluginEnvironment::default(),
            PluginPrivilege::Service,
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_abort_closes_event_channel_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobRecord::new(1, 0, "alice", &dir.path().display().to_string());

        // A downloader with no peer never gets past its first read; the
        // abort must still end the session cleanly.
        let (chan, _held_open) = MemoryChannel::pair();
        let downloader = Downloader::new(
            job,
            Arc::new(Config::default()),
            PeerCapabilities::default(),
            PluginRegistry::default(),
            invoker(),
            Arc::new(ImmediateCoordinator),
            dir.path().join("sandbox"),
            true,
        );

        let manager = SessionManager::new();
        let session = manager.start_download(downloader, Framer::new(chan));
        assert_eq!(manager.len(), 1);

        session.abort();
        session.abort();
        let summary = session.wait().await;
        assert!(summary.is_none());
        assert_eq!(manager.len(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys() {
        let manager = SessionManager::new();
        let dir = tempfile::tempdir().unwrap();
        let mut keys = std::collections::HashSet::new();
        for _ in 0..8 {
            let job = JobRecord::new(1, 0, "alice", &dir.path().display().to_string());
            let (chan, _other) = MemoryChannel::pair();
            let downloader = Downloader::new(
                job,
                Arc::new(Config::default()),
                PeerCapabilities::default(),
                PluginRegistry::default(),
                invoker(),
                Arc::new(ImmediateCoordinator),
                dir.path().join("sandbox"),
                true,
            );
            let session = manager.start_download(downloader, Framer::new(chan));
            assert!(keys.insert(session.key()));
            session.abort();
        }
    }
}
