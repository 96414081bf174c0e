//! Shard connection admission.
//!
//! Shards waiting for a gateway connection are queued here. Every change to
//! the queue is announced to all sessions with an [`AddSessionEvent`] or a
//! [`RemoveSessionEvent`], and the coordinator answers by sending
//! `RunSessionRequest` for the shard it admits next.

use crate::error::AdmissionError;
use crate::session::SessionRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use shardlink_core::types::{AddSessionEvent, QueueEvent, RemoveSessionEvent, ShardId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connection state reported by an upstream shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShardState {
    Disconnected,
    Connecting,
    /// Socket open, identify not acknowledged yet.
    AwaitingLogin,
    Ready,
    /// The upstream library already scheduled its own reconnect.
    ReconnectQueued,
    /// Gave up; a new enqueue replaces the entry.
    Failed,
}

impl ShardState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// Handle to one upstream shard connection.
#[async_trait]
pub trait ShardHandle: Send + Sync {
    fn shard_id(&self) -> ShardId;

    fn total_shards(&self) -> u32;

    fn state(&self) -> ShardState;

    /// Ask the upstream library to start connecting. Must not block.
    fn request_connect(&self);

    /// Connect now and wait for the attempt to finish.
    async fn connect(&self) -> Result<(), AdmissionError>;
}

/// Outcome of [`AdmissionScheduler::run_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Started,
    NotQueued,
    /// The shard is mid-login and stays queued.
    Refused,
    AlreadyRunning,
    ConnectFailed(String),
}

impl RunOutcome {
    pub fn started(&self) -> bool {
        matches!(self, Self::Started)
    }

    /// Human-readable reason for anything but `Started`.
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Started => None,
            Self::NotQueued => Some("shard is not queued".to_string()),
            Self::Refused => Some("shard is awaiting login".to_string()),
            Self::AlreadyRunning => Some("shard is already connecting".to_string()),
            Self::ConnectFailed(e) => Some(e.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Queued,
    Running,
}

struct Entry {
    handle: Arc<dyn ShardHandle>,
    state: EntryState,
}

/// Queue of shards awaiting admission.
pub struct AdmissionScheduler {
    routing_key: String,
    sessions: Arc<SessionRegistry>,
    queue: Mutex<BTreeMap<ShardId, Entry>>,
}

impl AdmissionScheduler {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            routing_key: sessions.routing_key().to_string(),
            sessions,
            queue: Mutex::new(BTreeMap::new()),
        }
    }

    /// Queue a shard and ask it to connect.
    ///
    /// Returns `false` when a live entry for the shard already exists.
    pub fn enqueue(&self, handle: Arc<dyn ShardHandle>) -> bool {
        let shard_id = handle.shard_id();
        {
            let mut queue = self.queue.lock();
            if let Some(existing) = queue.get(&shard_id) {
                if !existing.handle.state().is_terminal() {
                    debug!(shard_id = %shard_id, "Shard already queued");
                    return false;
                }
            }

            queue.insert(
                shard_id,
                Entry {
                    handle: handle.clone(),
                    state: EntryState::Queued,
                },
            );
            self.announce(&self.added(handle.as_ref()));
        }

        info!(shard_id = %shard_id, "Shard queued");
        handle.request_connect();
        true
    }

    /// Remove a shard from the queue unless its own reconnect is pending.
    pub fn dequeue(&self, shard_id: ShardId) -> bool {
        let mut queue = self.queue.lock();
        let reconnecting = match queue.get(&shard_id) {
            Some(entry) => entry.handle.state() == ShardState::ReconnectQueued,
            None => return false,
        };
        if reconnecting {
            debug!(shard_id = %shard_id, "Shard reconnecting, keeping it queued");
            return false;
        }

        queue.remove(&shard_id);
        self.announce(&self.removed(shard_id));
        info!(shard_id = %shard_id, "Shard dequeued");
        true
    }

    /// Connect a queued shard on the coordinator's behalf.
    pub async fn run_request(&self, shard_id: ShardId) -> RunOutcome {
        let handle = {
            let mut queue = self.queue.lock();
            let Some(entry) = queue.get_mut(&shard_id) else {
                self.announce(&self.removed(shard_id));
                return RunOutcome::NotQueued;
            };

            if entry.state == EntryState::Running {
                return RunOutcome::AlreadyRunning;
            }

            if entry.handle.state() == ShardState::AwaitingLogin {
                let added = self.added(entry.handle.as_ref());
                self.announce(&self.removed(shard_id));
                self.announce(&added);
                debug!(shard_id = %shard_id, "Shard awaiting login, run refused");
                return RunOutcome::Refused;
            }

            entry.state = EntryState::Running;
            entry.handle.clone()
        };

        match handle.connect().await {
            Ok(()) => {
                if !self.dequeue(shard_id) {
                    // Its own reconnect keeps the entry; the coordinator may run it again.
                    self.requeue(shard_id);
                }
                RunOutcome::Started
            }
            Err(AdmissionError::Closed) => {
                warn!(shard_id = %shard_id, "Shard closed while connecting, dropping it");
                let mut queue = self.queue.lock();
                if queue.remove(&shard_id).is_some() {
                    self.announce(&self.removed(shard_id));
                }
                RunOutcome::ConnectFailed(AdmissionError::Closed.to_string())
            }
            Err(e) => {
                warn!(shard_id = %shard_id, "Shard connect failed: {}", e);
                self.requeue(shard_id);
                RunOutcome::ConnectFailed(e.to_string())
            }
        }
    }

    fn requeue(&self, shard_id: ShardId) {
        if let Some(entry) = self.queue.lock().get_mut(&shard_id) {
            entry.state = EntryState::Queued;
        }
    }

    /// Announce every queued shard again, in ascending order.
    pub fn sync_queue(&self) -> Vec<ShardId> {
        let queue = self.queue.lock();
        let mut announced = Vec::new();
        for (shard_id, entry) in queue.iter() {
            if entry.state == EntryState::Queued {
                self.announce(&self.added(entry.handle.as_ref()));
                announced.push(*shard_id);
            }
        }
        debug!(count = announced.len(), "Queue synced");
        announced
    }

    /// Whether `shard_id` has an entry.
    pub fn contains(&self, shard_id: ShardId) -> bool {
        self.queue.lock().contains_key(&shard_id)
    }

    /// Number of entries, queued or running.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn added(&self, handle: &dyn ShardHandle) -> QueueEvent {
        QueueEvent::Added(AddSessionEvent {
            shard_id: handle.shard_id(),
            total_shards: handle.total_shards(),
            routing_key: self.routing_key.clone(),
        })
    }

    fn removed(&self, shard_id: ShardId) -> QueueEvent {
        QueueEvent::Removed(RemoveSessionEvent {
            shard_id,
            routing_key: self.routing_key.clone(),
        })
    }

    // Called with the queue lock held so sessions observe changes in order.
    fn announce(&self, event: &QueueEvent) {
        let sent = match event {
            QueueEvent::Added(payload) => self.sessions.broadcast(payload),
            QueueEvent::Removed(payload) => self.sessions.broadcast(payload),
        };
        if let Err(e) = sent {
            warn!(
                shard_id = %event.shard_id(),
                "Failed to announce {}: {}",
                event.type_name(),
                e
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::{Connection, FrameReceiver};
    use shardlink_core::config::SessionsConfig;
    use shardlink_core::types::Envelope;
    use shardlink_core::SecretString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct FakeShard {
        pub id: ShardId,
        pub total: u32,
        pub state: Mutex<ShardState>,
        pub connect_error: Mutex<Option<AdmissionError>>,
        pub after_connect: Mutex<ShardState>,
        pub connect_requests: AtomicUsize,
        pub connects: AtomicUsize,
    }

    impl FakeShard {
        pub(crate) fn new(id: u32, total: u32) -> Arc<Self> {
            Arc::new(Self {
                id: ShardId(id),
                total,
                state: Mutex::new(ShardState::Disconnected),
                connect_error: Mutex::new(None),
                after_connect: Mutex::new(ShardState::Ready),
                connect_requests: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
            })
        }

        pub(crate) fn set_state(&self, state: ShardState) {
            *self.state.lock() = state;
        }
    }

    #[async_trait]
    impl ShardHandle for FakeShard {
        fn shard_id(&self) -> ShardId {
            self.id
        }

        fn total_shards(&self) -> u32 {
            self.total
        }

        fn state(&self) -> ShardState {
            *self.state.lock()
        }

        fn request_connect(&self) {
            self.connect_requests.fetch_add(1, Ordering::SeqCst);
        }

        async fn connect(&self) -> Result<(), AdmissionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.connect_error.lock().clone() {
                return Err(e);
            }
            let next = *self.after_connect.lock();
            self.set_state(next);
            Ok(())
        }
    }

    fn setup() -> (AdmissionScheduler, Connection) {
        let sessions = Arc::new(SessionRegistry::new(
            "w-1",
            SecretString::new("pw"),
            SessionsConfig::default(),
        ));
        let mut connection = sessions.handshake(None, None).unwrap();
        connection.outbound.try_recv().unwrap();
        (AdmissionScheduler::new(sessions), connection)
    }

    fn events(rx: &mut FrameReceiver) -> Vec<(String, u32)> {
        let mut seen = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let envelope: Envelope = serde_json::from_str(&frame).unwrap();
            let shard = envelope.payload["shardId"].as_u64().unwrap() as u32;
            seen.push((envelope.payload_type, shard));
        }
        seen
    }

    #[test]
    fn test_enqueue_announces_once() {
        let (scheduler, mut connection) = setup();
        let shard = FakeShard::new(3, 10);

        assert!(scheduler.enqueue(shard.clone()));
        assert!(!scheduler.enqueue(shard.clone()));

        assert_eq!(scheduler.len(), 1);
        assert_eq!(shard.connect_requests.load(Ordering::SeqCst), 1);
        assert_eq!(
            events(&mut connection.outbound),
            vec![("AddSessionEvent".to_string(), 3)]
        );
    }

    #[test]
    fn test_enqueue_replaces_failed_entry() {
        let (scheduler, mut connection) = setup();
        let failed = FakeShard::new(3, 10);
        scheduler.enqueue(failed.clone());
        failed.set_state(ShardState::Failed);

        let retry = FakeShard::new(3, 10);
        assert!(scheduler.enqueue(retry.clone()));
        assert_eq!(retry.connect_requests.load(Ordering::SeqCst), 1);
        assert_eq!(events(&mut connection.outbound).len(), 2);
    }

    #[tokio::test]
    async fn test_run_request_starts_and_dequeues() {
        let (scheduler, mut connection) = setup();
        let shard = FakeShard::new(3, 10);
        scheduler.enqueue(shard.clone());

        let outcome = scheduler.run_request(ShardId(3)).await;
        assert_eq!(outcome, RunOutcome::Started);
        assert!(outcome.reason().is_none());
        assert!(!scheduler.contains(ShardId(3)));
        assert_eq!(shard.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            events(&mut connection.outbound),
            vec![
                ("AddSessionEvent".to_string(), 3),
                ("RemoveSessionEvent".to_string(), 3)
            ]
        );
    }

    #[tokio::test]
    async fn test_run_request_not_queued() {
        let (scheduler, mut connection) = setup();
        assert_eq!(scheduler.run_request(ShardId(7)).await, RunOutcome::NotQueued);
        assert_eq!(
            events(&mut connection.outbound),
            vec![("RemoveSessionEvent".to_string(), 7)]
        );
    }

    #[tokio::test]
    async fn test_run_request_refused_while_awaiting_login() {
        let (scheduler, mut connection) = setup();
        let shard = FakeShard::new(2, 4);
        scheduler.enqueue(shard.clone());
        shard.set_state(ShardState::AwaitingLogin);
        events(&mut connection.outbound);

        assert_eq!(scheduler.run_request(ShardId(2)).await, RunOutcome::Refused);
        assert!(scheduler.contains(ShardId(2)));
        assert_eq!(shard.connects.load(Ordering::SeqCst), 0);
        assert_eq!(
            events(&mut connection.outbound),
            vec![
                ("RemoveSessionEvent".to_string(), 2),
                ("AddSessionEvent".to_string(), 2)
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_requeues() {
        let (scheduler, _connection) = setup();
        let shard = FakeShard::new(1, 2);
        *shard.connect_error.lock() = Some(AdmissionError::Connect("gateway closed".into()));
        scheduler.enqueue(shard.clone());

        let outcome = scheduler.run_request(ShardId(1)).await;
        assert!(matches!(outcome, RunOutcome::ConnectFailed(ref e) if e.contains("gateway closed")));
        assert!(scheduler.contains(ShardId(1)));
        assert_eq!(scheduler.sync_queue(), vec![ShardId(1)]);
    }

    #[tokio::test]
    async fn test_started_shard_with_pending_reconnect_can_run_again() {
        let (scheduler, mut connection) = setup();
        let shard = FakeShard::new(3, 10);
        *shard.after_connect.lock() = ShardState::ReconnectQueued;
        scheduler.enqueue(shard.clone());
        events(&mut connection.outbound);

        assert_eq!(scheduler.run_request(ShardId(3)).await, RunOutcome::Started);
        assert!(scheduler.contains(ShardId(3)));
        assert_eq!(scheduler.sync_queue(), vec![ShardId(3)]);

        shard.set_state(ShardState::Connecting);
        *shard.after_connect.lock() = ShardState::Ready;
        assert_eq!(scheduler.run_request(ShardId(3)).await, RunOutcome::Started);
        assert_eq!(shard.connects.load(Ordering::SeqCst), 2);
        assert!(!scheduler.contains(ShardId(3)));
    }

    #[tokio::test]
    async fn test_closed_shard_leaves_queue() {
        let (scheduler, mut connection) = setup();
        let shard = FakeShard::new(4, 10);
        *shard.connect_error.lock() = Some(AdmissionError::Closed);
        scheduler.enqueue(shard.clone());
        events(&mut connection.outbound);

        let outcome = scheduler.run_request(ShardId(4)).await;
        assert_eq!(outcome, RunOutcome::ConnectFailed("shard closed".to_string()));
        assert!(!scheduler.contains(ShardId(4)));
        assert_eq!(
            events(&mut connection.outbound),
            vec![("RemoveSessionEvent".to_string(), 4)]
        );
    }

    #[test]
    fn test_dequeue_skips_reconnecting_shard() {
        let (scheduler, _connection) = setup();
        let shard = FakeShard::new(5, 8);
        scheduler.enqueue(shard.clone());
        shard.set_state(ShardState::ReconnectQueued);

        assert!(!scheduler.dequeue(ShardId(5)));
        assert!(scheduler.contains(ShardId(5)));

        shard.set_state(ShardState::Connecting);
        assert!(scheduler.dequeue(ShardId(5)));
        assert!(!scheduler.dequeue(ShardId(5)));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_sync_queue_is_ascending() {
        let (scheduler, mut connection) = setup();
        for id in [7, 2, 5] {
            scheduler.enqueue(FakeShard::new(id, 8));
        }
        events(&mut connection.outbound);

        assert_eq!(
            scheduler.sync_queue(),
            vec![ShardId(2), ShardId(5), ShardId(7)]
        );
        let shards: Vec<u32> = events(&mut connection.outbound)
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        assert_eq!(shards, vec![2, 5, 7]);
    }
}
