//! Resumable socket sessions.
//!
//! A [`Session`] outlives the transport connection it was created on. When the
//! connection drops and the coordinator declared a resume key, the session is
//! paused: outbound frames are buffered and an expiry timer starts. A new
//! connection presenting the same key claims the session, receives the
//! handshake acknowledgement, and then the buffered frames in their original
//! order.

use crate::error::WorkerError;
use crate::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use shardlink_core::config::{BufferOverflow, SessionsConfig};
use shardlink_core::types::{Envelope, InitialHandshake, Operation, Payload, SessionId};
use shardlink_core::SecretString;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A serialized envelope ready for the wire.
pub type Frame = String;

/// Sending half feeding a connection's writer task.
pub type FrameSender = mpsc::UnboundedSender<Frame>;

/// Receiving half drained by a connection's writer task.
pub type FrameReceiver = mpsc::UnboundedReceiver<Frame>;

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Active,
    Paused,
    Closed,
}

/// What happened to a frame handed to [`Session::send_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the connection writer.
    Delivered,
    /// Held for replay after resume.
    Buffered,
    /// Discarded because the session is closed.
    Dropped,
}

/// Result of a connection going away.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Detached {
    /// The connection was already superseded; nothing changed.
    Stale,
    /// No resume key: the session is gone.
    Closed,
    /// Waiting for a resume under `key`.
    Paused { key: String, timeout: Duration },
}

/// Frames a closing connection never wrote to its socket.
#[derive(Default)]
pub struct Unsent {
    /// Frame whose write failed.
    pub failed: Option<Frame>,
    /// The connection's outbound queue, drained under the session lock.
    pub outbound: Option<FrameReceiver>,
}

struct SessionState {
    phase: SessionPhase,
    resume_key: Option<String>,
    resume_timeout: Duration,
    buffer: VecDeque<Frame>,
    sink: Option<FrameSender>,
    /// Handshake ack of the current connection; never replayed.
    ack: Option<Frame>,
    connection: u64,
    expiry: Option<AbortHandle>,
}

/// A resumable logical connection to one coordinator client.
pub struct Session {
    id: SessionId,
    routing_key: String,
    client_name: Option<String>,
    created_at: DateTime<Utc>,
    buffer_limit: Option<usize>,
    overflow: BufferOverflow,
    closed: CancellationToken,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(routing_key: &str, client_name: Option<String>, config: &SessionsConfig) -> Self {
        Self {
            id: SessionId::generate(),
            routing_key: routing_key.to_string(),
            client_name,
            created_at: Utc::now(),
            buffer_limit: config.max_buffered_frames,
            overflow: config.overflow,
            closed: CancellationToken::new(),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Active,
                resume_key: None,
                resume_timeout: Duration::from_secs(config.resume_timeout_secs),
                buffer: VecDeque::new(),
                sink: None,
                ack: None,
                connection: 0,
                expiry: None,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn resume_key(&self) -> Option<String> {
        self.state.lock().resume_key.clone()
    }

    pub fn resume_timeout(&self) -> Duration {
        self.state.lock().resume_timeout
    }

    /// Frames waiting for a resume.
    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Token cancelled when the session closes for good.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Send an event built from a typed payload.
    pub fn send_event<P: Payload>(&self, payload: &P) -> Result<SendOutcome> {
        let envelope = Envelope::event(self.routing_key.as_str(), payload)?;
        self.send_envelope(&envelope)
    }

    /// Send an event from a type tag and a raw body.
    pub fn send_raw_event(&self, payload_type: &str, payload: Value) -> Result<SendOutcome> {
        let envelope = Envelope::new(
            Operation::Event,
            self.routing_key.as_str(),
            payload_type,
            payload,
        );
        self.send_envelope(&envelope)
    }

    /// Send a response to the request carrying `response_id`.
    pub fn send_response(
        &self,
        payload_type: &str,
        payload: Value,
        response_id: i64,
        successful: bool,
    ) -> Result<SendOutcome> {
        let envelope = Envelope::response(
            self.routing_key.as_str(),
            payload_type,
            payload,
            response_id,
            successful,
        );
        self.send_envelope(&envelope)
    }

    /// Serialize and send an envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<SendOutcome> {
        let frame = serde_json::to_string(envelope)?;
        Ok(self.send_frame(frame))
    }

    /// Deliver, buffer, or drop an already serialized frame depending on the phase.
    pub fn send_frame(&self, frame: Frame) -> SendOutcome {
        let mut state = self.state.lock();
        match state.phase {
            SessionPhase::Active => {
                let frame = match &state.sink {
                    Some(sink) => match sink.send(frame) {
                        Ok(()) => return SendOutcome::Delivered,
                        Err(mpsc::error::SendError(frame)) => frame,
                    },
                    None => {
                        debug!(session_id = %self.id, "No connection, dropping frame");
                        return SendOutcome::Dropped;
                    }
                };
                // Writer already gone; keep the frame for a resume.
                self.buffer_frame(&mut state, frame)
            }
            SessionPhase::Paused => self.buffer_frame(&mut state, frame),
            SessionPhase::Closed => {
                debug!(session_id = %self.id, "Session closed, dropping frame");
                SendOutcome::Dropped
            }
        }
    }

    fn buffer_frame(&self, state: &mut SessionState, frame: Frame) -> SendOutcome {
        if let Some(limit) = self.buffer_limit {
            if state.buffer.len() >= limit {
                match self.overflow {
                    BufferOverflow::DropOldest => {
                        state.buffer.pop_front();
                        debug!(session_id = %self.id, limit, "Replay buffer full, dropped oldest frame");
                    }
                    BufferOverflow::Expire => {
                        warn!(session_id = %self.id, limit, "Replay buffer full, expiring session");
                        state.phase = SessionPhase::Closed;
                        state.sink = None;
                        state.buffer.clear();
                        // The expiry task watches this token and unregisters the session.
                        self.closed.cancel();
                        return SendOutcome::Dropped;
                    }
                }
            }
        }
        state.buffer.push_back(frame);
        SendOutcome::Buffered
    }

    /// Apply a `configureResuming` declaration. An empty key disables resuming.
    pub fn configure_resuming(&self, key: Option<String>, timeout: Duration) {
        let key = key.filter(|k| !k.is_empty());
        let mut state = self.state.lock();
        debug!(
            session_id = %self.id,
            resumable = key.is_some(),
            timeout_secs = timeout.as_secs(),
            "Resume configured"
        );
        state.resume_key = key;
        state.resume_timeout = timeout;
    }

    fn initial_frame(&self, resumed: bool) -> Result<Frame> {
        let ack = InitialHandshake {
            session_id: self.id.clone(),
            routing_key: self.routing_key.clone(),
            resumed,
        };
        let envelope = Envelope::new(
            Operation::Initial,
            self.routing_key.as_str(),
            InitialHandshake::TYPE,
            serde_json::to_value(&ack)?,
        );
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Bind the first connection. Returns the connection generation.
    fn attach(&self, sink: FrameSender) -> Result<u64> {
        let ack = self.initial_frame(false)?;
        let mut state = self.state.lock();
        let _ = sink.send(ack.clone());
        state.ack = Some(ack);
        state.sink = Some(sink);
        state.connection += 1;
        Ok(state.connection)
    }

    /// Bind a new connection to a paused session and replay its buffer.
    ///
    /// Returns `None` when the session is no longer paused.
    fn resume(&self, sink: FrameSender) -> Result<Option<u64>> {
        let ack = self.initial_frame(true)?;
        let mut state = self.state.lock();
        if state.phase != SessionPhase::Paused {
            return Ok(None);
        }

        if let Some(expiry) = state.expiry.take() {
            expiry.abort();
        }

        // Ack first, then the backlog, all before any concurrent send can get in.
        let _ = sink.send(ack.clone());
        state.ack = Some(ack);
        let replayed = state.buffer.len();
        for frame in state.buffer.drain(..) {
            let _ = sink.send(frame);
        }

        state.phase = SessionPhase::Active;
        state.sink = Some(sink);
        state.connection += 1;
        debug!(session_id = %self.id, replayed, "Replayed buffered frames");
        Ok(Some(state.connection))
    }

    /// Detach connection `connection` from this session.
    ///
    /// Frames the connection never wrote go back to the front of the replay
    /// buffer, ahead of anything buffered since.
    fn detach(&self, connection: u64, unsent: Unsent) -> Detached {
        let mut state = self.state.lock();
        if state.connection != connection || state.phase != SessionPhase::Active {
            return Detached::Stale;
        }

        state.sink = None;
        let mut recovered: Vec<Frame> = unsent.failed.into_iter().collect();
        if let Some(mut outbound) = unsent.outbound {
            while let Ok(frame) = outbound.try_recv() {
                recovered.push(frame);
            }
        }
        let ack = state.ack.take();
        for frame in recovered.into_iter().rev() {
            if Some(&frame) != ack.as_ref() {
                state.buffer.push_front(frame);
            }
        }

        if let Some(limit) = self.buffer_limit {
            if state.buffer.len() > limit {
                match self.overflow {
                    BufferOverflow::DropOldest => {
                        let excess = state.buffer.len() - limit;
                        state.buffer.drain(..excess);
                        debug!(session_id = %self.id, excess, "Replay buffer full, dropped oldest frames");
                    }
                    BufferOverflow::Expire => {
                        warn!(session_id = %self.id, limit, "Replay buffer full, expiring session");
                        state.phase = SessionPhase::Closed;
                        state.buffer.clear();
                        return Detached::Closed;
                    }
                }
            }
        }

        match state.resume_key.clone() {
            Some(key) => {
                state.phase = SessionPhase::Paused;
                Detached::Paused {
                    key,
                    timeout: state.resume_timeout,
                }
            }
            None => {
                state.phase = SessionPhase::Closed;
                state.buffer.clear();
                Detached::Closed
            }
        }
    }

    fn set_expiry(&self, handle: AbortHandle) {
        let mut state = self.state.lock();
        if let Some(previous) = state.expiry.replace(handle) {
            previous.abort();
        }
    }

    /// Close the session for good.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.phase = SessionPhase::Closed;
        state.sink = None;
        state.buffer.clear();
        if let Some(expiry) = state.expiry.take() {
            expiry.abort();
        }
        drop(state);
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_name", &self.client_name)
            .field("phase", &self.phase())
            .finish()
    }
}

/// A connection bound to a session by the handshake.
pub struct Connection {
    pub session: Arc<Session>,
    pub resumed: bool,
    pub generation: u64,
    pub outbound: FrameReceiver,
}

/// Registry of live and paused sessions.
pub struct SessionRegistry {
    routing_key: String,
    password: SecretString,
    config: SessionsConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    paused: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new(routing_key: impl Into<String>, password: SecretString, config: SessionsConfig) -> Self {
        Self {
            routing_key: routing_key.into(),
            password,
            config,
            sessions: DashMap::new(),
            paused: DashMap::new(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Check the `Authorization` header value (raw secret or `Bearer <secret>`).
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<()> {
        let presented = authorization
            .map(|value| value.strip_prefix("Bearer ").unwrap_or(value))
            .ok_or_else(|| WorkerError::Auth("missing Authorization header".to_string()))?;

        if self.password.matches(presented) {
            Ok(())
        } else {
            Err(WorkerError::Auth("invalid credential".to_string()))
        }
    }

    /// Resume the paused session holding `resume_key`, or create a new one.
    pub fn handshake(&self, resume_key: Option<&str>, client_name: Option<&str>) -> Result<Connection> {
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(key) = resume_key.filter(|k| !k.is_empty()) {
            match self.paused.remove(key) {
                Some((_, session)) => {
                    if let Some(generation) = session.resume(tx.clone())? {
                        info!(session_id = %session.id(), "Session resumed");
                        return Ok(Connection {
                            session,
                            resumed: true,
                            generation,
                            outbound: rx,
                        });
                    }
                    debug!(session_id = %session.id(), "Claimed session already closed");
                }
                None => debug!(resume_key = key, "No paused session for resume key"),
            }
        }

        let session = Arc::new(Session::new(
            &self.routing_key,
            client_name.map(str::to_string),
            &self.config,
        ));
        let generation = session.attach(tx)?;
        self.sessions.insert(session.id().clone(), session.clone());
        info!(
            session_id = %session.id(),
            client = client_name.unwrap_or("unknown"),
            "Session created"
        );

        Ok(Connection {
            session,
            resumed: false,
            generation,
            outbound: rx,
        })
    }

    /// Handle the end of connection `generation` of `session`.
    pub fn disconnect(self: &Arc<Self>, session: &Arc<Session>, generation: u64) {
        self.disconnect_with(session, generation, Unsent::default());
    }

    /// Like [`disconnect`](Self::disconnect), keeping the frames the connection
    /// never wrote for the next resume.
    pub fn disconnect_with(self: &Arc<Self>, session: &Arc<Session>, generation: u64, unsent: Unsent) {
        match session.detach(generation, unsent) {
            Detached::Stale => {
                if session.phase() == SessionPhase::Closed {
                    self.sessions
                        .remove_if(session.id(), |_, s| Arc::ptr_eq(s, session));
                }
                debug!(session_id = %session.id(), generation, "Stale connection closed");
            }
            Detached::Closed => {
                self.sessions
                    .remove_if(session.id(), |_, s| Arc::ptr_eq(s, session));
                session.close();
                info!(session_id = %session.id(), "Session closed");
            }
            Detached::Paused { key, timeout } => {
                // Visible to resumes before the expiry timer exists.
                if let Some(older) = self.paused.insert(key.clone(), session.clone()) {
                    if !Arc::ptr_eq(&older, session) {
                        warn!(
                            session_id = %older.id(),
                            replaced_by = %session.id(),
                            "Resume key reused, closing older paused session"
                        );
                        older.close();
                        self.sessions
                            .remove_if(older.id(), |_, s| Arc::ptr_eq(s, &older));
                    }
                }
                self.schedule_expiry(session, key, timeout);
                info!(
                    session_id = %session.id(),
                    timeout_secs = timeout.as_secs(),
                    "Session paused"
                );
            }
        }
    }

    fn schedule_expiry(self: &Arc<Self>, session: &Arc<Session>, key: String, timeout: Duration) {
        let registry = Arc::downgrade(self);
        let watched = session.clone();
        let closed = session.close_token();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if let Some(registry) = registry.upgrade() {
                        registry.expire(&watched, &key);
                    }
                }
                _ = closed.cancelled() => {
                    if let Some(registry) = registry.upgrade() {
                        registry.forget(&watched, &key);
                    }
                }
            }
        });
        session.set_expiry(task.abort_handle());
    }

    fn expire(&self, session: &Arc<Session>, key: &str) {
        // Loses to a concurrent resume, which removes the key first.
        if self
            .paused
            .remove_if(key, |_, s| Arc::ptr_eq(s, session))
            .is_none()
        {
            return;
        }
        self.sessions
            .remove_if(session.id(), |_, s| Arc::ptr_eq(s, session));
        session.close();
        info!(session_id = %session.id(), "Session expired");
    }

    fn forget(&self, session: &Arc<Session>, key: &str) {
        self.paused.remove_if(key, |_, s| Arc::ptr_eq(s, session));
        self.sessions
            .remove_if(session.id(), |_, s| Arc::ptr_eq(s, session));
        debug!(session_id = %session.id(), "Closed session unregistered");
    }

    /// Get a session by ID.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every registered session, active or paused.
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Send an event to every session; paused sessions buffer it.
    pub fn broadcast<P: Payload>(&self, payload: &P) -> Result<usize> {
        let envelope = Envelope::event(self.routing_key.as_str(), payload)?;
        let frame = serde_json::to_string(&envelope)?;

        let mut reached = 0;
        for session in self.list() {
            if session.send_frame(frame.clone()) != SendOutcome::Dropped {
                reached += 1;
            }
        }
        debug!(payload_type = P::TYPE, reached, "Broadcast");
        Ok(reached)
    }

    /// Registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions waiting for a resume.
    pub fn paused_len(&self) -> usize {
        self.paused.len()
    }

    /// Close every session.
    pub fn close_all(&self) {
        for session in self.list() {
            session.close();
        }
        self.paused.clear();
        self.sessions.clear();
    }
}
