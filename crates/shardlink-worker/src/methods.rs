//! Socket request dispatch table.

use crate::error::WorkerError;
use crate::session::Session;
use crate::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use shardlink_bus::Reply;
use shardlink_core::error::PayloadError;
use shardlink_core::types::{ErrorResponse, Payload, NO_RESPONSE};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Future returned by a socket handler.
pub type MethodFuture = BoxFuture<'static, Result<Option<Reply>>>;

type BoxedMethod = Arc<dyn Fn(&str, Value, RequestContext) -> MethodFuture + Send + Sync>;

/// Where a request came from.
///
/// A request is answered at most once: either the handler calls
/// [`respond`](Self::respond) itself, or the connection answers with the
/// handler's return value.
#[derive(Clone)]
pub struct RequestContext {
    /// Session the request arrived on.
    pub session: Arc<Session>,

    /// `responseId` of the request, [`NO_RESPONSE`] for fire-and-forget.
    pub response_id: i64,

    responded: Arc<AtomicBool>,
}

impl RequestContext {
    pub fn new(session: Arc<Session>, response_id: i64) -> Self {
        Self {
            session,
            response_id,
            responded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the sender waits for a response.
    pub fn expects_response(&self) -> bool {
        self.response_id != NO_RESPONSE
    }

    /// Whether a response has already been sent.
    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Send a successful response now. Returns `false` when nothing was sent
    /// because the request is fire-and-forget or was already answered.
    pub fn respond<P: Payload>(&self, payload: &P) -> Result<bool> {
        if !self.claim() {
            return Ok(false);
        }
        self.session.send_response(
            P::TYPE,
            serde_json::to_value(payload)?,
            self.response_id,
            true,
        )?;
        Ok(true)
    }

    /// Send a failed response carrying `error`.
    pub fn respond_error(&self, error: &str) -> Result<bool> {
        if !self.claim() {
            return Ok(false);
        }
        self.session.send_response(
            ErrorResponse::TYPE,
            serde_json::to_value(ErrorResponse::new(error))?,
            self.response_id,
            false,
        )?;
        Ok(true)
    }

    /// Take the right to answer this request.
    pub(crate) fn claim(&self) -> bool {
        self.expects_response() && !self.responded.swap(true, Ordering::AcqRel)
    }
}

/// Handlers for inbound socket requests and events, keyed by payload type tag.
#[derive(Default)]
pub struct DispatchTable {
    methods: HashMap<&'static str, BoxedMethod>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for payload `P`. A later registration for the same tag replaces it.
    pub fn register<P, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        P: Payload,
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Reply>>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedMethod = Arc::new(move |type_name: &str, value: Value, ctx: RequestContext| {
            match P::from_value(type_name, value) {
                Ok(payload) => handler(payload, ctx).boxed(),
                Err(e) => async move { Err(WorkerError::Payload(e)) }.boxed(),
            }
        });
        self.methods.insert(P::TYPE, boxed);
        self
    }

    /// Whether a handler exists for `type_name`.
    pub fn contains(&self, type_name: &str) -> bool {
        self.methods.contains_key(type_name)
    }

    /// Registered type tags, sorted.
    pub fn list(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.methods.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Decode and run the handler for `type_name`.
    ///
    /// The returned future owns everything it needs, so callers can spawn it.
    pub fn call(&self, type_name: &str, payload: Value, ctx: RequestContext) -> MethodFuture {
        match self.methods.get(type_name) {
            Some(method) => {
                debug!(payload_type = type_name, "Dispatching socket message");
                method(type_name, payload, ctx)
            }
            None => {
                let err = PayloadError::UnknownType(type_name.to_string());
                async move { Err(WorkerError::Payload(err)) }.boxed()
            }
        }
    }
}
