//! WebSocket server for coordinator sessions.

use crate::admission::AdmissionScheduler;
use crate::error::WorkerError;
use crate::methods::{DispatchTable, MethodFuture, RequestContext};
use crate::session::{Connection, Session, SessionRegistry, Unsent};
use crate::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardlink_core::config::{BindMode, ServerConfig};
use shardlink_core::types::{ConfigureResuming, Envelope, ErrorResponse, Operation, Payload, NO_RESPONSE};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

/// Handshake header carrying the coordinator's resume key.
pub const RESUME_KEY_HEADER: &str = "resume-key";

/// Handshake header naming the coordinator.
pub const CLIENT_NAME_HEADER: &str = "client-name";

/// Response header telling the coordinator whether its session was resumed.
pub const SESSION_RESUMED_HEADER: &str = "session-resumed";

/// How long a closing connection waits for its writer to stop.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by every connection.
pub struct WorkerState {
    pub sessions: Arc<SessionRegistry>,
    pub scheduler: Arc<AdmissionScheduler>,
    pub methods: Arc<DispatchTable>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub sessions: usize,
    pub paused: usize,
    pub queued: usize,
    pub routing_key: String,
}

/// The coordinator-facing socket server.
pub struct SocketServer {
    config: ServerConfig,
    state: Arc<WorkerState>,
}

impl SocketServer {
    pub fn new(config: ServerConfig, state: Arc<WorkerState>) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Address derived from the bind mode and port.
    pub fn bind_address(&self) -> SocketAddr {
        let ip = match self.config.bind {
            BindMode::Loopback => [127, 0, 0, 1],
            BindMode::Lan => [0, 0, 0, 0],
        };
        SocketAddr::from((ip, self.config.port))
    }

    /// Build the Axum router.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.config.path, get(ws_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the listening socket.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.bind_address();
        if self.config.bind != BindMode::Loopback {
            warn!("Socket server binding to {}, reachable from the network", addr);
        }
        Ok(TcpListener::bind(addr).await?)
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!("Socket server listening on {}{}", addr, self.config.path);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| WorkerError::Internal(e.to_string()))?;

        info!("Socket server stopped");
        Ok(())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// WebSocket upgrade handler: authenticate, claim or create the session, upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<WorkerState>>,
) -> Response {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if let Err(e) = state.sessions.authenticate(authorization) {
        warn!("Handshake rejected: {}", e);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let connection = match state.sessions.handshake(
        header(&headers, RESUME_KEY_HEADER),
        header(&headers, CLIENT_NAME_HEADER),
    ) {
        Ok(connection) => connection,
        Err(e) => {
            error!("Handshake failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let Connection {
        session,
        resumed,
        generation,
        outbound,
    } = connection;

    // Whichever callback runs takes the outbound queue, which may already hold replayed frames.
    let upgrade_outbound = Arc::new(Mutex::new(Some(outbound)));
    let failed_outbound = upgrade_outbound.clone();
    let registry = state.sessions.clone();
    let failed_session = session.clone();

    let mut response = ws
        .on_failed_upgrade(move |e| {
            warn!("WebSocket upgrade failed: {}", e);
            let outbound = failed_outbound.lock().take();
            registry.disconnect_with(
                &failed_session,
                generation,
                Unsent {
                    failed: None,
                    outbound,
                },
            );
        })
        .on_upgrade(move |socket| async move {
            let outbound = upgrade_outbound.lock().take();
            if let Some(outbound) = outbound {
                let connection = Connection {
                    session,
                    resumed,
                    generation,
                    outbound,
                };
                handle_socket(socket, state, connection).await;
            }
        });

    response.headers_mut().insert(
        SESSION_RESUMED_HEADER,
        HeaderValue::from_static(if resumed { "true" } else { "false" }),
    );
    response
}

async fn health_handler(State(state): State<Arc<WorkerState>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        sessions: state.sessions.len(),
        paused: state.sessions.paused_len(),
        queued: state.scheduler.len(),
        routing_key: state.sessions.routing_key().to_string(),
    })
}

/// Run one connection: a writer task fed by the session, and the read loop.
#[instrument(
    skip_all,
    fields(session_id = %connection.session.id(), generation = connection.generation)
)]
async fn handle_socket(socket: WebSocket, state: Arc<WorkerState>, connection: Connection) {
    let Connection {
        session,
        resumed,
        generation,
        mut outbound,
    } = connection;
    info!(resumed, "Connection opened");

    let (mut sender, mut receiver) = socket.split();
    let closed = session.close_token();
    let stop = CancellationToken::new();
    let writer_done = CancellationToken::new();

    let writer = {
        let closed = closed.clone();
        let stop = stop.clone();
        let done = writer_done.clone();
        tokio::spawn(async move {
            let failed = loop {
                tokio::select! {
                    frame = outbound.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = sender.send(Message::Text(frame.clone())).await {
                                debug!("Socket send failed: {}", e);
                                break Some(frame);
                            }
                        }
                        None => break None,
                    },
                    _ = closed.cancelled() => {
                        let _ = sender.send(Message::Close(None)).await;
                        break None;
                    }
                    _ = stop.cancelled() => break None,
                }
            };
            done.cancel();
            Unsent {
                failed,
                outbound: Some(outbound),
            }
        })
    };
    let writer_abort = writer.abort_handle();

    loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => handle_message(&text, &state, &session),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => handle_message(text, &state, &session),
                    Err(_) => warn!("{}", WorkerError::Protocol("binary frame is not UTF-8".into())),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket read failed: {}", e);
                    break;
                }
            },
            _ = closed.cancelled() => break,
            _ = writer_done.cancelled() => break,
        }
    }

    // Stop the writer and keep whatever it did not write for the next resume.
    stop.cancel();
    let unsent = match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
        Ok(Ok(unsent)) => unsent,
        Ok(Err(e)) => {
            debug!("Writer task failed: {}", e);
            Unsent::default()
        }
        Err(_) => {
            debug!("Writer did not stop in time");
            writer_abort.abort();
            Unsent::default()
        }
    };
    state.sessions.disconnect_with(&session, generation, unsent);
    info!("Connection closed");
}

/// Route one inbound frame. Protocol violations are logged and the connection stays open.
pub(crate) fn handle_message(text: &str, state: &WorkerState, session: &Arc<Session>) {
    if let Err(e) = route_message(text, state, session) {
        warn!(session_id = %session.id(), "{}", e);
    }
}

fn route_message(text: &str, state: &WorkerState, session: &Arc<Session>) -> Result<()> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| WorkerError::Protocol(format!("malformed envelope: {}", e)))?;

    match envelope.operation {
        Operation::Request => dispatch_request(state, session, envelope),
        Operation::Event => dispatch_event(state, session, envelope),
        Operation::ConfigureResuming => {
            let config: ConfigureResuming = serde_json::from_value(envelope.payload)
                .map_err(|e| WorkerError::Protocol(format!("bad configureResuming payload: {}", e)))?;
            session.configure_resuming(config.key, Duration::from_secs(config.timeout));
        }
        Operation::Initial | Operation::Response => {
            return Err(WorkerError::Protocol(format!(
                "operation {:?} not accepted from clients",
                envelope.operation
            )));
        }
    }
    Ok(())
}

fn dispatch_request(state: &WorkerState, session: &Arc<Session>, envelope: Envelope) {
    let payload_type = envelope.payload_type;
    if !state.methods.contains(&payload_type) {
        warn!(payload_type = %payload_type, "No handler for request, ignoring");
        return;
    }

    let ctx = RequestContext::new(session.clone(), envelope.response_id);
    let future = state.methods.call(&payload_type, envelope.payload, ctx.clone());
    tokio::spawn(answer(ctx, payload_type, future));
}

async fn answer(ctx: RequestContext, payload_type: String, future: MethodFuture) {
    let sent = match future.await {
        Ok(Some(reply)) => {
            if !ctx.claim() {
                if ctx.expects_response() {
                    debug!(payload_type = %payload_type, "Request already answered");
                }
                return;
            }
            ctx.session
                .send_response(&reply.payload_type, reply.body, ctx.response_id, true)
        }
        Ok(None) => return,
        Err(e) => {
            warn!(payload_type = %payload_type, "Request failed: {}", e);
            if !ctx.claim() {
                return;
            }
            serde_json::to_value(ErrorResponse::new(e.to_string()))
                .map_err(WorkerError::from)
                .and_then(|body| {
                    ctx.session
                        .send_response(ErrorResponse::TYPE, body, ctx.response_id, false)
                })
        }
    };

    if let Err(e) = sent {
        warn!(payload_type = %payload_type, "Failed to send response: {}", e);
    }
}

fn dispatch_event(state: &WorkerState, session: &Arc<Session>, envelope: Envelope) {
    let payload_type = envelope.payload_type;
    if !state.methods.contains(&payload_type) {
        debug!(payload_type = %payload_type, "No handler for event, ignoring");
        return;
    }

    let ctx = RequestContext::new(session.clone(), NO_RESPONSE);
    let future = state.methods.call(&payload_type, envelope.payload, ctx);
    tokio::spawn(async move {
        if let Err(e) = future.await {
            warn!(payload_type = %payload_type, "Event handler failed: {}", e);
        }
    });
}
