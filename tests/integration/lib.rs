//! Shared harness for the integration tests: a worker on an ephemeral port
//! and a minimal coordinator-side socket client.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shardlink_core::types::{Envelope, ShardId};
use shardlink_core::{Config, SecretString};
use shardlink_worker::upstream::Detached;
use shardlink_worker::{
    AdmissionError, AdmissionScheduler, SessionRegistry, ShardHandle, ShardState, WorkerBuilder,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const PASSWORD: &str = "youshallnotpass";
pub const ROUTING_KEY: &str = "it-worker";

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A worker running in the background of a test.
pub struct TestWorker {
    pub addr: SocketAddr,
    pub sessions: Arc<SessionRegistry>,
    pub scheduler: Arc<AdmissionScheduler>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TestWorker {
    pub async fn start() -> Self {
        let mut config = Config::default();
        config.server.port = 0;
        config.server.password = SecretString::new(PASSWORD);
        config.worker.routing_key = Some(ROUTING_KEY.to_string());

        let worker = WorkerBuilder::new(config, Arc::new(Detached::new(1)))
            .start()
            .await
            .expect("worker starts");
        let addr = worker.local_addr();
        let sessions = worker.sessions().clone();
        let scheduler = worker.scheduler().clone();

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = worker
                .run(async {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            addr,
            sessions,
            scheduler,
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Open a socket; returns the stream and the `session-resumed` header.
    pub async fn connect(
        &self,
        password: &str,
        resume_key: Option<&str>,
    ) -> Result<(Socket, bool), tungstenite::Error> {
        let mut request = self.url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("authorization", header(password));
        headers.insert("client-name", header("integration"));
        if let Some(key) = resume_key {
            headers.insert("resume-key", header(key));
        }

        let (socket, response) = tokio_tungstenite::connect_async(request).await?;
        let resumed = response
            .headers()
            .get("session-resumed")
            .map(|v| v == "true")
            .unwrap_or(false);
        Ok((socket, resumed))
    }

    /// Poll until `check` holds or a second passes.
    pub async fn wait_for(&self, check: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..100 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

fn header(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).expect("valid header value")
}

/// Next text frame decoded as an envelope.
pub async fn next_envelope(socket: &mut Socket) -> Envelope {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("frame before timeout")
            .expect("socket open")
            .expect("frame ok");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("valid envelope");
        }
    }
}

/// Send an envelope as a text frame.
pub async fn send_json(socket: &mut Socket, value: serde_json::Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

/// Shard handle whose connect succeeds immediately.
pub struct InstantShard {
    id: ShardId,
    total: u32,
    state: AtomicU8,
}

impl InstantShard {
    pub fn new(id: u32, total: u32) -> Arc<Self> {
        Arc::new(Self {
            id: ShardId(id),
            total,
            state: AtomicU8::new(0),
        })
    }
}

#[async_trait]
impl ShardHandle for InstantShard {
    fn shard_id(&self) -> ShardId {
        self.id
    }

    fn total_shards(&self) -> u32 {
        self.total
    }

    fn state(&self) -> ShardState {
        match self.state.load(Ordering::SeqCst) {
            0 => ShardState::Disconnected,
            _ => ShardState::Ready,
        }
    }

    fn request_connect(&self) {}

    async fn connect(&self) -> Result<(), AdmissionError> {
        self.state.store(1, Ordering::SeqCst);
        Ok(())
    }
}
