//! Worker assembly: sessions, admission, subscriptions, socket server, and bus.

use crate::admission::AdmissionScheduler;
use crate::handlers::{self, HandlerContext};
use crate::methods::DispatchTable;
use crate::server::{SocketServer, WorkerState};
use crate::session::SessionRegistry;
use crate::subscriptions::SubscriptionRetry;
use crate::upstream::Upstream;
use crate::Result;
use shardlink_bus::rpc::RpcOptions;
use shardlink_bus::{BusPublisher, BusRpc, HandlerRegistry, Topology};
use shardlink_core::Config;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

/// Collects handlers before the worker starts.
///
/// The built-in handlers are registered up front; registering another handler
/// for the same payload type replaces the built-in one.
pub struct WorkerBuilder {
    config: Config,
    routing_key: String,
    sessions: Arc<SessionRegistry>,
    scheduler: Arc<AdmissionScheduler>,
    retry: Arc<SubscriptionRetry>,
    socket_handlers: DispatchTable,
    bus_handlers: HandlerRegistry,
}

impl WorkerBuilder {
    pub fn new(config: Config, upstream: Arc<dyn Upstream>) -> Self {
        let routing_key = config.resolve_routing_key();
        let sessions = Arc::new(SessionRegistry::new(
            routing_key.clone(),
            config.server.password.clone(),
            config.sessions.clone(),
        ));
        let scheduler = Arc::new(AdmissionScheduler::new(sessions.clone()));
        let retry = Arc::new(SubscriptionRetry::new(
            upstream,
            sessions.clone(),
            &config.subscriptions,
        ));

        let ctx = HandlerContext {
            scheduler: scheduler.clone(),
            retry: retry.clone(),
        };
        let mut socket_handlers = DispatchTable::new();
        handlers::register_socket(&mut socket_handlers, &ctx);
        let mut bus_handlers = HandlerRegistry::new();
        handlers::register_bus(&mut bus_handlers, &ctx);

        Self {
            config,
            routing_key,
            sessions,
            scheduler,
            retry,
            socket_handlers,
            bus_handlers,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn scheduler(&self) -> &Arc<AdmissionScheduler> {
        &self.scheduler
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRetry> {
        &self.retry
    }

    /// Handlers for socket requests and events.
    pub fn socket_handlers(&mut self) -> &mut DispatchTable {
        &mut self.socket_handlers
    }

    /// Handlers for bus requests.
    pub fn bus_handlers(&mut self) -> &mut HandlerRegistry {
        &mut self.bus_handlers
    }

    /// Connect the bus, start background tasks, and bind the socket server.
    pub async fn start(self) -> Result<Worker> {
        let mut tasks = Vec::new();

        let rpc = if self.config.bus.enabled {
            let broker = shardlink_bus::connect(&self.config.bus.url).await?;
            let (publisher, publisher_task) =
                BusPublisher::spawn(broker.clone(), self.config.bus.backpressure);
            tasks.push(publisher_task);

            let rpc = BusRpc::new(
                broker,
                publisher,
                Topology::new(self.routing_key.clone()),
                self.bus_handlers,
                RpcOptions {
                    max_concurrency: self.config.bus.max_concurrency,
                    request_timeout: Duration::from_secs(self.config.bus.request_timeout_secs),
                },
            );
            tasks.extend(rpc.start().await?);
            Some(rpc)
        } else {
            info!("Bus disabled");
            None
        };

        tasks.push(self.retry.spawn());

        let state = Arc::new(WorkerState {
            sessions: self.sessions.clone(),
            scheduler: self.scheduler.clone(),
            methods: Arc::new(self.socket_handlers),
        });
        let server = SocketServer::new(self.config.server.clone(), state);
        let listener = server.bind().await?;
        let local_addr = listener.local_addr()?;

        info!(
            routing_key = %self.routing_key,
            addr = %local_addr,
            bus = rpc.is_some(),
            "Worker started"
        );

        Ok(Worker {
            routing_key: self.routing_key,
            sessions: self.sessions,
            scheduler: self.scheduler,
            retry: self.retry,
            rpc,
            server,
            listener,
            local_addr,
            tasks,
        })
    }
}

/// A started worker.
pub struct Worker {
    routing_key: String,
    sessions: Arc<SessionRegistry>,
    scheduler: Arc<AdmissionScheduler>,
    retry: Arc<SubscriptionRetry>,
    rpc: Option<Arc<BusRpc>>,
    server: SocketServer,
    listener: TcpListener,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Worker {
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Address the socket server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn scheduler(&self) -> &Arc<AdmissionScheduler> {
        &self.scheduler
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRetry> {
        &self.retry
    }

    /// Bus endpoint, when the bus is enabled.
    pub fn rpc(&self) -> Option<&Arc<BusRpc>> {
        self.rpc.as_ref()
    }

    /// Serve until `shutdown` resolves, then close every session.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let served = self.server.serve(self.listener, shutdown).await;

        self.sessions.close_all();
        for task in &self.tasks {
            task.abort();
        }
        info!(routing_key = %self.routing_key, "Worker stopped");
        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Detached;
    use shardlink_core::types::{ShardId, SyncQueueRequest, SyncQueueResponse};
    use shardlink_core::SecretString;

    fn config() -> Config {
        let mut config = Config::default();
        config.server.port = 0;
        config.server.password = SecretString::new("pw");
        config.worker.routing_key = Some("w-test".into());
        config
    }

    #[tokio::test]
    async fn test_builder_registers_builtins() {
        let mut builder = WorkerBuilder::new(config(), Arc::new(Detached::new(1)));
        assert_eq!(builder.routing_key(), "w-test");
        assert_eq!(
            builder.socket_handlers().list(),
            vec!["RunSessionRequest", "SubscribeGuildRequest", "SyncQueueRequest"]
        );
        assert_eq!(
            builder.bus_handlers().types(),
            vec!["RunSessionRequest", "SyncQueueRequest"]
        );
    }

    #[tokio::test]
    async fn test_start_with_memory_bus_answers_sync_queue() {
        let builder = WorkerBuilder::new(config(), Arc::new(Detached::new(1)));
        let worker = builder.start().await.unwrap();
        assert_ne!(worker.local_addr().port(), 0);

        let rpc = worker.rpc().unwrap().clone();
        let response: SyncQueueResponse = rpc.request("w-test", &SyncQueueRequest {}).await.unwrap();
        assert!(response.queued.is_empty());
        assert!(!worker.scheduler().contains(ShardId(0)));

        worker.run(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_without_bus() {
        let mut config = config();
        config.bus.enabled = false;
        let worker = WorkerBuilder::new(config, Arc::new(Detached::new(1)))
            .start()
            .await
            .unwrap();
        assert!(worker.rpc().is_none());
    }
}
