//! Worker side of the shardlink process pair.
//!
//! This crate provides:
//! - Resumable WebSocket sessions with replay of frames sent while disconnected
//! - A typed dispatch table for coordinator requests and events
//! - The shard admission queue and its notifications
//! - Deferred guild subscriptions retried until their shard is ready

pub mod admission;
pub mod error;
pub mod handlers;
pub mod methods;
pub mod server;
pub mod session;
pub mod subscriptions;
pub mod upstream;
pub mod worker;

pub use admission::{AdmissionScheduler, RunOutcome, ShardHandle, ShardState};
pub use error::{AdmissionError, WorkerError};
pub use methods::{DispatchTable, RequestContext};
pub use server::{HealthStatus, SocketServer, WorkerState};
pub use session::{Session, SessionPhase, SessionRegistry};
pub use subscriptions::{SubscribeOutcome, SubscriptionRetry};
pub use upstream::Upstream;
pub use worker::{Worker, WorkerBuilder};

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
