//! Admission queue handlers.

use super::HandlerContext;
use crate::admission::{AdmissionScheduler, RunOutcome};
use crate::error::WorkerError;
use crate::methods::DispatchTable;
use crate::Result;
use shardlink_bus::{BusError, HandlerRegistry, Reply};
use shardlink_core::types::{RunSessionRequest, RunSessionResponse, SyncQueueRequest, SyncQueueResponse};
use tracing::debug;

/// Run a queued shard and describe the outcome.
pub async fn run_session(scheduler: &AdmissionScheduler, request: RunSessionRequest) -> Result<RunSessionResponse> {
    let outcome = scheduler.run_request(request.shard_id).await;
    debug!(shard_id = %request.shard_id, ?outcome, "Run session");

    if outcome == RunOutcome::NotQueued {
        return Err(WorkerError::NotQueued(request.shard_id));
    }
    Ok(RunSessionResponse {
        shard_id: request.shard_id,
        started: outcome.started(),
        reason: outcome.reason(),
    })
}

/// Announce the queue again.
pub fn sync_queue(scheduler: &AdmissionScheduler) -> SyncQueueResponse {
    SyncQueueResponse {
        queued: scheduler.sync_queue(),
    }
}

pub(super) fn register_socket(table: &mut DispatchTable, ctx: &HandlerContext) {
    let scheduler = ctx.scheduler.clone();
    table.register(move |request: RunSessionRequest, _ctx| {
        let scheduler = scheduler.clone();
        async move {
            let response = run_session(&scheduler, request).await?;
            Ok(Some(Reply::new(&response)?))
        }
    });

    let scheduler = ctx.scheduler.clone();
    table.register(move |_: SyncQueueRequest, _ctx| {
        let scheduler = scheduler.clone();
        async move { Ok(Some(Reply::new(&sync_queue(&scheduler))?)) }
    });
}

pub(super) fn register_bus(registry: &mut HandlerRegistry, ctx: &HandlerContext) {
    let scheduler = ctx.scheduler.clone();
    registry.register(move |request: RunSessionRequest| {
        let scheduler = scheduler.clone();
        async move {
            let response = run_session(&scheduler, request)
                .await
                .map_err(|e| BusError::Handler(e.to_string()))?;
            Ok(Some(Reply::new(&response)?))
        }
    });

    let scheduler = ctx.scheduler.clone();
    registry.register(move |_: SyncQueueRequest| {
        let scheduler = scheduler.clone();
        async move { Ok(Some(Reply::new(&sync_queue(&scheduler))?)) }
    });
}
