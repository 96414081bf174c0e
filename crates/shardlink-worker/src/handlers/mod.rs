//! Built-in request handlers.
//!
//! The same admission operations are reachable from the socket and from the
//! bus; each transport gets a thin adapter over the shared logic here.

pub mod queue;
pub mod subscribe;

use crate::admission::AdmissionScheduler;
use crate::methods::DispatchTable;
use crate::subscriptions::SubscriptionRetry;
use shardlink_bus::HandlerRegistry;
use std::sync::Arc;

/// State shared by the built-in handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub scheduler: Arc<AdmissionScheduler>,
    pub retry: Arc<SubscriptionRetry>,
}

/// Register the built-in socket handlers.
pub fn register_socket(table: &mut DispatchTable, ctx: &HandlerContext) {
    queue::register_socket(table, ctx);
    subscribe::register_socket(table, ctx);
}

/// Register the built-in bus handlers.
pub fn register_bus(registry: &mut HandlerRegistry, ctx: &HandlerContext) {
    queue::register_bus(registry, ctx);
}
