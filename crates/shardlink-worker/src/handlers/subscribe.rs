//! Guild subscription handler.

use super::HandlerContext;
use crate::methods::DispatchTable;
use crate::subscriptions::SubscribeOutcome;
use shardlink_bus::Reply;
use shardlink_core::types::{SubscribeGuildRequest, SubscribeGuildResponse};

pub(super) fn register_socket(table: &mut DispatchTable, ctx: &HandlerContext) {
    let retry = ctx.retry.clone();
    table.register(move |request: SubscribeGuildRequest, ctx| {
        let retry = retry.clone();
        async move {
            let outcome = retry.subscribe(&ctx.session, request.guild_id).await?;
            let response = SubscribeGuildResponse {
                guild_id: request.guild_id,
                deferred: outcome == SubscribeOutcome::Deferred,
            };
            Ok(Some(Reply::new(&response)?))
        }
    });
}
