//! The upstream gateway library, seen from the worker.

use crate::session::Session;
use crate::Result;
use async_trait::async_trait;
use shardlink_core::types::{GuildId, ShardId};
use std::sync::Arc;

/// Guild event source the worker forwards to sessions.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Total shards this process runs.
    fn total_shards(&self) -> u32;

    /// Whether `shard_id` has finished connecting.
    fn is_ready(&self, shard_id: ShardId) -> bool;

    /// Shard owning `guild_id`.
    fn shard_for_guild(&self, guild_id: GuildId) -> ShardId {
        guild_id.shard(self.total_shards())
    }

    /// Start forwarding `guild_id` events to `session`.
    async fn subscribe(&self, session: &Arc<Session>, guild_id: GuildId) -> Result<()>;
}

/// Upstream with no shards attached. Every subscription stays deferred.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached {
    total_shards: u32,
}

impl Detached {
    pub fn new(total_shards: u32) -> Self {
        Self { total_shards }
    }
}

#[async_trait]
impl Upstream for Detached {
    fn total_shards(&self) -> u32 {
        self.total_shards.max(1)
    }

    fn is_ready(&self, _shard_id: ShardId) -> bool {
        false
    }

    async fn subscribe(&self, _session: &Arc<Session>, guild_id: GuildId) -> Result<()> {
        Err(crate::error::WorkerError::UpstreamNotReady(
            self.shard_for_guild(guild_id),
        ))
    }
}
