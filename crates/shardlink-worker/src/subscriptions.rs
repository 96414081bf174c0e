//! Guild subscriptions that wait for their shard.
//!
//! A subscribe request for a guild whose shard is still connecting is parked
//! in a retry table keyed by (guild, session, shard). A periodic sweep replays
//! parked entries once the shard is ready and drops the ones whose session is
//! gone.

use crate::error::WorkerError;
use crate::session::{Session, SessionPhase, SessionRegistry};
use crate::upstream::Upstream;
use crate::Result;
use dashmap::DashMap;
use shardlink_core::config::SubscriptionsConfig;
use shardlink_core::types::{GuildId, SessionId, ShardId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetryKey {
    pub guild_id: GuildId,
    pub session_id: SessionId,
    pub shard_id: ShardId,
}

/// Result of [`SubscriptionRetry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// Parked until the shard is ready.
    Deferred,
}

/// What a sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub subscribed: usize,
    pub retained: usize,
    pub dropped: usize,
    pub evicted: usize,
    pub failed: usize,
}

/// Deferred guild subscriptions.
pub struct SubscriptionRetry {
    upstream: Arc<dyn Upstream>,
    sessions: Arc<SessionRegistry>,
    pending: DashMap<RetryKey, u32>,
    interval: Duration,
    max_attempts: Option<u32>,
}

impl SubscriptionRetry {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        sessions: Arc<SessionRegistry>,
        config: &SubscriptionsConfig,
    ) -> Self {
        Self {
            upstream,
            sessions,
            pending: DashMap::new(),
            interval: Duration::from_secs(config.retry_interval_secs.max(1)),
            max_attempts: config.max_attempts,
        }
    }

    /// Subscribe `session` to `guild_id` now, or park it until its shard is ready.
    pub async fn subscribe(&self, session: &Arc<Session>, guild_id: GuildId) -> Result<SubscribeOutcome> {
        let shard_id = self.upstream.shard_for_guild(guild_id);

        if self.upstream.is_ready(shard_id) {
            match self.upstream.subscribe(session, guild_id).await {
                Ok(()) => {
                    debug!(guild_id = %guild_id, session_id = %session.id(), "Guild subscribed");
                    return Ok(SubscribeOutcome::Subscribed);
                }
                Err(WorkerError::UpstreamNotReady(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let key = RetryKey {
            guild_id,
            session_id: session.id().clone(),
            shard_id,
        };
        self.pending.entry(key).or_insert(0);
        debug!(
            guild_id = %guild_id,
            shard_id = %shard_id,
            session_id = %session.id(),
            "Shard not ready, subscription deferred"
        );
        Ok(SubscribeOutcome::Deferred)
    }

    /// Entries waiting for a shard.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Retry every parked subscription once.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let keys: Vec<RetryKey> = self.pending.iter().map(|e| e.key().clone()).collect();

        for key in keys {
            let session = self
                .sessions
                .get(&key.session_id)
                .filter(|s| s.phase() != SessionPhase::Closed);
            let Some(session) = session else {
                if self.pending.remove(&key).is_some() {
                    let err = WorkerError::State(key.session_id.to_string());
                    warn!(guild_id = %key.guild_id, "Dropping deferred subscription: {}", err);
                    report.dropped += 1;
                }
                continue;
            };

            if !self.upstream.is_ready(key.shard_id) {
                if self.bump(&key) {
                    report.retained += 1;
                } else {
                    report.evicted += 1;
                }
                continue;
            }

            // Claim the entry so a concurrent sweep cannot replay it too.
            let Some((_, attempts)) = self.pending.remove(&key) else {
                continue;
            };

            match self.upstream.subscribe(&session, key.guild_id).await {
                Ok(()) => {
                    debug!(guild_id = %key.guild_id, session_id = %key.session_id, "Deferred subscription applied");
                    report.subscribed += 1;
                }
                Err(e) => {
                    warn!(guild_id = %key.guild_id, "Deferred subscription failed: {}", e);
                    report.failed += 1;
                    self.pending.insert(key.clone(), attempts);
                    if !self.bump(&key) {
                        report.evicted += 1;
                    }
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                subscribed = report.subscribed,
                retained = report.retained,
                dropped = report.dropped,
                evicted = report.evicted,
                "Subscription sweep"
            );
        }
        report
    }

    /// Count one more wait for `key`. Returns `false` when the entry was evicted.
    fn bump(&self, key: &RetryKey) -> bool {
        let attempts = match self.pending.get_mut(key) {
            Some(mut attempts) => {
                *attempts += 1;
                *attempts
            }
            None => return false,
        };

        match self.max_attempts {
            Some(max) if attempts >= max => {
                self.pending.remove(key);
                warn!(
                    guild_id = %key.guild_id,
                    shard_id = %key.shard_id,
                    attempts,
                    "Deferred subscription evicted"
                );
                false
            }
            _ => true,
        }
    }

    /// Run [`sweep`](Self::sweep) on the configured interval.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let retry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retry.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                retry.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use shardlink_core::config::SessionsConfig;
    use shardlink_core::SecretString;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeUpstream {
        ready: Mutex<HashSet<ShardId>>,
        subscribed: Mutex<Vec<(SessionId, GuildId)>>,
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        fn total_shards(&self) -> u32 {
            2
        }

        fn is_ready(&self, shard_id: ShardId) -> bool {
            self.ready.lock().contains(&shard_id)
        }

        async fn subscribe(&self, session: &Arc<Session>, guild_id: GuildId) -> Result<()> {
            self.subscribed.lock().push((session.id().clone(), guild_id));
            Ok(())
        }
    }

    // Shard 0 of 2.
    const GUILD: GuildId = GuildId(0);

    fn setup(max_attempts: Option<u32>) -> (Arc<FakeUpstream>, Arc<SessionRegistry>, Arc<SubscriptionRetry>) {
        let upstream = Arc::new(FakeUpstream::default());
        let sessions = Arc::new(SessionRegistry::new(
            "w-1",
            SecretString::new("pw"),
            SessionsConfig::default(),
        ));
        let retry = Arc::new(SubscriptionRetry::new(
            upstream.clone(),
            sessions.clone(),
            &SubscriptionsConfig {
                retry_interval_secs: 10,
                max_attempts,
            },
        ));
        (upstream, sessions, retry)
    }

    #[tokio::test]
    async fn test_ready_shard_subscribes_immediately() {
        let (upstream, sessions, retry) = setup(None);
        upstream.ready.lock().insert(ShardId(0));
        let connection = sessions.handshake(None, None).unwrap();

        let outcome = retry.subscribe(&connection.session, GUILD).await.unwrap();
        assert_eq!(outcome, SubscribeOutcome::Subscribed);
        assert_eq!(retry.pending(), 0);
        assert_eq!(upstream.subscribed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_deferred_subscription_applied_exactly_once() {
        let (upstream, sessions, retry) = setup(None);
        let connection = sessions.handshake(None, None).unwrap();

        for _ in 0..2 {
            let outcome = retry.subscribe(&connection.session, GUILD).await.unwrap();
            assert_eq!(outcome, SubscribeOutcome::Deferred);
        }
        assert_eq!(retry.pending(), 1);

        let report = retry.sweep().await;
        assert_eq!(report.retained, 1);
        assert!(upstream.subscribed.lock().is_empty());

        upstream.ready.lock().insert(ShardId(0));
        assert_eq!(retry.sweep().await.subscribed, 1);
        assert_eq!(retry.sweep().await, SweepReport::default());

        let subscribed = upstream.subscribed.lock();
        assert_eq!(subscribed.as_slice(), &[(connection.session.id().clone(), GUILD)]);
    }

    #[tokio::test]
    async fn test_sweep_drops_entries_for_gone_sessions() {
        let (upstream, sessions, retry) = setup(None);
        let connection = sessions.handshake(None, None).unwrap();
        retry.subscribe(&connection.session, GUILD).await.unwrap();

        sessions.disconnect(&connection.session, connection.generation);
        upstream.ready.lock().insert(ShardId(0));

        let report = retry.sweep().await;
        assert_eq!(report.dropped, 1);
        assert_eq!(retry.pending(), 0);
        assert!(upstream.subscribed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_max_attempts_evicts() {
        let (_upstream, sessions, retry) = setup(Some(2));
        let connection = sessions.handshake(None, None).unwrap();
        retry.subscribe(&connection.session, GUILD).await.unwrap();

        assert_eq!(retry.sweep().await.retained, 1);
        assert_eq!(retry.sweep().await.evicted, 1);
        assert_eq!(retry.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep() {
        let (upstream, sessions, retry) = setup(None);
        let connection = sessions.handshake(None, None).unwrap();
        retry.subscribe(&connection.session, GUILD).await.unwrap();
        let task = retry.spawn();

        upstream.ready.lock().insert(ShardId(0));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(retry.pending(), 0);
        assert_eq!(upstream.subscribed.lock().len(), 1);
        task.abort();
    }
}
