//! Reconnect recovery.
//!
//! After a connection drop, a fixed five-step sequence reconciles local and
//! remote state: enumerate locally known channels, read the last
//! pending-connection timestamp, replay missed events, re-watch the channels
//! currently on screen, and refetch the active channel-list queries. Every
//! step is bounded-retry and best effort: a step that gives up never blocks
//! the ones after it.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cache::{LocalStore, StoreTransaction};
use crate::config::SyncConfig;
use crate::controller::ActiveSet;
use crate::model::{ChannelId, ChannelListQuery, UserId};
use crate::ops::{
    CancellationHandle, OperationExit, OperationSequence, RetryableOperation, StepOutcome,
    SyncStep,
};
use crate::protocol::Pagination;
use crate::remote::RemoteUpdater;
use crate::remote::payload::{ChannelPayload, collect_valid};

const STEP_LOCAL_CHANNELS: &str = "enumerate-local-channels";
const STEP_LAST_SYNC: &str = "read-last-sync-timestamp";
const STEP_MISSED_EVENTS: &str = "fetch-missed-events";
const STEP_REWATCH: &str = "rewatch-active-channels";
const STEP_REFETCH_QUERIES: &str = "refetch-list-queries";

/// Scratch state threaded through the recovery steps. Created per run,
/// discarded at the end, never persisted.
#[derive(Debug)]
pub struct SyncContext {
    pub last_connection_at: Option<OffsetDateTime>,
    pub last_pending_connection_at: Option<OffsetDateTime>,
    pub local_channel_ids: Vec<ChannelId>,
    pub synced_channel_ids: HashSet<ChannelId>,
    pub watched_channel_ids: HashSet<ChannelId>,
}

impl SyncContext {
    fn new(last_connection_at: Option<OffsetDateTime>) -> Self {
        Self {
            last_connection_at,
            last_pending_connection_at: None,
            local_channel_ids: Vec::new(),
            synced_channel_ids: HashSet::new(),
            watched_channel_ids: HashSet::new(),
        }
    }
}

struct EnumerateLocalChannels {
    store: Arc<dyn LocalStore>,
}

#[async_trait]
impl SyncStep<SyncContext> for EnumerateLocalChannels {
    fn name(&self) -> &'static str {
        STEP_LOCAL_CHANNELS
    }

    async fn run(&self, cx: &mut SyncContext) -> StepOutcome {
        cx.local_channel_ids = self.store.channel_ids();
        debug!(count = cx.local_channel_ids.len(), "enumerated local channels");
        StepOutcome::Continue
    }
}

struct ReadLastSyncTimestamp {
    store: Arc<dyn LocalStore>,
    user: UserId,
}

#[async_trait]
impl SyncStep<SyncContext> for ReadLastSyncTimestamp {
    fn name(&self) -> &'static str {
        STEP_LAST_SYNC
    }

    async fn run(&self, cx: &mut SyncContext) -> StepOutcome {
        cx.last_pending_connection_at = self.store.last_sync_at(&self.user);
        StepOutcome::Continue
    }
}

struct FetchMissedEvents {
    remote: Arc<dyn RemoteUpdater>,
}

#[async_trait]
impl SyncStep<SyncContext> for FetchMissedEvents {
    fn name(&self) -> &'static str {
        STEP_MISSED_EVENTS
    }

    async fn run(&self, cx: &mut SyncContext) -> StepOutcome {
        let Some(since) = cx.last_pending_connection_at.or(cx.last_connection_at) else {
            debug!("no known disconnect timestamp; nothing to replay");
            return StepOutcome::Continue;
        };
        if cx.local_channel_ids.is_empty() {
            return StepOutcome::Continue;
        }
        match self
            .remote
            .sync_missed_events(since, &cx.local_channel_ids)
            .await
        {
            Ok(ids) => {
                cx.synced_channel_ids = ids.into_iter().collect();
                StepOutcome::Continue
            }
            Err(err) => {
                warn!(error = %err, "missed-event replay failed");
                cx.synced_channel_ids.clear();
                StepOutcome::Retry
            }
        }
    }
}

struct RewatchActiveChannels {
    remote: Arc<dyn RemoteUpdater>,
    active: Arc<ActiveSet>,
}

#[async_trait]
impl SyncStep<SyncContext> for RewatchActiveChannels {
    fn name(&self) -> &'static str {
        STEP_REWATCH
    }

    async fn run(&self, cx: &mut SyncContext) -> StepOutcome {
        let mut failed = false;
        for channel in self.active.watched_channels() {
            // A channel the server already replayed is watched again as part
            // of that replay; one we watched on an earlier attempt stays
            // watched.
            if cx.synced_channel_ids.contains(&channel)
                || cx.watched_channel_ids.contains(&channel)
            {
                continue;
            }
            match self.remote.watch_channel(&channel).await {
                Ok(()) => {
                    cx.watched_channel_ids.insert(channel);
                }
                Err(err) => {
                    warn!(channel = %channel, error = %err, "re-watch failed");
                    failed = true;
                }
            }
        }
        if failed {
            StepOutcome::Retry
        } else {
            StepOutcome::Continue
        }
    }
}

struct RefetchListQueries {
    remote: Arc<dyn RemoteUpdater>,
    store: Arc<dyn LocalStore>,
    active: Arc<ActiveSet>,
}

impl RefetchListQueries {
    async fn refetch(
        &self,
        query: &ChannelListQuery,
        cx: &mut SyncContext,
    ) -> anyhow::Result<()> {
        let payloads = self
            .remote
            .fetch_channels_page(query, &Pagination::first(query.page_size))
            .await
            .context("refetch page")?;
        let channels = collect_valid(payloads, ChannelPayload::into_channel, "channel");
        let ids: Vec<ChannelId> = channels.iter().map(|c| c.id.clone()).collect();
        self.store
            .write(
                StoreTransaction::new()
                    .upsert_channels(channels)
                    .link_query(query.cache_key(), ids.clone()),
            )
            .await
            .context("persist refetched page")?;
        cx.synced_channel_ids.extend(ids);
        Ok(())
    }
}

#[async_trait]
impl SyncStep<SyncContext> for RefetchListQueries {
    fn name(&self) -> &'static str {
        STEP_REFETCH_QUERIES
    }

    async fn run(&self, cx: &mut SyncContext) -> StepOutcome {
        let mut failed = false;
        for query in self.active.queries() {
            if let Err(err) = self.refetch(&query, cx).await {
                warn!(query = %query.cache_key(), error = %err, "list query refetch failed");
                failed = true;
            }
        }
        if failed {
            StepOutcome::Retry
        } else {
            StepOutcome::Continue
        }
    }
}

pub struct RecoveryCoordinator {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteUpdater>,
    active: Arc<ActiveSet>,
    user: UserId,
    config: SyncConfig,
    cancel: CancellationHandle,
}

impl RecoveryCoordinator {
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteUpdater>,
        active: Arc<ActiveSet>,
        user: UserId,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            active,
            user,
            config,
            cancel: CancellationHandle::new(),
        }
    }

    pub fn cancellation(&self) -> CancellationHandle {
        self.cancel.clone()
    }

    /// Run the five recovery steps and return the final context for
    /// inspection. On a successful missed-event replay the fresh last-sync
    /// timestamp is persisted for the next disconnect.
    pub async fn run(&self, last_connection_at: Option<OffsetDateTime>) -> SyncContext {
        let mut cx = SyncContext::new(last_connection_at);
        let retries = self.config.recovery_step_retries;
        let delay = self.config.retry_delay;

        let mut sequence =
            OperationSequence::new("reconnect-recovery").with_cancellation(self.cancel.clone());
        sequence.push(RetryableOperation::new(
            EnumerateLocalChannels {
                store: Arc::clone(&self.store),
            },
            retries,
            delay,
        ));
        sequence.push(RetryableOperation::new(
            ReadLastSyncTimestamp {
                store: Arc::clone(&self.store),
                user: self.user.clone(),
            },
            retries,
            delay,
        ));
        sequence.push(RetryableOperation::new(
            FetchMissedEvents {
                remote: Arc::clone(&self.remote),
            },
            retries,
            delay,
        ));
        sequence.push(RetryableOperation::new(
            RewatchActiveChannels {
                remote: Arc::clone(&self.remote),
                active: Arc::clone(&self.active),
            },
            retries,
            delay,
        ));
        sequence.push(RetryableOperation::new(
            RefetchListQueries {
                remote: Arc::clone(&self.remote),
                store: Arc::clone(&self.store),
                active: Arc::clone(&self.active),
            },
            retries,
            delay,
        ));

        let reports = sequence.run(&mut cx).await;

        let replayed = reports
            .iter()
            .any(|r| r.name == STEP_MISSED_EVENTS && r.exit == OperationExit::Finished);
        if replayed {
            let stamp = OffsetDateTime::now_utc();
            if let Err(err) = self
                .store
                .write(StoreTransaction::new().set_last_sync_at(self.user.clone(), stamp))
                .await
            {
                warn!(error = %err, "failed to persist last-sync timestamp");
            }
        }

        info!(
            synced = cx.synced_channel_ids.len(),
            watched = cx.watched_channel_ids.len(),
            "recovery sequence finished"
        );
        cx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::remote::{RecordedRequest, RemoteError, StubRemote};
    use std::time::Duration;

    fn ts(n: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(n).unwrap()
    }

    fn channel(id: &str) -> crate::model::Channel {
        crate::model::Channel {
            id: ChannelId::from(id),
            name: None,
            created_at: ts(1),
            last_message_at: None,
            member_count: 1,
            extra: Default::default(),
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        remote: Arc<StubRemote>,
        active: Arc<ActiveSet>,
        coordinator: RecoveryCoordinator,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(StubRemote::new());
        let active = Arc::new(ActiveSet::new());

        store
            .write(
                StoreTransaction::new()
                    .upsert_channels(vec![channel("c1"), channel("c2")])
                    .set_last_sync_at(UserId::from("me"), ts(1000)),
            )
            .await
            .unwrap();
        active.register_channel(ChannelId::from("c1"));
        active.register_channel(ChannelId::from("c2"));

        let config = SyncConfig {
            retry_delay: Duration::ZERO,
            ..SyncConfig::default()
        };
        let coordinator = RecoveryCoordinator::new(
            Arc::clone(&store) as Arc<dyn LocalStore>,
            Arc::clone(&remote) as Arc<dyn RemoteUpdater>,
            Arc::clone(&active),
            UserId::from("me"),
            config,
        );
        Fixture {
            store,
            remote,
            active,
            coordinator,
        }
    }

    #[tokio::test]
    async fn replayed_channels_skip_the_watch_step() {
        let fx = fixture().await;
        fx.remote.enqueue_sync(Ok(vec![ChannelId::from("c1")]));

        let cx = fx.coordinator.run(None).await;

        assert_eq!(
            cx.synced_channel_ids,
            HashSet::from([ChannelId::from("c1")])
        );
        assert_eq!(cx.local_channel_ids.len(), 2);
        assert_eq!(cx.last_pending_connection_at, Some(ts(1000)));

        let requests = fx.remote.requests();
        let watched: Vec<&ChannelId> = requests
            .iter()
            .filter_map(|r| match r {
                RecordedRequest::Watch { channel } => Some(channel),
                _ => None,
            })
            .collect();
        assert_eq!(watched, vec![&ChannelId::from("c2")]);
        assert_eq!(cx.watched_channel_ids, HashSet::from([ChannelId::from("c2")]));
    }

    #[tokio::test]
    async fn sync_request_carries_timestamp_and_channel_ids() {
        let fx = fixture().await;
        fx.remote.enqueue_sync(Ok(vec![]));
        fx.coordinator.run(None).await;

        let requests = fx.remote.requests();
        let sync = requests
            .iter()
            .find_map(|r| match r {
                RecordedRequest::Sync { since, channels } => Some((since, channels)),
                _ => None,
            })
            .expect("sync request issued");
        assert_eq!(*sync.0, ts(1000));
        assert_eq!(
            *sync.1,
            vec![ChannelId::from("c1"), ChannelId::from("c2")]
        );
    }

    #[tokio::test]
    async fn exhausted_replay_still_rewatches_everything() {
        let fx = fixture().await;
        for _ in 0..3 {
            fx.remote
                .enqueue_sync(Err(RemoteError::Transport("down".into())));
        }

        let cx = fx.coordinator.run(None).await;

        // Replay gave up; the synced set stays empty and both active
        // channels get watched anyway.
        assert!(cx.synced_channel_ids.is_empty());
        assert_eq!(
            cx.watched_channel_ids,
            HashSet::from([ChannelId::from("c1"), ChannelId::from("c2")])
        );

        let sync_attempts = fx
            .remote
            .requests()
            .iter()
            .filter(|r| matches!(r, RecordedRequest::Sync { .. }))
            .count();
        assert_eq!(sync_attempts, 3);
    }

    #[tokio::test]
    async fn failed_watch_is_retried_without_repeating_successes() {
        let fx = fixture().await;
        fx.remote.enqueue_sync(Ok(vec![]));
        fx.remote.fail_watch(ChannelId::from("c2"));

        let cx = fx.coordinator.run(None).await;

        // c1 succeeded on the first attempt and is not re-watched; c2 is
        // attempted on every retry of the step.
        let all = fx.remote.requests();
        let watch_c1 = all
            .iter()
            .filter(
                |r| matches!(r, RecordedRequest::Watch { channel } if channel.as_str() == "c1"),
            )
            .count();
        let watch_c2 = all
            .iter()
            .filter(
                |r| matches!(r, RecordedRequest::Watch { channel } if channel.as_str() == "c2"),
            )
            .count();
        assert_eq!(watch_c1, 1);
        assert_eq!(watch_c2, 3);
        assert_eq!(cx.watched_channel_ids, HashSet::from([ChannelId::from("c1")]));
    }

    #[tokio::test]
    async fn successful_replay_persists_a_fresh_timestamp() {
        let fx = fixture().await;
        fx.remote.enqueue_sync(Ok(vec![ChannelId::from("c1")]));
        fx.coordinator.run(None).await;

        let stamp = fx.store.last_sync_at(&UserId::from("me")).unwrap();
        assert!(stamp > ts(1000));
    }

    #[tokio::test]
    async fn refetched_queries_extend_the_synced_set() {
        let fx = fixture().await;
        fx.remote.enqueue_sync(Ok(vec![]));
        fx.active.register_query(ChannelListQuery::new(
            serde_json::json!({"members": ["me"]}),
            Default::default(),
            2,
        ));
        fx.remote.enqueue_channels(Ok(vec![crate::remote::payload::ChannelPayload {
            id: "c3".into(),
            name: None,
            created_at: ts(1),
            last_message_at: None,
            member_count: 1,
            extra: Default::default(),
        }]));

        let cx = fx.coordinator.run(None).await;
        assert!(cx.synced_channel_ids.contains(&ChannelId::from("c3")));
        assert!(fx.store.channel_ids().contains(&ChannelId::from("c3")));
    }
}
