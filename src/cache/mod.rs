//! Local store boundary.
//!
//! The store is an opaque keyed object store with query and change
//! notification capability; its storage technology is not this crate's
//! concern. All mutation funnels through one serializing write path so a
//! batch of changes becomes visible atomically, and every read returns rows
//! in the canonical order for that query.

mod memory;

pub use memory::MemoryStore;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::model::{
    Channel, ChannelId, ChannelListQuery, Message, MessageId, Reaction, Thread, UserId, Watcher,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed query: {0}")]
    MalformedQuery(String),
    #[error("store write rejected: {0}")]
    WriteFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Channel,
    Message,
    Reaction,
    Watcher,
    Thread,
}

/// Record version from a store-global counter; bumped whenever a write
/// actually changes the record's value.
pub type Version = u64;

/// A stored row plus its version, as handed to observers and loaders.
#[derive(Debug, Clone)]
pub struct StoredRecord<T> {
    pub version: Version,
    pub value: T,
}

/// Keys touched by one write, as reported by the store's native change
/// notification. Key strings use each entity's store key format.
#[derive(Debug, Clone, Default)]
pub struct ChangedKeys {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl ChangedKeys {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inserted.iter().any(|k| k == key)
            || self.updated.iter().any(|k| k == key)
            || self.removed.iter().any(|k| k == key)
    }
}

#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub kind: EntityKind,
    pub changes: ChangedKeys,
}

/// Canonical message slice: one channel, optional inclusive creation-time
/// bounds, rows ordered by creation time ascending. `limit` keeps the newest
/// rows of the slice.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageQuery {
    pub channel: ChannelId,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn channel(channel: ChannelId) -> Self {
        Self {
            channel,
            from: None,
            to: None,
            limit: None,
        }
    }

    pub fn between(mut self, from: OffsetDateTime, to: OffsetDateTime) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn newest(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cache_key(&self) -> String {
        format!(
            "{}|{:?}|{:?}|{:?}",
            self.channel,
            self.from.map(OffsetDateTime::unix_timestamp_nanos),
            self.to.map(OffsetDateTime::unix_timestamp_nanos),
            self.limit,
        )
    }
}

/// Reactions of one message, ordered by update time descending.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionQuery {
    pub message: MessageId,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Watchers of one channel, ordered by user id ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherQuery {
    pub channel: ChannelId,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Threads across all channels, ordered by last reply time descending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadQuery {
    pub limit: Option<usize>,
}

/// One atomic batch mutation. Upserts that leave a record's value unchanged
/// are dropped: they bump no version and appear in no change notification.
#[derive(Debug, Default)]
pub struct StoreTransaction {
    pub(crate) channels: Vec<Channel>,
    pub(crate) messages: Vec<Message>,
    pub(crate) reactions: Vec<Reaction>,
    pub(crate) watchers: Vec<(ChannelId, Watcher)>,
    pub(crate) threads: Vec<Thread>,
    pub(crate) removed_messages: Vec<MessageId>,
    pub(crate) query_links: Vec<(String, Vec<ChannelId>)>,
    pub(crate) last_sync_at: Option<(UserId, OffsetDateTime)>,
}

impl StoreTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels.extend(channels);
        self
    }

    pub fn upsert_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn upsert_reactions(mut self, reactions: Vec<Reaction>) -> Self {
        self.reactions.extend(reactions);
        self
    }

    pub fn upsert_watchers(mut self, channel: ChannelId, watchers: Vec<Watcher>) -> Self {
        self.watchers
            .extend(watchers.into_iter().map(|w| (channel.clone(), w)));
        self
    }

    pub fn upsert_threads(mut self, threads: Vec<Thread>) -> Self {
        self.threads.extend(threads);
        self
    }

    pub fn remove_messages(mut self, ids: Vec<MessageId>) -> Self {
        self.removed_messages.extend(ids);
        self
    }

    /// Record that `channels` are members of the channel-list query named by
    /// `query_key` (see [`ChannelListQuery::cache_key`]).
    pub fn link_query(mut self, query_key: String, channels: Vec<ChannelId>) -> Self {
        self.query_links.push((query_key, channels));
        self
    }

    pub fn set_last_sync_at(mut self, user: UserId, at: OffsetDateTime) -> Self {
        self.last_sync_at = Some((user, at));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
            && self.messages.is_empty()
            && self.reactions.is_empty()
            && self.watchers.is_empty()
            && self.threads.is_empty()
            && self.removed_messages.is_empty()
            && self.query_links.is_empty()
            && self.last_sync_at.is_none()
    }
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Apply one batch mutation atomically. Suspension point: writes are
    /// serialized behind a single logical write path.
    async fn write(&self, tx: StoreTransaction) -> Result<(), StoreError>;

    /// Channels belonging to `query`, in the query's declared sort order.
    fn channels(
        &self,
        query: &ChannelListQuery,
        limit: Option<usize>,
    ) -> Result<Vec<StoredRecord<Channel>>, StoreError>;

    fn messages(&self, query: &MessageQuery) -> Result<Vec<StoredRecord<Message>>, StoreError>;

    fn reactions(&self, query: &ReactionQuery) -> Result<Vec<StoredRecord<Reaction>>, StoreError>;

    fn watchers(&self, query: &WatcherQuery) -> Result<Vec<StoredRecord<Watcher>>, StoreError>;

    fn threads(&self, query: &ThreadQuery) -> Result<Vec<StoredRecord<Thread>>, StoreError>;

    /// Every channel id currently known locally.
    fn channel_ids(&self) -> Vec<ChannelId>;

    /// The last-pending-connection timestamp recorded for `user`.
    fn last_sync_at(&self, user: &UserId) -> Option<OffsetDateTime>;

    /// Native change notification. One event per entity kind per write.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Cache of query shape → record keys for repeated identical reads. Owned by
/// the store; every write touching an entity kind drops that kind's entries
/// so a read never sees stale row identifiers.
#[derive(Debug, Default)]
pub struct FetchResultCache {
    entries: Mutex<HashMap<(EntityKind, String), Vec<String>>>,
}

impl FetchResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EntityKind, key: &str) -> Option<Vec<String>> {
        self.entries.lock().get(&(kind, key.to_owned())).cloned()
    }

    pub fn put(&self, kind: EntityKind, key: String, record_keys: Vec<String>) {
        self.entries.lock().insert((kind, key), record_keys);
    }

    pub fn invalidate(&self, kind: EntityKind) {
        self.entries.lock().retain(|(k, _), _| *k != kind);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
