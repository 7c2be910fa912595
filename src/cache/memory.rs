//! Production in-memory store.
//!
//! Writes funnel through one async gate so each batch becomes visible
//! atomically and change events observe write order. Reads run concurrently
//! against a short-lived read lock and consult the fetch-result cache for
//! repeated identical queries.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

use async_trait::async_trait;
use parking_lot::RwLock;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::trace;

use crate::model::{
    Channel, ChannelId, ChannelListQuery, Message, MessageId, Reaction, Thread, ThreadId, UserId,
    Watcher,
};

use super::{
    ChangedKeys, EntityKind, FetchResultCache, LocalStore, MessageQuery, ReactionQuery,
    StoreError, StoreEvent, StoreTransaction, StoredRecord, ThreadQuery, Version, WatcherQuery,
};

const DEFAULT_EVENT_CAPACITY: usize = 256;

pub struct MemoryStore {
    inner: RwLock<Inner>,
    write_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
    fetch_cache: FetchResultCache,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelId, StoredRecord<Channel>>,
    messages: HashMap<MessageId, StoredRecord<Message>>,
    reactions: HashMap<String, StoredRecord<Reaction>>,
    watchers: HashMap<(ChannelId, UserId), StoredRecord<Watcher>>,
    threads: HashMap<ThreadId, StoredRecord<Thread>>,
    query_members: HashMap<String, BTreeSet<ChannelId>>,
    last_sync: HashMap<UserId, OffsetDateTime>,
    next_version: Version,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            inner: RwLock::new(Inner::default()),
            write_gate: tokio::sync::Mutex::new(()),
            events,
            fetch_cache: FetchResultCache::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn fetch_cache(&self) -> &FetchResultCache {
        &self.fetch_cache
    }

    fn cached<T, F>(&self, kind: EntityKind, cache_key: &str, lookup: F) -> Option<Vec<StoredRecord<T>>>
    where
        F: Fn(&Inner, &str) -> Option<StoredRecord<T>>,
    {
        let keys = self.fetch_cache.get(kind, cache_key)?;
        let inner = self.inner.read();
        let mut rows = Vec::with_capacity(keys.len());
        for key in &keys {
            rows.push(lookup(&inner, key)?);
        }
        Some(rows)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn upsert<K, T>(
    map: &mut HashMap<K, StoredRecord<T>>,
    counter: &mut Version,
    key: K,
    event_key: String,
    value: T,
    changes: &mut ChangedKeys,
) where
    K: Hash + Eq,
    T: PartialEq,
{
    match map.get_mut(&key) {
        Some(existing) if existing.value == value => {}
        Some(existing) => {
            *counter += 1;
            existing.value = value;
            existing.version = *counter;
            changes.updated.push(event_key);
        }
        None => {
            *counter += 1;
            map.insert(
                key,
                StoredRecord {
                    version: *counter,
                    value,
                },
            );
            changes.inserted.push(event_key);
        }
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn write(&self, tx: StoreTransaction) -> Result<(), StoreError> {
        if tx.is_empty() {
            return Ok(());
        }
        let _gate = self.write_gate.lock().await;

        let mut channel_changes = ChangedKeys::default();
        let mut message_changes = ChangedKeys::default();
        let mut reaction_changes = ChangedKeys::default();
        let mut watcher_changes = ChangedKeys::default();
        let mut thread_changes = ChangedKeys::default();

        {
            let mut guard = self.inner.write();
            let Inner {
                channels,
                messages,
                reactions,
                watchers,
                threads,
                query_members,
                last_sync,
                next_version,
            } = &mut *guard;

            for channel in tx.channels {
                let key = channel.id.clone();
                let event_key = channel.id.0.clone();
                upsert(channels, next_version, key, event_key, channel, &mut channel_changes);
            }
            for message in tx.messages {
                let key = message.id.clone();
                let event_key = message.id.0.clone();
                upsert(messages, next_version, key, event_key, message, &mut message_changes);
            }
            for reaction in tx.reactions {
                let key = reaction.store_key();
                upsert(reactions, next_version, key.clone(), key, reaction, &mut reaction_changes);
            }
            for (channel_id, watcher) in tx.watchers {
                let event_key = format!("{}:{}", channel_id, watcher.user);
                let key = (channel_id, watcher.user.clone());
                upsert(watchers, next_version, key, event_key, watcher, &mut watcher_changes);
            }
            for thread in tx.threads {
                let key = thread.id.clone();
                let event_key = thread.id.0.clone();
                upsert(threads, next_version, key, event_key, thread, &mut thread_changes);
            }
            for id in tx.removed_messages {
                if messages.remove(&id).is_some() {
                    message_changes.removed.push(id.0);
                }
            }
            for (query_key, ids) in tx.query_links {
                let members = query_members.entry(query_key).or_default();
                for id in ids {
                    // Membership changes what a channel-list read returns, so
                    // list observers must re-read even when the channel record
                    // itself did not change.
                    if members.insert(id.clone()) && !channel_changes.contains(&id.0) {
                        channel_changes.updated.push(id.0);
                    }
                }
            }
            if let Some((user, at)) = tx.last_sync_at {
                last_sync.insert(user, at);
            }
        }

        let batches = [
            (EntityKind::Channel, channel_changes),
            (EntityKind::Message, message_changes),
            (EntityKind::Reaction, reaction_changes),
            (EntityKind::Watcher, watcher_changes),
            (EntityKind::Thread, thread_changes),
        ];
        for (kind, changes) in batches {
            if changes.is_empty() {
                continue;
            }
            self.fetch_cache.invalidate(kind);
            trace!(
                ?kind,
                inserted = changes.inserted.len(),
                updated = changes.updated.len(),
                removed = changes.removed.len(),
                "store write applied"
            );
            let _ = self.events.send(StoreEvent { kind, changes });
        }
        Ok(())
    }

    fn channels(
        &self,
        query: &ChannelListQuery,
        limit: Option<usize>,
    ) -> Result<Vec<StoredRecord<Channel>>, StoreError> {
        let cache_key = format!("{}|{:?}", query.cache_key(), limit);
        if let Some(rows) = self.cached(EntityKind::Channel, &cache_key, |inner, key| {
            inner.channels.get(&ChannelId(key.to_owned())).cloned()
        }) {
            return Ok(rows);
        }

        let inner = self.inner.read();
        let mut rows: Vec<StoredRecord<Channel>> = inner
            .query_members
            .get(&query.cache_key())
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| inner.channels.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| query.sort.compare(&a.value, &b.value));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        self.fetch_cache.put(
            EntityKind::Channel,
            cache_key,
            rows.iter().map(|r| r.value.id.0.clone()).collect(),
        );
        Ok(rows)
    }

    fn messages(&self, query: &MessageQuery) -> Result<Vec<StoredRecord<Message>>, StoreError> {
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(StoreError::MalformedQuery(format!(
                    "message range starts after it ends: {from} > {to}"
                )));
            }
        }

        let cache_key = query.cache_key();
        if let Some(rows) = self.cached(EntityKind::Message, &cache_key, |inner, key| {
            inner.messages.get(&MessageId(key.to_owned())).cloned()
        }) {
            return Ok(rows);
        }

        let inner = self.inner.read();
        let mut rows: Vec<StoredRecord<Message>> = inner
            .messages
            .values()
            .filter(|r| r.value.channel_id == query.channel)
            .filter(|r| query.from.is_none_or(|bound| r.value.created_at >= bound))
            .filter(|r| query.to.is_none_or(|bound| r.value.created_at <= bound))
            .cloned()
            .collect();
        rows.sort_by(|a, b| Message::compare_created(&a.value, &b.value));
        if let Some(limit) = query.limit {
            if rows.len() > limit {
                rows.drain(..rows.len() - limit);
            }
        }
        self.fetch_cache.put(
            EntityKind::Message,
            cache_key,
            rows.iter().map(|r| r.value.id.0.clone()).collect(),
        );
        Ok(rows)
    }

    fn reactions(&self, query: &ReactionQuery) -> Result<Vec<StoredRecord<Reaction>>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<StoredRecord<Reaction>> = inner
            .reactions
            .values()
            .filter(|r| r.value.message_id == query.message)
            .cloned()
            .collect();
        rows.sort_by(|a, b| Reaction::compare_updated_desc(&a.value, &b.value));
        Ok(window(rows, query.offset, query.limit))
    }

    fn watchers(&self, query: &WatcherQuery) -> Result<Vec<StoredRecord<Watcher>>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<StoredRecord<Watcher>> = inner
            .watchers
            .iter()
            .filter(|((channel, _), _)| *channel == query.channel)
            .map(|(_, record)| record.clone())
            .collect();
        rows.sort_by(|a, b| Watcher::compare_user(&a.value, &b.value));
        Ok(window(rows, query.offset, query.limit))
    }

    fn threads(&self, query: &ThreadQuery) -> Result<Vec<StoredRecord<Thread>>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<StoredRecord<Thread>> = inner.threads.values().cloned().collect();
        rows.sort_by(|a, b| Thread::compare_last_reply_desc(&a.value, &b.value));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        let inner = self.inner.read();
        let mut ids: Vec<ChannelId> = inner.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn last_sync_at(&self, user: &UserId) -> Option<OffsetDateTime> {
        self.inner.read().last_sync.get(user).copied()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

fn window<T>(rows: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    let iter = rows.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}
