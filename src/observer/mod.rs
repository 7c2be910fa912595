//! Store-driven list observation.
//!
//! A [`ListObserver`] watches one store query. `start` performs the first
//! synchronous read and installs a live watch on the store's change
//! notification; afterwards every store event for the observed entity kind
//! produces exactly one fully materialized [`ListChangeBatch`], delivered
//! from a single task so batches never race each other.
//!
//! Conversion reuses the previous materialization where it can: a row whose
//! version is unchanged since the last cycle comes back as the same `Arc`,
//! which lets consumers short-circuit on reference equality. Rows named in
//! the current change set are always converted fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::cache::{ChangedKeys, EntityKind, LocalStore, StoreError, StoredRecord};
use crate::error::ClientError;

/// One positional mutation of the observed list. Remove/move-from indexes
/// are positions in the previous materialization; insert/update/move-to
/// indexes are positions in the new one.
#[derive(Debug, Clone)]
pub enum ListChange<T> {
    Insert { item: Arc<T>, index: usize },
    Update { item: Arc<T>, index: usize },
    Remove { item: Arc<T>, index: usize },
    Move { item: Arc<T>, from: usize, to: usize },
}

#[derive(Debug, Clone)]
pub enum ListChangeBatch<T> {
    Changes(Vec<ListChange<T>>),
    /// Positional application would be ambiguous (or the watch lagged); the
    /// consumer should replace its whole view with this list.
    Reload(Vec<Arc<T>>),
}

type ReadFn<T> = dyn Fn() -> Result<Vec<StoredRecord<T>>, StoreError> + Send + Sync;
type BatchFn<T> = dyn Fn(ListChangeBatch<T>) + Send + Sync;

struct Entry<T> {
    key: String,
    version: u64,
    item: Arc<T>,
}

pub struct ListObserver<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    token: Uuid,
    kind: EntityKind,
    key_of: fn(&T) -> String,
    read: Box<ReadFn<T>>,
    entries: Mutex<Vec<Entry<T>>>,
    on_batch: Mutex<Option<Arc<BatchFn<T>>>>,
    started: AtomicBool,
}

impl<T: Send + Sync + 'static> ListObserver<T> {
    pub fn new(
        kind: EntityKind,
        key_of: fn(&T) -> String,
        read: impl Fn() -> Result<Vec<StoredRecord<T>>, StoreError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: Uuid::new_v4(),
                kind,
                key_of,
                read: Box::new(read),
                entries: Mutex::new(Vec::new()),
                on_batch: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Register the batch consumer. Call before `start`; batches emitted
    /// while no consumer is registered are dropped.
    pub fn set_on_batch(&self, on_batch: impl Fn(ListChangeBatch<T>) + Send + Sync + 'static) {
        *self.inner.on_batch.lock() = Some(Arc::new(on_batch));
    }

    /// First synchronous read plus live watch. Idempotent: a second call is
    /// a no-op. Must run inside a tokio runtime; the delivery task lives for
    /// as long as the store's event channel does.
    pub fn start(&self, store: &dyn LocalStore) -> Result<(), ClientError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Subscribe before the initial read so a write landing between the
        // two is observed rather than lost.
        let mut events = store.subscribe();

        let rows = (self.inner.read)().map_err(|err| {
            self.inner.started.store(false, Ordering::Release);
            ClientError::LocalFetchFailed(err)
        })?;
        *self.inner.entries.lock() = rows
            .into_iter()
            .map(|record| Entry {
                key: (self.inner.key_of)(&record.value),
                version: record.version,
                item: Arc::new(record.value),
            })
            .collect();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.kind == inner.kind => inner.observe(&event.changes),
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(token = %inner.token, missed, "observer lagged behind store events; reloading");
                        inner.reload();
                    }
                    Err(RecvError::Closed) => {
                        debug!(token = %inner.token, "store event channel closed; observer stopping");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Snapshot of the current materialization.
    pub fn items(&self) -> Vec<Arc<T>> {
        self.inner
            .entries
            .lock()
            .iter()
            .map(|entry| Arc::clone(&entry.item))
            .collect()
    }
}

impl<T> Inner<T> {
    fn observe(&self, changes: &ChangedKeys) {
        let rows = match (self.read)() {
            Ok(rows) => rows,
            Err(err) => {
                warn!(token = %self.token, error = %err, "observer re-read failed; keeping previous materialization");
                return;
            }
        };

        let batch = {
            let mut entries = self.entries.lock();
            let next = self.convert(&entries, rows, changes);
            let batch = diff(&entries, &next, changes);
            *entries = next;
            batch
        };

        if let Some(batch) = batch {
            self.deliver(batch);
        }
    }

    fn reload(&self) {
        let rows = match (self.read)() {
            Ok(rows) => rows,
            Err(err) => {
                warn!(token = %self.token, error = %err, "observer reload failed");
                return;
            }
        };
        let items = {
            let mut entries = self.entries.lock();
            *entries = rows
                .into_iter()
                .map(|record| Entry {
                    key: (self.key_of)(&record.value),
                    version: record.version,
                    item: Arc::new(record.value),
                })
                .collect();
            entries.iter().map(|e| Arc::clone(&e.item)).collect()
        };
        self.deliver(ListChangeBatch::Reload(items));
    }

    /// Convert stored rows into entries, reusing the previous `Arc` when the
    /// row version is unchanged and the row is not part of this change set.
    fn convert(
        &self,
        previous: &[Entry<T>],
        rows: Vec<StoredRecord<T>>,
        changes: &ChangedKeys,
    ) -> Vec<Entry<T>> {
        let by_key: HashMap<&str, &Entry<T>> =
            previous.iter().map(|e| (e.key.as_str(), e)).collect();
        rows.into_iter()
            .map(|record| {
                let key = (self.key_of)(&record.value);
                if !changes.contains(&key) {
                    if let Some(prev) = by_key.get(key.as_str()) {
                        if prev.version == record.version {
                            return Entry {
                                key,
                                version: record.version,
                                item: Arc::clone(&prev.item),
                            };
                        }
                    }
                }
                trace!(key = %key, "fresh conversion");
                Entry {
                    key,
                    version: record.version,
                    item: Arc::new(record.value),
                }
            })
            .collect()
    }

    fn deliver(&self, batch: ListChangeBatch<T>) {
        let consumer = self.on_batch.lock().clone();
        if let Some(consumer) = consumer {
            consumer(batch);
        }
    }
}

/// Translate two materializations into positional operations. `None` when
/// nothing changed. Ambiguous index assignments degrade the whole batch to a
/// reload rather than a possibly corrupt partial update.
fn diff<T>(
    previous: &[Entry<T>],
    next: &[Entry<T>],
    changes: &ChangedKeys,
) -> Option<ListChangeBatch<T>> {
    let old_index: HashMap<&str, usize> = previous
        .iter()
        .enumerate()
        .map(|(i, e)| (e.key.as_str(), i))
        .collect();
    let new_index: HashMap<&str, usize> = next
        .iter()
        .enumerate()
        .map(|(i, e)| (e.key.as_str(), i))
        .collect();

    let mut ops: Vec<ListChange<T>> = Vec::new();

    // Removes first, in descending old positions.
    let mut removed: Vec<&Entry<T>> = previous
        .iter()
        .filter(|e| !new_index.contains_key(e.key.as_str()))
        .collect();
    removed.sort_by_key(|e| std::cmp::Reverse(old_index[e.key.as_str()]));
    for entry in removed {
        ops.push(ListChange::Remove {
            item: Arc::clone(&entry.item),
            index: old_index[entry.key.as_str()],
        });
    }

    for (index, entry) in next.iter().enumerate() {
        if !old_index.contains_key(entry.key.as_str()) {
            ops.push(ListChange::Insert {
                item: Arc::clone(&entry.item),
                index,
            });
        }
    }

    // Survivor ranks decide moves; the store saying a row changed decides
    // updates.
    let old_rank = survivor_ranks(previous, &new_index);
    let new_rank = survivor_ranks(next, &old_index);
    for entry in next {
        let key = entry.key.as_str();
        let Some(&from) = old_index.get(key) else {
            continue;
        };
        let to = new_index[key];
        if changes.contains(key) {
            ops.push(ListChange::Update {
                item: Arc::clone(&entry.item),
                index: to,
            });
        } else if old_rank[key] != new_rank[key] {
            ops.push(ListChange::Move {
                item: Arc::clone(&entry.item),
                from,
                to,
            });
        }
    }

    if ops.is_empty() {
        return None;
    }

    if has_index_conflict(&ops) {
        warn!("ambiguous positional batch; degrading to reload");
        return Some(ListChangeBatch::Reload(
            next.iter().map(|e| Arc::clone(&e.item)).collect(),
        ));
    }

    Some(ListChangeBatch::Changes(ops))
}

fn survivor_ranks<'a, T>(
    entries: &'a [Entry<T>],
    other_index: &HashMap<&str, usize>,
) -> HashMap<&'a str, usize> {
    entries
        .iter()
        .filter(|e| other_index.contains_key(e.key.as_str()))
        .enumerate()
        .map(|(rank, e)| (e.key.as_str(), rank))
        .collect()
}

fn has_index_conflict<T>(ops: &[ListChange<T>]) -> bool {
    let mut old_space = std::collections::HashSet::new();
    let mut new_space = std::collections::HashSet::new();
    for op in ops {
        match op {
            ListChange::Remove { index, .. } => {
                if !old_space.insert(*index) {
                    return true;
                }
            }
            ListChange::Insert { index, .. } => {
                if !new_space.insert(*index) {
                    return true;
                }
            }
            ListChange::Move { from, to, .. } => {
                if !old_space.insert(*from) || !new_space.insert(*to) {
                    return true;
                }
            }
            ListChange::Update { .. } => {}
        }
    }
    false
}
