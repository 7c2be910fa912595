//! Watcher pagination for one channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::cache::{LocalStore, StoreTransaction, WatcherQuery};
use crate::error::ClientError;
use crate::merge::merge_sorted;
use crate::model::{ChannelId, Watcher};
use crate::protocol::{PageParam, Pagination, short_page};
use crate::remote::RemoteUpdater;
use crate::remote::payload::{WatcherPayload, collect_valid};

use super::LoadGuard;

/// Live watcher list for one channel. Identity is the user id; ordering
/// follows the canonical local fetch (user id ascending).
pub struct WatcherListLoader {
    channel: ChannelId,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteUpdater>,
    page_size: usize,
    live: RwLock<Vec<Watcher>>,
    loading: AtomicBool,
    loaded_all: AtomicBool,
}

impl WatcherListLoader {
    pub fn new(
        channel: ChannelId,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteUpdater>,
        page_size: usize,
    ) -> Self {
        Self {
            channel,
            store,
            remote,
            page_size,
            live: RwLock::new(Vec::new()),
            loading: AtomicBool::new(false),
            loaded_all: AtomicBool::new(false),
        }
    }

    pub fn watchers(&self) -> Vec<Watcher> {
        self.live.read().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn has_loaded_all(&self) -> bool {
        self.loaded_all.load(Ordering::Acquire)
    }

    /// Fetch the next page. Offset pagination recomputed from the current
    /// count; best effort under concurrent inserts (known gap, kept as-is).
    pub async fn load_more(&self, limit: Option<usize>) -> Result<Vec<Watcher>, ClientError> {
        if self.loaded_all.load(Ordering::Acquire) {
            trace!(channel = %self.channel, "watchers exhausted; no-op");
            return Ok(Vec::new());
        }
        let Some(_guard) = LoadGuard::acquire(&self.loading) else {
            return Ok(Vec::new());
        };

        let offset = self.live.read().len();
        let size = limit.unwrap_or(self.page_size);
        let param = (offset > 0).then_some(PageParam::Offset(offset));
        let payloads = self
            .remote
            .fetch_watchers_page(&self.channel, &Pagination::new(size, param))
            .await?;
        let received = payloads.len();
        let fetched = collect_valid(payloads, WatcherPayload::into_watcher, "watcher");

        if !fetched.is_empty() {
            self.store
                .write(StoreTransaction::new().upsert_watchers(self.channel.clone(), fetched.clone()))
                .await?;
            let rows = self.store.watchers(&WatcherQuery {
                channel: self.channel.clone(),
                offset: 0,
                limit: Some(offset + fetched.len()),
            })?;
            let canonical: Vec<Watcher> = rows.into_iter().map(|r| r.value).collect();
            let mut live = self.live.write();
            *live = merge_sorted(&live, &canonical, Watcher::compare_user, |a, b| {
                a.user == b.user
            });
        }
        if short_page(received, size) {
            self.loaded_all.store(true, Ordering::Release);
        }
        debug!(channel = %self.channel, offset, received, "loaded watcher page");
        Ok(fetched)
    }
}
