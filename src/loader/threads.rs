//! Thread-list pagination.
//!
//! Unlike the other list endpoints, the thread endpoint hands back an
//! explicit continuation cursor, so exhaustion is driven by the cursor as
//! well as by a short page.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::cache::{LocalStore, StoreTransaction, ThreadQuery};
use crate::error::ClientError;
use crate::merge::merge_sorted;
use crate::model::Thread;
use crate::protocol::{PageParam, Pagination};
use crate::remote::RemoteUpdater;
use crate::remote::payload::{ThreadPayload, collect_valid};

use super::LoadGuard;

/// Live thread list across channels, last reply time descending.
pub struct ThreadListLoader {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteUpdater>,
    page_size: usize,
    live: RwLock<Vec<Thread>>,
    next_cursor: Mutex<Option<String>>,
    loading: AtomicBool,
    loaded_all: AtomicBool,
}

impl ThreadListLoader {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteUpdater>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            remote,
            page_size,
            live: RwLock::new(Vec::new()),
            next_cursor: Mutex::new(None),
            loading: AtomicBool::new(false),
            loaded_all: AtomicBool::new(false),
        }
    }

    pub fn threads(&self) -> Vec<Thread> {
        self.live.read().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn has_loaded_all(&self) -> bool {
        self.loaded_all.load(Ordering::Acquire)
    }

    /// Fetch the first page, dropping any held cursor, and make it the whole
    /// live state.
    pub async fn refresh(&self) -> Result<Vec<Thread>, ClientError> {
        let Some(_guard) = LoadGuard::acquire(&self.loading) else {
            return Ok(Vec::new());
        };
        *self.next_cursor.lock() = None;
        self.loaded_all.store(false, Ordering::Release);

        let (fetched, exhausted) = self.round_trip(None).await?;
        let canonical = self.canonical(fetched.len())?;
        {
            let mut live = self.live.write();
            *live = canonical;
        }
        self.loaded_all.store(exhausted, Ordering::Release);
        debug!(count = fetched.len(), "refreshed thread list");
        Ok(fetched)
    }

    pub async fn load_next_page(&self) -> Result<Vec<Thread>, ClientError> {
        if self.loaded_all.load(Ordering::Acquire) {
            trace!("thread list exhausted; no-op");
            return Ok(Vec::new());
        }
        let Some(_guard) = LoadGuard::acquire(&self.loading) else {
            return Ok(Vec::new());
        };

        let cursor = self.next_cursor.lock().clone();
        let live_len = self.live.read().len();
        let (fetched, exhausted) = self.round_trip(cursor).await?;
        let canonical = self.canonical(live_len + fetched.len())?;
        {
            let mut live = self.live.write();
            *live = merge_sorted(
                &live,
                &canonical,
                Thread::compare_last_reply_desc,
                |a, b| a.id == b.id,
            );
        }
        if exhausted {
            self.loaded_all.store(true, Ordering::Release);
        }
        debug!(count = fetched.len(), "loaded thread page");
        Ok(fetched)
    }

    /// One remote round trip. Returns the converted page and whether the
    /// list is exhausted (absent cursor or short page).
    async fn round_trip(
        &self,
        cursor: Option<String>,
    ) -> Result<(Vec<Thread>, bool), ClientError> {
        let page = Pagination::new(self.page_size, cursor.map(PageParam::LessThan));
        let response = self.remote.fetch_threads_page(&page).await?;
        let exhausted = response.exhausted(self.page_size);
        *self.next_cursor.lock() = response.next_cursor.clone();

        let fetched = collect_valid(response.items, ThreadPayload::into_thread, "thread");
        if !fetched.is_empty() {
            self.store
                .write(StoreTransaction::new().upsert_threads(fetched.clone()))
                .await?;
        }
        Ok((fetched, exhausted))
    }

    fn canonical(&self, limit: usize) -> Result<Vec<Thread>, ClientError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = self.store.threads(&ThreadQuery { limit: Some(limit) })?;
        Ok(rows.into_iter().map(|record| record.value).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::protocol::PageResponse;
    use crate::remote::{RecordedRequest, StubRemote};
    use time::OffsetDateTime;

    fn ts(n: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(n).unwrap()
    }

    fn payload(id: &str, last_reply: i64) -> ThreadPayload {
        ThreadPayload {
            parent_message_id: id.into(),
            channel_id: "c1".into(),
            reply_count: 3,
            participant_count: 2,
            last_reply_at: Some(ts(last_reply)),
            created_at: ts(1),
        }
    }

    fn loader(page_size: usize) -> (ThreadListLoader, Arc<StubRemote>) {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(StubRemote::new());
        let loader = ThreadListLoader::new(
            store as Arc<dyn LocalStore>,
            Arc::clone(&remote) as Arc<dyn RemoteUpdater>,
            page_size,
        );
        (loader, remote)
    }

    #[tokio::test]
    async fn cursor_is_carried_into_the_next_request() {
        let (loader, remote) = loader(2);
        remote.enqueue_threads(Ok(PageResponse {
            items: vec![payload("t1", 40), payload("t2", 30)],
            next_cursor: Some("cursor-1".into()),
        }));
        loader.refresh().await.unwrap();
        assert!(!loader.has_loaded_all());

        remote.enqueue_threads(Ok(PageResponse {
            items: vec![payload("t3", 20)],
            next_cursor: None,
        }));
        loader.load_next_page().await.unwrap();

        let requests = remote.requests();
        match &requests[1] {
            RecordedRequest::Threads { page } => {
                assert_eq!(page.param(), Some(&PageParam::LessThan("cursor-1".into())));
            }
            other => panic!("expected threads request, got {other:?}"),
        }

        let threads = loader.threads();
        let ids: Vec<&str> = threads.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        // Absent cursor exhausts even independent of page size.
        assert!(loader.has_loaded_all());
    }

    #[tokio::test]
    async fn full_page_without_cursor_still_exhausts() {
        let (loader, remote) = loader(2);
        remote.enqueue_threads(Ok(PageResponse {
            items: vec![payload("t1", 40), payload("t2", 30)],
            next_cursor: None,
        }));
        loader.refresh().await.unwrap();
        assert!(loader.has_loaded_all());

        loader.load_next_page().await.unwrap();
        assert_eq!(remote.requests().len(), 1);
    }
}
