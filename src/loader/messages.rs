//! Message timeline pagination for one channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::cache::{LocalStore, MessageQuery, StoreTransaction};
use crate::error::ClientError;
use crate::merge::merge_sorted;
use crate::model::{ChannelId, Message, MessageId};
use crate::protocol::{PageParam, Pagination, resolve_boundary, short_page};
use crate::remote::RemoteUpdater;
use crate::remote::payload::{MessagePayload, collect_valid};

use super::LoadGuard;

/// Live message timeline for one channel, creation time ascending.
///
/// Directions are independent: `load_previous` extends toward older
/// messages, `load_next` toward newer ones, `load_around` jumps. A direction
/// whose exhaustion flag is set is a no-op until a fresh first-page load
/// (`load_latest`) resets it.
pub struct MessageListLoader {
    channel: ChannelId,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteUpdater>,
    page_size: usize,
    live: RwLock<Vec<Message>>,
    oldest_fetched: Mutex<Option<MessageId>>,
    newest_fetched: Mutex<Option<MessageId>>,
    loading_previous: AtomicBool,
    loading_next: AtomicBool,
    loading_middle: AtomicBool,
    loaded_all_previous: AtomicBool,
    loaded_all_next: AtomicBool,
}

impl MessageListLoader {
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
            oldest_fetched: Mutex::new(None),
            newest_fetched: Mutex::new(None),
            loading_previous: AtomicBool::new(false),
            loading_next: AtomicBool::new(false),
            loading_middle: AtomicBool::new(false),
            loaded_all_previous: AtomicBool::new(false),
            loaded_all_next: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn messages(&self) -> Vec<Message> {
        self.live.read().clone()
    }

    pub fn is_loading_previous(&self) -> bool {
        self.loading_previous.load(Ordering::Acquire)
    }

    pub fn is_loading_next(&self) -> bool {
        self.loading_next.load(Ordering::Acquire)
    }

    pub fn is_loading_middle(&self) -> bool {
        self.loading_middle.load(Ordering::Acquire)
    }

    pub fn has_loaded_all_previous(&self) -> bool {
        self.loaded_all_previous.load(Ordering::Acquire)
    }

    pub fn has_loaded_all_next(&self) -> bool {
        self.loaded_all_next.load(Ordering::Acquire)
    }

    /// Fetch the newest page and make it the whole live state. Resets both
    /// exhaustion flags and the fetch boundaries.
    pub async fn load_latest(&self, limit: Option<usize>) -> Result<Vec<Message>, ClientError> {
        let Some(_guard) = LoadGuard::acquire(&self.loading_middle) else {
            return Ok(Vec::new());
        };
        let size = limit.unwrap_or(self.page_size);
        let payloads = self
            .remote
            .fetch_messages_page(&self.channel, &Pagination::first(size))
            .await?;
        let received = payloads.len();
        let fetched = collect_valid(payloads, MessagePayload::into_message, "message");

        let canonical = self.persist_and_reread(&fetched).await?;
        {
            let mut live = self.live.write();
            *live = canonical;
        }
        self.set_boundaries(&fetched, true, true);
        // The first page is the newest edge by definition.
        self.loaded_all_next.store(true, Ordering::Release);
        self.loaded_all_previous
            .store(short_page(received, size), Ordering::Release);
        debug!(channel = %self.channel, received, "loaded latest messages");
        Ok(fetched)
    }

    /// Extend the timeline toward older messages.
    pub async fn load_previous(
        &self,
        anchor: Option<MessageId>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ClientError> {
        if self.loaded_all_previous.load(Ordering::Acquire) {
            trace!(channel = %self.channel, "all previous messages loaded; no-op");
            return Ok(Vec::new());
        }
        let Some(_guard) = LoadGuard::acquire(&self.loading_previous) else {
            return Ok(Vec::new());
        };

        let anchor = self.resolve_anchor(anchor, Boundary::Oldest)?;
        let size = limit.unwrap_or(self.page_size);
        let page = Pagination::new(size, Some(PageParam::LessThan(anchor.0.clone())));
        let payloads = self.remote.fetch_messages_page(&self.channel, &page).await?;
        let received = payloads.len();
        let fetched = collect_valid(payloads, MessagePayload::into_message, "message");

        let canonical = self.persist_and_reread(&fetched).await?;
        self.fold(canonical);
        self.set_boundaries(&fetched, true, false);
        if short_page(received, size) {
            self.loaded_all_previous.store(true, Ordering::Release);
        }
        debug!(channel = %self.channel, received, anchor = %anchor, "loaded previous messages");
        Ok(fetched)
    }

    /// Extend the timeline toward newer messages.
    pub async fn load_next(
        &self,
        anchor: Option<MessageId>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ClientError> {
        if self.loaded_all_next.load(Ordering::Acquire) {
            trace!(channel = %self.channel, "all next messages loaded; no-op");
            return Ok(Vec::new());
        }
        let Some(_guard) = LoadGuard::acquire(&self.loading_next) else {
            return Ok(Vec::new());
        };

        let anchor = self.resolve_anchor(anchor, Boundary::Newest)?;
        let size = limit.unwrap_or(self.page_size);
        let page = Pagination::new(size, Some(PageParam::GreaterThan(anchor.0.clone())));
        let payloads = self.remote.fetch_messages_page(&self.channel, &page).await?;
        let received = payloads.len();
        let fetched = collect_valid(payloads, MessagePayload::into_message, "message");

        let canonical = self.persist_and_reread(&fetched).await?;
        self.fold(canonical);
        self.set_boundaries(&fetched, false, true);
        if short_page(received, size) {
            self.loaded_all_next.store(true, Ordering::Release);
        }
        debug!(channel = %self.channel, received, anchor = %anchor, "loaded next messages");
        Ok(fetched)
    }

    /// Jump to the window around `anchor`. The live state is reset to the
    /// locally known slice of that window rather than extended: after the
    /// jump, both directions are open again.
    pub async fn load_around(
        &self,
        anchor: MessageId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ClientError> {
        let Some(_guard) = LoadGuard::acquire(&self.loading_middle) else {
            return Ok(Vec::new());
        };
        let size = limit.unwrap_or(self.page_size);
        let page = Pagination::new(size, Some(PageParam::Around(anchor.0.clone())));
        let payloads = self.remote.fetch_messages_page(&self.channel, &page).await?;
        let fetched = collect_valid(payloads, MessagePayload::into_message, "message");
        if fetched.is_empty() {
            debug!(channel = %self.channel, anchor = %anchor, "around window came back empty");
            return Ok(Vec::new());
        }

        let canonical = self.persist_and_reread(&fetched).await?;
        {
            let mut live = self.live.write();
            *live = canonical;
        }
        self.set_boundaries(&fetched, true, true);
        self.loaded_all_previous.store(false, Ordering::Release);
        self.loaded_all_next.store(false, Ordering::Release);
        debug!(channel = %self.channel, anchor = %anchor, count = fetched.len(), "jumped to message window");
        Ok(fetched)
    }

    /// Persist a fetched page and re-read the canonical slice bounded by the
    /// page's creation-time range.
    async fn persist_and_reread(
        &self,
        fetched: &[Message],
    ) -> Result<Vec<Message>, ClientError> {
        let Some((from, to)) = created_range(fetched) else {
            return Ok(Vec::new());
        };
        self.store
            .write(StoreTransaction::new().upsert_messages(fetched.to_vec()))
            .await?;
        let rows = self
            .store
            .messages(&MessageQuery::channel(self.channel.clone()).between(from, to))?;
        Ok(rows.into_iter().map(|record| record.value).collect())
    }

    fn fold(&self, canonical: Vec<Message>) {
        if canonical.is_empty() {
            return;
        }
        let mut live = self.live.write();
        *live = merge_sorted(&live, &canonical, Message::compare_created, |a, b| {
            a.id == b.id
        });
    }

    fn resolve_anchor(
        &self,
        explicit: Option<MessageId>,
        boundary: Boundary,
    ) -> Result<MessageId, ClientError> {
        let last_fetched = match boundary {
            Boundary::Oldest => self.oldest_fetched.lock().clone(),
            Boundary::Newest => self.newest_fetched.lock().clone(),
        };
        let live = {
            let live = self.live.read();
            match boundary {
                Boundary::Oldest => live.first().map(|m| m.id.clone()),
                Boundary::Newest => live.last().map(|m| m.id.clone()),
            }
        };
        resolve_boundary(explicit.as_ref(), last_fetched.as_ref(), live.as_ref())
            .ok_or(ClientError::ChannelEmptyMessages)
    }

    fn set_boundaries(&self, fetched: &[Message], oldest: bool, newest: bool) {
        if oldest {
            if let Some(message) = fetched.iter().min_by(|a, b| Message::compare_created(a, b)) {
                *self.oldest_fetched.lock() = Some(message.id.clone());
            }
        }
        if newest {
            if let Some(message) = fetched.iter().max_by(|a, b| Message::compare_created(a, b)) {
                *self.newest_fetched.lock() = Some(message.id.clone());
            }
        }
    }
}

enum Boundary {
    Oldest,
    Newest,
}

fn created_range(messages: &[Message]) -> Option<(OffsetDateTime, OffsetDateTime)> {
    let from = messages.iter().map(|m| m.created_at).min()?;
    let to = messages.iter().map(|m| m.created_at).max()?;
    Some((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::remote::{RecordedRequest, RemoteError, StubRemote};

    fn ts(n: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(n).unwrap()
    }

    fn payload(id: &str, created: i64) -> MessagePayload {
        MessagePayload {
            id: id.into(),
            channel_id: "c1".into(),
            author_id: "u1".into(),
            text: format!("text-{id}"),
            created_at: ts(created),
            updated_at: None,
            parent_id: None,
            extra: Default::default(),
        }
    }

    fn loader(page_size: usize) -> (MessageListLoader, Arc<StubRemote>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(StubRemote::new());
        let loader = MessageListLoader::new(
            ChannelId::from("c1"),
            Arc::clone(&store) as Arc<dyn LocalStore>,
            Arc::clone(&remote) as Arc<dyn RemoteUpdater>,
            page_size,
        );
        (loader, remote, store)
    }

    #[tokio::test]
    async fn previous_without_any_anchor_fails() {
        let (loader, _remote, _store) = loader(25);
        let err = loader.load_previous(None, None).await.unwrap_err();
        assert!(matches!(err, ClientError::ChannelEmptyMessages));
    }

    #[tokio::test]
    async fn previous_uses_live_boundary_as_cursor() {
        let (loader, remote, _store) = loader(25);
        remote.enqueue_messages(Ok(vec![payload("m1", 100)]));
        loader.load_latest(Some(1)).await.unwrap();
        assert!(!loader.has_loaded_all_previous());

        // Next older page; the stub answers empty.
        loader.load_previous(None, Some(1)).await.unwrap();

        let requests = remote.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1],
            RecordedRequest::Messages {
                channel: ChannelId::from("c1"),
                page: Pagination::new(1, Some(PageParam::LessThan("m1".into()))),
            }
        );
        // The empty answer exhausted the previous direction.
        assert!(loader.has_loaded_all_previous());
    }

    #[tokio::test]
    async fn short_page_sets_exhaustion_after_one_call() {
        let (loader, remote, _store) = loader(3);
        remote.enqueue_messages(Ok(vec![payload("m1", 10), payload("m2", 20)]));

        loader.load_latest(None).await.unwrap();
        assert!(loader.has_loaded_all_previous());

        // Exhausted direction: silent no-op, no request issued.
        loader.load_previous(None, None).await.unwrap();
        assert_eq!(remote.requests().len(), 1);
    }

    #[tokio::test]
    async fn explicit_anchor_takes_precedence() {
        let (loader, remote, _store) = loader(25);
        remote.enqueue_messages(Ok(vec![payload("m5", 50)]));
        loader.load_latest(Some(1)).await.unwrap();

        remote.enqueue_messages(Ok(vec![payload("m2", 20)]));
        loader
            .load_previous(Some(MessageId::from("m3")), Some(1))
            .await
            .unwrap();

        let requests = remote.requests();
        assert_eq!(
            requests[1],
            RecordedRequest::Messages {
                channel: ChannelId::from("c1"),
                page: Pagination::new(1, Some(PageParam::LessThan("m3".into()))),
            }
        );
    }

    #[tokio::test]
    async fn pages_fold_into_one_ascending_timeline() {
        let (loader, remote, _store) = loader(2);
        remote.enqueue_messages(Ok(vec![payload("m4", 40), payload("m3", 30)]));
        loader.load_latest(None).await.unwrap();

        remote.enqueue_messages(Ok(vec![payload("m2", 20), payload("m1", 10)]));
        loader.load_previous(None, None).await.unwrap();

        let ids: Vec<String> = loader.messages().iter().map(|m| m.id.0.clone()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3", "m4"]);
        assert!(!loader.has_loaded_all_previous());
    }

    #[tokio::test]
    async fn around_resets_live_state_to_the_window() {
        let (loader, remote, store) = loader(2);
        remote.enqueue_messages(Ok(vec![payload("m9", 90), payload("m8", 80)]));
        loader.load_latest(None).await.unwrap();
        assert_eq!(loader.messages().len(), 2);

        // Locally known message inside the jumped-to window; the canonical
        // re-read picks it up even though the page did not contain it.
        store
            .write(StoreTransaction::new().upsert_messages(vec![
                Message {
                    id: MessageId::from("m2b"),
                    channel_id: ChannelId::from("c1"),
                    author: crate::model::UserId::from("u2"),
                    text: "local".into(),
                    created_at: ts(25),
                    updated_at: ts(25),
                    parent_id: None,
                    extra: Default::default(),
                },
            ]))
            .await
            .unwrap();

        remote.enqueue_messages(Ok(vec![payload("m2", 20), payload("m3", 30)]));
        loader
            .load_around(MessageId::from("m2"), None)
            .await
            .unwrap();

        let ids: Vec<String> = loader.messages().iter().map(|m| m.id.0.clone()).collect();
        // Old tail (m8, m9) is gone: a jump replaces, never extends.
        assert_eq!(ids, vec!["m2", "m2b", "m3"]);
        assert!(!loader.has_loaded_all_previous());
        assert!(!loader.has_loaded_all_next());
    }

    #[tokio::test]
    async fn remote_errors_pass_through_unchanged() {
        let (loader, remote, _store) = loader(25);
        remote.enqueue_messages(Err(RemoteError::Api {
            status: 429,
            message: "rate limited".into(),
        }));
        let err = loader.load_latest(None).await.unwrap_err();
        match err {
            ClientError::Remote(RemoteError::Api { status, .. }) => assert_eq!(status, 429),
            other => panic!("expected remote passthrough, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_first_page_reopens_an_exhausted_direction() {
        let (loader, remote, _store) = loader(2);
        remote.enqueue_messages(Ok(vec![payload("m1", 10)]));
        loader.load_latest(None).await.unwrap();
        assert!(loader.has_loaded_all_previous());

        remote.enqueue_messages(Ok(vec![payload("m3", 30), payload("m2", 20)]));
        loader.load_latest(None).await.unwrap();
        assert!(!loader.has_loaded_all_previous());
    }
}
