//! Reaction pagination for one message.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::cache::{LocalStore, ReactionQuery, StoreTransaction};
use crate::error::ClientError;
use crate::merge::merge_sorted;
use crate::model::{MessageId, Reaction};
use crate::protocol::{PageParam, Pagination, short_page};
use crate::remote::RemoteUpdater;
use crate::remote::payload::{ReactionPayload, collect_valid};

use super::LoadGuard;

/// Live reaction list for one message, update time descending. Identity is
/// the (author, kind) pair: a fetched reaction replaces the same author's
/// reaction of the same kind, never stacks next to it.
pub struct ReactionListLoader {
    message: MessageId,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteUpdater>,
    page_size: usize,
    live: RwLock<Vec<Reaction>>,
    loading: AtomicBool,
    loaded_all: AtomicBool,
}

impl ReactionListLoader {
    pub fn new(
        message: MessageId,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteUpdater>,
        page_size: usize,
    ) -> Self {
        Self {
            message,
            store,
            remote,
            page_size,
            live: RwLock::new(Vec::new()),
            loading: AtomicBool::new(false),
            loaded_all: AtomicBool::new(false),
        }
    }

    pub fn reactions(&self) -> Vec<Reaction> {
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
    pub async fn load_more(&self, limit: Option<usize>) -> Result<Vec<Reaction>, ClientError> {
        if self.loaded_all.load(Ordering::Acquire) {
            trace!(message = %self.message, "reactions exhausted; no-op");
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
            .fetch_reactions_page(&self.message, &Pagination::new(size, param))
            .await?;
        let received = payloads.len();
        let fetched = collect_valid(payloads, ReactionPayload::into_reaction, "reaction");

        if !fetched.is_empty() {
            self.store
                .write(StoreTransaction::new().upsert_reactions(fetched.clone()))
                .await?;
            let rows = self.store.reactions(&ReactionQuery {
                message: self.message.clone(),
                offset: 0,
                limit: Some(offset + fetched.len()),
            })?;
            let canonical: Vec<Reaction> = rows.into_iter().map(|r| r.value).collect();
            let mut live = self.live.write();
            *live = merge_sorted(
                &live,
                &canonical,
                Reaction::compare_updated_desc,
                Reaction::same_entity,
            );
        }
        if short_page(received, size) {
            self.loaded_all.store(true, Ordering::Release);
        }
        debug!(message = %self.message, offset, received, "loaded reaction page");
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::remote::StubRemote;
    use time::OffsetDateTime;

    fn ts(n: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(n).unwrap()
    }

    fn payload(author: &str, kind: &str, updated: i64) -> ReactionPayload {
        ReactionPayload {
            message_id: "m1".into(),
            author_id: author.into(),
            kind: kind.into(),
            score: 1,
            created_at: ts(updated),
            updated_at: Some(ts(updated)),
        }
    }

    fn loader(page_size: usize) -> (ReactionListLoader, Arc<StubRemote>) {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(StubRemote::new());
        let loader = ReactionListLoader::new(
            MessageId::from("m1"),
            store as Arc<dyn LocalStore>,
            Arc::clone(&remote) as Arc<dyn RemoteUpdater>,
            page_size,
        );
        (loader, remote)
    }

    #[tokio::test]
    async fn author_kind_identity_replaces_instead_of_stacking() {
        let (loader, remote) = loader(2);
        remote.enqueue_reactions(Ok(vec![payload("u1", "like", 10), payload("u2", "like", 20)]));
        loader.load_more(None).await.unwrap();

        // Same author and kind, newer update time: replaces the old row.
        remote.enqueue_reactions(Ok(vec![payload("u1", "like", 30), payload("u1", "wow", 25)]));
        loader.load_more(None).await.unwrap();

        let reactions = loader.reactions();
        assert_eq!(reactions.len(), 3);
        let u1_likes: Vec<&Reaction> = reactions
            .iter()
            .filter(|r| r.author.as_str() == "u1" && r.kind == "like")
            .collect();
        assert_eq!(u1_likes.len(), 1);
        assert_eq!(u1_likes[0].updated_at, ts(30));
        // Ordered by update time descending.
        assert!(reactions.windows(2).all(|w| w[0].updated_at >= w[1].updated_at));
    }

    #[tokio::test]
    async fn short_page_exhausts() {
        let (loader, remote) = loader(3);
        remote.enqueue_reactions(Ok(vec![payload("u1", "like", 10)]));
        loader.load_more(None).await.unwrap();
        assert!(loader.has_loaded_all());

        loader.load_more(None).await.unwrap();
        assert_eq!(remote.requests().len(), 1);
    }
}
