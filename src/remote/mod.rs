//! Remote updater boundary.
//!
//! The remote side of the sync engine is consumed through one narrow trait.
//! [`HttpRemote`] is the production implementation; [`StubRemote`] is a
//! scripted double for tests. Authentication, token refresh, and transport
//! details beyond plain HTTP belong to the embedding application.

mod http;
pub mod payload;
mod stub;

pub use http::HttpRemote;
pub use stub::{RecordedRequest, StubRemote};

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::model::{ChannelId, ChannelListQuery, MessageId};
use crate::protocol::{PageResponse, Pagination};
use payload::{ChannelPayload, MessagePayload, ReactionPayload, ThreadPayload, WatcherPayload};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("server rejected request: status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed server payload: {0}")]
    Payload(String),
}

#[async_trait]
pub trait RemoteUpdater: Send + Sync {
    async fn fetch_channels_page(
        &self,
        query: &ChannelListQuery,
        page: &Pagination,
    ) -> Result<Vec<ChannelPayload>, RemoteError>;

    async fn fetch_messages_page(
        &self,
        channel: &ChannelId,
        page: &Pagination,
    ) -> Result<Vec<MessagePayload>, RemoteError>;

    async fn fetch_reactions_page(
        &self,
        message: &MessageId,
        page: &Pagination,
    ) -> Result<Vec<ReactionPayload>, RemoteError>;

    async fn fetch_watchers_page(
        &self,
        channel: &ChannelId,
        page: &Pagination,
    ) -> Result<Vec<WatcherPayload>, RemoteError>;

    async fn fetch_threads_page(
        &self,
        page: &Pagination,
    ) -> Result<PageResponse<ThreadPayload>, RemoteError>;

    /// Ask the server for every event missed since `since` across the given
    /// channels. Returns the ids of channels the server replayed events for.
    async fn sync_missed_events(
        &self,
        since: OffsetDateTime,
        channels: &[ChannelId],
    ) -> Result<Vec<ChannelId>, RemoteError>;

    /// (Re)establish a server-side watch on one channel.
    async fn watch_channel(&self, channel: &ChannelId) -> Result<(), RemoteError>;
}
