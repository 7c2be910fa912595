//! Scripted remote double.
//!
//! Tests (and the end-to-end scenarios under `tests/`) queue responses per
//! endpoint and inspect the exact requests a loader issued. An empty queue
//! answers with an empty page, so exhaustion paths need no scripting.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::model::{ChannelId, ChannelListQuery, MessageId};
use crate::protocol::{PageResponse, Pagination};

use super::payload::{
    ChannelPayload, MessagePayload, ReactionPayload, ThreadPayload, WatcherPayload,
};
use super::{RemoteError, RemoteUpdater};

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedRequest {
    Channels { query_key: String, page: Pagination },
    Messages { channel: ChannelId, page: Pagination },
    Reactions { message: MessageId, page: Pagination },
    Watchers { channel: ChannelId, page: Pagination },
    Threads { page: Pagination },
    Sync { since: OffsetDateTime, channels: Vec<ChannelId> },
    Watch { channel: ChannelId },
}

#[derive(Default)]
struct Script {
    channels: VecDeque<Result<Vec<ChannelPayload>, RemoteError>>,
    messages: VecDeque<Result<Vec<MessagePayload>, RemoteError>>,
    reactions: VecDeque<Result<Vec<ReactionPayload>, RemoteError>>,
    watchers: VecDeque<Result<Vec<WatcherPayload>, RemoteError>>,
    threads: VecDeque<Result<PageResponse<ThreadPayload>, RemoteError>>,
    sync: VecDeque<Result<Vec<ChannelId>, RemoteError>>,
}

#[derive(Default)]
pub struct StubRemote {
    script: Mutex<Script>,
    requests: Mutex<Vec<RecordedRequest>>,
    failing_watches: Mutex<HashSet<ChannelId>>,
}

impl StubRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_channels(&self, response: Result<Vec<ChannelPayload>, RemoteError>) {
        self.script.lock().channels.push_back(response);
    }

    pub fn enqueue_messages(&self, response: Result<Vec<MessagePayload>, RemoteError>) {
        self.script.lock().messages.push_back(response);
    }

    pub fn enqueue_reactions(&self, response: Result<Vec<ReactionPayload>, RemoteError>) {
        self.script.lock().reactions.push_back(response);
    }

    pub fn enqueue_watchers(&self, response: Result<Vec<WatcherPayload>, RemoteError>) {
        self.script.lock().watchers.push_back(response);
    }

    pub fn enqueue_threads(&self, response: Result<PageResponse<ThreadPayload>, RemoteError>) {
        self.script.lock().threads.push_back(response);
    }

    pub fn enqueue_sync(&self, response: Result<Vec<ChannelId>, RemoteError>) {
        self.script.lock().sync.push_back(response);
    }

    /// Make `watch_channel` fail for this channel until cleared.
    pub fn fail_watch(&self, channel: ChannelId) {
        self.failing_watches.lock().insert(channel);
    }

    pub fn clear_watch_failures(&self) {
        self.failing_watches.lock().clear();
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    fn record(&self, request: RecordedRequest) {
        self.requests.lock().push(request);
    }
}

#[async_trait]
impl RemoteUpdater for StubRemote {
    async fn fetch_channels_page(
        &self,
        query: &ChannelListQuery,
        page: &Pagination,
    ) -> Result<Vec<ChannelPayload>, RemoteError> {
        self.record(RecordedRequest::Channels {
            query_key: query.cache_key(),
            page: page.clone(),
        });
        self.script
            .lock()
            .channels
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_messages_page(
        &self,
        channel: &ChannelId,
        page: &Pagination,
    ) -> Result<Vec<MessagePayload>, RemoteError> {
        self.record(RecordedRequest::Messages {
            channel: channel.clone(),
            page: page.clone(),
        });
        self.script
            .lock()
            .messages
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_reactions_page(
        &self,
        message: &MessageId,
        page: &Pagination,
    ) -> Result<Vec<ReactionPayload>, RemoteError> {
        self.record(RecordedRequest::Reactions {
            message: message.clone(),
            page: page.clone(),
        });
        self.script
            .lock()
            .reactions
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_watchers_page(
        &self,
        channel: &ChannelId,
        page: &Pagination,
    ) -> Result<Vec<WatcherPayload>, RemoteError> {
        self.record(RecordedRequest::Watchers {
            channel: channel.clone(),
            page: page.clone(),
        });
        self.script
            .lock()
            .watchers
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_threads_page(
        &self,
        page: &Pagination,
    ) -> Result<PageResponse<ThreadPayload>, RemoteError> {
        self.record(RecordedRequest::Threads { page: page.clone() });
        self.script.lock().threads.pop_front().unwrap_or_else(|| {
            Ok(PageResponse {
                items: Vec::new(),
                next_cursor: None,
            })
        })
    }

    async fn sync_missed_events(
        &self,
        since: OffsetDateTime,
        channels: &[ChannelId],
    ) -> Result<Vec<ChannelId>, RemoteError> {
        self.record(RecordedRequest::Sync {
            since,
            channels: channels.to_vec(),
        });
        self.script
            .lock()
            .sync
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn watch_channel(&self, channel: &ChannelId) -> Result<(), RemoteError> {
        self.record(RecordedRequest::Watch {
            channel: channel.clone(),
        });
        if self.failing_watches.lock().contains(channel) {
            return Err(RemoteError::Transport(format!(
                "scripted watch failure for {channel}"
            )));
        }
        Ok(())
    }
}
