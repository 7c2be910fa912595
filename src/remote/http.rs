//! Thin HTTP/JSON implementation of the remote updater.
//!
//! Endpoint layout mirrors the hosted chat API: list endpoints take `limit`
//! plus one anchor parameter, the thread endpoint returns an explicit
//! continuation cursor. Auth token injection is the embedding application's
//! job; this client only attaches an optional static api key.

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

use crate::model::{ChannelId, ChannelListQuery, MessageId};
use crate::protocol::{PageParam, PageResponse, Pagination};

use super::payload::{
    ChannelPayload, MessagePayload, ReactionPayload, ThreadPayload, WatcherPayload,
};
use super::{RemoteError, RemoteUpdater};

pub struct HttpRemote {
    base: Url,
    http: reqwest::Client,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ChannelsEnvelope {
    channels: Vec<ChannelPayload>,
}

#[derive(Deserialize)]
struct MessagesEnvelope {
    messages: Vec<MessagePayload>,
}

#[derive(Deserialize)]
struct ReactionsEnvelope {
    reactions: Vec<ReactionPayload>,
}

#[derive(Deserialize)]
struct WatchersEnvelope {
    watchers: Vec<WatcherPayload>,
}

#[derive(Deserialize)]
struct ThreadsEnvelope {
    threads: Vec<ThreadPayload>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct SyncEnvelope {
    channel_ids: Vec<String>,
}

impl HttpRemote {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base
            .join(path)
            .map_err(|err| RemoteError::Transport(format!("invalid endpoint {path}: {err}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        params: &[(String, String)],
    ) -> Result<T, RemoteError> {
        let mut request = self.http.get(url).query(params);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        decode(response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        body: &serde_json::Value,
    ) -> Result<T, RemoteError> {
        let mut request = self.http.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        decode(response).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(RemoteError::Api {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|err| RemoteError::Payload(err.to_string()))
}

fn page_params(page: &Pagination) -> Vec<(String, String)> {
    let mut params = vec![("limit".to_owned(), page.page_size().to_string())];
    match page.param() {
        Some(PageParam::LessThan(anchor)) => params.push(("id_lt".to_owned(), anchor.clone())),
        Some(PageParam::GreaterThan(anchor)) => params.push(("id_gt".to_owned(), anchor.clone())),
        Some(PageParam::Around(anchor)) => params.push(("id_around".to_owned(), anchor.clone())),
        Some(PageParam::Offset(offset)) => params.push(("offset".to_owned(), offset.to_string())),
        None => {}
    }
    params
}

#[async_trait]
impl RemoteUpdater for HttpRemote {
    async fn fetch_channels_page(
        &self,
        query: &ChannelListQuery,
        page: &Pagination,
    ) -> Result<Vec<ChannelPayload>, RemoteError> {
        let mut params = page_params(page);
        params.push(("filter".to_owned(), query.filter.to_string()));
        params.push(("sort".to_owned(), format!("{:?}", query.sort.key)));
        params.push((
            "direction".to_owned(),
            if query.sort.ascending { "asc" } else { "desc" }.to_owned(),
        ));
        let envelope: ChannelsEnvelope = self.get_json(self.endpoint("channels")?, &params).await?;
        Ok(envelope.channels)
    }

    async fn fetch_messages_page(
        &self,
        channel: &ChannelId,
        page: &Pagination,
    ) -> Result<Vec<MessagePayload>, RemoteError> {
        let url = self.endpoint(&format!("channels/{channel}/messages"))?;
        let envelope: MessagesEnvelope = self.get_json(url, &page_params(page)).await?;
        Ok(envelope.messages)
    }

    async fn fetch_reactions_page(
        &self,
        message: &MessageId,
        page: &Pagination,
    ) -> Result<Vec<ReactionPayload>, RemoteError> {
        let url = self.endpoint(&format!("messages/{message}/reactions"))?;
        let envelope: ReactionsEnvelope = self.get_json(url, &page_params(page)).await?;
        Ok(envelope.reactions)
    }

    async fn fetch_watchers_page(
        &self,
        channel: &ChannelId,
        page: &Pagination,
    ) -> Result<Vec<WatcherPayload>, RemoteError> {
        let url = self.endpoint(&format!("channels/{channel}/watchers"))?;
        let envelope: WatchersEnvelope = self.get_json(url, &page_params(page)).await?;
        Ok(envelope.watchers)
    }

    async fn fetch_threads_page(
        &self,
        page: &Pagination,
    ) -> Result<PageResponse<ThreadPayload>, RemoteError> {
        let mut params = vec![("limit".to_owned(), page.page_size().to_string())];
        if let Some(PageParam::LessThan(cursor)) = page.param() {
            params.push(("next".to_owned(), cursor.clone()));
        }
        let envelope: ThreadsEnvelope = self.get_json(self.endpoint("threads")?, &params).await?;
        Ok(PageResponse {
            items: envelope.threads,
            next_cursor: envelope.next,
        })
    }

    async fn sync_missed_events(
        &self,
        since: OffsetDateTime,
        channels: &[ChannelId],
    ) -> Result<Vec<ChannelId>, RemoteError> {
        let since = since
            .format(&Rfc3339)
            .map_err(|err| RemoteError::Transport(format!("unformattable timestamp: {err}")))?;
        let body = serde_json::json!({
            "last_sync_at": since,
            "channel_ids": channels.iter().map(|id| id.as_str()).collect::<Vec<_>>(),
        });
        let envelope: SyncEnvelope = self.post_json(self.endpoint("sync")?, &body).await?;
        Ok(envelope.channel_ids.into_iter().map(ChannelId).collect())
    }

    async fn watch_channel(&self, channel: &ChannelId) -> Result<(), RemoteError> {
        let url = self.endpoint(&format!("channels/{channel}/watch"))?;
        let _: serde_json::Value = self.post_json(url, &serde_json::json!({})).await?;
        Ok(())
    }
}
