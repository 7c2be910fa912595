//! Wire payloads and validating conversion into domain items.
//!
//! Conversion is total: a payload that cannot name a real entity converts to
//! `None` and the caller drops it with a warning. A bad record never blocks
//! the rest of its page.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::model::{
    Channel, ChannelId, Message, MessageId, Reaction, Thread, ThreadId, UserId, Watcher,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub member_count: u32,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChannelPayload {
    pub fn into_channel(self) -> Option<Channel> {
        if self.id.is_empty() {
            return None;
        }
        Some(Channel {
            id: ChannelId(self.id),
            name: self.name,
            created_at: self.created_at,
            last_message_at: self.last_message_at,
            member_count: self.member_count,
            extra: self.extra,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessagePayload {
    pub fn into_message(self) -> Option<Message> {
        if self.id.is_empty() || self.channel_id.is_empty() || self.author_id.is_empty() {
            return None;
        }
        Some(Message {
            id: MessageId(self.id),
            channel_id: ChannelId(self.channel_id),
            author: UserId(self.author_id),
            text: self.text,
            created_at: self.created_at,
            updated_at: self.updated_at.unwrap_or(self.created_at),
            parent_id: self.parent_id.filter(|p| !p.is_empty()).map(MessageId),
            extra: self.extra,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub message_id: String,
    pub author_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_score")]
    pub score: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

fn default_score() -> u32 {
    1
}

impl ReactionPayload {
    pub fn into_reaction(self) -> Option<Reaction> {
        if self.message_id.is_empty() || self.author_id.is_empty() || self.kind.is_empty() {
            return None;
        }
        Some(Reaction {
            message_id: MessageId(self.message_id),
            author: UserId(self.author_id),
            kind: self.kind,
            score: self.score,
            created_at: self.created_at,
            updated_at: self.updated_at.unwrap_or(self.created_at),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherPayload {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_active_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub online: bool,
}

impl WatcherPayload {
    pub fn into_watcher(self) -> Option<Watcher> {
        if self.user_id.is_empty() {
            return None;
        }
        Some(Watcher {
            user: UserId(self.user_id),
            name: self.name,
            last_active_at: self.last_active_at,
            online: self.online,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadPayload {
    pub parent_message_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub reply_count: u32,
    #[serde(default)]
    pub participant_count: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_reply_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ThreadPayload {
    pub fn into_thread(self) -> Option<Thread> {
        if self.parent_message_id.is_empty() || self.channel_id.is_empty() {
            return None;
        }
        Some(Thread {
            id: ThreadId(self.parent_message_id),
            channel_id: ChannelId(self.channel_id),
            reply_count: self.reply_count,
            participant_count: self.participant_count,
            last_reply_at: self.last_reply_at,
            created_at: self.created_at,
        })
    }
}

/// Convert a page of payloads, dropping each malformed record with a
/// warning.
pub fn collect_valid<P, T>(
    payloads: Vec<P>,
    convert: impl Fn(P) -> Option<T>,
    entity: &'static str,
) -> Vec<T> {
    let total = payloads.len();
    let valid: Vec<T> = payloads.into_iter().filter_map(convert).collect();
    if valid.len() < total {
        warn!(entity, dropped = total - valid.len(), "dropped malformed payloads");
    }
    valid
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(n: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(n).unwrap()
    }

    #[test]
    fn malformed_payloads_are_dropped_not_fatal() {
        let payloads = vec![
            MessagePayload {
                id: "m1".into(),
                channel_id: "c1".into(),
                author_id: "u1".into(),
                text: "ok".into(),
                created_at: ts(1),
                updated_at: None,
                parent_id: None,
                extra: Default::default(),
            },
            MessagePayload {
                id: "".into(),
                channel_id: "c1".into(),
                author_id: "u1".into(),
                text: "missing id".into(),
                created_at: ts(2),
                updated_at: None,
                parent_id: None,
                extra: Default::default(),
            },
        ];
        let messages = collect_valid(payloads, MessagePayload::into_message, "message");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id.as_str(), "m1");
        // Missing updated_at falls back to creation time.
        assert_eq!(messages[0].updated_at, messages[0].created_at);
    }

    #[test]
    fn reaction_requires_author_and_kind() {
        let payload = ReactionPayload {
            message_id: "m1".into(),
            author_id: "u1".into(),
            kind: "".into(),
            score: 1,
            created_at: ts(1),
            updated_at: None,
        };
        assert!(payload.into_reaction().is_none());
    }
}
