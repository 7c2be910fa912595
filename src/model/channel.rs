use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::ChannelId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    pub member_count: u32,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelSortKey {
    LastMessageAt,
    CreatedAt,
    MemberCount,
}

/// Caller-declared ordering for a channel list. Ties fall back to the channel
/// id so the order is total and stable across re-reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSort {
    pub key: ChannelSortKey,
    pub ascending: bool,
}

impl Default for ChannelSort {
    fn default() -> Self {
        Self {
            key: ChannelSortKey::LastMessageAt,
            ascending: false,
        }
    }
}

impl ChannelSort {
    pub fn compare(&self, a: &Channel, b: &Channel) -> Ordering {
        let ord = match self.key {
            ChannelSortKey::LastMessageAt => a.last_message_at.cmp(&b.last_message_at),
            ChannelSortKey::CreatedAt => a.created_at.cmp(&b.created_at),
            ChannelSortKey::MemberCount => a.member_count.cmp(&b.member_count),
        };
        let ord = if self.ascending { ord } else { ord.reverse() };
        ord.then_with(|| a.id.cmp(&b.id))
    }
}

/// Identifies one channel-list view: an opaque server-side filter plus the
/// declared sort. Two queries with the same [`cache_key`](Self::cache_key)
/// name the same list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelListQuery {
    pub filter: serde_json::Value,
    pub sort: ChannelSort,
    pub page_size: usize,
}

impl ChannelListQuery {
    pub fn new(filter: serde_json::Value, sort: ChannelSort, page_size: usize) -> Self {
        Self {
            filter,
            sort,
            page_size,
        }
    }

    pub fn cache_key(&self) -> String {
        format!("{}|{:?}|{}", self.filter, self.sort.key, self.ascending_flag())
    }

    fn ascending_flag(&self) -> char {
        if self.sort.ascending { 'a' } else { 'd' }
    }
}
