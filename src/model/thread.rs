use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{ChannelId, ThreadId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub channel_id: ChannelId,
    pub reply_count: u32,
    pub participant_count: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_reply_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Thread {
    /// Last reply time descending; threads with no replies sort last.
    pub fn compare_last_reply_desc(a: &Thread, b: &Thread) -> Ordering {
        b.last_reply_at
            .cmp(&a.last_reply_at)
            .then_with(|| a.id.cmp(&b.id))
    }
}
