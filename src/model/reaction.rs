use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{MessageId, UserId};

/// One user's reaction of one kind to a message. A user may leave several
/// reactions on the same message as long as their kinds differ, so the
/// logical identity is the (author, kind) pair, not a single id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    pub author: UserId,
    pub kind: String,
    pub score: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Reaction {
    pub fn same_entity(a: &Reaction, b: &Reaction) -> bool {
        a.author == b.author && a.kind == b.kind
    }

    /// Update time descending, (author, kind) as tie-break.
    pub fn compare_updated_desc(a: &Reaction, b: &Reaction) -> Ordering {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.author.cmp(&b.author))
            .then_with(|| a.kind.cmp(&b.kind))
    }

    pub fn store_key(&self) -> String {
        format!("{}:{}:{}", self.message_id, self.author, self.kind)
    }
}
