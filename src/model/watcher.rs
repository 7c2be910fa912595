use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::UserId;

/// A user currently watching a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watcher {
    pub user: UserId,
    pub name: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_active_at: Option<OffsetDateTime>,
    pub online: bool,
}

impl Watcher {
    /// Canonical watcher ordering, matching the local fetch: user id ascending.
    pub fn compare_user(a: &Watcher, b: &Watcher) -> Ordering {
        a.user.cmp(&b.user)
    }
}
