//! Domain items held in live state and in the local cache.
//!
//! Items are plain value types: once converted from a wire payload or a
//! stored row they are never mutated in place. Loaders and observers replace
//! whole items through the merge fold instead.

mod channel;
mod message;
mod reaction;
mod thread;
mod watcher;

pub use channel::{Channel, ChannelListQuery, ChannelSort, ChannelSortKey};
pub use message::Message;
pub use reaction::Reaction;
pub use thread::Thread;
pub use watcher::Watcher;

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_owned())
            }
        }
    };
}

string_id!(
    /// Server-assigned channel identifier.
    ChannelId
);
string_id!(
    /// Server-assigned message identifier.
    MessageId
);
string_id!(UserId);
string_id!(
    /// Thread identifier; equals the id of the thread's parent message.
    ThreadId
);
