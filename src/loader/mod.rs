//! Paginated loaders.
//!
//! Every loader follows the same round trip: build a page request from its
//! current boundary state, fetch through the remote updater, persist the raw
//! page to the local store, re-read the canonical slice, and fold it into
//! live state through the merge engine. Loaders are the sole writers of
//! their own live state; per-direction in-flight guards make a duplicate
//! call a silent no-op rather than an error.

mod channels;
mod messages;
mod reactions;
mod threads;
mod watchers;

pub use channels::ChannelListLoader;
pub use messages::MessageListLoader;
pub use reactions::ReactionListLoader;
pub use threads::ThreadListLoader;
pub use watchers::WatcherListLoader;

use std::sync::atomic::{AtomicBool, Ordering};

/// Clears the in-flight flag when the load attempt ends, on every exit path.
pub(crate) struct LoadGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> LoadGuard<'a> {
    /// `None` when a load in this direction is already running.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
