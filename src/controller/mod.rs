//! Controller surface.
//!
//! Controllers bind an observer and a loader for one list and expose the
//! in-process API boundary: a delegate callback pair plus an equivalent
//! stream publisher pair. Consumers poll or observe the controller state;
//! no exception-based control flow crosses this boundary.

mod channel;
mod channel_list;

pub use channel::ChannelController;
pub use channel_list::ChannelListController;

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::model::{ChannelId, ChannelListQuery};
use crate::observer::ListChangeBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initialized,
    LocalDataFetched,
    RemoteDataFetched,
    LocalDataFetchFailed,
    RemoteDataFetchFailed,
}

pub trait ListControllerDelegate<T>: Send + Sync {
    fn did_change_items(&self, batch: &ListChangeBatch<T>);

    fn did_change_state(&self, state: ControllerState);
}

#[derive(Debug, Clone)]
pub enum ListEvent<T> {
    Items(ListChangeBatch<T>),
    State(ControllerState),
}

/// Stream twin of the delegate surface.
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<ListEvent<T>>,
}

impl<T> Stream for EventStream<T> {
    type Item = ListEvent<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Fan-out to registered delegates and open streams. Dead streams are pruned
/// on emit.
pub(crate) struct Listeners<T> {
    delegates: Mutex<Vec<Arc<dyn ListControllerDelegate<T>>>>,
    streams: Mutex<Vec<mpsc::UnboundedSender<ListEvent<T>>>>,
}

impl<T: Clone> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            delegates: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_delegate(&self, delegate: Arc<dyn ListControllerDelegate<T>>) {
        self.delegates.lock().push(delegate);
    }

    pub(crate) fn stream(&self) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().push(tx);
        EventStream { rx }
    }

    pub(crate) fn emit_items(&self, batch: ListChangeBatch<T>) {
        for delegate in self.delegates.lock().iter() {
            delegate.did_change_items(&batch);
        }
        self.streams
            .lock()
            .retain(|tx| tx.send(ListEvent::Items(batch.clone())).is_ok());
    }

    pub(crate) fn emit_state(&self, state: ControllerState) {
        for delegate in self.delegates.lock().iter() {
            delegate.did_change_state(state);
        }
        self.streams
            .lock()
            .retain(|tx| tx.send(ListEvent::State(state)).is_ok());
    }
}

/// Channels currently on screen and channel-list queries currently bound to
/// a controller. The recovery sequence walks this set when it re-watches and
/// refetches after a reconnect.
#[derive(Default)]
pub struct ActiveSet {
    channels: Mutex<BTreeSet<ChannelId>>,
    queries: Mutex<Vec<ChannelListQuery>>,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_channel(&self, channel: ChannelId) {
        self.channels.lock().insert(channel);
    }

    pub fn unregister_channel(&self, channel: &ChannelId) {
        self.channels.lock().remove(channel);
    }

    pub fn register_query(&self, query: ChannelListQuery) {
        let mut queries = self.queries.lock();
        if !queries.iter().any(|q| q.cache_key() == query.cache_key()) {
            queries.push(query);
        }
    }

    pub fn watched_channels(&self) -> Vec<ChannelId> {
        self.channels.lock().iter().cloned().collect()
    }

    pub fn queries(&self) -> Vec<ChannelListQuery> {
        self.queries.lock().clone()
    }
}
