//! Controller for one channel: message timeline plus watchers.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{EntityKind, LocalStore, MessageQuery};
use crate::config::SyncConfig;
use crate::error::ClientError;
use crate::loader::{MessageListLoader, WatcherListLoader};
use crate::model::{ChannelId, Message, MessageId, Watcher};
use crate::observer::ListObserver;
use crate::remote::RemoteUpdater;

use super::{ActiveSet, ControllerState, EventStream, ListControllerDelegate, Listeners};

pub struct ChannelController {
    inner: Arc<Inner>,
}

struct Inner {
    channel: ChannelId,
    store: Arc<dyn LocalStore>,
    messages: MessageListLoader,
    watchers: WatcherListLoader,
    observer: ListObserver<Message>,
    state: Mutex<ControllerState>,
    listeners: Arc<Listeners<Message>>,
    active: Arc<ActiveSet>,
}

impl ChannelController {
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteUpdater>,
        channel: ChannelId,
        config: &SyncConfig,
        active: Arc<ActiveSet>,
    ) -> Self {
        let listeners = Arc::new(Listeners::new());

        let observer = ListObserver::new(EntityKind::Message, |m: &Message| m.id.0.clone(), {
            let store = Arc::clone(&store);
            let channel = channel.clone();
            move || store.messages(&MessageQuery::channel(channel.clone()))
        });
        let sink = Arc::clone(&listeners);
        observer.set_on_batch(move |batch| sink.emit_items(batch));

        let messages = MessageListLoader::new(
            channel.clone(),
            Arc::clone(&store),
            Arc::clone(&remote),
            config.message_page_size,
        );
        let watchers = WatcherListLoader::new(
            channel.clone(),
            Arc::clone(&store),
            remote,
            config.watcher_page_size,
        );

        Self {
            inner: Arc::new(Inner {
                channel,
                store,
                messages,
                watchers,
                observer,
                state: Mutex::new(ControllerState::Initialized),
                listeners,
                active,
            }),
        }
    }

    /// Drive the controller through its states: start local observation,
    /// mark the channel active, then fetch the newest remote page.
    pub async fn synchronize(&self) -> Result<(), ClientError> {
        if let Err(err) = self.inner.observer.start(self.inner.store.as_ref()) {
            self.set_state(ControllerState::LocalDataFetchFailed);
            return Err(err);
        }
        self.set_state(ControllerState::LocalDataFetched);
        self.inner.active.register_channel(self.inner.channel.clone());

        match self.inner.messages.load_latest(None).await {
            Ok(_) => {
                self.set_state(ControllerState::RemoteDataFetched);
                Ok(())
            }
            Err(err) => {
                self.set_state(ControllerState::RemoteDataFetchFailed);
                Err(err)
            }
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.inner.state.lock()
    }

    pub fn channel(&self) -> &ChannelId {
        &self.inner.channel
    }

    /// The live ordered message timeline.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.messages.messages()
    }

    pub fn watchers(&self) -> Vec<Watcher> {
        self.inner.watchers.watchers()
    }

    pub async fn load_previous_messages(
        &self,
        anchor: Option<MessageId>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ClientError> {
        self.inner.messages.load_previous(anchor, limit).await
    }

    pub async fn load_next_messages(
        &self,
        anchor: Option<MessageId>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ClientError> {
        self.inner.messages.load_next(anchor, limit).await
    }

    pub async fn jump_to_message(
        &self,
        anchor: MessageId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ClientError> {
        self.inner.messages.load_around(anchor, limit).await
    }

    pub async fn load_more_watchers(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<Watcher>, ClientError> {
        self.inner.watchers.load_more(limit).await
    }

    pub fn has_loaded_all_previous_messages(&self) -> bool {
        self.inner.messages.has_loaded_all_previous()
    }

    pub fn has_loaded_all_next_messages(&self) -> bool {
        self.inner.messages.has_loaded_all_next()
    }

    pub fn is_loading_previous_messages(&self) -> bool {
        self.inner.messages.is_loading_previous()
    }

    pub fn is_loading_next_messages(&self) -> bool {
        self.inner.messages.is_loading_next()
    }

    pub fn add_delegate(&self, delegate: Arc<dyn ListControllerDelegate<Message>>) {
        self.inner.listeners.add_delegate(delegate);
    }

    pub fn events(&self) -> EventStream<Message> {
        self.inner.listeners.stream()
    }

    fn set_state(&self, state: ControllerState) {
        {
            let mut held = self.inner.state.lock();
            if *held == state {
                return;
            }
            *held = state;
        }
        debug!(channel = %self.inner.channel, ?state, "channel state changed");
        self.inner.listeners.emit_state(state);
    }
}

impl Drop for ChannelController {
    fn drop(&mut self) {
        self.inner.active.unregister_channel(&self.inner.channel);
    }
}
