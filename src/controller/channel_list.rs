//! Controller for one channel-list query.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{EntityKind, LocalStore};
use crate::error::ClientError;
use crate::loader::ChannelListLoader;
use crate::model::{Channel, ChannelListQuery};
use crate::observer::ListObserver;
use crate::remote::RemoteUpdater;

use super::{ActiveSet, ControllerState, EventStream, ListControllerDelegate, Listeners};

pub struct ChannelListController {
    inner: Arc<Inner>,
}

struct Inner {
    query: ChannelListQuery,
    store: Arc<dyn LocalStore>,
    loader: ChannelListLoader,
    observer: ListObserver<Channel>,
    state: Mutex<ControllerState>,
    listeners: Arc<Listeners<Channel>>,
    active: Arc<ActiveSet>,
}

impl ChannelListController {
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteUpdater>,
        query: ChannelListQuery,
        active: Arc<ActiveSet>,
    ) -> Self {
        let listeners = Arc::new(Listeners::new());

        let observer = ListObserver::new(EntityKind::Channel, |c: &Channel| c.id.0.clone(), {
            let store = Arc::clone(&store);
            let query = query.clone();
            move || store.channels(&query, None)
        });
        let sink = Arc::clone(&listeners);
        observer.set_on_batch(move |batch| sink.emit_items(batch));

        let loader = ChannelListLoader::new(query.clone(), Arc::clone(&store), remote);

        Self {
            inner: Arc::new(Inner {
                query,
                store,
                loader,
                observer,
                state: Mutex::new(ControllerState::Initialized),
                listeners,
                active,
            }),
        }
    }

    /// Drive the controller through its states: start local observation,
    /// then fetch the first remote page.
    pub async fn synchronize(&self) -> Result<(), ClientError> {
        if let Err(err) = self.inner.observer.start(self.inner.store.as_ref()) {
            self.set_state(ControllerState::LocalDataFetchFailed);
            return Err(err);
        }
        self.set_state(ControllerState::LocalDataFetched);
        self.inner.active.register_query(self.inner.query.clone());

        match self.inner.loader.refresh().await {
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

    pub fn query(&self) -> &ChannelListQuery {
        &self.inner.query
    }

    /// The live ordered channel list.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.loader.channels()
    }

    pub fn has_loaded_all(&self) -> bool {
        self.inner.loader.has_loaded_all()
    }

    pub async fn load_next_page(&self, limit: Option<usize>) -> Result<Vec<Channel>, ClientError> {
        self.inner.loader.load_next_page(limit).await
    }

    pub fn add_delegate(&self, delegate: Arc<dyn ListControllerDelegate<Channel>>) {
        self.inner.listeners.add_delegate(delegate);
    }

    pub fn events(&self) -> EventStream<Channel> {
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
        debug!(query = %self.inner.query.cache_key(), ?state, "channel list state changed");
        self.inner.listeners.emit_state(state);
    }
}
