//! Assembly facade.
//!
//! A [`ChatClient`] owns the collaborator handles and the active-set shared
//! by controllers and recovery, and hands out ready-wired controllers and
//! loaders for one authenticated user.

use std::sync::Arc;

use crate::cache::LocalStore;
use crate::config::SyncConfig;
use crate::controller::{ActiveSet, ChannelController, ChannelListController};
use crate::loader::{ReactionListLoader, ThreadListLoader};
use crate::model::{ChannelId, ChannelListQuery, MessageId, UserId};
use crate::recovery::RecoveryCoordinator;
use crate::remote::RemoteUpdater;

pub struct ChatClient {
    user: UserId,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteUpdater>,
    config: SyncConfig,
    active: Arc<ActiveSet>,
}

impl ChatClient {
    pub fn new(
        user: UserId,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteUpdater>,
        config: SyncConfig,
    ) -> Self {
        Self {
            user,
            store,
            remote,
            config,
            active: Arc::new(ActiveSet::new()),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteUpdater> {
        &self.remote
    }

    pub fn channel_list_controller(&self, query: ChannelListQuery) -> ChannelListController {
        ChannelListController::new(
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            query,
            Arc::clone(&self.active),
        )
    }

    pub fn channel_controller(&self, channel: ChannelId) -> ChannelController {
        ChannelController::new(
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            channel,
            &self.config,
            Arc::clone(&self.active),
        )
    }

    pub fn thread_list_loader(&self) -> ThreadListLoader {
        ThreadListLoader::new(
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            self.config.thread_page_size,
        )
    }

    pub fn reaction_loader(&self, message: MessageId) -> ReactionListLoader {
        ReactionListLoader::new(
            message,
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            self.config.reaction_page_size,
        )
    }

    pub fn recovery_coordinator(&self) -> RecoveryCoordinator {
        RecoveryCoordinator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            Arc::clone(&self.active),
            self.user.clone(),
            self.config.clone(),
        )
    }
}
