use std::time::Duration;

use crate::cache::EntityKind;

const DEFAULT_MESSAGE_PAGE_SIZE: usize = 25;
const DEFAULT_CHANNEL_PAGE_SIZE: usize = 20;
const DEFAULT_REACTION_PAGE_SIZE: usize = 25;
const DEFAULT_WATCHER_PAGE_SIZE: usize = 30;
const DEFAULT_THREAD_PAGE_SIZE: usize = 20;
const DEFAULT_RECOVERY_STEP_RETRIES: usize = 2;
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Tuning knobs for pagination and recovery. The embedding application owns
/// any external configuration surface; this is a plain value struct.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub message_page_size: usize,
    pub channel_page_size: usize,
    pub reaction_page_size: usize,
    pub watcher_page_size: usize,
    pub thread_page_size: usize,
    /// Retries per recovery step (N retries = N + 1 executions).
    pub recovery_step_retries: usize,
    /// Base delay between retry attempts; grows linearly per attempt.
    pub retry_delay: Duration,
    /// Capacity of the store's change-event channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            message_page_size: DEFAULT_MESSAGE_PAGE_SIZE,
            channel_page_size: DEFAULT_CHANNEL_PAGE_SIZE,
            reaction_page_size: DEFAULT_REACTION_PAGE_SIZE,
            watcher_page_size: DEFAULT_WATCHER_PAGE_SIZE,
            thread_page_size: DEFAULT_THREAD_PAGE_SIZE,
            recovery_step_retries: DEFAULT_RECOVERY_STEP_RETRIES,
            retry_delay: Duration::from_millis(500),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SyncConfig {
    pub fn page_size_for(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Channel => self.channel_page_size,
            EntityKind::Message => self.message_page_size,
            EntityKind::Reaction => self.reaction_page_size,
            EntityKind::Watcher => self.watcher_page_size,
            EntityKind::Thread => self.thread_page_size,
        }
    }
}
