// Consumption layer: one observable chat per consumer

use crate::cache::PrefetchReport;
use crate::models::{sort_messages, Chat, Message};

pub mod chat_view;

pub use chat_view::ChatViewModel;

/// What a consumer renders
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatViewState {
    /// The selected chat, confirmed messages only
    pub chat: Option<Chat>,
    /// True while `chat` comes from the local cache and no live snapshot has arrived
    pub from_cache: bool,
    /// Set once the first live snapshot has been applied and its media prefetched
    pub initialized: bool,
    /// Reason the live feed stopped, if it did
    pub unavailable: Option<String>,
    /// Optimistic messages not yet confirmed by the store
    pub pending: Vec<Message>,
    pub prefetch: Option<PrefetchReport>,
}

impl ChatViewState {
    /// Confirmed messages in server order, followed by pending ones
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = self
            .chat
            .as_ref()
            .map(|chat| chat.messages.clone())
            .unwrap_or_default();
        sort_messages(&mut messages);
        messages.extend(self.pending.iter().cloned());
        messages
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat.as_ref().map(|chat| chat.id.as_str())
    }
}
