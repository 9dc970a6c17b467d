// Live chat feeds: one remote subscription per feed, fanned out to observers

use std::sync::Arc;

use crate::models::Chat;
use crate::store::{Query, SortOrder, CHATS};

pub mod fingerprint;
pub mod subscription;

pub use fingerprint::{chat_fingerprint, chats_fingerprint};
pub use subscription::{Subscription, SubscriptionManager};

/// Logical resource a manager keeps live
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChatFeed {
    /// Every chat, newest activity first (admin side)
    AllChats,
    /// The chat(s) registered for one phone number (user side)
    ByPhone(String),
}

impl ChatFeed {
    pub fn query(&self) -> Query {
        let query = Query::collection(CHATS).order_by("lastMessageTime", SortOrder::Descending);
        match self {
            ChatFeed::AllChats => query,
            ChatFeed::ByPhone(phone) => query.where_eq("phoneNumber", phone.as_str()),
        }
    }
}

impl std::fmt::Display for ChatFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatFeed::AllChats => write!(f, "all chats"),
            ChatFeed::ByPhone(phone) => write!(f, "chats of {}", phone),
        }
    }
}

/// What observers receive
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Materialized chat list, each chat carrying its newest page of messages (ascending)
    Chats(Arc<Vec<Chat>>),
    /// The remote subscription failed and will not deliver further updates
    Unavailable(String),
}

impl FeedEvent {
    pub fn chats(&self) -> Option<&[Chat]> {
        match self {
            FeedEvent::Chats(chats) => Some(chats.as_slice()),
            FeedEvent::Unavailable(_) => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, FeedEvent::Unavailable(_))
    }
}
