// Chat synchronization and caching core
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod service;
pub mod store;
pub mod sync;
pub mod view;
pub mod wire;

// Re-export main types for convenience
pub use cache::{CacheManager, PrefetchOutcome, PrefetchReport};
pub use config::SyncConfig;
pub use error::{StoreError, SyncError, SyncResult};
pub use models::*;
pub use service::{ChatService, MessageService, SentMessage, StatusService, Uploader};
pub use sync::{ChatFeed, FeedEvent, Subscription, SubscriptionManager};
pub use view::{ChatViewModel, ChatViewState};
