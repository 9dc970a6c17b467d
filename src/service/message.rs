// Message write path: insert the message, then update the chat summary
// The two writes are not atomic; a failed summary update is repaired by the next
// successful send or by reconcile_summary

use log::{debug, info, warn};
use std::sync::Arc;

use crate::cache::validate_media_url;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{DeliveryStatus, Direction, Message, MessagePreview};
use crate::store::{messages_path, Patch, Query, RemoteStore, SortOrder, CHATS};
use crate::wire::{
    chat_from_document, message_from_document, message_insert_patch, messages_from_documents,
    timestamp_to_value,
};

/// Outcome of a send whose message insert succeeded
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    /// The stored message, with its id and server timestamp
    pub message: Message,
    /// False when the chat summary update failed and the summary is stale
    pub summary_updated: bool,
}

#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn RemoteStore>,
    page_size: usize,
}

impl MessageService {
    pub fn new(store: Arc<dyn RemoteStore>, config: &SyncConfig) -> Self {
        MessageService {
            store,
            page_size: config.messages_per_page.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    async fn ensure_chat(&self, chat_id: &str) -> SyncResult<()> {
        if chat_id.trim().is_empty() {
            return Err(SyncError::Validation("chat id is required".to_string()));
        }
        match self.store.get(CHATS, chat_id).await? {
            Some(_) => Ok(()),
            None => {
                warn!("Chat {} not found", chat_id);
                Err(SyncError::NotFound(format!("chat {}", chat_id)))
            }
        }
    }

    /// Send a message to a chat.
    ///
    /// # Arguments
    ///
    /// * `chat_id` - Target chat
    /// * `content` - Text content, ignored when a preview is attached
    /// * `preview` - Optional media preview
    /// * `direction` - Which side authored the message
    ///
    /// # Returns
    ///
    /// The stored message. Errors leave no message behind.
    pub async fn send(
        &self,
        chat_id: &str,
        content: &str,
        preview: Option<MessagePreview>,
        direction: Direction,
    ) -> SyncResult<SentMessage> {
        let draft = Message::draft(content, preview, direction);
        if !draft.is_well_formed() {
            return Err(SyncError::Validation(
                "message needs text content or a preview".to_string(),
            ));
        }
        if let Some(preview) = &draft.preview {
            validate_media_url(&preview.url)?;
        }

        self.ensure_chat(chat_id).await?;

        let doc = self
            .store
            .add(&messages_path(chat_id), message_insert_patch(&draft))
            .await?;
        let message = message_from_document(&doc)?;
        debug!("Inserted message {} into chat {}", message.id, chat_id);

        let mut summary = Patch::new()
            .set("lastMessage", message.summary())
            .set("lastMessageTime", timestamp_to_value(&message.timestamp));
        // The counter tracks messages the admin has not seen yet
        if direction == Direction::Incoming {
            summary = summary.increment("unreadCount", 1);
        }

        let summary_updated = match self.store.update(CHATS, chat_id, summary).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "Message {} stored but summary of chat {} not updated: {}",
                    message.id, chat_id, e
                );
                false
            }
        };

        Ok(SentMessage {
            message,
            summary_updated,
        })
    }

    /// Message written by the end user
    pub async fn send_user_message(
        &self,
        chat_id: &str,
        content: &str,
        preview: Option<MessagePreview>,
    ) -> SyncResult<SentMessage> {
        self.send(chat_id, content, preview, Direction::Incoming).await
    }

    /// Message written by the admin
    pub async fn send_admin_message(
        &self,
        chat_id: &str,
        content: &str,
        preview: Option<MessagePreview>,
    ) -> SyncResult<SentMessage> {
        self.send(chat_id, content, preview, Direction::Outgoing).await
    }

    /// Newest page of messages, oldest first
    pub async fn load_recent_messages(&self, chat_id: &str) -> SyncResult<Vec<Message>> {
        let query = Query::collection(&messages_path(chat_id))
            .order_by("timestamp", SortOrder::Descending)
            .limit(self.page_size);
        let docs = self.store.query(&query).await?;
        let mut messages = messages_from_documents(&docs);
        messages.reverse();
        Ok(messages)
    }

    /// Load up to `page_size` messages older than `before_message_id`, oldest first.
    /// The caller merges them into its cache.
    pub async fn load_older_messages(
        &self,
        chat_id: &str,
        before_message_id: &str,
        page_size: usize,
    ) -> SyncResult<Vec<Message>> {
        let path = messages_path(chat_id);
        let anchor = self
            .store
            .get(&path, before_message_id)
            .await?
            .ok_or_else(|| {
                warn!("Pagination anchor {} missing in chat {}", before_message_id, chat_id);
                SyncError::NotFound(format!("message {} in chat {}", before_message_id, chat_id))
            })?;

        let query = Query::collection(&path)
            .order_by("timestamp", SortOrder::Descending)
            .start_after(anchor)
            .limit(page_size.max(1));
        let docs = self.store.query(&query).await?;
        let mut messages = messages_from_documents(&docs);
        messages.reverse();
        debug!(
            "Loaded {} messages older than {} in chat {}",
            messages.len(),
            before_message_id,
            chat_id
        );
        Ok(messages)
    }

    /// Reset the unread counter and mark incoming messages as read.
    ///
    /// # Returns
    ///
    /// The number of messages whose status changed
    pub async fn mark_as_read(&self, chat_id: &str) -> SyncResult<usize> {
        self.store
            .update(CHATS, chat_id, Patch::new().set("unreadCount", 0))
            .await?;

        let query = Query::collection(&messages_path(chat_id)).where_eq("direction", "incoming");
        let docs = self.store.query(&query).await?;
        let mut marked = 0;
        for message in messages_from_documents(&docs) {
            if message.status == DeliveryStatus::Read {
                continue;
            }
            self.store
                .update(
                    &messages_path(chat_id),
                    &message.id,
                    Patch::new().set("status", DeliveryStatus::Read.as_str()),
                )
                .await?;
            marked += 1;
        }
        info!("Marked {} messages read in chat {}", marked, chat_id);
        Ok(marked)
    }

    /// Move a message's status forward.
    ///
    /// # Returns
    ///
    /// False when the transition would regress the status and was ignored
    pub async fn update_message_status(
        &self,
        chat_id: &str,
        message_id: &str,
        status: DeliveryStatus,
    ) -> SyncResult<bool> {
        let path = messages_path(chat_id);
        let doc = self
            .store
            .get(&path, message_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("message {} in chat {}", message_id, chat_id)))?;
        let current = message_from_document(&doc)?.status;

        if current.advance(status) == current {
            debug!(
                "Ignoring status change {} -> {} for message {}",
                current.as_str(),
                status.as_str(),
                message_id
            );
            return Ok(false);
        }
        self.store
            .update(&path, message_id, Patch::new().set("status", status.as_str()))
            .await?;
        Ok(true)
    }

    /// Recompute the chat summary from the newest stored message.
    ///
    /// # Returns
    ///
    /// True when the stored summary was stale and has been rewritten
    pub async fn reconcile_summary(&self, chat_id: &str) -> SyncResult<bool> {
        let doc = self
            .store
            .get(CHATS, chat_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("chat {}", chat_id)))?;
        let chat = chat_from_document(&doc)?;

        let query = Query::collection(&messages_path(chat_id))
            .order_by("timestamp", SortOrder::Descending)
            .limit(1);
        let newest = messages_from_documents(&self.store.query(&query).await?);
        let Some(newest) = newest.first() else {
            return Ok(false);
        };

        let summary = newest.summary();
        if chat.last_message == summary && chat.last_message_time == Some(newest.timestamp) {
            return Ok(false);
        }

        info!("Repairing stale summary of chat {}", chat_id);
        self.store
            .update(
                CHATS,
                chat_id,
                Patch::new()
                    .set("lastMessage", summary)
                    .set("lastMessageTime", timestamp_to_value(&newest.timestamp)),
            )
            .await?;
        Ok(true)
    }
}
