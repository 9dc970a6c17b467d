// Chat lifecycle: first-contact creation, presence and contact details

use log::{info, warn};
use std::sync::Arc;

use super::chat_id_for_phone;
use super::message::MessageService;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::Chat;
use crate::store::{Patch, Query, RemoteStore, CHATS};
use crate::wire::chat_from_document;

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn RemoteStore>,
    messages: MessageService,
    welcome_message: String,
    default_avatar_url: String,
}

impl ChatService {
    pub fn new(store: Arc<dyn RemoteStore>, messages: MessageService, config: &SyncConfig) -> Self {
        ChatService {
            store,
            messages,
            welcome_message: config.welcome_message.clone(),
            default_avatar_url: config.default_avatar_url.clone(),
        }
    }

    /// Return the chat for `phone`, creating it on first contact.
    ///
    /// A new chat starts with one unread message: the admin's welcome message.
    pub async fn create_or_get_chat(&self, phone: &str) -> SyncResult<Chat> {
        let phone = phone.trim();
        if let Some(chat) = self.get_chat_by_phone(phone).await? {
            return Ok(chat);
        }

        let chat_id = chat_id_for_phone(phone)?;
        info!("Creating chat {} for {}", chat_id, phone);
        let fields = Patch::new()
            .set("phoneNumber", phone)
            .set("name", phone)
            .set("avatarUrl", self.default_avatar_url.as_str())
            .set("online", false)
            .set("lastMessage", "")
            .set("unreadCount", 1)
            .server_timestamp("createdAt");
        self.store.set(CHATS, &chat_id, fields).await?;

        let welcome = match self
            .messages
            .send_admin_message(&chat_id, &self.welcome_message, None)
            .await
        {
            Ok(sent) => Some(sent.message),
            Err(e) => {
                warn!("Chat {} created without welcome message: {}", chat_id, e);
                None
            }
        };

        let doc = self
            .store
            .get(CHATS, &chat_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("chat {}", chat_id)))?;
        let mut chat = chat_from_document(&doc)?;
        chat.messages.extend(welcome);
        Ok(chat)
    }

    /// Chat metadata for a phone number, without messages
    pub async fn get_chat_by_phone(&self, phone: &str) -> SyncResult<Option<Chat>> {
        let chat_id = chat_id_for_phone(phone)?;
        if let Some(doc) = self.store.get(CHATS, &chat_id).await? {
            return Ok(Some(chat_from_document(&doc)?));
        }

        // Chats created under store-assigned ids are found by their phone field
        let query = Query::collection(CHATS).where_eq("phoneNumber", phone.trim()).limit(1);
        match self.store.query(&query).await?.first() {
            Some(doc) => Ok(Some(chat_from_document(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn update_online_status(&self, chat_id: &str, online: bool) -> SyncResult<()> {
        self.store
            .update(
                CHATS,
                chat_id,
                Patch::new().set("online", online).server_timestamp("lastSeen"),
            )
            .await?;
        Ok(())
    }

    pub async fn update_contact_name(&self, chat_id: &str, name: &str) -> SyncResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::Validation("contact name cannot be empty".to_string()));
        }
        self.store
            .update(
                CHATS,
                chat_id,
                Patch::new().set("name", name).server_timestamp("updatedAt"),
            )
            .await?;
        info!("Renamed chat {} to {}", chat_id, name);
        Ok(())
    }
}
