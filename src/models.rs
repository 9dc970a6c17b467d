// Domain models shared by the subscription, cache, service and view layers

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Avatar used when a chat record carries none
pub const DEFAULT_AVATAR_URL: &str = "https://media.chatsync.local/admin/avatar.png";

/// Summary label used for image previews
pub const PHOTO_LABEL: &str = "📷 Photo";

/// Who authored a message, seen from the side that owns the unread counter (the admin).
///
/// `Outgoing` messages were written by the admin, `Incoming` ones by the end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Delivery status of a message. Ordered so that transitions can only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Apply a transition, ignoring anything that would regress the status
    pub fn advance(self, next: DeliveryStatus) -> DeliveryStatus {
        self.max(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewKind {
    Image,
    Document,
}

/// Media attached to a message in place of text content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    #[serde(rename = "type", alias = "kind")]
    pub kind: PreviewKind,
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "size")]
    pub size_label: String,
}

impl MessagePreview {
    pub fn image(url: &str, name: &str) -> Self {
        MessagePreview {
            kind: PreviewKind::Image,
            url: url.to_string(),
            name: name.to_string(),
            size_label: String::new(),
        }
    }

    pub fn document(url: &str, name: &str, size_label: &str) -> Self {
        MessagePreview {
            kind: PreviewKind::Document,
            url: url.to_string(),
            name: name.to_string(),
            size_label: size_label.to_string(),
        }
    }

    /// Text shown as the chat's last message when this preview is the newest message
    pub fn summary_label(&self) -> String {
        match self.kind {
            PreviewKind::Image => PHOTO_LABEL.to_string(),
            PreviewKind::Document => format!("📄 {}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(with = "crate::wire::flexible_timestamp", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    #[serde(default)]
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<MessagePreview>,
}

impl Message {
    /// Build an unsaved message. Content is trimmed, and cleared entirely when a preview is attached.
    pub fn draft(content: &str, preview: Option<MessagePreview>, direction: Direction) -> Self {
        let content = if preview.is_some() {
            String::new()
        } else {
            content.trim().to_string()
        };

        Message {
            id: String::new(),
            content,
            timestamp: Utc::now(),
            direction,
            status: DeliveryStatus::Sent,
            preview,
        }
    }

    /// Exactly one of content or preview is present
    pub fn is_well_formed(&self) -> bool {
        self.content.is_empty() == self.preview.is_some()
    }

    /// Text this message contributes to the chat summary
    pub fn summary(&self) -> String {
        match &self.preview {
            Some(preview) => preview.summary_label(),
            None => self.content.clone(),
        }
    }

    pub fn image_url(&self) -> Option<&str> {
        match &self.preview {
            Some(preview) if preview.kind == PreviewKind::Image => Some(preview.url.as_str()),
            _ => None,
        }
    }
}

/// Ephemeral story post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default)]
    pub id: String,
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(with = "crate::wire::flexible_timestamp", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Blob store key backing `image_url`, used to cascade deletes
    #[serde(default, alias = "fileName", skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Chat {
    pub id: String,
    pub phone_number: String,
    pub name: String,
    #[serde(alias = "avatar")]
    pub avatar_url: String,
    pub online: bool,
    pub last_message: String,
    #[serde(
        with = "crate::wire::flexible_timestamp_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(alias = "unread")]
    pub unread_count: u32,
    /// Ascending by timestamp
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<Status>,
}

impl Default for Chat {
    fn default() -> Self {
        Chat {
            id: String::new(),
            phone_number: String::new(),
            name: String::new(),
            avatar_url: DEFAULT_AVATAR_URL.to_string(),
            online: false,
            last_message: String::new(),
            last_message_time: None,
            unread_count: 0,
            messages: Vec::new(),
            about: None,
            statuses: Vec::new(),
        }
    }
}

impl Chat {
    pub fn new(id: &str, phone_number: &str) -> Self {
        Chat {
            id: id.to_string(),
            phone_number: phone_number.to_string(),
            name: phone_number.to_string(),
            ..Chat::default()
        }
    }

    /// Copy of the chat metadata without the message list
    pub fn without_messages(&self) -> Chat {
        Chat {
            id: self.id.clone(),
            phone_number: self.phone_number.clone(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
            online: self.online,
            last_message: self.last_message.clone(),
            last_message_time: self.last_message_time,
            unread_count: self.unread_count,
            messages: Vec::new(),
            about: self.about.clone(),
            statuses: self.statuses.clone(),
        }
    }

    /// Summary derived from the newest message, if any
    pub fn derived_summary(&self) -> Option<(String, DateTime<Utc>)> {
        self.messages
            .last()
            .map(|message| (message.summary(), message.timestamp))
    }

    /// Recompute `last_message`/`last_message_time` from the message list.
    /// Returns true when the stored summary was stale.
    pub fn reconcile_summary(&mut self) -> bool {
        match self.derived_summary() {
            Some((summary, time)) => {
                let stale = self.last_message != summary || self.last_message_time != Some(time);
                self.last_message = summary;
                self.last_message_time = Some(time);
                stale
            }
            None => false,
        }
    }

    /// Merge messages by id, keeping timestamp order. Known ids only have their status advanced.
    /// Returns the messages that were not present before.
    pub fn merge_messages(&mut self, incoming: Vec<Message>) -> Vec<Message> {
        let added = merge_by_id(&mut self.messages, incoming);
        sort_messages(&mut self.messages);
        added
    }

    /// Distinct image URLs referenced by the avatar and message previews
    pub fn image_urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        let candidates = std::iter::once(self.avatar_url.as_str())
            .chain(self.messages.iter().filter_map(|m| m.image_url()));

        for url in candidates {
            if !url.is_empty() && seen.insert(url.to_string()) {
                urls.push(url.to_string());
            }
        }
        urls
    }

    pub fn has_message(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }
}

/// Merge `incoming` into `existing` by id without reordering. Returns the newly added messages.
pub fn merge_by_id(existing: &mut Vec<Message>, incoming: Vec<Message>) -> Vec<Message> {
    let mut added = Vec::new();
    for message in incoming {
        match existing.iter_mut().find(|m| m.id == message.id) {
            Some(known) => known.status = known.status.advance(message.status),
            None => {
                added.push(message.clone());
                existing.push(message);
            }
        }
    }
    added
}

/// Stable sort by timestamp, ties broken by id
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

/// Case-insensitive content search
pub fn search_messages<'a>(messages: &'a [Message], term: &str) -> Vec<&'a Message> {
    let term = term.trim().to_lowercase();
    if term.is_empty() {
        return messages.iter().collect();
    }
    messages
        .iter()
        .filter(|m| m.content.to_lowercase().contains(&term))
        .collect()
}

/// Cached value plus the moment it was written. Never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    #[serde(with = "crate::wire::flexible_timestamp")]
    pub last_updated: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T) -> Self {
        CacheEntry {
            data,
            last_updated: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.last_updated
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() <= max_age
    }
}
