// Write paths against the remote store: chats, messages, statuses and uploads

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{SyncError, SyncResult};

pub mod chat;
pub mod message;
pub mod status;
pub mod upload;

pub use chat::ChatService;
pub use message::{MessageService, SentMessage};
pub use status::StatusService;
pub use upload::{format_size, validate_upload, UploadKind, Uploader};

static NON_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\D+").expect("valid digit regex"));

/// Stable chat id for a phone number: its digits, with `+` and separators dropped
pub fn chat_id_for_phone(phone: &str) -> SyncResult<String> {
    let digits = NON_DIGITS.replace_all(phone, "").into_owned();
    if digits.is_empty() {
        return Err(SyncError::Validation(format!(
            "phone number {:?} contains no digits",
            phone
        )));
    }
    Ok(digits)
}
