// Content fingerprints used to drop snapshots that would not change what is rendered

use sha2::{Digest, Sha256};

use crate::models::Chat;

const FIELD_SEP: &[u8] = b"\x1f";
const RECORD_SEP: &[u8] = b"\x1e";

fn hash_chat(hasher: &mut Sha256, chat: &Chat) {
    for field in [
        chat.id.as_str(),
        chat.name.as_str(),
        chat.avatar_url.as_str(),
        chat.last_message.as_str(),
        chat.about.as_deref().unwrap_or(""),
    ] {
        hasher.update(field.as_bytes());
        hasher.update(FIELD_SEP);
    }
    hasher.update(chat.unread_count.to_be_bytes());
    hasher.update(FIELD_SEP);

    for message in &chat.messages {
        hasher.update(message.id.as_bytes());
        hasher.update(b":");
        hasher.update(message.status.as_str().as_bytes());
        hasher.update(FIELD_SEP);
    }
    hasher.update(RECORD_SEP);
}

/// Fingerprint of a single chat's render-relevant fields.
///
/// Covers identity, display fields, summary, unread counter and the (id, status)
/// list of its messages. Presence (`online`) and raw timestamps are excluded.
pub fn chat_fingerprint(chat: &Chat) -> String {
    let mut hasher = Sha256::new();
    hash_chat(&mut hasher, chat);
    hex::encode(hasher.finalize())
}

/// Fingerprint of an ordered chat list
pub fn chats_fingerprint(chats: &[Chat]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((chats.len() as u64).to_be_bytes());
    for chat in chats {
        hash_chat(&mut hasher, chat);
    }
    hex::encode(hasher.finalize())
}
