// Attachment uploads to the blob store

use chrono::Utc;
use log::{debug, info};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::MessagePreview;
use crate::store::MediaBlobStore;

pub const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

pub const DOCUMENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/plain",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Image,
    Document,
}

/// Check size and content type of a file before uploading it
pub fn validate_upload(name: &str, mime: &str, size: u64, max_bytes: u64) -> SyncResult<UploadKind> {
    if name.trim().is_empty() {
        return Err(SyncError::Validation("file name is required".to_string()));
    }
    if size == 0 {
        return Err(SyncError::Validation(format!("{} is empty", name)));
    }
    if size > max_bytes {
        return Err(SyncError::Validation(format!(
            "{} is {} which exceeds the {} limit",
            name,
            format_size(size),
            format_size(max_bytes)
        )));
    }

    let mime = mime.trim().to_ascii_lowercase();
    if IMAGE_TYPES.contains(&mime.as_str()) {
        Ok(UploadKind::Image)
    } else if DOCUMENT_TYPES.contains(&mime.as_str()) {
        Ok(UploadKind::Document)
    } else {
        Err(SyncError::Validation(format!(
            "unsupported file type {} for {}",
            mime, name
        )))
    }
}

/// Human-readable size, in megabytes with two decimals
pub fn format_size(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

/// Lowercased extension of a file name, `bin` when it has none
pub fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => "bin".to_string(),
    }
}

/// Collision-resistant blob key: millisecond timestamp plus a random suffix
pub fn upload_key(prefix: &str, name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}{}_{}.{}",
        prefix,
        Utc::now().timestamp_millis(),
        &suffix[..8],
        extension_of(name)
    )
}

#[derive(Clone)]
pub struct Uploader {
    blobs: Arc<dyn MediaBlobStore>,
    max_bytes: u64,
}

impl Uploader {
    pub fn new(blobs: Arc<dyn MediaBlobStore>, config: &SyncConfig) -> Self {
        Uploader {
            blobs,
            max_bytes: config.max_upload_bytes,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Upload a file and describe it as a message preview
    pub async fn upload_attachment(&self, name: &str, mime: &str, bytes: Vec<u8>) -> SyncResult<MessagePreview> {
        let size = bytes.len() as u64;
        let kind = validate_upload(name, mime, size, self.max_bytes)?;
        let key = upload_key("uploads/", name);
        debug!("Uploading {} as {}", name, key);

        let url = self.blobs.put(&key, bytes, mime).await?;
        info!("Uploaded {} ({})", name, format_size(size));

        Ok(match kind {
            UploadKind::Image => MessagePreview::image(&url, name),
            UploadKind::Document => MessagePreview::document(&url, name, &format_size(size)),
        })
    }
}
