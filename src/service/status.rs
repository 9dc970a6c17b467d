// Admin status posts: image upload, newest-first listing, delete with blob cascade

use log::{debug, info, warn};
use std::sync::Arc;

use super::upload::{upload_key, validate_upload, UploadKind};
use crate::config::SyncConfig;
use crate::error::{StoreError, SyncError, SyncResult};
use crate::models::Status;
use crate::store::{MediaBlobStore, Patch, Query, RemoteStore, SortOrder, STATUSES};
use crate::wire::status_from_document;

#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn RemoteStore>,
    blobs: Arc<dyn MediaBlobStore>,
    max_bytes: u64,
}

impl StatusService {
    pub fn new(store: Arc<dyn RemoteStore>, blobs: Arc<dyn MediaBlobStore>, config: &SyncConfig) -> Self {
        StatusService {
            store,
            blobs,
            max_bytes: config.max_upload_bytes,
        }
    }

    /// Publish an image as a status post
    pub async fn upload_status(
        &self,
        file_name: &str,
        mime: &str,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> SyncResult<Status> {
        let kind = validate_upload(file_name, mime, bytes.len() as u64, self.max_bytes)?;
        if kind != UploadKind::Image {
            return Err(SyncError::Validation(format!(
                "status posts must be images, got {}",
                mime
            )));
        }

        let key = upload_key("admin/status_", file_name);
        let image_url = self.blobs.put(&key, bytes, mime).await?;

        let mut record = Patch::new()
            .set("imageUrl", image_url.as_str())
            .set("fileKey", key.as_str())
            .server_timestamp("createdAt");
        if let Some(caption) = caption.map(str::trim).filter(|c| !c.is_empty()) {
            record = record.set("caption", caption);
        }

        let doc = match self.store.add(STATUSES, record).await {
            Ok(doc) => doc,
            Err(e) => {
                // Do not leave an orphaned blob behind
                if let Err(cleanup) = self.blobs.delete(&key).await {
                    warn!("Failed to remove orphaned status blob {}: {}", key, cleanup);
                }
                return Err(e.into());
            }
        };
        info!("Published status {}", doc.id);
        Ok(status_from_document(&doc)?)
    }

    /// Status posts, newest first. Malformed records are skipped.
    pub async fn list_statuses(&self) -> SyncResult<Vec<Status>> {
        let query = Query::collection(STATUSES).order_by("createdAt", SortOrder::Descending);
        let docs = self.store.query(&query).await?;
        Ok(docs
            .iter()
            .filter_map(|doc| match status_from_document(doc) {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!("Skipping malformed status: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Delete a status post and its backing image.
    ///
    /// A failure to delete the image is logged; the record is removed regardless.
    pub async fn delete_status(&self, status_id: &str) -> SyncResult<()> {
        let doc = self
            .store
            .get(STATUSES, status_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("status {}", status_id)))?;
        let status = status_from_document(&doc)?;

        if let Some(key) = &status.file_key {
            match self.blobs.delete(key).await {
                Ok(()) => debug!("Deleted status image {}", key),
                Err(StoreError::NotFound(_)) => debug!("Status image {} already gone", key),
                Err(e) => warn!("Failed to delete status image {}: {}", key, e),
            }
        }

        self.store.delete(STATUSES, status_id).await?;
        info!("Deleted status {}", status_id);
        Ok(())
    }
}
