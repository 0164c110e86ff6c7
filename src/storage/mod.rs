use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{DriveConfig, StorageBackend};

pub mod s3;
pub mod swift;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage authentication failed: {0}")]
    Auth(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Pluggable blob store. Keys embed the bot's opaque id and are unique, so
/// writes are last-write-wins by construction.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Returns the backend's etag for the stored object.
    async fn put(&self, key: &str, data: Bytes, content_type: &str)
        -> Result<String, StorageError>;
    /// Streams a finished file from disk; returns (etag, byte size).
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(String, i64), StorageError>;
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

pub async fn build_storage(config: &DriveConfig) -> anyhow::Result<Arc<dyn BlobStorage>> {
    match config.backend {
        StorageBackend::S3 => Ok(Arc::new(s3::S3Storage::new(config).await)),
        StorageBackend::Swift => Ok(Arc::new(swift::SwiftStorage::new(config)?)),
    }
}

/// `recordings/{bot_object_id}.{ext}`, with per-participant variants nested
/// under the bot id. A bot-level `file_name` override replaces the whole key.
pub fn recording_key(
    bot_object_id: &str,
    participant_uuid: Option<&str>,
    extension: &str,
    file_name_override: Option<&str>,
) -> String {
    if let Some(name) = file_name_override {
        return name.to_string();
    }
    match participant_uuid {
        Some(uuid) => format!("recordings/{}/{}.{}", bot_object_id, uuid, extension),
        None => format!("recordings/{}.{}", bot_object_id, extension),
    }
}

pub fn debug_screenshot_key(bot_object_id: &str, event_id: &str) -> String {
    format!("debug/{}/{}.png", bot_object_id, event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_keys_embed_bot_and_participant_ids() {
        assert_eq!(
            recording_key("bot_abc", None, "mp4", None),
            "recordings/bot_abc.mp4"
        );
        assert_eq!(
            recording_key("bot_abc", Some("p-42"), "mp3", None),
            "recordings/bot_abc/p-42.mp3"
        );
    }

    #[test]
    fn file_name_override_wins() {
        assert_eq!(
            recording_key("bot_abc", None, "mp4", Some("custom/meeting.mp4")),
            "custom/meeting.mp4"
        );
    }

    #[test]
    fn debug_keys_group_by_bot() {
        assert_eq!(
            debug_screenshot_key("bot_abc", "evt_1"),
            "debug/bot_abc/evt_1.png"
        );
    }
}
