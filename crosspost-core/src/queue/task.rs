use serde::{Deserialize, Serialize};

use crate::platform::Platform;

pub const PUBLISH_QUEUE: &str = "publish:post";
pub const SYNC_QUEUE: &str = "task:sync_platform_activity";

/// Body of a `publish:post` message. The retry counter travels in the
/// `x-retry-count` header, never in the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTask {
    pub user_id: i64,
    pub platform: Platform,
    #[serde(default)]
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blog_url: Option<String>,
}

impl PublishTask {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(body: &[u8]) -> serde_json::Result<Self> {
        let mut task: Self = serde_json::from_slice(body)?;
        task.cover_image = task.cover_image.filter(|value| !value.trim().is_empty());
        task.blog_url = task.blog_url.filter(|value| !value.trim().is_empty());
        task.tags.retain(|tag| !tag.trim().is_empty());
        Ok(task)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTask {
    pub user_id: i64,
    pub platform: Platform,
}

impl SyncTask {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}
