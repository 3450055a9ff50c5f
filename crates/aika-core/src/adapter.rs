//! Contract for the chat-platform adapter. The adapter itself lives outside
//! this workspace; the pipeline only ever talks to this trait.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{HistoryMessage, Scene, SelfInfo};

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Deliver one text segment to a scene.
    async fn send_text(&self, scene: &Scene, text: &str) -> Result<()>;

    /// Deliver a local image file to a scene.
    async fn send_image(&self, scene: &Scene, path: &Path) -> Result<()>;

    /// Fetch up to `count` recent private messages with a user, unordered.
    async fn fetch_private_history(&self, user_id: &str, count: usize)
        -> Result<Vec<HistoryMessage>>;

    /// Fetch up to `count` recent group messages. `user_filter` keeps the
    /// pairing logic focused on one member; the adapter may ignore it and
    /// return the raw window.
    async fn fetch_group_history(
        &self,
        group_id: &str,
        user_filter: Option<&str>,
        count: usize,
    ) -> Result<Vec<HistoryMessage>>;

    /// The bot's own platform identity.
    async fn self_info(&self) -> Result<SelfInfo>;

    /// Download an image from the platform CDN so vision calls never hand
    /// the provider a foreign URL.
    async fn download_image(&self, url: &str) -> Result<Vec<u8>>;
}
