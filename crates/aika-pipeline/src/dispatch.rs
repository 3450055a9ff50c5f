//! Inbound event handling: adapter event → (commands | pipeline) → paced
//! outbound segments.
//!
//! Image parts are captioned through the vision model before the pipeline
//! sees the message, so the text stages only ever deal with text. An event
//! with no usable text after captioning is dropped without a reply.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use aika_core::adapter::ChatAdapter;
use aika_core::config::EmojiConfig;
use aika_core::types::{MessageEvent, MessagePart};
use aika_llm::LlmError;
use aika_memory::EmojiStore;
use aika_stats::StatsService;

use crate::commands::{Command, CommandRouter};
use crate::orchestrator::Orchestrator;
use crate::splitter::MessageSplitter;

/// Seam over the vision-caption model so tests can fake it and deployments
/// without a vision role can pass `None`.
#[async_trait]
pub trait ImageCaptioner: Send + Sync {
    async fn caption(&self, image: &[u8], mime: &str, is_emoji: bool) -> Result<String, LlmError>;
}

pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    splitter: Arc<MessageSplitter>,
    commands: Arc<CommandRouter>,
    adapter: Arc<dyn ChatAdapter>,
    stats: Arc<StatsService>,
    captioner: Option<Arc<dyn ImageCaptioner>>,
    emoji: Option<Arc<EmojiStore>>,
    emoji_cfg: EmojiConfig,
}

impl Dispatcher {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        splitter: Arc<MessageSplitter>,
        commands: Arc<CommandRouter>,
        adapter: Arc<dyn ChatAdapter>,
        stats: Arc<StatsService>,
        captioner: Option<Arc<dyn ImageCaptioner>>,
        emoji: Option<Arc<EmojiStore>>,
        emoji_cfg: EmojiConfig,
    ) -> Self {
        Self {
            orchestrator,
            splitter,
            commands,
            adapter,
            stats,
            captioner,
            emoji,
            emoji_cfg,
        }
    }

    /// Handle one inbound event end to end.
    pub async fn process_event(&self, event: MessageEvent) {
        if let Err(e) = self.stats.record_incoming(&event.user_id) {
            debug!("incoming stat write failed: {e}");
        }

        let scene = event.scene();
        let text = self.assemble_text(&event).await;
        if text.is_empty() {
            debug!(user_id = %event.user_id, "event had no usable text, dropped");
            return;
        }

        // Slash commands bypass the pipeline and reply as one message.
        if let Some(command) = Command::parse(&text) {
            let reply = self.commands.execute(command, &event.user_id).await;
            self.send_segment(&scene, &reply).await;
            return;
        }

        let reply = self
            .orchestrator
            .handle(
                &scene,
                &event.sender_name,
                event.group_name.as_deref(),
                &text,
            )
            .await;
        if reply.is_empty() {
            return;
        }

        let segments = self.splitter.split(&reply).await;
        info!(
            user_id = %event.user_id,
            segments = segments.len(),
            "reply ready"
        );
        for (i, segment) in segments.iter().enumerate() {
            self.send_segment(&scene, segment).await;
            if i + 1 < segments.len() {
                tokio::time::sleep(self.splitter.pause_after(segment)).await;
            }
        }

        self.maybe_send_emoji(&scene, &reply).await;
    }

    /// Occasionally answer with a learned sticker that matches the reply's
    /// mood. Misses and errors are silent.
    async fn maybe_send_emoji(&self, scene: &aika_core::types::Scene, reply: &str) {
        let Some(emoji) = &self.emoji else { return };
        if !self.emoji_cfg.enable {
            return;
        }
        let roll = rand::thread_rng().gen_bool(self.emoji_cfg.sending_probability.clamp(0.0, 1.0));
        if !roll {
            return;
        }

        match emoji.search(reply).await {
            Ok(Some((path, similarity))) => {
                debug!(similarity, "sticker matched reply");
                if let Err(e) = self.adapter.send_image(scene, &path).await {
                    warn!("sticker send failed: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => debug!("sticker search failed: {e}"),
        }
    }

    /// Text parts concatenated, image parts replaced by captions when a
    /// vision model is wired up. Caption failures just skip the part.
    /// Captioned emoji images also feed the sticker collection.
    async fn assemble_text(&self, event: &MessageEvent) -> String {
        let mut text = String::new();
        for part in &event.parts {
            match part {
                MessagePart::Text { text: t } => text.push_str(t),
                MessagePart::Image { url, is_emoji } => {
                    let Some(captioner) = &self.captioner else {
                        continue;
                    };
                    match self.caption_one(captioner, url, *is_emoji).await {
                        Ok((caption, bytes, extension)) => {
                            let label = if *is_emoji { "表情" } else { "图片" };
                            text.push_str(&format!("[{label}: {caption}]"));
                            if *is_emoji {
                                self.learn_emoji(bytes, extension, caption);
                            }
                        }
                        Err(e) => debug!("image caption skipped: {e}"),
                    }
                }
            }
        }
        text.trim().to_string()
    }

    async fn caption_one(
        &self,
        captioner: &Arc<dyn ImageCaptioner>,
        url: &str,
        is_emoji: bool,
    ) -> Result<(String, Vec<u8>, &'static str), aika_core::AikaError> {
        let bytes = self.adapter.download_image(url).await?;
        let mime = sniff_mime(&bytes);
        let caption = captioner
            .caption(&bytes, mime, is_emoji)
            .await
            .map_err(|e| aika_core::AikaError::Internal(e.to_string()))?;
        let extension = mime.rsplit('/').next().unwrap_or("png");
        Ok((caption, bytes, extension))
    }

    /// Fire-and-forget sticker learning.
    fn learn_emoji(&self, bytes: Vec<u8>, extension: &'static str, caption: String) {
        if !self.emoji_cfg.enable {
            return;
        }
        let Some(emoji) = self.emoji.clone() else { return };
        tokio::spawn(async move {
            match emoji.learn(&bytes, extension, &caption).await {
                Ok(true) => info!(%caption, "new sticker learned"),
                Ok(false) => {}
                Err(e) => debug!("sticker learn failed: {e}"),
            }
        });
    }

    async fn send_segment(&self, scene: &aika_core::types::Scene, text: &str) {
        if let Err(e) = self.adapter.send_text(scene, text).await {
            warn!("adapter send failed: {e}");
            return;
        }
        if let Err(e) = self.stats.record_outgoing(&scene.user_id) {
            debug!("outgoing stat write failed: {e}");
        }
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else {
        "image/png"
    }
}
