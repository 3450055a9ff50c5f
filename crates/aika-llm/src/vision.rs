//! Image captioning through the chat endpoint. Images are downloaded from
//! the platform CDN by the caller and shipped inline as a base64 data URI so
//! the model provider never fetches a foreign URL itself.

use std::time::Duration;

use base64::Engine;
use tracing::warn;

use aika_core::config::ModelRole;

use crate::client::{ApiResponse, ModelClient};
use crate::error::LlmError;

/// Default instruction when the role carries no system prompt of its own.
const DEFAULT_CAPTION_INSTRUCTION: &str =
    "用一句话简要描述这张图片的内容，不超过30字。如果是表情包，说明它表达的情绪。";

impl ModelClient {
    /// Caption one image via the configured vision role.
    pub async fn caption_image(
        &self,
        role: &ModelRole,
        image: &[u8],
        mime: &str,
        is_emoji: bool,
    ) -> Result<String, LlmError> {
        if !role.enabled {
            return Err(LlmError::Disabled {
                role: role.model_name.clone(),
            });
        }

        let provider = self
            .config()
            .provider_for(&role.provider)
            .map_err(|e| LlmError::Config(e.to_string()))?;
        let timeout = role.effective_timeout(provider);

        let data_uri = format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        let instruction = if !role.system_prompt.is_empty() {
            role.system_prompt.clone()
        } else if is_emoji {
            format!("{DEFAULT_CAPTION_INSTRUCTION}（这是一个表情包）")
        } else {
            DEFAULT_CAPTION_INSTRUCTION.to_string()
        };

        let url = format!(
            "{}/chat/completions",
            provider.api_base.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": role.model_name,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": data_uri}},
                    {"type": "text", "text": instruction},
                ],
            }],
            "temperature": role.temperature,
            "max_tokens": role.max_tokens,
        });

        let resp = self
            .http()
            .post(&url)
            .bearer_auth(&provider.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .timeout(Duration::from_secs(timeout))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout { secs: timeout }
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, model = %role.model_name, "vision API error");
            return Err(LlmError::Api {
                status,
                message: text.chars().take(300).collect(),
            });
        }

        let api: ApiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let caption = api
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default()
            .trim()
            .to_string();

        if caption.is_empty() {
            return Err(LlmError::Parse("vision model returned no caption".to_string()));
        }
        Ok(caption)
    }
}
