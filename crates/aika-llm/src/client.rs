//! Uniform client for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Every model role (organizer, generator, guard, utility, …) goes through
//! `ModelClient::chat` with its own provider, temperature and timeout. The
//! response is reduced to plain text plus optional reasoning trace and token
//! usage; `<think>…</think>` wrappers some providers emit are stripped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use aika_core::config::{AikaConfig, ModelRole};

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Reduced chat response.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: String,
    /// Reasoning trace (`reasoning_content`) when the provider emits one.
    pub reasoning: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub elapsed_secs: f64,
}

/// Seam for the pipeline and tests: everything that calls a chat model does
/// it through this trait so fakes can be injected.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        role: &ModelRole,
        messages: Vec<ChatMessage>,
        temperature_override: Option<f32>,
    ) -> Result<ChatOutcome, LlmError>;
}

pub struct ModelClient {
    http: reqwest::Client,
    config: Arc<AikaConfig>,
    think_re: Regex,
}

impl ModelClient {
    pub fn new(config: Arc<AikaConfig>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            think_re: Regex::new(r"(?s)<think>.*?</think>").unwrap(),
        }
    }

    fn strip_think(&self, content: &str) -> String {
        self.think_re.replace_all(content, "").trim().to_string()
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn config(&self) -> &AikaConfig {
        &self.config
    }
}

#[async_trait]
impl LlmClient for ModelClient {
    async fn chat(
        &self,
        role: &ModelRole,
        messages: Vec<ChatMessage>,
        temperature_override: Option<f32>,
    ) -> Result<ChatOutcome, LlmError> {
        if !role.enabled {
            return Err(LlmError::Disabled {
                role: role.model_name.clone(),
            });
        }

        let provider = self
            .config
            .provider_for(&role.provider)
            .map_err(|e| LlmError::Config(e.to_string()))?;
        let timeout = role.effective_timeout(provider);
        let temperature = temperature_override.unwrap_or(role.temperature);

        let url = format!("{}/chat/completions", provider.api_base.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": role.model_name,
            "messages": messages
                .iter()
                .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
                .collect::<Vec<_>>(),
            "temperature": temperature,
            "max_tokens": role.max_tokens,
        });

        debug!(model = %role.model_name, msgs = messages.len(), "sending chat request");

        let started = std::time::Instant::now();
        let resp = self
            .http
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
            warn!(status, model = %role.model_name, "chat API error");
            return Err(LlmError::Api {
                status,
                message: text.chars().take(300).collect(),
            });
        }

        let api: ApiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let choice = api.choices.into_iter().next();
        let raw = choice
            .as_ref()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or("");
        let content = self.strip_think(raw);
        let reasoning = choice
            .as_ref()
            .and_then(|c| c.message.reasoning_content.clone())
            .filter(|r| !r.is_empty());

        Ok(ChatOutcome {
            content,
            reasoning,
            prompt_tokens: api.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: api
                .usage
                .as_ref()
                .map(|u| u.completion_tokens)
                .unwrap_or(0),
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }
}

// Response types shared with the vision path.

#[derive(Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) choices: Vec<Choice>,
    pub(crate) usage: Option<Usage>,
}

#[derive(Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: ResponseMessage,
}

#[derive(Deserialize)]
pub(crate) struct ResponseMessage {
    pub(crate) content: Option<String>,
    #[serde(default)]
    pub(crate) reasoning_content: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct Usage {
    pub(crate) prompt_tokens: u32,
    pub(crate) completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use aika_core::config::{
        CommonConfig, EmbeddingRole, GuardConfig, ModelsConfig, ProviderConfig, ReplyConfig,
        RoleConfig, SchedulerConfig, StorageConfig,
    };

    fn role(name: &str) -> ModelRole {
        ModelRole {
            provider: String::new(),
            model_name: name.to_string(),
            temperature: 0.7,
            max_tokens: 100,
            timeout_secs: 0,
            enabled: true,
            system_prompt: String::new(),
        }
    }

    fn test_config() -> AikaConfig {
        let mut providers = HashMap::new();
        providers.insert(
            "main".to_string(),
            ProviderConfig {
                api_base: "http://127.0.0.1:9".to_string(),
                api_key: "sk-test".to_string(),
                timeout_secs: 1,
            },
        );
        AikaConfig {
            common: CommonConfig {
                default_provider: "main".to_string(),
                ..CommonConfig::default()
            },
            providers,
            models: ModelsConfig {
                organizer: role("o"),
                kb_organizer: None,
                generator: role("g"),
                embedding: EmbeddingRole {
                    provider: String::new(),
                    model_name: "e".to_string(),
                    vector_dim: 4,
                },
                vision: None,
                vision_caption: None,
                guard: role("gd"),
                utility: role("u"),
            },
            storage: StorageConfig::default(),
            guard: GuardConfig::default(),
            reply: ReplyConfig::default(),
            role: RoleConfig::default(),
            emoji: Default::default(),
            retrieval: Default::default(),
            admin: Default::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    #[test]
    fn think_wrapper_is_stripped() {
        let client = ModelClient::new(Arc::new(test_config()));
        let out = client.strip_think("<think>internal\nstuff</think>你好");
        assert_eq!(out, "你好");
        assert_eq!(client.strip_think("plain"), "plain");
    }

    #[tokio::test]
    async fn disabled_role_short_circuits() {
        let client = ModelClient::new(Arc::new(test_config()));
        let mut r = role("g");
        r.enabled = false;
        let err = client
            .chat(&r, vec![ChatMessage::user("hi")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Disabled { .. }));
    }

    #[test]
    fn response_parse_reads_reasoning_and_usage() {
        let json = r#"{
            "choices": [{"message": {"content": "ok", "reasoning_content": "because"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }"#;
        let api: ApiResponse = serde_json::from_str(json).unwrap();
        let choice = &api.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("ok"));
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("because"));
        assert_eq!(api.usage.as_ref().unwrap().prompt_tokens, 12);
    }
}
