//! Text → fixed-dimension vector via an OpenAI-compatible `/embeddings`
//! endpoint. Vectors come back raw; the store normalizes before indexing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use aika_core::config::AikaConfig;

use crate::error::LlmError;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    /// Dimension every returned vector has.
    fn dim(&self) -> usize;
}

pub struct EmbeddingClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    dim: usize,
    timeout_secs: u64,
}

impl EmbeddingClient {
    pub fn new(config: Arc<AikaConfig>) -> Result<Self, LlmError> {
        let role = &config.models.embedding;
        let provider = config
            .provider_for(&role.provider)
            .map_err(|e| LlmError::Config(e.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_base: provider.api_base.trim_end_matches('/').to_string(),
            api_key: provider.api_key.clone(),
            model: role.model_name.clone(),
            dim: role.vector_dim,
            timeout_secs: provider.timeout_secs,
        })
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let url = format!("{}/embeddings", self.api_base);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "encoding_format": "float",
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .timeout(Duration::from_secs(self.timeout_secs))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        secs: self.timeout_secs,
                    }
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, model = %self.model, "embedding API error");
            return Err(LlmError::Api {
                status,
                message: text.chars().take(300).collect(),
            });
        }

        let api: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let vector = api
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LlmError::Parse("embedding response has no data".to_string()))?;

        if vector.len() != self.dim {
            return Err(LlmError::Parse(format!(
                "embedding dimension mismatch: got {}, expected {}",
                vector.len(),
                self.dim
            )));
        }
        Ok(vector)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_response_parses() {
        let json = r#"{"data": [{"embedding": [0.1, 0.2, 0.3]}]}"#;
        let api: EmbeddingResponse = serde_json::from_str(json).unwrap();
        assert_eq!(api.data[0].embedding, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn empty_data_is_detectable() {
        let json = r#"{"data": []}"#;
        let api: EmbeddingResponse = serde_json::from_str(json).unwrap();
        assert!(api.data.is_empty());
    }
}
