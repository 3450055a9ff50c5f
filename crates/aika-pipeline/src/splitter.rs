//! LLM-assisted message splitting with human-paced delivery.
//!
//! Long replies become several short lines the way a person would type
//! them. Disabled, short, or code-fenced text passes through unsplit, and
//! any model-side trouble silently returns the original — a worse-split
//! message beats a dropped one.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

use aika_core::config::{ModelRole, ReplyConfig};
use aika_llm::{ChatMessage, LlmClient};

const SPLIT_SYSTEM_PROMPT: &str = "\
你是消息拆分助手。将长文本拆分成多条短消息，模拟真人发送消息的习惯。\n\n\
【拆分规则】\n\
1. 根据长度进行拆分，可以选择不拆，不拆则直接原文返回\n\
2. 保持语义完整，不要在句子中间断开\n\
3. 不要添加任何标点符号，保持原文\n\
4. 不要添加序号、分隔符等额外内容\n\n\
【输出格式】\n\
每行一条消息，不要有空行，不要有序号。\n\n\
【示例】\n\
输入：随你吧，反正说了你也不信，都一点了啊，你还不睡吗\n\
输出：\n\
随你吧\n\
反正说了你也不信\n\
都一点了啊\n\
你还不睡吗";

pub struct MessageSplitter {
    llm: Arc<dyn LlmClient>,
    role: ModelRole,
    config: ReplyConfig,
    numbering_re: Regex,
}

impl MessageSplitter {
    /// `utility` is cloned into a low-temperature split role.
    pub fn new(llm: Arc<dyn LlmClient>, utility: &ModelRole, config: ReplyConfig) -> Self {
        let mut role = utility.clone();
        role.temperature = 0.3;
        role.max_tokens = 500;
        Self {
            llm,
            role,
            config,
            numbering_re: Regex::new(r"^\d+[.、]\s*").unwrap(),
        }
    }

    /// Split one reply. The result is never empty; the failure mode is a
    /// one-element vector holding the input unchanged.
    pub async fn split(&self, text: &str) -> Vec<String> {
        if !self.config.enable_split || text.chars().count() < self.config.split_threshold {
            return vec![text.to_string()];
        }
        if text.contains("```") {
            debug!("code fence present, splitting skipped");
            return vec![text.to_string()];
        }

        match self.llm_split(text).await {
            Some(segments) if !segments.is_empty() => segments,
            _ => vec![text.to_string()],
        }
    }

    async fn llm_split(&self, text: &str) -> Option<Vec<String>> {
        let messages = vec![
            ChatMessage::system(SPLIT_SYSTEM_PROMPT),
            ChatMessage::user(format!("请拆分以下文本：\n{text}")),
        ];
        let outcome = match self.llm.chat(&self.role, messages, None).await {
            Ok(o) => o,
            Err(e) => {
                warn!("split model failed, returning original: {e}");
                return None;
            }
        };

        let segments: Vec<String> = outcome
            .content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| self.numbering_re.replace(l, "").to_string())
            .filter(|l| !l.is_empty())
            .collect();

        if segments.is_empty() {
            None
        } else {
            Some(segments)
        }
    }

    /// Typing pause after one segment: `len * typing_speed`, jittered by
    /// 0.8–1.2 and capped at `max_delay`.
    pub fn pause_after(&self, segment: &str) -> Duration {
        let base = segment.chars().count() as f64 * self.config.typing_speed;
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64((base * jitter).min(self.config.max_delay))
    }

    /// Lower bound on the pause for a segment, for callers that assert on
    /// pacing.
    pub fn min_pause(&self, segment: &str) -> Duration {
        let base = segment.chars().count() as f64 * self.config.typing_speed;
        Duration::from_secs_f64((base * 0.8).min(self.config.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use aika_llm::{ChatOutcome, LlmError};

    struct FixedLlm {
        reply: Option<&'static str>,
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn chat(
            &self,
            _role: &ModelRole,
            _messages: Vec<ChatMessage>,
            _temperature_override: Option<f32>,
        ) -> Result<ChatOutcome, LlmError> {
            match self.reply {
                Some(reply) => Ok(ChatOutcome {
                    content: reply.to_string(),
                    ..Default::default()
                }),
                None => Err(LlmError::Timeout { secs: 3 }),
            }
        }
    }

    fn utility() -> ModelRole {
        ModelRole {
            provider: String::new(),
            model_name: "utility".to_string(),
            temperature: 0.3,
            max_tokens: 500,
            timeout_secs: 0,
            enabled: true,
            system_prompt: String::new(),
        }
    }

    fn splitter(reply: Option<&'static str>, config: ReplyConfig) -> MessageSplitter {
        MessageSplitter::new(Arc::new(FixedLlm { reply }), &utility(), config)
    }

    #[tokio::test]
    async fn short_text_passes_through() {
        let s = splitter(Some("不该被调用"), ReplyConfig::default());
        let out = s.split("短消息").await;
        assert_eq!(out, vec!["短消息".to_string()]);
    }

    #[tokio::test]
    async fn disabled_splitter_passes_through() {
        let config = ReplyConfig {
            enable_split: false,
            ..ReplyConfig::default()
        };
        let s = splitter(Some("不该被调用"), config);
        let long = "字".repeat(120);
        assert_eq!(s.split(&long).await, vec![long]);
    }

    #[tokio::test]
    async fn code_fence_suppresses_splitting() {
        let s = splitter(Some("不该被调用"), ReplyConfig::default());
        let text = format!("看这段代码```rust\nfn main() {{}}\n```{}", "补".repeat(60));
        assert_eq!(s.split(&text).await, vec![text]);
    }

    #[tokio::test]
    async fn model_lines_become_segments_with_numbering_stripped() {
        let s = splitter(Some("1. 随你吧\n2、反正说了你也不信\n\n都一点了啊"), ReplyConfig::default());
        let text = "随".repeat(80);
        let out = s.split(&text).await;
        assert_eq!(out, vec!["随你吧", "反正说了你也不信", "都一点了啊"]);
    }

    #[tokio::test]
    async fn model_failure_returns_original() {
        let s = splitter(None, ReplyConfig::default());
        let text = "长".repeat(80);
        assert_eq!(s.split(&text).await, vec![text]);
    }

    #[test]
    fn pause_respects_jitter_band_and_cap() {
        let s = splitter(Some(""), ReplyConfig::default());
        let segment = "十个字的消息内容呀";
        let min = s.min_pause(segment).as_secs_f64();
        for _ in 0..50 {
            let pause = s.pause_after(segment).as_secs_f64();
            assert!(pause >= min - 1e-9);
            assert!(pause <= 5.0 + 1e-9);
        }

        // A very long segment hits the cap.
        let long = "字".repeat(500);
        assert!((s.pause_after(&long).as_secs_f64() - 5.0).abs() < 1e-9);
    }
}
