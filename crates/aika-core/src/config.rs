use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AikaError, Result};

/// Default system-prompt template for the reply generator. Placeholders are
/// substituted by the pipeline; `{group_name}` only exists in the group
/// variant.
pub const DEFAULT_REPLY_TEMPLATE: &str = "\
【角色设定】\n{role_profile}\n\n\
【表达风格】\n{expression_style}\n\n\
【当前时间】{current_datetime}\n\
【对话对象】{user_name}\n\
【好感度】{affection_level}\n\n\
【记忆摘要】\n{memory_summary}\n\n\
【最近对话】\n{recent_dialogue}\n\n\
【相关知识】\n{kb_info}\n\n\
【对话规则】\n{conversation_rules}";

pub const DEFAULT_GROUP_REPLY_TEMPLATE: &str = "\
【角色设定】\n{role_profile}\n\n\
【表达风格】\n{expression_style}\n\n\
【当前时间】{current_datetime}\n\
【所在群聊】{group_name}\n\
【对话对象】{user_name}\n\
【好感度】{affection_level}\n\n\
【记忆摘要】\n{memory_summary}\n\n\
【最近对话】\n{recent_dialogue}\n\n\
【相关知识】\n{kb_info}\n\n\
【对话规则】\n{conversation_rules}";

/// Default organizer system prompt. `{memory_content}` is replaced with the
/// formatted long-term memory block before the call.
pub const DEFAULT_ORGANIZER_PROMPT: &str = "\
你是记忆整理助手。基于下面的历史记忆，概括角色与对方之间的重要互动和关系特征。\n\
输出一段话，不超过100字。用对方的名字或\"对方\"指代，禁止使用\"用户\"一词。\n\
不要生成回复，只做概括。\n\n\
【历史记忆】\n{memory_content}";

pub const DEFAULT_KB_ORGANIZER_PROMPT: &str = "\
你是知识库整理助手。从检索到的知识库中提取与用户消息相关的信息。\n\n\
【输出要求】\n\
1. 只输出与用户消息直接相关的信息\n\
2. 客观、简洁、清晰，不超过150字\n\
3. 如果知识库内容与用户消息无关，输出\"无相关知识\"\n\
4. 不要编造信息，只基于提供的知识库内容";

/// Top-level config (`configs/aika.toml` + `AIKA_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AikaConfig {
    #[serde(default)]
    pub common: CommonConfig,
    pub providers: HashMap<String, ProviderConfig>,
    pub models: ModelsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub role: RoleConfig,
    #[serde(default)]
    pub emoji: EmojiConfig,
    #[serde(default)]
    pub retrieval: RetrievalTuning,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Sticker collection: learned from incoming emoji images, sent back
/// probabilistically when a reply matches one semantically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmojiConfig {
    #[serde(default)]
    pub enable: bool,
    /// Chance of attaching an emoji image after a reply.
    #[serde(default = "default_emoji_probability")]
    pub sending_probability: f64,
    #[serde(default = "default_emoji_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_emoji_dir")]
    pub dir: String,
}

impl Default for EmojiConfig {
    fn default() -> Self {
        Self {
            enable: false,
            sending_probability: default_emoji_probability(),
            similarity_threshold: default_emoji_threshold(),
            dir: default_emoji_dir(),
        }
    }
}

/// Persona-specific knowledge-retrieval tuning: weighted keywords, synonym
/// expansion and negative filtering applied on top of vector similarity.
/// The tables live in config so the code stays character-agnostic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalTuning {
    #[serde(default)]
    pub enable: bool,
    /// Keyword → weight. Matched keywords boost a hit's final score.
    #[serde(default)]
    pub keyword_weights: HashMap<String, f32>,
    /// Canonical term → alternate surface forms found in queries.
    #[serde(default)]
    pub synonyms: HashMap<String, Vec<String>>,
    /// Hits containing any of these are dropped outright.
    #[serde(default)]
    pub negative_keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    pub default_provider: String,
    /// Reply shown when the generator itself fails. Never a stack trace.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    /// When the organizer stage errors, continue with a trivial summary
    /// instead of failing the whole turn.
    #[serde(default = "bool_true")]
    pub skip_organizer_on_failure: bool,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            default_provider: String::new(),
            fallback_reply: default_fallback_reply(),
            skip_organizer_on_failure: true,
        }
    }
}

/// One OpenAI-compatible endpoint. `api_base` carries no trailing slash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Named model roles of the pipeline. Optional roles degrade gracefully:
/// no `kb_organizer` means raw knowledge hits are passed through, no
/// `vision` means image parts are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub organizer: ModelRole,
    pub kb_organizer: Option<ModelRole>,
    pub generator: ModelRole,
    pub embedding: EmbeddingRole,
    pub vision: Option<ModelRole>,
    pub vision_caption: Option<ModelRole>,
    pub guard: ModelRole,
    pub utility: ModelRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRole {
    /// Provider name; empty string falls back to `common.default_provider`.
    #[serde(default)]
    pub provider: String,
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-role timeout override in seconds; 0 uses the provider timeout.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Role-specific system prompt; empty uses the built-in default.
    #[serde(default)]
    pub system_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRole {
    #[serde(default)]
    pub provider: String,
    pub model_name: String,
    pub vector_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for every persisted database and index file.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_retrieve_count")]
    pub retrieve_count: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_kb_similarity_threshold")]
    pub kb_similarity_threshold: f32,
    /// Widen memory search across scenes (private sees group rows, group
    /// search scans the user's other groups).
    #[serde(default)]
    pub cross_scene: bool,
    #[serde(default = "bool_true")]
    pub enable_vector_memory: bool,
    /// GC leaves the vector index stale and warns (original behavior).
    /// Set true to rebuild the index inline after every GC pass.
    #[serde(default)]
    pub rebuild_after_gc: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            retrieve_count: default_retrieve_count(),
            similarity_threshold: default_similarity_threshold(),
            kb_similarity_threshold: default_kb_similarity_threshold(),
            cross_scene: false,
            enable_vector_memory: true,
            rebuild_after_gc: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "bool_true")]
    pub enable: bool,
    /// Messages shorter than this skip the guard entirely.
    #[serde(default = "default_guard_min_chars")]
    pub min_check_chars: usize,
    #[serde(default = "default_ban_minutes")]
    pub ban_minutes: i64,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enable: true,
            min_check_chars: default_guard_min_chars(),
            ban_minutes: default_ban_minutes(),
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    #[serde(default = "bool_true")]
    pub enable_split: bool,
    #[serde(default = "default_split_threshold")]
    pub split_threshold: usize,
    #[serde(default = "default_min_segment_length")]
    pub min_segment_length: usize,
    /// Seconds of simulated typing per character.
    #[serde(default = "default_typing_speed")]
    pub typing_speed: f64,
    /// Hard cap on the inter-segment pause in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            enable_split: true,
            split_threshold: default_split_threshold(),
            min_segment_length: default_min_segment_length(),
            typing_speed: default_typing_speed(),
            max_delay: default_max_delay(),
        }
    }
}

/// Persona definition. Templates use `{placeholder}` substitution; rules may
/// reference `{user_name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    #[serde(default = "default_persona_name")]
    pub name: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub speaking_style: String,
    #[serde(default)]
    pub conversation_rules: String,
    /// Anchor paragraph embedded once and compared against replies when the
    /// persona-vector drift check is enabled.
    #[serde(default)]
    pub persona_anchor: String,
    /// Embedding-similarity drift check on every reply. Off by default, it
    /// costs one embedding call per turn.
    #[serde(default)]
    pub persona_vector_check: bool,
    #[serde(default = "default_persona_threshold")]
    pub persona_threshold: f32,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub group_template: String,
    #[serde(default)]
    pub recent_dialogue: RecentDialogueConfig,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            name: default_persona_name(),
            profile: String::new(),
            speaking_style: String::new(),
            conversation_rules: String::new(),
            persona_anchor: String::new(),
            persona_vector_check: false,
            persona_threshold: default_persona_threshold(),
            template: String::new(),
            group_template: String::new(),
            recent_dialogue: RecentDialogueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentDialogueConfig {
    #[serde(default = "default_private_rounds")]
    pub private_max_rounds: usize,
    #[serde(default = "default_group_rounds")]
    pub group_max_rounds: usize,
    #[serde(default = "default_dialogue_chars")]
    pub max_chars: usize,
}

impl Default for RecentDialogueConfig {
    fn default() -> Self {
        Self {
            private_max_rounds: default_private_rounds(),
            group_max_rounds: default_group_rounds(),
            max_chars: default_dialogue_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_bind")]
    pub bind: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
    #[serde(default)]
    pub token: String,
    /// User ids allowed to issue `/` admin commands through the chat adapter.
    #[serde(default)]
    pub admin_users: Vec<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: default_admin_bind(),
            port: default_admin_port(),
            token: String::new(),
            admin_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_gc_hours")]
    pub memory_gc_hours: u64,
    #[serde(default = "default_sweep_minutes")]
    pub blacklist_sweep_minutes: u64,
    #[serde(default = "default_graph_hours")]
    pub graph_cleanup_hours: u64,
    /// Users handled per graph-cleanup run, to bound LLM spend.
    #[serde(default = "default_graph_users")]
    pub graph_users_per_run: usize,
    #[serde(default = "default_warmup_users")]
    pub warmup_users: usize,
    #[serde(default = "default_warmup_messages")]
    pub warmup_messages: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            memory_gc_hours: default_gc_hours(),
            blacklist_sweep_minutes: default_sweep_minutes(),
            graph_cleanup_hours: default_graph_hours(),
            graph_users_per_run: default_graph_users(),
            warmup_users: default_warmup_users(),
            warmup_messages: default_warmup_messages(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_fallback_reply() -> String {
    "……内部出了点问题，等我一下".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_retrieve_count() -> usize {
    5
}
fn default_similarity_threshold() -> f32 {
    0.55
}
fn default_kb_similarity_threshold() -> f32 {
    0.45
}
fn default_guard_min_chars() -> usize {
    12
}
fn default_ban_minutes() -> i64 {
    30
}
fn default_split_threshold() -> usize {
    50
}
fn default_min_segment_length() -> usize {
    5
}
fn default_typing_speed() -> f64 {
    0.15
}
fn default_max_delay() -> f64 {
    5.0
}
fn default_persona_threshold() -> f32 {
    0.45
}
fn default_emoji_probability() -> f64 {
    0.15
}
fn default_emoji_threshold() -> f32 {
    0.5
}
fn default_emoji_dir() -> String {
    "data/emoji".to_string()
}
fn default_persona_name() -> String {
    "爱佳".to_string()
}
fn default_private_rounds() -> usize {
    6
}
fn default_group_rounds() -> usize {
    4
}
fn default_dialogue_chars() -> usize {
    400
}
fn default_admin_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_admin_port() -> u16 {
    18650
}
fn default_gc_hours() -> u64 {
    12
}
fn default_sweep_minutes() -> u64 {
    10
}
fn default_graph_hours() -> u64 {
    4
}
fn default_graph_users() -> usize {
    5
}
fn default_warmup_users() -> usize {
    20
}
fn default_warmup_messages() -> usize {
    200
}

impl AikaConfig {
    /// Load from a TOML file with `AIKA_*` env overrides, then validate that
    /// every model role references a known provider.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.unwrap_or("configs/aika.toml");

        let config: AikaConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("AIKA_").split("__"))
            .extract()
            .map_err(|e| AikaError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.common.default_provider.is_empty() {
            return Err(AikaError::Config(
                "common.default_provider is required".to_string(),
            ));
        }
        if !self.providers.contains_key(&self.common.default_provider) {
            return Err(AikaError::UnknownProvider {
                name: self.common.default_provider.clone(),
            });
        }

        let mut roles: Vec<(&str, &str)> = vec![
            ("organizer", self.models.organizer.provider.as_str()),
            ("generator", self.models.generator.provider.as_str()),
            ("embedding", self.models.embedding.provider.as_str()),
            ("guard", self.models.guard.provider.as_str()),
            ("utility", self.models.utility.provider.as_str()),
        ];
        if let Some(r) = &self.models.kb_organizer {
            roles.push(("kb_organizer", r.provider.as_str()));
        }
        if let Some(r) = &self.models.vision {
            roles.push(("vision", r.provider.as_str()));
        }
        if let Some(r) = &self.models.vision_caption {
            roles.push(("vision_caption", r.provider.as_str()));
        }

        for (role, provider) in roles {
            if !provider.is_empty() && !self.providers.contains_key(provider) {
                return Err(AikaError::Config(format!(
                    "model role '{role}' references unknown provider '{provider}'"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a role's provider config, falling back to the default
    /// provider for empty names.
    pub fn provider_for(&self, role_provider: &str) -> Result<&ProviderConfig> {
        let name = if role_provider.is_empty() {
            &self.common.default_provider
        } else {
            role_provider
        };
        self.providers
            .get(name)
            .ok_or_else(|| AikaError::UnknownProvider {
                name: name.to_string(),
            })
    }
}

impl ModelRole {
    /// Effective timeout: role override wins, otherwise provider default.
    pub fn effective_timeout(&self, provider: &ProviderConfig) -> u64 {
        if self.timeout_secs > 0 {
            self.timeout_secs
        } else {
            provider.timeout_secs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [common]
            default_provider = "main"

            [providers.main]
            api_base = "https://api.example.com/v1"
            api_key = "sk-test"

            [models.organizer]
            model_name = "small-chat"

            [models.generator]
            model_name = "big-chat"

            [models.embedding]
            model_name = "embed-1"
            vector_dim = 1024

            [models.guard]
            model_name = "small-chat"
            max_tokens = 8

            [models.utility]
            model_name = "small-chat"
        "#
    }

    fn parse(toml: &str) -> Result<AikaConfig> {
        let config: AikaConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| AikaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = parse(minimal_toml()).unwrap();
        assert_eq!(cfg.storage.retrieve_count, 5);
        assert!(cfg.storage.enable_vector_memory);
        assert!(!cfg.storage.rebuild_after_gc);
        assert_eq!(cfg.reply.split_threshold, 50);
        assert_eq!(cfg.role.recent_dialogue.private_max_rounds, 6);
        assert_eq!(cfg.role.recent_dialogue.group_max_rounds, 4);
        assert!(cfg.models.kb_organizer.is_none());
    }

    #[test]
    fn unknown_role_provider_is_rejected() {
        let toml = minimal_toml().to_string()
            + r#"
            [models.kb_organizer]
            provider = "nope"
            model_name = "x"
        "#;
        let err = parse(&toml).unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn missing_default_provider_is_rejected() {
        let toml = minimal_toml().replace("default_provider = \"main\"", "default_provider = \"gone\"");
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn role_timeout_falls_back_to_provider() {
        let cfg = parse(minimal_toml()).unwrap();
        let provider = cfg.provider_for("").unwrap();
        assert_eq!(cfg.models.organizer.effective_timeout(provider), 60);
        let mut role = cfg.models.organizer.clone();
        role.timeout_secs = 5;
        assert_eq!(role.effective_timeout(provider), 5);
    }
}
