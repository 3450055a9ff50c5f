//! AI-driven graph cleanup.
//!
//! For a bounded set of users, the organizer model looks at the entity list
//! and names (a) groups of duplicates with a main entity, and (b) useless or
//! low-value entities. Duplicates are merged through the store, useless
//! nodes deleted with their edges. Model misbehavior degrades to a no-op;
//! the heuristic cleanups in `GraphStore` remain available independently.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use aika_core::config::ModelRole;
use aika_llm::{ChatMessage, LlmClient};

use crate::error::Result;
use crate::store::GraphStore;
use crate::types::{CleanupOutcome, EntityMatch};

/// Entities shown to the model per user, to bound the prompt.
const ENTITY_PROMPT_LIMIT: usize = 50;

pub struct GraphCleaner {
    store: Arc<GraphStore>,
    llm: Arc<dyn LlmClient>,
    role: ModelRole,
}

#[derive(Debug, Deserialize)]
struct DuplicateGroup {
    main: String,
    #[serde(default)]
    duplicates: Vec<String>,
}

impl GraphCleaner {
    pub fn new(store: Arc<GraphStore>, llm: Arc<dyn LlmClient>, organizer: &ModelRole) -> Self {
        let mut role = organizer.clone();
        role.temperature = 0.1;
        role.max_tokens = 1000;
        Self { store, llm, role }
    }

    /// Clean one user's subgraph. Returns merge/delete counts.
    pub async fn cleanup_user(&self, user_id: &str) -> Result<CleanupOutcome> {
        let entities = self.store.search_entities(user_id, "", 100)?;
        if entities.is_empty() {
            return Ok(CleanupOutcome::default());
        }
        info!(user_id, entities = entities.len(), "AI graph cleanup start");

        let listing = self.entity_listing(user_id, &entities)?;
        let duplicates = self.identify_duplicates(user_id, &listing).await;
        let useless = self.identify_useless(user_id, &listing).await;

        let mut outcome = CleanupOutcome::default();
        for group in &duplicates {
            if !self.store.node_exists(user_id, &group.main)? {
                warn!(user_id, main = %group.main, "merge target absent, group skipped");
                continue;
            }
            outcome.merged += self
                .store
                .merge_entities(user_id, &group.main, &group.duplicates)?;
        }
        for entity in &useless {
            if self.store.delete_entity(user_id, entity)? {
                outcome.deleted += 1;
            }
        }

        info!(
            user_id,
            merged = outcome.merged,
            deleted = outcome.deleted,
            "AI graph cleanup done"
        );
        Ok(outcome)
    }

    /// Clean the `limit` users with the most nodes.
    pub async fn cleanup_users(&self, limit: usize) -> Result<CleanupOutcome> {
        let users = self.store.users()?;
        let mut total = CleanupOutcome::default();
        for user in users.into_iter().take(limit) {
            match self.cleanup_user(&user.user_id).await {
                Ok(outcome) => {
                    total.merged += outcome.merged;
                    total.deleted += outcome.deleted;
                }
                Err(e) => warn!(user_id = %user.user_id, "graph cleanup failed: {e}"),
            }
        }
        Ok(total)
    }

    fn entity_listing(&self, user_id: &str, entities: &[EntityMatch]) -> Result<String> {
        let mut lines = Vec::new();
        for (i, e) in entities.iter().take(ENTITY_PROMPT_LIMIT).enumerate() {
            let aliases = e.aliases();
            let alias_str = if aliases.is_empty() {
                String::new()
            } else {
                format!(" (别名: {})", aliases.join(", "))
            };
            let edge_count = self.store.edge_count(user_id, &e.entity)?;
            let edge_info = if edge_count > 0 {
                format!(" [{edge_count}条关系]")
            } else {
                " [孤立]".to_string()
            };
            lines.push(format!(
                "{}. {} ({}){}{}",
                i + 1,
                e.entity,
                e.entity_type.as_deref().unwrap_or("未知"),
                alias_str,
                edge_info
            ));
        }
        Ok(lines.join("\n"))
    }

    async fn identify_duplicates(&self, user_id: &str, listing: &str) -> Vec<DuplicateGroup> {
        let system_prompt = "你是知识图谱清理专家。分析实体列表，识别重复或相似的实体。\n\n\
             【判断标准】\n\
             1. 语义相同：如\"小明\"和\"小明同学\"\n\
             2. 指代相同：如\"她\"和\"小红\"（如果别名中有关联）\n\
             3. 简写/全称：如\"北京\"和\"北京市\"\n\
             4. 错别字：如\"小明\"和\"小名\"\n\n\
             【输出格式】\n\
             只输出 JSON 数组，每组重复实体一个对象：\n\
             [{\"main\": \"小明\", \"duplicates\": [\"小明同学\"]}]\n\
             如果没有重复实体，输出空数组：[]\n\n\
             【注意】\n\
             - 只输出 JSON，不要其他内容\n\
             - main 是保留的主实体\n\
             - 不确定的不要输出";
        let user_prompt = format!("用户 {user_id} 的实体列表：\n\n{listing}\n\n请识别重复实体：");

        match self.ask_json::<Vec<DuplicateGroup>>(system_prompt, &user_prompt).await {
            Some(groups) => groups
                .into_iter()
                .filter(|g| !g.main.is_empty() && !g.duplicates.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }

    async fn identify_useless(&self, user_id: &str, listing: &str) -> Vec<String> {
        let system_prompt = "你是知识图谱清理专家。分析实体列表，识别无用、低价值或孤立的实体。\n\n\
             【无用实体标准】\n\
             1. 孤立实体（0条关系）\n\
             2. 无意义词：如\"这个\"、\"那个\"、\"东西\"、\"事情\"\n\
             3. 通用动词：如\"做\"、\"说\"、\"去\"、\"看\"\n\
             4. 错误提取：如\"不知道\"、\"没有\"、\"可能\"\n\
             5. 过于泛化：如\"问题\"、\"情况\"、\"方面\"\n\n\
             【保留实体】具体人名、地名、物品名、专有名词、有多条关系的重要实体\n\n\
             【输出格式】\n\
             只输出 JSON 数组，包含无用实体的名称：[\"这个\", \"东西\"]\n\
             如果没有无用实体，输出空数组：[]\n\n\
             【注意】宁可保守，不确定的不要删除";
        let user_prompt = format!(
            "用户 {user_id} 的实体列表：\n\n{listing}\n\n请识别无用、低价值或孤立的实体："
        );

        self.ask_json::<Vec<String>>(system_prompt, &user_prompt)
            .await
            .unwrap_or_default()
    }

    async fn ask_json<T: serde::de::DeserializeOwned>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Option<T> {
        let outcome = match self
            .llm
            .chat(
                &self.role,
                vec![
                    ChatMessage::system(system_prompt),
                    ChatMessage::user(user_prompt),
                ],
                None,
            )
            .await
        {
            Ok(o) => o,
            Err(e) => {
                warn!("graph cleanup model call failed: {e}");
                return None;
            }
        };

        let text = strip_fence(&outcome.content);
        match serde_json::from_str::<T>(text) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("graph cleanup output unparseable: {e}");
                None
            }
        }
    }
}

fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let inner = trimmed
        .split_once("```json")
        .or_else(|| trimmed.split_once("```"))
        .map(|(_, rest)| rest);
    match inner.and_then(|r| r.split_once("```")) {
        Some((body, _)) => body.trim(),
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use std::sync::Mutex;

    use aika_llm::{ChatOutcome, LlmError};

    /// Replies with the queued strings in order.
    struct QueuedLlm {
        replies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for QueuedLlm {
        async fn chat(
            &self,
            _role: &ModelRole,
            _messages: Vec<ChatMessage>,
            _temperature_override: Option<f32>,
        ) -> std::result::Result<ChatOutcome, LlmError> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(LlmError::Transport("queue exhausted".to_string()));
            }
            Ok(ChatOutcome {
                content: replies.remove(0),
                ..Default::default()
            })
        }
    }

    fn organizer() -> ModelRole {
        ModelRole {
            provider: String::new(),
            model_name: "small-chat".to_string(),
            temperature: 0.3,
            max_tokens: 300,
            timeout_secs: 0,
            enabled: true,
            system_prompt: String::new(),
        }
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fence("```json\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_fence("```\n[]\n```"), "[]");
        assert_eq!(strip_fence("[3]"), "[3]");
    }

    #[tokio::test]
    async fn cleanup_merges_and_deletes_per_model_verdict() {
        let store = Arc::new(GraphStore::new(Connection::open_in_memory().unwrap()).unwrap());
        store.add_node("u1", "小明", Some("人物"), None).unwrap();
        store.add_node("u1", "小明同学", Some("人物"), None).unwrap();
        store.add_node("u1", "这个", Some("其他"), None).unwrap();
        store.add_node("u1", "篮球", Some("物品"), None).unwrap();
        store.add_edge("u1", "小明同学", "篮球", "喜欢", None).unwrap();

        let llm = Arc::new(QueuedLlm {
            replies: Mutex::new(vec![
                // duplicates verdict, fenced like real model output
                "```json\n[{\"main\": \"小明\", \"duplicates\": [\"小明同学\"]}]\n```".to_string(),
                // useless verdict
                "[\"这个\"]".to_string(),
            ]),
        });

        let cleaner = GraphCleaner::new(Arc::clone(&store), llm, &organizer());
        let outcome = cleaner.cleanup_user("u1").await.unwrap();

        assert_eq!(outcome.merged, 1);
        assert_eq!(outcome.deleted, 1);
        assert!(!store.node_exists("u1", "小明同学").unwrap());
        assert!(!store.node_exists("u1", "这个").unwrap());
        // The migrated edge now hangs off the main entity.
        assert_eq!(store.get_neighbors("u1", "小明", 1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn model_failure_is_a_noop() {
        let store = Arc::new(GraphStore::new(Connection::open_in_memory().unwrap()).unwrap());
        store.add_node("u1", "保留", None, None).unwrap();

        let llm = Arc::new(QueuedLlm {
            replies: Mutex::new(Vec::new()),
        });
        let cleaner = GraphCleaner::new(Arc::clone(&store), llm, &organizer());
        let outcome = cleaner.cleanup_user("u1").await.unwrap();

        assert_eq!(outcome.merged, 0);
        assert_eq!(outcome.deleted, 0);
        assert!(store.node_exists("u1", "保留").unwrap());
    }
}
