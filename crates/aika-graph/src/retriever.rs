//! Graph-backed retrieval for the reply pipeline.
//!
//! A small model call pulls 2–3 keywords and an optional time phrase out of
//! the query; on failure a stopword-filtered n-gram heuristic takes over.
//! Matched entities (by name or alias) are expanded two hops, optionally
//! filtered by the time phrase, deduplicated and rendered as short
//! natural-language clauses.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};

use aika_core::config::ModelRole;
use aika_llm::{ChatMessage, LlmClient};

use crate::error::Result;
use crate::extractor::EntityExtractor;
use crate::store::GraphStore;
use crate::types::{EntityMatch, NeighborEdge};

const MAX_KEYWORDS: usize = 3;
const ENTITIES_PER_KEYWORD: usize = 3;
const MAX_ENTITIES: usize = 5;
const NEIGHBORS_PER_ENTITY: usize = 5;
const MAX_CLAUSES: usize = 8;
const TRAVERSAL_DEPTH: usize = 2;

/// Surface time phrases mapped to an age window in seconds. Tuple windows
/// are (min_age, max_age); scalars mean "within".
fn time_window(time_ref: &str) -> Option<TimeWindow> {
    match time_ref {
        "刚才" | "刚刚" => Some(TimeWindow::Within(3600)),
        "最近" => Some(TimeWindow::Within(7 * 86_400)),
        "昨天" => Some(TimeWindow::Between(86_400, 2 * 86_400)),
        "前天" => Some(TimeWindow::Between(2 * 86_400, 3 * 86_400)),
        "上次" | "之前" => Some(TimeWindow::Within(30 * 86_400)),
        _ => None,
    }
}

enum TimeWindow {
    Within(i64),
    Between(i64, i64),
}

const TIME_KEYWORDS: &[&str] = &[
    "昨天", "前天", "上次", "最近", "刚才", "刚刚", "之前", "上周", "上个月", "去年", "那天",
    "那时", "当时",
];

const STOPWORDS: &[&str] = &[
    "什么", "怎么", "为什么", "哪里", "怎样", "如何", "是否", "可以", "能不能", "有没有",
    "为何", "何时", "何地", "谁的", "哪个", "哪些", "你的", "我的", "他的", "她的", "它的",
    "我们", "你们", "他们", "这个", "那个", "这些", "那些", "这样", "那样", "知道", "觉得",
    "认为", "感觉", "想要", "希望", "需要", "应该", "不是", "没有", "不要", "不会", "不能",
    "还是", "或者", "但是", "因为", "所以", "如果", "虽然", "然后", "接着", "于是",
];

pub struct GraphRetriever {
    store: Arc<GraphStore>,
    extractor: EntityExtractor,
    llm: Arc<dyn LlmClient>,
    keyword_role: ModelRole,
    chinese_re: Regex,
    latin_re: Regex,
}

impl GraphRetriever {
    pub fn new(
        store: Arc<GraphStore>,
        llm: Arc<dyn LlmClient>,
        organizer: &ModelRole,
        persona_name: &str,
    ) -> Self {
        let mut keyword_role = organizer.clone();
        keyword_role.temperature = 0.1;
        keyword_role.max_tokens = 50;
        Self {
            extractor: EntityExtractor::new(Arc::clone(&llm), organizer, persona_name),
            store,
            llm,
            keyword_role,
            chinese_re: Regex::new(r"[\u{4e00}-\u{9fa5}]{2,4}").unwrap(),
            latin_re: Regex::new(r"[a-zA-Z]{3,}").unwrap(),
        }
    }

    /// Retrieve related facts for a query. Empty string means nothing usable
    /// was found; storage errors do propagate, model errors do not.
    pub async fn retrieve(&self, user_id: &str, query: &str, user_name: &str) -> Result<String> {
        let (mut keywords, mut time_ref) = self.extract_keywords_with_time(query, user_name).await;
        if keywords.is_empty() {
            keywords = self.extract_keywords_simple(query);
            time_ref = extract_time_simple(query);
        }
        debug!(?keywords, %time_ref, "graph retrieval keywords");

        if keywords.is_empty() {
            return Ok(String::new());
        }

        // Entity lookup per keyword, by name then by alias.
        let mut entities: Vec<EntityMatch> = Vec::new();
        for keyword in keywords.iter().take(MAX_KEYWORDS) {
            entities.extend(self.store.search_entities(user_id, keyword, ENTITIES_PER_KEYWORD)?);
            entities.extend(self.store.search_by_alias(user_id, keyword)?);
        }
        if entities.is_empty() {
            return Ok(String::new());
        }

        let mut clauses = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for entity in entities.iter().take(MAX_ENTITIES) {
            let mut neighbors =
                self.store
                    .get_neighbors(user_id, &entity.entity, TRAVERSAL_DEPTH)?;
            if !time_ref.is_empty() {
                neighbors = filter_by_time(neighbors, &time_ref, Utc::now().timestamp());
            }

            for neighbor in neighbors.iter().take(NEIGHBORS_PER_ENTITY) {
                let key = format!(
                    "{}-{}-{}",
                    neighbor.source, neighbor.relation, neighbor.target
                );
                if !seen.insert(key) {
                    continue;
                }
                let time_info = neighbor
                    .properties
                    .get("time_ref")
                    .and_then(|t| t.as_str())
                    .unwrap_or("");
                clauses.push(format!(
                    "{time_info}{}{}{}",
                    neighbor.source, neighbor.relation, neighbor.target
                ));
            }
        }

        if clauses.is_empty() {
            return Ok(String::new());
        }
        clauses.truncate(MAX_CLAUSES);
        info!(user_id, relations = clauses.len(), "graph retrieval hit");
        Ok(clauses.join("、"))
    }

    /// Two-line LLM extraction: keywords on the first line, time phrase (or
    /// 无) on the second. Any failure falls back to the heuristic.
    async fn extract_keywords_with_time(
        &self,
        query: &str,
        user_name: &str,
    ) -> (Vec<String>, String) {
        let system_prompt = "你是关键词提取助手。从用户消息中提取关键实体和时间指代。\n\n\
             【输出格式】\n\
             第一行: 2-3个关键词(用逗号分隔)\n\
             第二行: 时间指代(如\"昨天\"、\"上次\"、\"最近\"，没有则输出\"无\")\n\n\
             【示例】\n\
             输入: 你怎么知道她不需要\n\
             输出:\n\
             她，不需要\n\
             无";
        let user_prompt = format!("用户（{user_name}）说：{query}\n\n请提取关键实体和时间指代：");

        let outcome = match self
            .llm
            .chat(
                &self.keyword_role,
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
                debug!("keyword extraction call failed: {e}");
                return (Vec::new(), String::new());
            }
        };

        let lines: Vec<&str> = outcome
            .content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if lines.is_empty() {
            return (Vec::new(), String::new());
        }

        let keywords: Vec<String> = lines[0]
            .split([',', '，'])
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .take(5)
            .map(String::from)
            .collect();
        let time_ref = lines
            .get(1)
            .filter(|l| **l != "无")
            .map(|l| l.to_string())
            .unwrap_or_default();

        (keywords, time_ref)
    }

    /// Heuristic fallback: 2–4-char Chinese n-grams minus stopwords, plus
    /// 3+ char Latin tokens.
    fn extract_keywords_simple(&self, text: &str) -> Vec<String> {
        let mut keywords = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for m in self.chinese_re.find_iter(text) {
            let word = m.as_str();
            if STOPWORDS.contains(&word) || seen.contains(word) {
                continue;
            }
            seen.insert(word.to_string());
            keywords.push(word.to_string());
        }
        for m in self.latin_re.find_iter(text) {
            let lower = m.as_str().to_lowercase();
            if seen.contains(&lower) {
                continue;
            }
            seen.insert(lower);
            keywords.push(m.as_str().to_string());
        }

        keywords.truncate(5);
        keywords
    }

    /// Background side effect after a turn: extract and upsert. Errors are
    /// logged and dropped so the spawner never sees them.
    pub async fn add_dialogue_to_graph(
        &self,
        user_id: &str,
        user_message: &str,
        bot_reply: &str,
        user_name: &str,
    ) {
        let extracted = self
            .extractor
            .extract_from_dialogue(user_message, bot_reply, user_name)
            .await;

        if extracted.entities.is_empty() && extracted.relations.is_empty() {
            debug!(user_id, "no entities or relations extracted");
            return;
        }

        for entity in &extracted.entities {
            let entity_type = if entity.entity_type.is_empty() {
                "其他"
            } else {
                &entity.entity_type
            };
            let alias = (!entity.alias.is_empty()).then_some(entity.alias.as_str());
            if let Err(e) = self
                .store
                .add_node(user_id, &entity.name, Some(entity_type), alias)
            {
                warn!(user_id, entity = %entity.name, "graph node insert failed: {e}");
            }
        }

        for relation in &extracted.relations {
            let time_ref = if !relation.time_ref.is_empty() {
                relation.time_ref.as_str()
            } else {
                extracted.time_context.as_str()
            };
            let time_ref = (!time_ref.is_empty()).then_some(time_ref);
            if let Err(e) = self.store.add_edge(
                user_id,
                &relation.source,
                &relation.target,
                &relation.relation,
                time_ref,
            ) {
                warn!(user_id, "graph edge insert failed: {e}");
            }
        }

        info!(
            user_id,
            entities = extracted.entities.len(),
            relations = extracted.relations.len(),
            "dialogue folded into graph"
        );
    }
}

fn extract_time_simple(text: &str) -> String {
    TIME_KEYWORDS
        .iter()
        .find(|k| text.contains(*k))
        .map(|k| k.to_string())
        .unwrap_or_default()
}

/// Apply a time window to edges carrying a recorded timestamp. Edges without
/// timestamps pass through untouched when none carry one; an empty filter
/// result degrades to the five most recent.
fn filter_by_time(neighbors: Vec<NeighborEdge>, time_ref: &str, now: i64) -> Vec<NeighborEdge> {
    let Some(window) = time_window(time_ref) else {
        return neighbors;
    };

    let mut timed: Vec<(i64, NeighborEdge)> = neighbors
        .iter()
        .filter_map(|n| {
            n.properties
                .get("timestamp")
                .and_then(|t| t.as_i64())
                .map(|ts| (ts, n.clone()))
        })
        .collect();
    if timed.is_empty() {
        return neighbors;
    }

    let mut filtered: Vec<(i64, NeighborEdge)> = timed
        .iter()
        .filter(|(ts, _)| {
            let age = now - ts;
            match window {
                TimeWindow::Within(max) => age <= max,
                TimeWindow::Between(min, max) => age >= min && age < max,
            }
        })
        .cloned()
        .collect();

    if filtered.is_empty() {
        timed.sort_by_key(|(ts, _)| std::cmp::Reverse(*ts));
        return timed.into_iter().take(5).map(|(_, n)| n).collect();
    }

    filtered.sort_by_key(|(ts, _)| std::cmp::Reverse(*ts));
    filtered.into_iter().map(|(_, n)| n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rusqlite::Connection;

    use aika_llm::{ChatOutcome, LlmError};

    struct ScriptedLlm {
        reply: String,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(
            &self,
            _role: &ModelRole,
            _messages: Vec<ChatMessage>,
            _temperature_override: Option<f32>,
        ) -> std::result::Result<ChatOutcome, LlmError> {
            if self.reply.is_empty() {
                return Err(LlmError::Transport("scripted failure".to_string()));
            }
            Ok(ChatOutcome {
                content: self.reply.clone(),
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

    fn retriever(reply: &str) -> GraphRetriever {
        let store = Arc::new(GraphStore::new(Connection::open_in_memory().unwrap()).unwrap());
        GraphRetriever::new(
            store,
            Arc::new(ScriptedLlm {
                reply: reply.to_string(),
            }),
            &organizer(),
            "爱佳",
        )
    }

    fn edge(source: &str, target: &str, ts: Option<i64>) -> NeighborEdge {
        NeighborEdge {
            source: source.to_string(),
            target: target.to_string(),
            relation: "提到".to_string(),
            weight: 1.0,
            depth: 1,
            properties: match ts {
                Some(ts) => serde_json::json!({"timestamp": ts, "time_ref": "之前"}),
                None => serde_json::json!({}),
            },
        }
    }

    #[test]
    fn simple_keywords_skip_stopwords_and_keep_latin() {
        let r = retriever("");
        let kws = r.extract_keywords_simple("知道 艾玛 焙茶 Rust ok");
        assert!(kws.contains(&"艾玛".to_string()));
        assert!(kws.contains(&"焙茶".to_string()));
        assert!(kws.iter().any(|k| k == "Rust"));
        // Stopwords and sub-3-char Latin tokens are dropped.
        assert!(!kws.contains(&"知道".to_string()));
        assert!(!kws.iter().any(|k| k == "ok"));
    }

    #[test]
    fn time_phrase_detection() {
        assert_eq!(extract_time_simple("昨天那件事怎么样了"), "昨天");
        assert_eq!(extract_time_simple("我们聊聊天气"), "");
    }

    #[test]
    fn time_filter_keeps_window_and_degrades_to_recent() {
        let now = 1_700_000_000i64;
        let edges = vec![
            edge("甲", "乙", Some(now - 1800)),          // 30 min ago
            edge("甲", "丙", Some(now - 5 * 86_400)),    // 5 days ago
            edge("甲", "丁", None),
        ];

        let recent = filter_by_time(edges.clone(), "刚才", now);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].target, "乙");

        // 昨天 matches nothing → most recent few come back instead.
        let fallback = filter_by_time(edges.clone(), "昨天", now);
        assert_eq!(fallback.len(), 2);
        assert_eq!(fallback[0].target, "乙");

        // Unknown phrase: untouched.
        let untouched = filter_by_time(edges.clone(), "某时", now);
        assert_eq!(untouched.len(), 3);
    }

    #[tokio::test]
    async fn retrieve_formats_clauses_and_dedupes() {
        let store = Arc::new(GraphStore::new(Connection::open_in_memory().unwrap()).unwrap());
        store.add_node("u1", "艾玛", Some("人物"), Some("她")).unwrap();
        store.add_node("u1", "焙茶", Some("物品"), None).unwrap();
        store.add_edge("u1", "艾玛", "焙茶", "喜欢", None).unwrap();

        let r = GraphRetriever::new(
            Arc::clone(&store),
            Arc::new(ScriptedLlm {
                reply: "艾玛，焙茶\n无".to_string(),
            }),
            &organizer(),
            "爱佳",
        );

        let out = r.retrieve("u1", "艾玛喜欢什么", "测试者").await.unwrap();
        assert_eq!(out, "艾玛喜欢焙茶");
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_heuristic() {
        let store = Arc::new(GraphStore::new(Connection::open_in_memory().unwrap()).unwrap());
        store.add_node("u1", "焙茶", Some("物品"), None).unwrap();
        store.add_node("u1", "奶糖", Some("物品"), None).unwrap();
        store.add_edge("u1", "焙茶", "奶糖", "配", None).unwrap();

        let r = GraphRetriever::new(
            Arc::clone(&store),
            Arc::new(ScriptedLlm {
                reply: String::new(),
            }),
            &organizer(),
            "爱佳",
        );

        let out = r.retrieve("u1", "焙茶 好喝吗", "测试者").await.unwrap();
        assert_eq!(out, "焙茶配奶糖");
    }

    #[tokio::test]
    async fn no_keywords_means_empty_result() {
        let r = retriever("无\n无");
        // The scripted reply's first line is "无" which becomes a keyword;
        // on a store with no entities the result is still empty.
        let out = r.retrieve("u1", "嗯嗯", "测试者").await.unwrap();
        assert!(out.is_empty());
    }
}
