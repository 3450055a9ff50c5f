//! LLM-driven entity/relation extraction from one dialogue turn.
//!
//! Runs on the organizer model (the cheap one) at low temperature. The model
//! answers in JSON, sometimes wrapped in a code fence; parsing tolerates
//! both. A failed extraction yields an empty result, never an error that
//! could reach the reply path.

use std::sync::Arc;

use tracing::{debug, info, warn};

use aika_core::config::ModelRole;
use aika_llm::{ChatMessage, LlmClient};

use crate::types::ExtractedGraph;

pub struct EntityExtractor {
    llm: Arc<dyn LlmClient>,
    role: ModelRole,
    persona_name: String,
}

impl EntityExtractor {
    /// `organizer` is cloned into an extraction role at temperature 0.4.
    pub fn new(llm: Arc<dyn LlmClient>, organizer: &ModelRole, persona_name: &str) -> Self {
        let mut role = organizer.clone();
        role.temperature = 0.4;
        role.max_tokens = 500;
        Self {
            llm,
            role,
            persona_name: persona_name.to_string(),
        }
    }

    pub async fn extract_from_dialogue(
        &self,
        user_message: &str,
        bot_reply: &str,
        user_name: &str,
    ) -> ExtractedGraph {
        let system_prompt = self.build_system_prompt(user_name);
        let user_prompt = format!(
            "【对话内容】\n{user_name}：{user_message}\n{}：{bot_reply}\n\n\
             请提取实体和关系（JSON格式）：",
            self.persona_name
        );

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
                warn!("entity extraction call failed: {e}");
                return ExtractedGraph::default();
            }
        };

        match parse_extraction(&outcome.content) {
            Ok(extracted) => {
                info!(
                    entities = extracted.entities.len(),
                    relations = extracted.relations.len(),
                    time_context = %extracted.time_context,
                    "dialogue extraction done"
                );
                extracted
            }
            Err(e) => {
                warn!("entity extraction parse failed: {e}");
                debug!(raw = %outcome.content, "unparseable extraction output");
                ExtractedGraph::default()
            }
        }
    }

    fn build_system_prompt(&self, user_name: &str) -> String {
        let persona = &self.persona_name;
        format!(
            "你是知识图谱构建助手。从对话中提取关键实体、关系和时间信息。\n\n\
             【输出格式】JSON格式，包含三个字段：\n\
             1. entities: 实体列表，每个实体包含：\n\
                - name: 实体名（具体名称）\n\
                - type: 类型（人物/地点/事件/物品/情感/其他）\n\
                - alias: 别名或指代（如\"她\"、\"那个人\"，没有则为空）\n\
             2. relations: 关系列表，每个关系包含：\n\
                - source: 源实体（具体名称）\n\
                - target: 目标实体（具体名称）\n\
                - relation: 关系描述（动词短语，如\"喜欢\"、\"去过\"、\"讨厌\"）\n\
                - time_ref: 时间指代（如\"昨天\"、\"上次\"、\"最近\"，没有则为空）\n\
             3. time_context: 对话中的时间上下文（没有则为空）\n\n\
             【提取规则】\n\
             - 只提取重要的实体（人名、地名、事件、物品等）\n\
             - 关系要简洁明确（如：喜欢、讨厌、去过、拥有、提到等）\n\
             - {persona} 是 Bot，{user_name} 是用户\n\
             - 如果对话中有\"她\"、\"他\"、\"那个\"等指代词，尝试推断具体指代谁，填入 alias 字段\n\
             - 如果对话中有时间词（昨天、上次、最近、刚才等），提取到 time_ref 和 time_context\n\
             - 如果没有明显实体或关系，返回空列表\n\n\
             【示例】\n\
             输入：\n\
             用户：我昨天去了东京塔\n\
             Bot：东京塔的夜景很美\n\n\
             输出：\n\
             {{\n\
               \"entities\": [\n\
                 {{\"name\": \"{user_name}\", \"type\": \"人物\", \"alias\": \"\"}},\n\
                 {{\"name\": \"东京塔\", \"type\": \"地点\", \"alias\": \"\"}}\n\
               ],\n\
               \"relations\": [\n\
                 {{\"source\": \"{user_name}\", \"target\": \"东京塔\", \"relation\": \"去过\", \"time_ref\": \"昨天\"}}\n\
               ],\n\
               \"time_context\": \"昨天\"\n\
             }}"
        )
    }
}

/// Pull the JSON object out of the model's answer, tolerating ```json fences
/// and leading/trailing prose.
pub(crate) fn parse_extraction(raw: &str) -> Result<ExtractedGraph, String> {
    let trimmed = raw.trim();
    let candidate = if let Some(fenced) = extract_fenced(trimmed) {
        fenced
    } else {
        let start = trimmed.find('{').ok_or("no JSON object in output")?;
        let end = trimmed.rfind('}').ok_or("unterminated JSON object")?;
        if end < start {
            return Err("unterminated JSON object".to_string());
        }
        &trimmed[start..=end]
    };

    serde_json::from_str::<ExtractedGraph>(candidate).map_err(|e| e.to_string())
}

fn extract_fenced(text: &str) -> Option<&str> {
    let after = text.split_once("```json").or_else(|| text.split_once("```"))?;
    let inner = after.1;
    let end = inner.find("```")?;
    Some(inner[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let raw = r#"{"entities": [{"name": "东京塔", "type": "地点", "alias": ""}],
                      "relations": [{"source": "u", "target": "东京塔", "relation": "去过", "time_ref": "昨天"}],
                      "time_context": "昨天"}"#;
        let parsed = parse_extraction(raw).unwrap();
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.relations[0].time_ref, "昨天");
        assert_eq!(parsed.time_context, "昨天");
    }

    #[test]
    fn parses_fenced_json_with_prose() {
        let raw = "提取结果如下：\n```json\n{\"entities\": [], \"relations\": [], \"time_context\": \"\"}\n```\n完毕";
        let parsed = parse_extraction(raw).unwrap();
        assert!(parsed.entities.is_empty());
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let parsed = parse_extraction(r#"{"entities": [{"name": "x"}]}"#).unwrap();
        assert_eq!(parsed.entities[0].entity_type, "");
        assert!(parsed.relations.is_empty());
        assert_eq!(parsed.time_context, "");
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_extraction("抱歉，我无法完成这个任务").is_err());
        assert!(parse_extraction("{broken json").is_err());
    }
}
