//! Prompt assembly for the two pipeline stages.
//!
//! Templates come from the role config (falling back to built-in ones) and
//! use `{placeholder}` substitution. The organizer sees the formatted
//! long-term memory with store-internal markers rewritten into names; the
//! generator sees the full structured persona prompt.

use chrono::Local;

use aika_core::config::{
    RoleConfig, DEFAULT_GROUP_REPLY_TEMPLATE, DEFAULT_ORGANIZER_PROMPT, DEFAULT_REPLY_TEMPLATE,
};
use aika_memory::short_term::DialogueTriple;

/// Everything the generator template can reference.
pub struct ReplyPromptInputs<'a> {
    pub user_name: &'a str,
    pub group_name: Option<&'a str>,
    pub memory_summary: &'a str,
    pub recent_dialogue: &'a str,
    pub kb_info: &'a str,
    pub affection_level: &'a str,
}

/// Fill the generator system prompt. The group template is used when a
/// group name is present and the role config carries one.
pub fn build_reply_prompt(role: &RoleConfig, inputs: &ReplyPromptInputs<'_>) -> String {
    let template = if inputs.group_name.is_some() {
        non_empty(&role.group_template)
            .or_else(|| non_empty(&role.template))
            .unwrap_or(DEFAULT_GROUP_REPLY_TEMPLATE)
    } else {
        non_empty(&role.template).unwrap_or(DEFAULT_REPLY_TEMPLATE)
    };

    let rules = role.conversation_rules.replace("{user_name}", inputs.user_name);
    let memory_summary = if inputs.memory_summary.trim().is_empty() {
        "暂无长期记忆"
    } else {
        inputs.memory_summary
    };
    let recent_dialogue = if inputs.recent_dialogue.is_empty() {
        "（暂无最近对话）"
    } else {
        inputs.recent_dialogue
    };
    let kb_info = if inputs.kb_info.is_empty() {
        "（无相关知识）"
    } else {
        inputs.kb_info
    };

    template
        .replace("{role_profile}", &role.profile)
        .replace("{expression_style}", &role.speaking_style)
        .replace(
            "{current_datetime}",
            &Local::now().format("%Y年%m月%d日 %H:%M:%S").to_string(),
        )
        .replace("{user_name}", inputs.user_name)
        .replace("{group_name}", inputs.group_name.unwrap_or(""))
        .replace("{affection_level}", inputs.affection_level)
        .replace("{memory_summary}", memory_summary)
        .replace("{recent_dialogue}", recent_dialogue)
        .replace("{kb_info}", kb_info)
        .replace("{conversation_rules}", &rules)
}

/// Organizer system prompt with the memory block spliced in. Store-internal
/// markers become display names so the model never sees them.
pub fn build_organizer_prompt(
    organizer_system_prompt: &str,
    long_mem: &str,
    user_name: &str,
    persona_name: &str,
) -> String {
    let template = non_empty(organizer_system_prompt).unwrap_or(DEFAULT_ORGANIZER_PROMPT);
    let memory_content = if long_mem.is_empty() {
        "(暂无历史记忆)".to_string()
    } else {
        long_mem
            .replace("[Pair] User问:", &format!("{user_name}:"))
            .replace("User问:", &format!("{user_name}:"))
            .replace("Bot答:", &format!("{persona_name}:"))
            .replace("[Pair] ", "")
    };
    template.replace("{memory_content}", &memory_content)
}

/// Organizer user prompt; the first-contact variant pins the expected
/// output.
pub fn build_organizer_user_prompt(user_name: &str, user_message: &str, has_memory: bool) -> String {
    if has_memory {
        format!("对话对象: {user_name}\n当前消息: {user_message}\n\n请整理上述历史记忆。")
    } else {
        format!(
            "对话对象: {user_name}\n当前消息: {user_message}\n\n这是首次对话，请输出: 首次对话，暂无历史互动"
        )
    }
}

/// Format recent short-term triples into `speaker: text` lines. Rounds are
/// dropped oldest-first when the block would exceed `max_chars`.
pub fn format_recent_dialogue(
    triples: &[DialogueTriple],
    user_name: &str,
    persona_name: &str,
    is_group: bool,
    max_chars: usize,
) -> String {
    if triples.is_empty() {
        return String::new();
    }

    let lines: Vec<String> = triples
        .iter()
        .map(|t| {
            let display = if is_group { &t.sender_name } else { user_name };
            format!("{display}：{}\n{persona_name}：{}", t.query, t.reply)
        })
        .collect();

    let full = lines.join("\n");
    if full.chars().count() <= max_chars {
        return full;
    }

    // Keep the newest rounds whole; older ones fall off the front.
    let mut kept: Vec<&String> = Vec::new();
    let mut total = 0usize;
    for line in lines.iter().rev() {
        let len = line.chars().count() + 1;
        if total + len > max_chars {
            break;
        }
        kept.push(line);
        total += len;
    }
    kept.reverse();
    kept.iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn non_empty(s: &str) -> Option<&str> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(q: &str, r: &str, sender: &str) -> DialogueTriple {
        DialogueTriple {
            query: q.to_string(),
            reply: r.to_string(),
            sender_name: sender.to_string(),
        }
    }

    fn role() -> RoleConfig {
        RoleConfig {
            name: "爱佳".to_string(),
            profile: "魔女族最后的幸存者".to_string(),
            speaking_style: "冷淡克制".to_string(),
            conversation_rules: "称呼对方为{user_name}".to_string(),
            ..RoleConfig::default()
        }
    }

    #[test]
    fn reply_prompt_fills_placeholders_and_defaults() {
        let prompt = build_reply_prompt(
            &role(),
            &ReplyPromptInputs {
                user_name: "小明",
                group_name: None,
                memory_summary: "",
                recent_dialogue: "",
                kb_info: "",
                affection_level: "陌生（3.5/13）",
            },
        );
        assert!(prompt.contains("魔女族最后的幸存者"));
        assert!(prompt.contains("称呼对方为小明"));
        assert!(prompt.contains("暂无长期记忆"));
        assert!(prompt.contains("（暂无最近对话）"));
        assert!(prompt.contains("（无相关知识）"));
        assert!(prompt.contains("陌生（3.5/13）"));
        assert!(!prompt.contains("{user_name}"));
    }

    #[test]
    fn group_prompt_carries_group_name() {
        let prompt = build_reply_prompt(
            &role(),
            &ReplyPromptInputs {
                user_name: "小明",
                group_name: Some("测试群"),
                memory_summary: "摘要",
                recent_dialogue: "",
                kb_info: "",
                affection_level: "一般（4.2/13）",
            },
        );
        assert!(prompt.contains("测试群"));
        assert!(prompt.contains("摘要"));
    }

    #[test]
    fn organizer_prompt_rewrites_store_markers() {
        let mem = "- [07-01 10:00] [Pair] User问: 早\nBot答: 早安";
        let prompt = build_organizer_prompt("", mem, "小明", "爱佳");
        assert!(prompt.contains("小明: 早"));
        assert!(prompt.contains("爱佳: 早安"));
        assert!(!prompt.contains("User问"));
        assert!(!prompt.contains("Bot答"));
        assert!(!prompt.contains("[Pair]"));
    }

    #[test]
    fn organizer_user_prompt_first_contact_variant() {
        let p = build_organizer_user_prompt("小明", "你好", false);
        assert!(p.contains("首次对话，暂无历史互动"));
        let p = build_organizer_user_prompt("小明", "你好", true);
        assert!(p.contains("请整理上述历史记忆"));
    }

    #[test]
    fn recent_dialogue_private_uses_current_user_name() {
        let triples = vec![triple("在吗", "在", "别人")];
        let block = format_recent_dialogue(&triples, "小明", "爱佳", false, 400);
        assert_eq!(block, "小明：在吗\n爱佳：在");
    }

    #[test]
    fn recent_dialogue_group_uses_sender_names() {
        let triples = vec![triple("大家好", "好", "路人甲")];
        let block = format_recent_dialogue(&triples, "小明", "爱佳", true, 400);
        assert!(block.starts_with("路人甲："));
    }

    #[test]
    fn recent_dialogue_truncates_oldest_first() {
        let triples = vec![
            triple(&"早".repeat(120), "嗯", "a"),
            triple("最近的问题", "最近的回答", "a"),
        ];
        let block = format_recent_dialogue(&triples, "小明", "爱佳", false, 60);
        assert!(block.contains("最近的问题"));
        assert!(!block.contains(&"早".repeat(120)));
    }
}
