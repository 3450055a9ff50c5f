//! Per-scene short-term dialogue buffers.
//!
//! Scene key is the group id when present, else the user id. Buffers are
//! process-local, capped at 100 triples with oldest-first eviction, and can
//! be warmed from adapter history at startup. Turn ordering within a scene
//! is the orchestrator's responsibility; this type only stores.

use std::collections::VecDeque;

use dashmap::DashMap;
use tracing::debug;

use aika_core::types::HistoryMessage;

/// Max dialogue rounds retained per scene.
pub const SHORT_TERM_CAPACITY: usize = 100;

/// One remembered round: (user text, reply text, sender display name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueTriple {
    pub query: String,
    pub reply: String,
    pub sender_name: String,
}

#[derive(Default)]
pub struct ShortTermMemory {
    scenes: DashMap<String, VecDeque<DialogueTriple>>,
}

impl ShortTermMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, scene_key: &str, query: &str, reply: &str, sender_name: &str) {
        let mut buf = self.scenes.entry(scene_key.to_string()).or_default();
        if buf.len() >= SHORT_TERM_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(DialogueTriple {
            query: query.to_string(),
            reply: reply.to_string(),
            sender_name: sender_name.to_string(),
        });
    }

    /// Latest `max_rounds` triples, oldest first.
    pub fn recent(&self, scene_key: &str, max_rounds: usize) -> Vec<DialogueTriple> {
        match self.scenes.get(scene_key) {
            Some(buf) => {
                let skip = buf.len().saturating_sub(max_rounds);
                buf.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn has_memory(&self, scene_key: &str) -> bool {
        self.scenes
            .get(scene_key)
            .map(|b| !b.is_empty())
            .unwrap_or(false)
    }

    pub fn len(&self, scene_key: &str) -> usize {
        self.scenes.get(scene_key).map(|b| b.len()).unwrap_or(0)
    }

    pub fn clear_scene(&self, scene_key: &str) {
        self.scenes.remove(scene_key);
    }

    /// Replay paired adapter history into a scene, truncating to capacity.
    /// Returns the number of rounds stored.
    pub fn populate_from_history(
        &self,
        scene_key: &str,
        messages: &[HistoryMessage],
        bot_user_id: &str,
        user_filter: Option<&str>,
        sender_name: &str,
    ) -> usize {
        let pairs = pair_history(messages, bot_user_id, user_filter);
        if pairs.is_empty() {
            return 0;
        }
        let take = pairs.len().min(SHORT_TERM_CAPACITY);
        for (query, reply) in pairs.iter().skip(pairs.len() - take) {
            self.append(scene_key, query, reply, sender_name);
        }
        debug!(scene_key, rounds = take, "short-term warmed from history");
        take
    }
}

/// Pair raw history into (user, bot) rounds.
///
/// Messages are sorted ascending by time; empty and `/`-command items are
/// skipped (a command also resets the pending user message so its reply is
/// never mis-paired). Consecutive user messages keep only the latest. With a
/// `user_filter`, other members' messages reset the pending query so group
/// cross-talk never forms a pair.
pub fn pair_history(
    messages: &[HistoryMessage],
    bot_user_id: &str,
    user_filter: Option<&str>,
) -> Vec<(String, String)> {
    let mut sorted: Vec<&HistoryMessage> = messages.iter().collect();
    sorted.sort_by_key(|m| m.time);

    let mut pairs = Vec::new();
    let mut pending: Option<String> = None;

    for msg in sorted {
        let text = msg.plain_text();
        if text.is_empty() {
            continue;
        }
        if text.starts_with('/') {
            pending = None;
            continue;
        }

        if msg.sender_id == bot_user_id {
            if let Some(query) = pending.take() {
                pairs.push((query, text));
            }
        } else if user_filter.map_or(true, |u| u == msg.sender_id) {
            pending = Some(text);
        } else {
            pending = None;
        }
    }
    pairs
}
