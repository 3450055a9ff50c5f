//! Knowledge-retrieval tuning on top of raw vector similarity.
//!
//! Scene detection picks what kind of exchange this is (identity question,
//! emotional beat, small talk, …); configured keyword weights and synonym
//! expansion then boost hits that touch the persona's own lore, and negative
//! keywords drop hits that belong to someone else's. All persona data comes
//! from config — the code knows no character.

use std::collections::HashSet;

use aika_core::config::RetrievalTuning;

use crate::types::KnowledgeHit;

/// Per-keyword boost applied as `score * (1 + BOOST_FACTOR * weight)`.
const BOOST_FACTOR: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneType {
    Identity,
    Emotion,
    Daily,
    Deep,
    Greeting,
    Unknown,
}

const IDENTITY_MARKERS: &[&str] = &[
    "你是谁", "真实身份", "身份", "你叫什么", "介绍一下自己", "什么来历",
];
const EMOTION_MARKERS: &[&str] = &[
    "喜欢", "爱", "讨厌", "感觉", "心情", "开心", "难过", "孤独", "寂寞",
];
const DAILY_MARKERS: &[&str] = &["今天", "早上", "晚上", "吃", "做什么", "在干嘛", "天气"];
const DEEP_MARKERS: &[&str] = &["人生", "意义", "为什么", "存在", "命运", "未来", "过去"];
const GREETING_MARKERS: &[&str] = &["你好", "早安", "晚安", "嗨", "在吗", "hello", "hi"];

pub fn detect_scene(query: &str) -> SceneType {
    let lowered = query.to_lowercase();
    let hit = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));

    // Identity wins over everything; greetings only when nothing else fits.
    if hit(IDENTITY_MARKERS) {
        SceneType::Identity
    } else if hit(EMOTION_MARKERS) {
        SceneType::Emotion
    } else if hit(DEEP_MARKERS) {
        SceneType::Deep
    } else if hit(DAILY_MARKERS) {
        SceneType::Daily
    } else if hit(GREETING_MARKERS) {
        SceneType::Greeting
    } else {
        SceneType::Unknown
    }
}

pub struct RetrievalStrategy {
    tuning: RetrievalTuning,
}

impl RetrievalStrategy {
    pub fn new(tuning: RetrievalTuning) -> Self {
        Self { tuning }
    }

    pub fn enabled(&self) -> bool {
        self.tuning.enable
    }

    /// Terms the query is "about": the query's configured keywords plus
    /// canonical forms reached through the synonym table.
    fn query_terms(&self, query: &str) -> HashSet<String> {
        let mut terms = HashSet::new();
        for keyword in self.tuning.keyword_weights.keys() {
            if query.contains(keyword.as_str()) {
                terms.insert(keyword.clone());
            }
        }
        for (canonical, alternates) in &self.tuning.synonyms {
            if query.contains(canonical.as_str())
                || alternates.iter().any(|a| query.contains(a.as_str()))
            {
                terms.insert(canonical.clone());
                for alt in alternates {
                    terms.insert(alt.clone());
                }
            }
        }
        terms
    }

    /// Re-rank knowledge hits for a query. Negative-keyword hits are
    /// dropped; hits mentioning the query's weighted terms move up.
    /// Greetings skip the lore boost — raw similarity is already right for
    /// small talk.
    pub fn rerank(&self, query: &str, mut hits: Vec<KnowledgeHit>) -> Vec<KnowledgeHit> {
        if !self.tuning.enable || hits.is_empty() {
            return hits;
        }
        if detect_scene(query) == SceneType::Greeting {
            return hits;
        }

        hits.retain(|hit| {
            !self
                .tuning
                .negative_keywords
                .iter()
                .any(|bad| hit.content.contains(bad.as_str()) || hit.title.contains(bad.as_str()))
        });

        let terms = self.query_terms(query);
        if terms.is_empty() {
            return hits;
        }

        for hit in hits.iter_mut() {
            let mut boost = 0.0f32;
            for term in &terms {
                if hit.content.contains(term.as_str()) || hit.title.contains(term.as_str()) {
                    boost += self.tuning.keyword_weights.get(term).copied().unwrap_or(1.0);
                }
            }
            hit.similarity *= 1.0 + BOOST_FACTOR * boost;
        }
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn hit(title: &str, content: &str, similarity: f32) -> KnowledgeHit {
        KnowledgeHit {
            source: "设定集".to_string(),
            title: title.to_string(),
            content: content.to_string(),
            similarity,
        }
    }

    fn tuning() -> RetrievalTuning {
        let mut keyword_weights = HashMap::new();
        keyword_weights.insert("魔女".to_string(), 8.0);
        keyword_weights.insert("焙茶".to_string(), 3.0);
        let mut synonyms = HashMap::new();
        synonyms.insert("魔女".to_string(), vec!["大魔女".to_string(), "魔女族".to_string()]);
        RetrievalTuning {
            enable: true,
            keyword_weights,
            synonyms,
            negative_keywords: vec!["侦探".to_string()],
        }
    }

    #[test]
    fn scene_detection_priorities() {
        assert_eq!(detect_scene("你是谁啊"), SceneType::Identity);
        assert_eq!(detect_scene("今天有点难过"), SceneType::Emotion);
        assert_eq!(detect_scene("人生的意义是什么"), SceneType::Deep);
        assert_eq!(detect_scene("今天吃什么"), SceneType::Daily);
        assert_eq!(detect_scene("早安"), SceneType::Greeting);
        assert_eq!(detect_scene("呼"), SceneType::Unknown);
    }

    #[test]
    fn weighted_terms_outrank_raw_similarity() {
        let strategy = RetrievalStrategy::new(tuning());
        let hits = vec![
            hit("杂项", "无关的闲聊记录", 0.60),
            hit("身世", "她是魔女族最后的幸存者", 0.55),
        ];
        // Query says 大魔女; the synonym table folds it back onto 魔女, so
        // the lore hit overtakes the higher raw similarity.
        let ranked = strategy.rerank("大魔女的事情还记得吗", hits);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].title, "身世");
        assert!(ranked[0].similarity > 0.60);
    }

    #[test]
    fn negative_keywords_drop_hits() {
        let strategy = RetrievalStrategy::new(tuning());
        let hits = vec![
            hit("别人的设定", "一个侦探角色的描述", 0.9),
            hit("茶", "她喜欢焙茶", 0.5),
        ];
        let ranked = strategy.rerank("焙茶好喝吗", hits);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].title, "茶");
    }

    #[test]
    fn greetings_skip_the_lore_boost() {
        let strategy = RetrievalStrategy::new(tuning());
        let hits = vec![hit("身世", "她是魔女族最后的幸存者", 0.5)];
        let ranked = strategy.rerank("你好呀", hits);
        assert_eq!(ranked[0].similarity, 0.5);
    }

    #[test]
    fn disabled_strategy_is_identity() {
        let strategy = RetrievalStrategy::new(RetrievalTuning::default());
        let hits = vec![hit("a", "侦探", 0.9)];
        let ranked = strategy.rerank("任何问题", hits.clone());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].similarity, 0.9);
    }
}
