//! Long-term memory garbage collection.
//!
//! Two-phase, per user: above 200 rows the oldest 15% are dropped outright;
//! above 150 the oldest 20% are condensed into summary rows by the organizer
//! model in batches of 15, then deleted. The vector index is left stale by
//! default (search tolerates the dangling entries) and a warning advises a
//! rebuild; `rebuild_after_gc` flips to inline rebuilding.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use aika_core::config::ModelRole;
use aika_llm::{ChatMessage, LlmClient};

use crate::store::VectorStore;

const DELETE_THRESHOLD: usize = 200;
const DELETE_RATIO: f64 = 0.15;
const SUMMARIZE_THRESHOLD: usize = 150;
const SUMMARIZE_RATIO: f64 = 0.20;
const SUMMARY_MAX_CHARS: usize = 500;
const BATCH_SIZE: usize = 15;

/// Pause between users during a full sweep, to stay under API rate limits.
const PER_USER_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct GcOutcome {
    pub user_id: String,
    pub before_count: usize,
    pub after_count: usize,
    pub deleted_count: usize,
    pub summarized_count: usize,
    pub summaries_inserted: usize,
    pub error: Option<String>,
}

pub struct MemoryGc {
    store: Arc<VectorStore>,
    llm: Arc<dyn LlmClient>,
    summarizer: ModelRole,
    rebuild_after_gc: bool,
}

impl MemoryGc {
    /// `organizer` is cloned into a low-temperature summarization role.
    pub fn new(
        store: Arc<VectorStore>,
        llm: Arc<dyn LlmClient>,
        organizer: &ModelRole,
        rebuild_after_gc: bool,
    ) -> Self {
        let mut summarizer = organizer.clone();
        summarizer.temperature = 0.3;
        summarizer.max_tokens = 600;
        Self {
            store,
            llm,
            summarizer,
            rebuild_after_gc,
        }
    }

    pub async fn gc_user(&self, user_id: &str) -> GcOutcome {
        let mut outcome = GcOutcome {
            user_id: user_id.to_string(),
            ..Default::default()
        };

        match self.run_user(user_id, &mut outcome).await {
            Ok(()) => {}
            Err(e) => {
                outcome.error = Some(e.to_string());
                error!(user_id, "memory GC failed: {e}");
            }
        }
        outcome
    }

    async fn run_user(
        &self,
        user_id: &str,
        outcome: &mut GcOutcome,
    ) -> crate::error::Result<()> {
        outcome.before_count = self.store.user_memory_stats(user_id)?.total;
        let mut current = outcome.before_count;
        info!(user_id, count = current, "memory GC start");

        // Phase 1: hard delete above 200.
        if current > DELETE_THRESHOLD {
            let limit = (current as f64 * DELETE_RATIO).ceil() as usize;
            let rows = self.store.oldest_private_rows(user_id, limit)?;
            let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
            outcome.deleted_count = self.store.delete_private_rows(user_id, &ids)?;
            current = self.store.user_memory_stats(user_id)?.total;
            info!(user_id, deleted = outcome.deleted_count, "GC delete phase done");
        }

        // Phase 2: summarize above 150.
        if current > SUMMARIZE_THRESHOLD {
            let limit = (current as f64 * SUMMARIZE_RATIO).ceil() as usize;
            let rows = self.store.oldest_private_rows(user_id, limit)?;
            if !rows.is_empty() {
                let docs: Vec<String> = rows.iter().map(|(_, c)| c.clone()).collect();
                let summaries = self.summarize_batches(&docs).await;
                if !summaries.is_empty() {
                    for summary in &summaries {
                        self.store.insert_summary_row(user_id, summary)?;
                    }
                    let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
                    self.store.delete_private_rows(user_id, &ids)?;
                    outcome.summarized_count = ids.len();
                    outcome.summaries_inserted = summaries.len();
                }
            }
        }

        outcome.after_count = self.store.user_memory_stats(user_id)?.total;

        if outcome.deleted_count > 0 || outcome.summarized_count > 0 {
            if self.rebuild_after_gc {
                let vectors = self.store.rebuild_private_index(user_id).await?;
                info!(user_id, vectors, "index rebuilt inline after GC");
            } else {
                warn!(
                    user_id,
                    "vector index not updated after GC; stale entries remain until a rebuild"
                );
            }
        }

        info!(
            user_id,
            before = outcome.before_count,
            after = outcome.after_count,
            deleted = outcome.deleted_count,
            summarized = outcome.summarized_count,
            "memory GC done"
        );
        Ok(())
    }

    /// Condense documents into ≤500-char summaries, 15 rows per model call.
    /// A failed batch is skipped rather than aborting the pass.
    async fn summarize_batches(&self, docs: &[String]) -> Vec<String> {
        let mut summaries = Vec::new();
        for batch in docs.chunks(BATCH_SIZE) {
            let batch_text = batch.join("\n---\n");
            let prompt = format!(
                "请将以下对话记忆压缩成一段简洁的摘要，不超过{SUMMARY_MAX_CHARS}字。\n\
                 保留关键事件、情感变化和重要信息，不要逐条复述。\n\n\
                 对话记忆：\n{batch_text}\n\n摘要："
            );
            match self
                .llm
                .chat(&self.summarizer, vec![ChatMessage::user(prompt)], None)
                .await
            {
                Ok(outcome) if !outcome.content.is_empty() => {
                    summaries.push(outcome.content.trim().to_string());
                }
                Ok(_) => warn!("summarizer returned empty batch summary"),
                Err(e) => warn!("summarize batch failed: {e}"),
            }
        }
        summaries
    }

    /// GC every user that owns a private store.
    pub async fn gc_all_users(&self) -> Vec<GcOutcome> {
        let users = self.store.list_user_ids();
        info!(users = users.len(), "global memory GC start");

        let mut results = Vec::with_capacity(users.len());
        for user_id in users {
            results.push(self.gc_user(&user_id).await);
            tokio::time::sleep(PER_USER_PAUSE).await;
        }

        let deleted: usize = results.iter().map(|r| r.deleted_count).sum();
        let summarized: usize = results.iter().map(|r| r.summarized_count).sum();
        info!(
            users = results.len(),
            deleted, summarized, "global memory GC done"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use aika_llm::{ChatOutcome, LlmError};

    use crate::store::VectorStoreConfig;
    use crate::testing::HashEmbedder;

    struct CountingSummarizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for CountingSummarizer {
        async fn chat(
            &self,
            _role: &ModelRole,
            _messages: Vec<ChatMessage>,
            _temperature_override: Option<f32>,
        ) -> Result<ChatOutcome, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatOutcome {
                content: format!("第{}批记忆的摘要", n + 1),
                ..Default::default()
            })
        }
    }

    fn organizer_role() -> ModelRole {
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

    async fn seeded_store(dir: &std::path::Path, rows: usize) -> Arc<VectorStore> {
        let cfg = VectorStoreConfig {
            data_dir: dir.to_path_buf(),
            dim: 16,
            retrieve_count: 5,
            similarity_threshold: 0.3,
            kb_similarity_threshold: 0.3,
            cross_scene: false,
            enabled: true,
        };
        let store = Arc::new(VectorStore::new(cfg, Arc::new(HashEmbedder)).unwrap());
        for i in 0..rows {
            store
                .add_pair("u1", &format!("第{i}条历史问题"), "回答", None, None)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn summarize_path_batches_and_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), 180).await;
        let llm = Arc::new(CountingSummarizer {
            calls: AtomicUsize::new(0),
        });

        let gc = MemoryGc::new(Arc::clone(&store), llm.clone(), &organizer_role(), false);
        let outcome = gc.gc_user("u1").await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.before_count, 180);
        assert_eq!(outcome.deleted_count, 0); // under the delete threshold
        assert_eq!(outcome.summarized_count, 36); // ceil(180 * 0.20)
        assert_eq!(outcome.summaries_inserted, 3); // ceil(36 / 15)
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.after_count, 180 - 36 + 3);
    }

    #[tokio::test]
    async fn delete_phase_fires_above_200() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), 210).await;
        let llm = Arc::new(CountingSummarizer {
            calls: AtomicUsize::new(0),
        });

        let gc = MemoryGc::new(Arc::clone(&store), llm, &organizer_role(), false);
        let outcome = gc.gc_user("u1").await;

        assert_eq!(outcome.deleted_count, 32); // ceil(210 * 0.15)
        // 178 remain, still above 150 → summarize phase runs too.
        assert_eq!(outcome.summarized_count, 36); // ceil(178 * 0.20)
        assert_eq!(outcome.after_count, 210 - 32 - 36 + 3);
    }

    #[tokio::test]
    async fn small_stores_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), 20).await;
        let llm = Arc::new(CountingSummarizer {
            calls: AtomicUsize::new(0),
        });

        let gc = MemoryGc::new(Arc::clone(&store), llm.clone(), &organizer_role(), false);
        let outcome = gc.gc_user("u1").await;

        assert_eq!(outcome.before_count, 20);
        assert_eq!(outcome.after_count, 20);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inline_rebuild_restores_parity() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), 180).await;
        let llm = Arc::new(CountingSummarizer {
            calls: AtomicUsize::new(0),
        });

        let gc = MemoryGc::new(Arc::clone(&store), llm, &organizer_role(), true);
        let outcome = gc.gc_user("u1").await;
        assert!(outcome.error.is_none());

        // After an inline rebuild a fresh search only sees live rows.
        let hits = store
            .search_memory("u1", "第179条历史问题", None, None)
            .await
            .unwrap();
        assert!(!hits.is_empty());
    }
}
