//! The pipeline conductor.
//!
//! One call per turn: blacklist gate → injection guard → input cleansing →
//! concurrent retrieval fan-out → organizer → knowledge organizer →
//! generator → reply post-processing → persona rule check with corrective
//! rewrite → post-commit side effects. `handle` always returns a string;
//! every internal failure folds into the configured fallback reply.
//!
//! Turns of the same scene serialize on a per-scene lock so this turn's
//! memory writes are visible to the next turn's retrieval. Distinct scenes
//! interleave freely.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, error, info, warn};

use aika_core::config::AikaConfig;
use aika_core::types::Scene;
use aika_affection::AffectionService;
use aika_graph::GraphRetriever;
use aika_guard::injection::GuardVerdict;
use aika_guard::{check_reply_rules, clean_injection, InjectionGuard, PersonaMatcher, TempBlacklist};
use aika_llm::{ChatMessage, ChatOutcome, LlmClient, TraceLogger, TraceRecord};
use aika_memory::{RetrievalStrategy, ShortTermMemory, VectorStore};
use aika_stats::StatsService;

use crate::error::Result;
use crate::prompt::{
    build_organizer_prompt, build_organizer_user_prompt, build_reply_prompt,
    format_recent_dialogue, ReplyPromptInputs,
};

/// Memory block character budget handed to the organizer (≈500 tokens).
const MEMORY_BLOCK_CHARS: usize = 1000;

/// Substituted when post-processing eats the whole reply.
const ELLIPSIS_REPLY: &str = "……";

/// Everything the orchestrator needs, wired once by the composition root.
pub struct OrchestratorDeps {
    pub config: Arc<AikaConfig>,
    pub llm: Arc<dyn LlmClient>,
    pub store: Arc<VectorStore>,
    pub short_term: Arc<ShortTermMemory>,
    pub graph: Arc<GraphRetriever>,
    pub affection: Arc<AffectionService>,
    pub guard: Arc<InjectionGuard>,
    pub blacklist: Arc<TempBlacklist>,
    pub stats: Arc<StatsService>,
    pub trace: Arc<TraceLogger>,
    pub persona_matcher: Option<Arc<PersonaMatcher>>,
}

pub struct Orchestrator {
    config: Arc<AikaConfig>,
    llm: Arc<dyn LlmClient>,
    store: Arc<VectorStore>,
    short_term: Arc<ShortTermMemory>,
    graph: Arc<GraphRetriever>,
    affection: Arc<AffectionService>,
    guard: Arc<InjectionGuard>,
    blacklist: Arc<TempBlacklist>,
    stats: Arc<StatsService>,
    trace: Arc<TraceLogger>,
    persona_matcher: Option<Arc<PersonaMatcher>>,
    strategy: RetrievalStrategy,
    scene_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        let strategy = RetrievalStrategy::new(deps.config.retrieval.clone());
        Self {
            config: deps.config,
            llm: deps.llm,
            store: deps.store,
            short_term: deps.short_term,
            graph: deps.graph,
            affection: deps.affection,
            guard: deps.guard,
            blacklist: deps.blacklist,
            stats: deps.stats,
            trace: deps.trace,
            persona_matcher: deps.persona_matcher,
            strategy,
            scene_locks: DashMap::new(),
        }
    }

    pub fn short_term(&self) -> &Arc<ShortTermMemory> {
        &self.short_term
    }

    /// Run one turn. Never errors, never panics the caller: the worst
    /// outcome is the configured fallback string.
    pub async fn handle(
        &self,
        scene: &Scene,
        user_name: &str,
        group_name: Option<&str>,
        user_text: &str,
    ) -> String {
        let lock = {
            let entry = self.scene_locks.entry(scene.key().to_string()).or_default();
            Arc::clone(entry.value())
        };
        let _turn = lock.lock().await;

        match self.run_turn(scene, user_name, group_name, user_text).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(user_id = %scene.user_id, "turn failed: {e}");
                self.config.common.fallback_reply.clone()
            }
        }
    }

    async fn run_turn(
        &self,
        scene: &Scene,
        user_name: &str,
        group_name: Option<&str>,
        user_text: &str,
    ) -> Result<String> {
        let user_id = scene.user_id.as_str();
        let group_id = scene.group_id.as_deref();

        // Stage 1: blacklist gate.
        match self.blacklist.get_info(user_id) {
            Ok(Some(info)) => {
                debug!(user_id, "blocked user turned away");
                return Ok(ban_notice(info.remaining_minutes.max(1)));
            }
            Ok(None) => {}
            Err(e) => warn!("blacklist lookup failed open: {e}"),
        }

        // Stage 2: injection guard, fail-open on anything but a verdict.
        let guard_cfg = &self.config.guard;
        if guard_cfg.enable && user_text.chars().count() >= guard_cfg.min_check_chars {
            match self.guard.check(user_text, user_id).await {
                Ok(GuardVerdict::Block { reason }) => {
                    let full_reason = format!("疑似注入攻击: {reason}");
                    if let Err(e) =
                        self.blacklist
                            .ban(user_id, guard_cfg.ban_minutes, Some(&full_reason), "auto_guard")
                    {
                        warn!(user_id, "ban write failed: {e}");
                    }
                    return Ok(ban_notice(guard_cfg.ban_minutes));
                }
                Ok(GuardVerdict::Allow) => {}
                Err(e) => warn!(user_id, "guard failed open: {e}"),
            }
        }

        // Stage 3: cleanse what the guard let through.
        let user_text = clean_injection(user_text);

        // Stage 4: retrieval fan-out. Independent I/O runs concurrently and
        // every branch degrades to empty context on failure.
        let (memory_block, kb_hits, graph_mem) = tokio::join!(
            self.memory_context(user_id, &user_text, group_id),
            self.kb_context(&user_text),
            self.graph_context(user_id, &user_text, user_name),
        );

        let default_temp = self.config.models.generator.temperature;
        let temperature = self
            .affection
            .temperature_for(user_id, default_temp)
            .unwrap_or(default_temp);

        let long_mem = match (memory_block.is_empty(), graph_mem.is_empty()) {
            (false, false) => format!("{memory_block}\n\n【相关事实】{graph_mem}"),
            (true, false) => format!("【相关事实】{graph_mem}"),
            _ => memory_block,
        };

        // Stage 5: organizer condenses memory into a ≤100-char summary.
        let context_summary = self.organize_context(&user_text, user_name, &long_mem).await?;

        // Stage 6: knowledge organizer, only when the KB search hit.
        let kb_info = if kb_hits.is_empty() {
            String::new()
        } else {
            let raw = VectorStore::format_knowledge(&kb_hits);
            self.organize_knowledge(&user_text, &raw).await
        };

        // Stage 7: recent dialogue block from short-term memory.
        let dialogue_cfg = &self.config.role.recent_dialogue;
        let rounds = if scene.is_group() {
            dialogue_cfg.group_max_rounds
        } else {
            dialogue_cfg.private_max_rounds
        };
        let recent_dialogue = format_recent_dialogue(
            &self.short_term.recent(scene.key(), rounds),
            user_name,
            &self.config.role.name,
            scene.is_group(),
            dialogue_cfg.max_chars,
        );

        // Stage 8: generator.
        let affection_level = self.affection_display(user_id);
        let system_prompt = build_reply_prompt(
            &self.config.role,
            &ReplyPromptInputs {
                user_name,
                group_name,
                memory_summary: &context_summary,
                recent_dialogue: &recent_dialogue,
                kb_info: &kb_info,
                affection_level: &affection_level,
            },
        );
        let outcome = self
            .call_model(
                "generator",
                &self.config.models.generator,
                vec![
                    ChatMessage::system(system_prompt),
                    ChatMessage::user(user_text.clone()),
                ],
                Some(temperature),
                Some(user_id),
                &user_text,
            )
            .await?;

        // Stage 9: strip stage directions and periods.
        let mut reply = postprocess_reply(&outcome.content);

        // Stage 10: persona rule check, then the optional drift check.
        let mut needs_rewrite = false;
        if let Some(violation) = check_reply_rules(&reply) {
            warn!(user_id, %violation, "reply broke persona rules");
            needs_rewrite = true;
        } else if let Some(matcher) = &self.persona_matcher {
            match matcher.check_reply(&reply).await {
                Ok((false, similarity)) => {
                    warn!(user_id, similarity, "reply drifted from persona anchor");
                    needs_rewrite = true;
                }
                Ok((true, _)) => {}
                Err(e) => debug!("persona vector check skipped: {e}"),
            }
        }
        if needs_rewrite {
            reply = self
                .correction_rewrite(&context_summary, &user_text, user_name)
                .await;
        }

        // Stage 11: post-commit side effects. Short-term and the vector
        // store finish before the scene lock releases; graph extraction is
        // fire-and-forget.
        self.short_term
            .append(scene.key(), &user_text, &reply, user_name);
        if let Err(e) = self
            .store
            .add_pair(user_id, &user_text, &reply, group_id, Some(user_name))
            .await
        {
            warn!(user_id, "long-term memory append failed: {e}");
        }

        {
            let graph = Arc::clone(&self.graph);
            let user_id = user_id.to_string();
            let user_text = user_text.clone();
            let reply = reply.clone();
            let user_name = user_name.to_string();
            tokio::spawn(async move {
                graph
                    .add_dialogue_to_graph(&user_id, &user_text, &reply, &user_name)
                    .await;
            });
        }

        if let Err(e) = self.affection.update_affection(user_id, &user_text) {
            warn!(user_id, "affection update failed: {e}");
        }

        Ok(reply)
    }

    // --- retrieval helpers -------------------------------------------------

    async fn memory_context(&self, user_id: &str, text: &str, group_id: Option<&str>) -> String {
        match self.store.search_memory(user_id, text, group_id, None).await {
            Ok(hits) if !hits.is_empty() => {
                info!(user_id, hits = hits.len(), "long-term memory hit");
                VectorStore::format_hits(&hits, MEMORY_BLOCK_CHARS)
            }
            Ok(_) => String::new(),
            Err(e) => {
                warn!("memory search degraded to empty: {e}");
                String::new()
            }
        }
    }

    async fn kb_context(&self, text: &str) -> Vec<aika_memory::KnowledgeHit> {
        match self.store.search_knowledge(text, None).await {
            Ok(hits) => self.strategy.rerank(text, hits),
            Err(e) => {
                warn!("knowledge search degraded to empty: {e}");
                Vec::new()
            }
        }
    }

    async fn graph_context(&self, user_id: &str, text: &str, user_name: &str) -> String {
        match self.graph.retrieve(user_id, text, user_name).await {
            Ok(mem) => mem,
            Err(e) => {
                warn!("graph retrieval degraded to empty: {e}");
                String::new()
            }
        }
    }

    fn affection_display(&self, user_id: &str) -> String {
        match self.affection.info(user_id) {
            Ok(info) => format!("{}（{}/13）", info.level_name, info.score),
            Err(_) => "未知".to_string(),
        }
    }

    // --- model stages ------------------------------------------------------

    async fn organize_context(
        &self,
        user_message: &str,
        user_name: &str,
        long_mem: &str,
    ) -> Result<String> {
        let organizer = &self.config.models.organizer;
        if !organizer.enabled {
            warn!("organizer disabled, passing raw input through");
            return Ok(format!("用户输入：{user_message}"));
        }

        let system_prompt = build_organizer_prompt(
            &organizer.system_prompt,
            long_mem,
            user_name,
            &self.config.role.name,
        );
        let user_prompt =
            build_organizer_user_prompt(user_name, user_message, !long_mem.is_empty());

        match self
            .call_model(
                "organizer",
                organizer,
                vec![
                    ChatMessage::system(system_prompt),
                    ChatMessage::user(user_prompt),
                ],
                None,
                None,
                user_message,
            )
            .await
        {
            Ok(outcome) if !outcome.content.is_empty() => Ok(outcome.content),
            Ok(_) => Ok(format!("User input: {user_message}")),
            Err(e) if self.config.common.skip_organizer_on_failure => {
                warn!("organizer skipped after failure: {e}");
                Ok(format!("User input: {user_message}"))
            }
            Err(e) => Err(e),
        }
    }

    async fn organize_knowledge(&self, user_message: &str, kb_raw: &str) -> String {
        let Some(kb_organizer) = &self.config.models.kb_organizer else {
            return kb_raw.to_string();
        };
        if !kb_organizer.enabled {
            return kb_raw.to_string();
        }

        let system_prompt = if kb_organizer.system_prompt.is_empty() {
            aika_core::config::DEFAULT_KB_ORGANIZER_PROMPT.to_string()
        } else {
            kb_organizer.system_prompt.clone()
        };
        let user_prompt = format!(
            "用户消息：{user_message}\n\n知识库内容：\n{kb_raw}\n\n请整理出与用户消息相关的知识（≤150字）："
        );

        match self
            .call_model(
                "kb_organizer",
                kb_organizer,
                vec![
                    ChatMessage::system(system_prompt),
                    ChatMessage::user(user_prompt),
                ],
                None,
                None,
                user_message,
            )
            .await
        {
            Ok(outcome) if !outcome.content.is_empty() => outcome.content,
            Ok(_) => kb_raw.to_string(),
            Err(e) => {
                warn!("knowledge organizer failed, using raw hits: {e}");
                kb_raw.to_string()
            }
        }
    }

    /// One retry at low temperature with a stripped-down in-character
    /// prompt. The ellipsis is the last resort.
    async fn correction_rewrite(
        &self,
        context_summary: &str,
        user_message: &str,
        user_name: &str,
    ) -> String {
        let role = &self.config.role;
        let anchor = if role.persona_anchor.is_empty() {
            role.profile.as_str()
        } else {
            role.persona_anchor.as_str()
        };
        let summary: String = context_summary.chars().take(200).collect();
        let prompt = format!(
            "你是{}。{anchor}\n\n上一次回复不符合角色设定。请重新回复下面的用户消息，严格保持角色。\n\
             禁止说\"作为AI\"或讨论规则本身。\n\n\
             场景概括：{summary}\n用户（{user_name}）说：{user_message}",
            role.name
        );

        match self
            .call_model(
                "correction",
                &self.config.models.generator,
                vec![ChatMessage::user(prompt)],
                Some(0.5),
                None,
                user_message,
            )
            .await
        {
            Ok(outcome) if !outcome.content.is_empty() => {
                info!("corrective rewrite applied");
                outcome.content
            }
            Ok(_) => ELLIPSIS_REPLY.to_string(),
            Err(e) => {
                error!("corrective rewrite failed: {e}");
                ELLIPSIS_REPLY.to_string()
            }
        }
    }

    /// Shared call wrapper: runs the model, then records trace and token
    /// stats. Trace/stat trouble never affects the turn.
    async fn call_model(
        &self,
        stage: &str,
        role: &aika_core::config::ModelRole,
        messages: Vec<ChatMessage>,
        temperature_override: Option<f32>,
        user_id: Option<&str>,
        user_message: &str,
    ) -> Result<ChatOutcome> {
        let system_prompt = messages
            .first()
            .filter(|m| matches!(m.role, aika_llm::Role::System))
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let outcome = self.llm.chat(role, messages, temperature_override).await?;

        self.trace.log(&TraceRecord {
            stage,
            model: &role.model_name,
            elapsed_secs: outcome.elapsed_secs,
            user_id,
            temperature: temperature_override.unwrap_or(role.temperature),
            max_tokens: role.max_tokens,
            user_message,
            system_prompt: &system_prompt,
            reasoning: outcome.reasoning.as_deref(),
            output: &outcome.content,
            is_blocked: None,
            block_reason: None,
        });
        if let Err(e) = self.stats.record_llm_usage(
            &role.model_name,
            outcome.prompt_tokens,
            outcome.completion_tokens,
        ) {
            debug!("llm stats write failed: {e}");
        }

        Ok(outcome)
    }
}

pub(crate) fn ban_notice(minutes: i64) -> String {
    format!("你先冷静一下吧，{minutes}分钟后再来找我")
}

/// Strip parenthesized stage directions and sentence periods, collapse
/// whitespace. Anything shorter than two characters afterwards becomes an
/// ellipsis.
pub fn postprocess_reply(raw: &str) -> String {
    static BRACKETS: OnceLock<Vec<Regex>> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();

    let brackets = BRACKETS.get_or_init(|| {
        [
            r"[（(][^（）()]*[）)]",
            r"[【\[][^【】\[\]]*[】\]]",
            r"[《<][^《》<>]*[》>]",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").unwrap());

    let mut reply = raw.to_string();
    for re in brackets {
        reply = re.replace_all(&reply, "").to_string();
    }
    reply = reply.replace('。', "");
    let reply = spaces.replace_all(&reply, " ").trim().to_string();

    if reply.chars().count() < 2 {
        ELLIPSIS_REPLY.to_string()
    } else {
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_directions_and_periods_are_stripped() {
        let raw = "（轻轻叹气）知道了。下次注意【小声】";
        assert_eq!(postprocess_reply(raw), "知道了下次注意");
    }

    #[test]
    fn mixed_bracket_styles_are_removed() {
        let raw = "哼(whatever)，随你《内心独白》吧";
        assert_eq!(postprocess_reply(raw), "哼，随你吧");
    }

    #[test]
    fn eaten_reply_becomes_ellipsis() {
        assert_eq!(postprocess_reply("（盯着看）。"), "……");
        assert_eq!(postprocess_reply(""), "……");
        assert_eq!(postprocess_reply("嗯。"), "……");
    }

    #[test]
    fn whitespace_collapses() {
        assert_eq!(postprocess_reply("两个  词\n换行"), "两个 词 换行");
    }

    #[test]
    fn ban_notice_carries_minutes() {
        assert!(ban_notice(30).contains("30分钟"));
    }
}
