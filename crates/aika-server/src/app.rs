//! Composition root.
//!
//! Every service is constructed exactly once here and handed to its
//! consumers as an `Arc`. No component reaches for a global; tests build
//! the same graph with fakes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use aika_admin::AdminState;
use aika_affection::AffectionService;
use aika_core::adapter::ChatAdapter;
use aika_core::config::{AikaConfig, ModelRole};
use aika_graph::{GraphCleaner, GraphRetriever, GraphStore};
use aika_guard::{InjectionGuard, PersonaMatcher, TempBlacklist};
use aika_llm::{Embedder, EmbeddingClient, LlmClient, LlmError, ModelClient, TraceLogger};
use aika_memory::store::VectorStoreConfig;
use aika_memory::{EmojiStore, MemoryGc, ShortTermMemory, VectorStore};
use aika_pipeline::commands::CommandRouter;
use aika_pipeline::dispatch::ImageCaptioner;
use aika_pipeline::orchestrator::{Orchestrator, OrchestratorDeps};
use aika_pipeline::{Dispatcher, MessageSplitter};
use aika_scheduler::Scheduler;
use aika_stats::StatsService;

pub struct App {
    pub config: Arc<AikaConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub splitter: Arc<MessageSplitter>,
    pub commands: Arc<CommandRouter>,
    pub stats: Arc<StatsService>,
    pub short_term: Arc<ShortTermMemory>,
    pub store: Arc<VectorStore>,
    pub blacklist: Arc<TempBlacklist>,
    pub affection: Arc<AffectionService>,
    pub graph_store: Arc<GraphStore>,
    pub gc: Arc<MemoryGc>,
    pub cleaner: Arc<GraphCleaner>,
    captioner: Option<Arc<dyn ImageCaptioner>>,
    emoji: Option<Arc<EmojiStore>>,
}

impl App {
    pub fn build(config: AikaConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let data_dir = PathBuf::from(&config.storage.data_dir);

        let model_client = Arc::new(ModelClient::new(Arc::clone(&config)));
        let llm: Arc<dyn LlmClient> = model_client.clone();
        let embedder: Arc<dyn Embedder> = Arc::new(
            EmbeddingClient::new(Arc::clone(&config)).context("embedding client")?,
        );
        let trace = Arc::new(TraceLogger::new("logs"));

        let store = Arc::new(
            VectorStore::new(
                VectorStoreConfig::from_storage(&config.storage, config.models.embedding.vector_dim),
                Arc::clone(&embedder),
            )
            .context("vector store")?,
        );
        let short_term = Arc::new(ShortTermMemory::new());

        let graph_store = Arc::new(
            GraphStore::open(&data_dir.join("knowledge_graph.db")).context("graph store")?,
        );
        let graph = Arc::new(GraphRetriever::new(
            Arc::clone(&graph_store),
            Arc::clone(&llm),
            &config.models.organizer,
            &config.role.name,
        ));
        let cleaner = Arc::new(GraphCleaner::new(
            Arc::clone(&graph_store),
            Arc::clone(&llm),
            &config.models.organizer,
        ));

        let affection =
            Arc::new(AffectionService::open(&data_dir.join("affection.db")).context("affection")?);
        let blacklist =
            Arc::new(TempBlacklist::open(&data_dir.join("guard.db")).context("blacklist")?);
        let stats = Arc::new(StatsService::open(&data_dir.join("stats.db")).context("stats")?);

        let guard = Arc::new(InjectionGuard::new(
            Arc::clone(&llm),
            &config.models.guard,
            config.guard.temperature,
            Arc::clone(&trace),
        ));

        let persona_matcher = if config.role.persona_vector_check
            && !config.role.persona_anchor.is_empty()
        {
            Some(Arc::new(PersonaMatcher::new(
                Arc::clone(&embedder),
                &config.role.persona_anchor,
                config.role.persona_threshold,
            )))
        } else {
            None
        };

        let orchestrator = Arc::new(Orchestrator::new(OrchestratorDeps {
            config: Arc::clone(&config),
            llm: Arc::clone(&llm),
            store: Arc::clone(&store),
            short_term: Arc::clone(&short_term),
            graph,
            affection: Arc::clone(&affection),
            guard,
            blacklist: Arc::clone(&blacklist),
            stats: Arc::clone(&stats),
            trace,
            persona_matcher,
        }));

        let splitter = Arc::new(MessageSplitter::new(
            Arc::clone(&llm),
            &config.models.utility,
            config.reply.clone(),
        ));
        let gc = Arc::new(MemoryGc::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            &config.models.organizer,
            config.storage.rebuild_after_gc,
        ));
        let commands = Arc::new(CommandRouter::new(
            Arc::clone(&config),
            Arc::clone(&blacklist),
            Arc::clone(&store),
            Arc::clone(&short_term),
            Arc::clone(&gc),
            Arc::clone(&stats),
        ));

        let captioner: Option<Arc<dyn ImageCaptioner>> = config
            .models
            .vision_caption
            .as_ref()
            .or(config.models.vision.as_ref())
            .map(|role| {
                Arc::new(VisionCaptioner {
                    client: model_client,
                    role: role.clone(),
                }) as Arc<dyn ImageCaptioner>
            });

        let emoji = if config.emoji.enable {
            Some(Arc::new(
                EmojiStore::open(
                    &config.emoji.dir,
                    Arc::clone(&embedder),
                    config.emoji.similarity_threshold,
                )
                .context("emoji store")?,
            ))
        } else {
            None
        };

        Ok(Self {
            config,
            orchestrator,
            splitter,
            commands,
            stats,
            short_term,
            store,
            blacklist,
            affection,
            graph_store,
            gc,
            cleaner,
            captioner,
            emoji,
        })
    }

    /// Wire a chat-platform adapter into the pipeline.
    pub fn dispatcher(&self, adapter: Arc<dyn ChatAdapter>) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.splitter),
            Arc::clone(&self.commands),
            adapter,
            Arc::clone(&self.stats),
            self.captioner.clone(),
            self.emoji.clone(),
            self.config.emoji.clone(),
        )
    }

    /// Startup warm-up: rebuild short-term buffers for the most recently
    /// active users from adapter history. Call once after the adapter
    /// connects.
    pub async fn warm_up(&self, adapter: Arc<dyn ChatAdapter>) {
        aika_scheduler::warm_up_short_term(
            &self.config.scheduler,
            adapter,
            Arc::clone(&self.short_term),
            Arc::clone(&self.stats),
        )
        .await;
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.config.scheduler.clone(),
            Arc::clone(&self.gc),
            Arc::clone(&self.blacklist),
            Arc::clone(&self.cleaner),
        )
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState {
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
            affection: Arc::clone(&self.affection),
            graph: Arc::clone(&self.graph_store),
            blacklist: Arc::clone(&self.blacklist),
            store: Arc::clone(&self.store),
        }
    }
}

struct VisionCaptioner {
    client: Arc<ModelClient>,
    role: ModelRole,
}

#[async_trait]
impl ImageCaptioner for VisionCaptioner {
    async fn caption(&self, image: &[u8], mime: &str, is_emoji: bool) -> Result<String, LlmError> {
        self.client
            .caption_image(&self.role, image, mime, is_emoji)
            .await
    }
}
