use thiserror::Error;

/// Internal plumbing errors. Nothing here ever reaches a user; the
/// orchestrator folds every failure into its fallback reply or an empty
/// retrieval context.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("memory error: {0}")]
    Memory(#[from] aika_memory::MemoryError),

    #[error("graph error: {0}")]
    Graph(#[from] aika_graph::GraphError),

    #[error("affection error: {0}")]
    Affection(#[from] aika_affection::AffectionError),

    #[error("guard error: {0}")]
    Guard(#[from] aika_guard::GuardError),

    #[error("stats error: {0}")]
    Stats(#[from] aika_stats::StatsError),

    #[error("model error: {0}")]
    Llm(#[from] aika_llm::LlmError),

    #[error("adapter error: {0}")]
    Adapter(#[from] aika_core::AikaError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
