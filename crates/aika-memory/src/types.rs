use serde::{Deserialize, Serialize};

/// Entry in a user's private id-map. The private index holds both the
/// user's private turns and shadow copies of their group turns; the variant
/// tells search which table the row lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdRef {
    Private(i64),
    Group(i64),
}

/// One long-term memory search result, re-ranked by freshness.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: i64,
    pub role: String,
    pub content: String,
    /// Epoch seconds.
    pub timestamp: i64,
    pub sender_name: Option<String>,
    pub similarity: f32,
    /// `similarity * (1 + 0.3 * exp(-age / 7d))`.
    pub score: f32,
}

/// One knowledge-base search result.
#[derive(Debug, Clone)]
pub struct KnowledgeHit {
    pub source: String,
    pub title: String,
    pub content: String,
    pub similarity: f32,
}

/// Per-user memory counts for admin views and GC decisions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserMemoryStats {
    pub total: usize,
    pub private: usize,
    pub group: usize,
}

/// Workspace-wide memory counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalMemoryStats {
    pub user_count: usize,
    pub group_count: usize,
    pub total_private_memories: usize,
    pub total_group_memories: usize,
}
