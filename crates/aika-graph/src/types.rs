use serde::{Deserialize, Serialize};

/// A stored entity. `properties` carries an `aliases` string list with the
/// alternate surface forms seen for this entity ("她", "那个人", …).
#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: i64,
    pub user_id: String,
    pub entity: String,
    pub entity_type: Option<String>,
    pub properties: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A stored relation. `properties` may carry `time_ref` (the surface time
/// phrase) and `timestamp` (when it was recorded).
#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub id: i64,
    pub user_id: String,
    pub source: String,
    pub target: String,
    pub relation: String,
    pub properties: serde_json::Value,
    pub weight: f64,
    pub created_at: i64,
}

/// One traversal result from `get_neighbors`.
#[derive(Debug, Clone)]
pub struct NeighborEdge {
    pub source: String,
    pub target: String,
    pub relation: String,
    pub weight: f64,
    pub depth: usize,
    pub properties: serde_json::Value,
}

/// Entity row shape returned by name/alias search.
#[derive(Debug, Clone)]
pub struct EntityMatch {
    pub entity: String,
    pub entity_type: Option<String>,
    pub properties: serde_json::Value,
    pub updated_at: i64,
}

impl EntityMatch {
    pub fn aliases(&self) -> Vec<String> {
        self.properties
            .get("aliases")
            .and_then(|a| a.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// LLM extraction output for one dialogue turn.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedGraph {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
    #[serde(default)]
    pub time_context: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub alias: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    pub relation: String,
    #[serde(default)]
    pub time_ref: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub total_users: usize,
    pub entity_types: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UserGraphStats {
    pub nodes: usize,
    pub edges: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphUser {
    pub user_id: String,
    pub node_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupOutcome {
    pub merged: usize,
    pub deleted: usize,
}
