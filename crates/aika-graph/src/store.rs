//! Per-user knowledge graph in SQLite.
//!
//! Nodes are unique per (user, entity); edges per (user, source, target,
//! relation) and a repeated insert bumps the weight by 0.1. Nothing is ever
//! shared across users. Alongside plain storage this module carries the
//! heuristic cleanups (orphans, low-connection nodes, near-duplicate merge)
//! that back the AI cleaner's fallback path.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::Result;
use crate::types::{
    EntityMatch, GraphEdge, GraphNode, GraphStats, GraphUser, NeighborEdge, UserGraphStats,
};

/// Outgoing edges followed per node during traversal.
const NEIGHBOR_FANOUT: usize = 10;

/// Weight added on edge upsert conflict.
const EDGE_WEIGHT_INCREMENT: f64 = 0.1;

pub struct GraphStore {
    conn: Mutex<Connection>,
}

impl GraphStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(db_path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::new(Connection::open(db_path)?)
    }

    /// Insert or update a node, merging the new alias into the stored list.
    pub fn add_node(
        &self,
        user_id: &str,
        entity: &str,
        entity_type: Option<&str>,
        alias: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();

        let existing: Option<String> = conn
            .query_row(
                "SELECT properties FROM nodes WHERE user_id = ?1 AND entity = ?2",
                rusqlite::params![user_id, entity],
                |row| row.get(0),
            )
            .ok();

        let mut props: serde_json::Value = existing
            .as_deref()
            .and_then(|p| serde_json::from_str(p).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        if let Some(alias) = alias.filter(|a| !a.is_empty() && *a != entity) {
            let aliases = props
                .get("aliases")
                .and_then(|a| a.as_array())
                .cloned()
                .unwrap_or_default();
            let mut list: Vec<String> = aliases
                .into_iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
            if !list.iter().any(|a| a == alias) {
                list.push(alias.to_string());
            }
            props["aliases"] = serde_json::json!(list);
        }

        conn.execute(
            "INSERT INTO nodes (user_id, entity, entity_type, properties, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(user_id, entity) DO UPDATE SET
                 entity_type = excluded.entity_type,
                 properties = excluded.properties,
                 updated_at = excluded.updated_at",
            rusqlite::params![user_id, entity, entity_type, props.to_string(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert or strengthen an edge. A `time_ref` phrase is stored in the
    /// properties together with the wall-clock timestamp it refers from.
    pub fn add_edge(
        &self,
        user_id: &str,
        source: &str,
        target: &str,
        relation: &str,
        time_ref: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();

        let mut props = serde_json::json!({});
        if let Some(time_ref) = time_ref.filter(|t| !t.is_empty()) {
            props["time_ref"] = serde_json::json!(time_ref);
            props["timestamp"] = serde_json::json!(now);
        }

        conn.execute(
            "INSERT INTO edges
             (user_id, source_entity, target_entity, relation, properties, weight,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1.0, ?6, ?6)
             ON CONFLICT(user_id, source_entity, target_entity, relation) DO UPDATE SET
                 properties = excluded.properties,
                 weight = weight + ?7,
                 updated_at = excluded.updated_at",
            rusqlite::params![
                user_id,
                source,
                target,
                relation,
                props.to_string(),
                now,
                EDGE_WEIGHT_INCREMENT
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Depth-bounded traversal over outgoing edges, strongest first, at most
    /// ten per node, never revisiting an entity.
    pub fn get_neighbors(
        &self,
        user_id: &str,
        entity: &str,
        max_depth: usize,
    ) -> Result<Vec<NeighborEdge>> {
        let conn = self.conn.lock().unwrap();
        let mut visited = HashSet::new();
        let mut results = Vec::new();
        traverse(&conn, user_id, entity, 1, max_depth, &mut visited, &mut results)?;
        Ok(results)
    }

    /// Fuzzy entity lookup by name. An empty keyword lists everything, which
    /// the cleaner uses to fetch a user's full entity set.
    pub fn search_entities(
        &self,
        user_id: &str,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<EntityMatch>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT entity, entity_type, properties, updated_at
             FROM nodes
             WHERE user_id = ?1 AND entity LIKE ?2
             ORDER BY updated_at DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                rusqlite::params![user_id, format!("%{keyword}%"), limit as i64],
                row_to_match,
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Find entities whose stored alias list contains `alias`. The LIKE scan
    /// over serialized properties is a prefilter; the parsed list decides.
    pub fn search_by_alias(&self, user_id: &str, alias: &str) -> Result<Vec<EntityMatch>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT entity, entity_type, properties, updated_at
             FROM nodes
             WHERE user_id = ?1 AND properties LIKE ?2
             ORDER BY updated_at DESC
             LIMIT 5",
        )?;
        let rows: Vec<EntityMatch> = stmt
            .query_map(
                rusqlite::params![user_id, format!("%\"{alias}\"%")],
                row_to_match,
            )?
            .filter_map(|r| r.ok())
            .filter(|m| m.aliases().iter().any(|a| a == alias))
            .collect();
        Ok(rows)
    }

    pub fn node_exists(&self, user_id: &str, entity: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE user_id = ?1 AND entity = ?2",
            rusqlite::params![user_id, entity],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn edge_count(&self, user_id: &str, entity: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM edges
             WHERE user_id = ?1 AND (source_entity = ?2 OR target_entity = ?2)",
            rusqlite::params![user_id, entity],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// Remove one entity and every edge touching it.
    pub fn delete_entity(&self, user_id: &str, entity: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM edges
             WHERE user_id = ?1 AND (source_entity = ?2 OR target_entity = ?2)",
            rusqlite::params![user_id, entity],
        )?;
        let deleted = conn.execute(
            "DELETE FROM nodes WHERE user_id = ?1 AND entity = ?2",
            rusqlite::params![user_id, entity],
        )?;
        Ok(deleted > 0)
    }

    // --- stats and views --------------------------------------------------

    pub fn user_stats(&self, user_id: &str) -> Result<UserGraphStats> {
        let conn = self.conn.lock().unwrap();
        let nodes: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE user_id = ?1",
            [user_id],
            |r| r.get(0),
        )?;
        let edges: i64 = conn.query_row(
            "SELECT COUNT(*) FROM edges WHERE user_id = ?1",
            [user_id],
            |r| r.get(0),
        )?;
        Ok(UserGraphStats {
            nodes: nodes as usize,
            edges: edges as usize,
        })
    }

    pub fn stats(&self) -> Result<GraphStats> {
        let conn = self.conn.lock().unwrap();
        let total_nodes: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
        let total_edges: i64 = conn.query_row("SELECT COUNT(*) FROM edges", [], |r| r.get(0))?;
        let total_users: i64 =
            conn.query_row("SELECT COUNT(DISTINCT user_id) FROM nodes", [], |r| r.get(0))?;
        let entity_types: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT entity_type) FROM nodes WHERE entity_type IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(GraphStats {
            total_nodes: total_nodes as usize,
            total_edges: total_edges as usize,
            total_users: total_users as usize,
            entity_types: entity_types as usize,
        })
    }

    pub fn users(&self) -> Result<Vec<GraphUser>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, COUNT(*) AS node_count
             FROM nodes GROUP BY user_id ORDER BY node_count DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(GraphUser {
                    user_id: row.get(0)?,
                    node_count: row.get::<_, i64>(1)? as usize,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Nodes and the edges between them, for the admin view. Bounded to 500
    /// nodes / 1000 edge candidates.
    pub fn graph_data(&self, user_id: Option<&str>) -> Result<(Vec<GraphNode>, Vec<GraphEdge>)> {
        let conn = self.conn.lock().unwrap();

        let (node_where, params): (&str, Vec<String>) = match user_id {
            Some(uid) => ("WHERE user_id = ?1", vec![uid.to_string()]),
            None => ("", Vec::new()),
        };

        let mut stmt = conn.prepare(&format!(
            "SELECT id, user_id, entity, entity_type, properties, created_at, updated_at
             FROM nodes {node_where} ORDER BY updated_at DESC LIMIT 500"
        ))?;
        let nodes: Vec<GraphNode> = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let props: Option<String> = row.get(4)?;
                Ok(GraphNode {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    entity: row.get(2)?,
                    entity_type: row.get(3)?,
                    properties: props
                        .and_then(|p| serde_json::from_str(&p).ok())
                        .unwrap_or_else(|| serde_json::json!({})),
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        let known: HashSet<&str> = nodes.iter().map(|n| n.entity.as_str()).collect();

        let mut stmt = stmt_for_edges(&conn, user_id)?;
        let edges: Vec<GraphEdge> = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let props: Option<String> = row.get(5)?;
                Ok(GraphEdge {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    source: row.get(2)?,
                    target: row.get(3)?,
                    relation: row.get(4)?,
                    properties: props
                        .and_then(|p| serde_json::from_str(&p).ok())
                        .unwrap_or_else(|| serde_json::json!({})),
                    weight: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .filter(|e| known.contains(e.source.as_str()) && known.contains(e.target.as_str()))
            .collect();

        Ok((nodes, edges))
    }

    // --- destructive maintenance ------------------------------------------

    pub fn clear_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE user_id = ?1",
            [user_id],
            |r| r.get(0),
        )?;
        conn.execute("DELETE FROM nodes WHERE user_id = ?1", [user_id])?;
        conn.execute("DELETE FROM edges WHERE user_id = ?1", [user_id])?;
        warn!(user_id, nodes = count, "user graph cleared");
        Ok(count as usize)
    }

    pub fn clear_all(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
        conn.execute("DELETE FROM nodes", [])?;
        conn.execute("DELETE FROM edges", [])?;
        warn!(nodes = count, "entire graph cleared");
        Ok(count as usize)
    }

    /// Delete nodes with no incident edges.
    pub fn cleanup_orphan_nodes(&self, user_id: Option<&str>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = match user_id {
            Some(uid) => conn.execute(
                "DELETE FROM nodes
                 WHERE user_id = ?1 AND entity NOT IN (
                     SELECT source_entity FROM edges WHERE user_id = ?1
                     UNION
                     SELECT target_entity FROM edges WHERE user_id = ?1
                 )",
                [uid],
            )?,
            None => conn.execute(
                "DELETE FROM nodes
                 WHERE NOT EXISTS (
                     SELECT 1 FROM edges e
                     WHERE e.user_id = nodes.user_id
                       AND (e.source_entity = nodes.entity OR e.target_entity = nodes.entity)
                 )",
                [],
            )?,
        };
        if deleted > 0 {
            info!(user = ?user_id, deleted, "orphan nodes pruned");
        }
        Ok(deleted)
    }

    /// Delete nodes with 1..=threshold incident edges, plus those edges.
    pub fn cleanup_low_connection_nodes(
        &self,
        user_id: Option<&str>,
        threshold: usize,
    ) -> Result<usize> {
        let victims: Vec<(String, String)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT user_id, entity,
                        (SELECT COUNT(*) FROM edges e
                          WHERE e.user_id = n.user_id AND e.source_entity = n.entity) +
                        (SELECT COUNT(*) FROM edges e
                          WHERE e.user_id = n.user_id AND e.target_entity = n.entity)
                            AS edge_count
                 FROM nodes n",
            )?;
            let rows: Vec<(String, String, usize)> = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)? as usize,
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            rows.into_iter()
                .filter(|(uid, _, count)| {
                    *count > 0
                        && *count <= threshold
                        && user_id.map_or(true, |u| u == uid)
                })
                .map(|(uid, entity, _)| (uid, entity))
                .collect()
        };

        let conn = self.conn.lock().unwrap();
        for (uid, entity) in &victims {
            conn.execute(
                "DELETE FROM edges
                 WHERE user_id = ?1 AND (source_entity = ?2 OR target_entity = ?2)",
                rusqlite::params![uid, entity],
            )?;
            conn.execute(
                "DELETE FROM nodes WHERE user_id = ?1 AND entity = ?2",
                rusqlite::params![uid, entity],
            )?;
        }
        if !victims.is_empty() {
            info!(user = ?user_id, deleted = victims.len(), threshold, "low-connection nodes pruned");
        }
        Ok(victims.len())
    }

    /// Heuristic duplicate merge: case-fold equality, mutual alias, or edit
    /// distance ≤ 1 for names of at most four characters.
    pub fn merge_duplicate_entities(&self, user_id: Option<&str>) -> Result<usize> {
        let users: Vec<String> = match user_id {
            Some(uid) => vec![uid.to_string()],
            None => {
                let conn = self.conn.lock().unwrap();
                let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM nodes")?;
                let users = stmt
                    .query_map([], |r| r.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                users
            }
        };

        let mut total = 0usize;
        for uid in users {
            let entities = self.search_entities(&uid, "", 1000)?;
            if entities.len() < 2 {
                continue;
            }

            let mut processed: HashSet<String> = HashSet::new();
            for (i, a) in entities.iter().enumerate() {
                if processed.contains(&a.entity) {
                    continue;
                }
                let aliases_a: HashSet<String> = a.aliases().into_iter().collect();

                let mut duplicates = Vec::new();
                for b in entities.iter().skip(i + 1) {
                    if processed.contains(&b.entity) {
                        continue;
                    }
                    let aliases_b: HashSet<String> = b.aliases().into_iter().collect();

                    let same_case_fold = a.entity.to_lowercase() == b.entity.to_lowercase()
                        && a.entity != b.entity;
                    let mutual_alias =
                        aliases_a.contains(&b.entity) || aliases_b.contains(&a.entity);
                    let close_short = a.entity.chars().count() <= 4
                        && b.entity.chars().count() <= 4
                        && edit_distance(&a.entity, &b.entity) <= 1;

                    if same_case_fold || mutual_alias || close_short {
                        duplicates.push(b.entity.clone());
                        processed.insert(b.entity.clone());
                    }
                }

                if !duplicates.is_empty() {
                    total += self.merge_entities(&uid, &a.entity, &duplicates)?;
                }
            }
        }
        if total > 0 {
            info!(merged = total, "duplicate entities merged");
        }
        Ok(total)
    }

    /// Fold `duplicates` into `main_entity`: migrate incident edges, union
    /// aliases, delete the duplicate nodes and any resulting self-loop.
    pub fn merge_entities(
        &self,
        user_id: &str,
        main_entity: &str,
        duplicates: &[String],
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();

        let main_props: Option<String> = conn
            .query_row(
                "SELECT properties FROM nodes WHERE user_id = ?1 AND entity = ?2",
                rusqlite::params![user_id, main_entity],
                |r| r.get(0),
            )
            .ok();
        let Some(main_props) = main_props else {
            warn!(user_id, main_entity, "merge target missing, skipped");
            return Ok(0);
        };

        let mut props: serde_json::Value =
            serde_json::from_str(&main_props).unwrap_or_else(|_| serde_json::json!({}));
        let mut aliases: HashSet<String> = props
            .get("aliases")
            .and_then(|a| a.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut merged = 0usize;
        for dup in duplicates {
            if dup == main_entity {
                continue;
            }
            let dup_props: Option<String> = conn
                .query_row(
                    "SELECT properties FROM nodes WHERE user_id = ?1 AND entity = ?2",
                    rusqlite::params![user_id, dup],
                    |r| r.get(0),
                )
                .ok();
            let Some(dup_props) = dup_props else { continue };

            aliases.insert(dup.clone());
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&dup_props) {
                if let Some(arr) = parsed.get("aliases").and_then(|a| a.as_array()) {
                    for v in arr.iter().filter_map(|v| v.as_str()) {
                        aliases.insert(v.to_string());
                    }
                }
            }

            // Outgoing edges, then incoming; OR IGNORE drops collisions with
            // edges the main entity already owns.
            conn.execute(
                "INSERT OR IGNORE INTO edges
                 (user_id, source_entity, target_entity, relation, properties, weight,
                  created_at, updated_at)
                 SELECT user_id, ?1, target_entity, relation, properties, weight,
                        created_at, updated_at
                 FROM edges WHERE user_id = ?2 AND source_entity = ?3",
                rusqlite::params![main_entity, user_id, dup],
            )?;
            conn.execute(
                "DELETE FROM edges WHERE user_id = ?1 AND source_entity = ?2",
                rusqlite::params![user_id, dup],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO edges
                 (user_id, source_entity, target_entity, relation, properties, weight,
                  created_at, updated_at)
                 SELECT user_id, source_entity, ?1, relation, properties, weight,
                        created_at, updated_at
                 FROM edges WHERE user_id = ?2 AND target_entity = ?3",
                rusqlite::params![main_entity, user_id, dup],
            )?;
            conn.execute(
                "DELETE FROM edges WHERE user_id = ?1 AND target_entity = ?2",
                rusqlite::params![user_id, dup],
            )?;
            conn.execute(
                "DELETE FROM nodes WHERE user_id = ?1 AND entity = ?2",
                rusqlite::params![user_id, dup],
            )?;
            merged += 1;
        }

        aliases.remove(main_entity);
        let mut list: Vec<String> = aliases.into_iter().collect();
        list.sort();
        props["aliases"] = serde_json::json!(list);
        conn.execute(
            "UPDATE nodes SET properties = ?1, updated_at = ?2
             WHERE user_id = ?3 AND entity = ?4",
            rusqlite::params![props.to_string(), now, user_id, main_entity],
        )?;

        conn.execute(
            "DELETE FROM edges
             WHERE user_id = ?1 AND source_entity = ?2 AND target_entity = ?2",
            rusqlite::params![user_id, main_entity],
        )?;

        Ok(merged)
    }
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS nodes (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            entity      TEXT NOT NULL,
            entity_type TEXT,
            properties  TEXT,
            created_at  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL,
            UNIQUE(user_id, entity)
        );
        CREATE TABLE IF NOT EXISTS edges (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id       TEXT NOT NULL,
            source_entity TEXT NOT NULL,
            target_entity TEXT NOT NULL,
            relation      TEXT NOT NULL,
            properties    TEXT,
            weight        REAL DEFAULT 1.0,
            created_at    INTEGER NOT NULL,
            updated_at    INTEGER NOT NULL,
            UNIQUE(user_id, source_entity, target_entity, relation)
        );
        CREATE INDEX IF NOT EXISTS idx_nodes_user ON nodes(user_id);
        CREATE INDEX IF NOT EXISTS idx_nodes_entity ON nodes(entity);
        CREATE INDEX IF NOT EXISTS idx_edges_user ON edges(user_id);
        CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_entity);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_entity);",
    )
}

fn stmt_for_edges<'a>(
    conn: &'a Connection,
    user_id: Option<&str>,
) -> rusqlite::Result<rusqlite::Statement<'a>> {
    let edge_where = match user_id {
        Some(_) => "WHERE user_id = ?1",
        None => "",
    };
    conn.prepare(&format!(
        "SELECT id, user_id, source_entity, target_entity, relation, properties,
                weight, created_at
         FROM edges {edge_where} LIMIT 1000"
    ))
}

fn traverse(
    conn: &Connection,
    user_id: &str,
    entity: &str,
    depth: usize,
    max_depth: usize,
    visited: &mut HashSet<String>,
    results: &mut Vec<NeighborEdge>,
) -> Result<()> {
    if depth > max_depth || visited.contains(entity) {
        return Ok(());
    }
    visited.insert(entity.to_string());

    let edges: Vec<(String, String, f64, Option<String>)> = {
        let mut stmt = conn.prepare_cached(
            "SELECT target_entity, relation, weight, properties
             FROM edges
             WHERE user_id = ?1 AND source_entity = ?2
             ORDER BY weight DESC
             LIMIT ?3",
        )?;
        let collected = stmt
            .query_map(
                rusqlite::params![user_id, entity, NEIGHBOR_FANOUT as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();
        collected
    };

    for (target, relation, weight, props) in edges {
        results.push(NeighborEdge {
            source: entity.to_string(),
            target: target.clone(),
            relation,
            weight,
            depth,
            properties: props
                .as_deref()
                .and_then(|p| serde_json::from_str(p).ok())
                .unwrap_or_else(|| serde_json::json!({})),
        });
        if depth < max_depth {
            traverse(conn, user_id, &target, depth + 1, max_depth, visited, results)?;
        }
    }
    Ok(())
}

fn row_to_match(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityMatch> {
    let props: Option<String> = row.get(2)?;
    Ok(EntityMatch {
        entity: row.get(0)?,
        entity_type: row.get(1)?,
        properties: props
            .as_deref()
            .and_then(|p| serde_json::from_str(p).ok())
            .unwrap_or_else(|| serde_json::json!({})),
        updated_at: row.get(3)?,
    })
}

/// Levenshtein distance, used only for short-name duplicate detection.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut current = vec![i + 1];
        for (j, cb) in b.iter().enumerate() {
            let insert = prev[j + 1] + 1;
            let delete = current[j] + 1;
            let substitute = prev[j] + usize::from(ca != cb);
            current.push(insert.min(delete).min(substitute));
        }
        prev = current;
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GraphStore {
        GraphStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn edge_upsert_increments_weight() {
        let s = store();
        s.add_node("u1", "小明", Some("人物"), None).unwrap();
        s.add_node("u1", "东京塔", Some("地点"), None).unwrap();
        s.add_edge("u1", "小明", "东京塔", "去过", None).unwrap();
        s.add_edge("u1", "小明", "东京塔", "去过", None).unwrap();

        let neighbors = s.get_neighbors("u1", "小明", 2).unwrap();
        assert_eq!(neighbors.len(), 1);
        assert!((neighbors[0].weight - 1.1).abs() < 1e-9);
    }

    #[test]
    fn aliases_accumulate_across_inserts() {
        let s = store();
        s.add_node("u1", "艾玛", Some("人物"), Some("她")).unwrap();
        s.add_node("u1", "艾玛", Some("人物"), Some("那个人")).unwrap();

        let matches = s.search_by_alias("u1", "她").unwrap();
        assert_eq!(matches.len(), 1);
        let aliases = matches[0].aliases();
        assert!(aliases.contains(&"她".to_string()));
        assert!(aliases.contains(&"那个人".to_string()));
    }

    #[test]
    fn traversal_is_depth_bounded_and_memoized() {
        let s = store();
        for (a, b, r) in [
            ("甲", "乙", "认识"),
            ("乙", "丙", "认识"),
            ("丙", "丁", "认识"),
            ("丙", "甲", "认识"), // cycle back
        ] {
            s.add_node("u1", a, None, None).unwrap();
            s.add_node("u1", b, None, None).unwrap();
            s.add_edge("u1", a, b, r, None).unwrap();
        }

        let neighbors = s.get_neighbors("u1", "甲", 2).unwrap();
        // depth 1: 甲→乙; depth 2: 乙→丙. 丙's edges are beyond the bound.
        assert_eq!(neighbors.len(), 2);
        assert!(neighbors.iter().all(|n| n.depth <= 2));
    }

    #[test]
    fn graphs_are_user_scoped() {
        let s = store();
        s.add_node("u1", "秘密", None, None).unwrap();
        s.add_node("u2", "秘密", None, None).unwrap();
        s.add_edge("u1", "秘密", "日记", "写在", None).unwrap();

        assert!(s.get_neighbors("u2", "秘密", 2).unwrap().is_empty());
        assert_eq!(s.user_stats("u1").unwrap().nodes, 1);
        assert_eq!(s.user_stats("u2").unwrap().nodes, 1);
    }

    #[test]
    fn orphan_cleanup_spares_connected_nodes() {
        let s = store();
        s.add_node("u1", "孤立点", None, None).unwrap();
        s.add_node("u1", "来源", None, None).unwrap();
        s.add_node("u1", "目标", None, None).unwrap();
        s.add_edge("u1", "来源", "目标", "指向", None).unwrap();

        let deleted = s.cleanup_orphan_nodes(Some("u1")).unwrap();
        assert_eq!(deleted, 1);
        assert!(!s.node_exists("u1", "孤立点").unwrap());
        assert!(s.node_exists("u1", "来源").unwrap());
    }

    #[test]
    fn merge_migrates_edges_and_unions_aliases() {
        let s = store();
        s.add_node("u1", "小明", Some("人物"), None).unwrap();
        s.add_node("u1", "小明同学", Some("人物"), Some("同学")).unwrap();
        s.add_node("u1", "篮球", Some("物品"), None).unwrap();
        s.add_edge("u1", "小明同学", "篮球", "喜欢", None).unwrap();

        let merged = s
            .merge_entities("u1", "小明", &["小明同学".to_string()])
            .unwrap();
        assert_eq!(merged, 1);
        assert!(!s.node_exists("u1", "小明同学").unwrap());

        let neighbors = s.get_neighbors("u1", "小明", 1).unwrap();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].target, "篮球");

        let matches = s.search_entities("u1", "小明", 5).unwrap();
        assert!(matches[0].aliases().contains(&"小明同学".to_string()));
    }

    #[test]
    fn heuristic_duplicate_detection_covers_all_rules() {
        let s = store();
        s.add_node("u1", "Tokyo", None, None).unwrap();
        s.add_node("u1", "tokyo", None, None).unwrap(); // case fold
        s.add_node("u1", "小红", None, None).unwrap();
        s.add_node("u1", "小虹", None, None).unwrap(); // edit distance 1, short
        s.add_edge("u1", "Tokyo", "小红", "在", None).unwrap();

        let merged = s.merge_duplicate_entities(Some("u1")).unwrap();
        assert_eq!(merged, 2);
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("abc", "abc"), 0);
        assert_eq!(edit_distance("abc", "abd"), 1);
        assert_eq!(edit_distance("小红", "小虹"), 1);
        assert_eq!(edit_distance("", "ab"), 2);
    }

    #[test]
    fn low_connection_cleanup_honors_threshold() {
        let s = store();
        s.add_node("u1", "弱", None, None).unwrap();
        s.add_node("u1", "强", None, None).unwrap();
        s.add_node("u1", "对象", None, None).unwrap();
        s.add_edge("u1", "弱", "对象", "有", None).unwrap();
        s.add_edge("u1", "强", "对象", "有", None).unwrap();
        s.add_edge("u1", "强", "弱", "压", None).unwrap();

        // 弱 has 2 incident edges now, 强 has 2, 对象 has 2 → nothing under 1.
        assert_eq!(s.cleanup_low_connection_nodes(Some("u1"), 1).unwrap(), 0);
        // Raise the threshold and everything with 1..=2 edges goes.
        assert!(s.cleanup_low_connection_nodes(Some("u1"), 2).unwrap() > 0);
    }
}
