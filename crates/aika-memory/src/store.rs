//! Dual-scope long-term memory on FAISS-style flat indices.
//!
//! Every user owns a private database (their private turns + shadow copies
//! of their group turns) and every group owns a member database. Vectors
//! live in one flat index per scope; `id_map[i]` maps the i-th vector back
//! to its SQLite row. Rows deleted by GC without a rebuild leave dangling
//! id-map entries that search silently skips.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Local, TimeZone, Utc};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use aika_core::config::StorageConfig;
use aika_llm::Embedder;

use crate::db;
use crate::error::{MemoryError, Result};
use crate::index::{dot, load_id_map, normalize, save_id_map, FlatIndex};
use crate::types::{GlobalMemoryStats, IdRef, KnowledgeHit, UserMemoryStats, VectorHit};

/// Queries shorter than this never hit the memory index.
const MIN_MEMORY_QUERY_CHARS: usize = 4;
const MIN_KB_QUERY_CHARS: usize = 3;

/// Closed-class utterances that carry no retrievable content.
const MEMORY_SKIP_PATTERNS: &[&str] = &[
    "嗯", "哦", "好", "啊", "呢", "吧", "了", "在吗", "在不", "你好",
];
const KB_SKIP_PATTERNS: &[&str] = &["嗯", "哦", "好", "啊", "呢", "吧", "了"];

/// Freshness half-window for re-ranking: seven days in seconds.
const FRESHNESS_TAU_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Extra neighbors fetched beyond k to survive threshold filtering.
const FETCH_MARGIN: usize = 5;

/// Cap on other-group rows scanned during cross-scene widening.
const CROSS_SCENE_SCAN_LIMIT: usize = 50;

struct ScopeState<T> {
    index: FlatIndex,
    id_map: Vec<T>,
}

#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub data_dir: PathBuf,
    pub dim: usize,
    pub retrieve_count: usize,
    pub similarity_threshold: f32,
    pub kb_similarity_threshold: f32,
    pub cross_scene: bool,
    pub enabled: bool,
}

impl VectorStoreConfig {
    pub fn from_storage(storage: &StorageConfig, dim: usize) -> Self {
        Self {
            data_dir: PathBuf::from(&storage.data_dir),
            dim,
            retrieve_count: storage.retrieve_count,
            similarity_threshold: storage.similarity_threshold,
            kb_similarity_threshold: storage.kb_similarity_threshold,
            cross_scene: storage.cross_scene,
            enabled: storage.enable_vector_memory,
        }
    }
}

pub struct VectorStore {
    cfg: VectorStoreConfig,
    embedder: Arc<dyn Embedder>,
    private_states: Mutex<HashMap<String, ScopeState<IdRef>>>,
    group_states: Mutex<HashMap<String, ScopeState<i64>>>,
    kb_state: Mutex<Option<ScopeState<i64>>>,
}

impl VectorStore {
    pub fn new(cfg: VectorStoreConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        std::fs::create_dir_all(cfg.data_dir.join("private"))?;
        std::fs::create_dir_all(cfg.data_dir.join("groups"))?;
        info!(
            dir = %cfg.data_dir.display(),
            dim = cfg.dim,
            threshold = cfg.similarity_threshold,
            "vector store ready"
        );
        Ok(Self {
            cfg,
            embedder,
            private_states: Mutex::new(HashMap::new()),
            group_states: Mutex::new(HashMap::new()),
            kb_state: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &VectorStoreConfig {
        &self.cfg
    }

    // --- paths ------------------------------------------------------------

    fn private_db_path(&self, user_id: &str) -> PathBuf {
        self.cfg.data_dir.join("private").join(format!("user_{user_id}.db"))
    }

    fn private_index_paths(&self, user_id: &str) -> (PathBuf, PathBuf) {
        let dir = self.cfg.data_dir.join("private");
        (
            dir.join(format!("user_{user_id}.index")),
            dir.join(format!("user_{user_id}.idmap")),
        )
    }

    fn group_db_path(&self, group_id: &str) -> PathBuf {
        self.cfg.data_dir.join("groups").join(format!("group_{group_id}.db"))
    }

    fn group_index_paths(&self, group_id: &str) -> (PathBuf, PathBuf) {
        let dir = self.cfg.data_dir.join("groups");
        (
            dir.join(format!("group_{group_id}.index")),
            dir.join(format!("group_{group_id}.idmap")),
        )
    }

    fn kb_db_path(&self) -> PathBuf {
        self.cfg.data_dir.join("knowledge.db")
    }

    fn kb_index_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.cfg.data_dir.join("knowledge.index"),
            self.cfg.data_dir.join("knowledge.idmap"),
        )
    }

    // --- connections ------------------------------------------------------

    fn open_private_db(&self, user_id: &str) -> Result<Connection> {
        let conn = Connection::open(self.private_db_path(user_id))?;
        db::init_private_db(&conn)?;
        Ok(conn)
    }

    fn open_group_db(&self, group_id: &str) -> Result<Connection> {
        let conn = Connection::open(self.group_db_path(group_id))?;
        db::init_group_db(&conn)?;
        Ok(conn)
    }

    fn open_kb_db(&self) -> Result<Connection> {
        let conn = Connection::open(self.kb_db_path())?;
        db::init_knowledge_db(&conn)?;
        Ok(conn)
    }

    // --- writes -----------------------------------------------------------

    /// Store one finished turn. Private turns land in the user's store only;
    /// group turns are written to the user's store (discriminated id-map
    /// entry) AND to the group's own store.
    pub async fn add_pair(
        &self,
        user_id: &str,
        query: &str,
        reply: &str,
        group_id: Option<&str>,
        sender_name: Option<&str>,
    ) -> Result<()> {
        if !self.cfg.enabled {
            return Ok(());
        }

        let combined = format!("User问: {query}\nBot答: {reply}");
        let vector = normalize(self.embedder.embed(&combined).await?);
        let now = Utc::now().timestamp();

        match group_id {
            Some(gid) => {
                self.add_user_group_row(user_id, gid, query, reply, &combined, &vector, now)?;
                self.add_group_member_row(
                    gid, user_id, sender_name, query, reply, &combined, &vector, now,
                )?;
            }
            None => {
                self.add_user_private_row(user_id, query, reply, &combined, &vector, now)?;
            }
        }
        debug!(user_id, group = ?group_id, "memory pair stored");
        Ok(())
    }

    fn add_user_private_row(
        &self,
        user_id: &str,
        query: &str,
        reply: &str,
        content: &str,
        vector: &[f32],
        now: i64,
    ) -> Result<()> {
        let conn = self.open_private_db(user_id)?;
        conn.execute(
            "INSERT INTO private_memories (role, content, timestamp, query, reply)
             VALUES ('Pair', ?1, ?2, ?3, ?4)",
            rusqlite::params![content, now, query, reply],
        )?;
        let row_id = conn.last_insert_rowid();
        self.push_private_vector(user_id, vector.to_vec(), IdRef::Private(row_id))
    }

    fn add_user_group_row(
        &self,
        user_id: &str,
        group_id: &str,
        query: &str,
        reply: &str,
        content: &str,
        vector: &[f32],
        now: i64,
    ) -> Result<()> {
        let conn = self.open_private_db(user_id)?;
        conn.execute(
            "INSERT INTO group_memories (group_id, role, content, timestamp, query, reply)
             VALUES (?1, 'Pair', ?2, ?3, ?4, ?5)",
            rusqlite::params![group_id, content, now, query, reply],
        )?;
        let row_id = conn.last_insert_rowid();
        self.push_private_vector(user_id, vector.to_vec(), IdRef::Group(row_id))
    }

    #[allow(clippy::too_many_arguments)]
    fn add_group_member_row(
        &self,
        group_id: &str,
        user_id: &str,
        sender_name: Option<&str>,
        query: &str,
        reply: &str,
        content: &str,
        vector: &[f32],
        now: i64,
    ) -> Result<()> {
        let conn = self.open_group_db(group_id)?;
        conn.execute(
            "INSERT INTO member_memories
             (user_id, role, content, timestamp, sender_name, query, reply)
             VALUES (?1, 'Pair', ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![user_id, content, now, sender_name, query, reply],
        )?;
        let row_id = conn.last_insert_rowid();

        let (index_path, map_path) = self.group_index_paths(group_id);
        let mut states = self.group_states.lock().unwrap();
        let state = self.load_group_state(&mut states, group_id)?;
        state.index.add(vector.to_vec())?;
        state.id_map.push(row_id);
        state.index.save(&index_path)?;
        save_id_map(&map_path, &state.id_map)
    }

    fn push_private_vector(&self, user_id: &str, vector: Vec<f32>, id_ref: IdRef) -> Result<()> {
        let (index_path, map_path) = self.private_index_paths(user_id);
        let mut states = self.private_states.lock().unwrap();
        let state = self.load_private_state(&mut states, user_id)?;
        state.index.add(vector)?;
        state.id_map.push(id_ref);
        state.index.save(&index_path)?;
        save_id_map(&map_path, &state.id_map)
    }

    fn load_private_state<'a>(
        &self,
        states: &'a mut HashMap<String, ScopeState<IdRef>>,
        user_id: &str,
    ) -> Result<&'a mut ScopeState<IdRef>> {
        if !states.contains_key(user_id) {
            let (index_path, map_path) = self.private_index_paths(user_id);
            let index = FlatIndex::load(&index_path, self.cfg.dim)?;
            let id_map: Vec<IdRef> = load_id_map(&map_path)?;
            if index.len() != id_map.len() {
                warn!(
                    user_id,
                    vectors = index.len(),
                    ids = id_map.len(),
                    "private index and id-map drifted; a rebuild is advised"
                );
            }
            states.insert(user_id.to_string(), ScopeState { index, id_map });
        }
        Ok(states.get_mut(user_id).unwrap())
    }

    fn load_group_state<'a>(
        &self,
        states: &'a mut HashMap<String, ScopeState<i64>>,
        group_id: &str,
    ) -> Result<&'a mut ScopeState<i64>> {
        if !states.contains_key(group_id) {
            let (index_path, map_path) = self.group_index_paths(group_id);
            let index = FlatIndex::load(&index_path, self.cfg.dim)?;
            let id_map: Vec<i64> = load_id_map(&map_path)?;
            if index.len() != id_map.len() {
                warn!(
                    group_id,
                    vectors = index.len(),
                    ids = id_map.len(),
                    "group index and id-map drifted; a rebuild is advised"
                );
            }
            states.insert(group_id.to_string(), ScopeState { index, id_map });
        }
        Ok(states.get_mut(group_id).unwrap())
    }

    // --- memory search ----------------------------------------------------

    /// Search long-term memory for a scene and return re-ranked hits.
    /// Short or closed-class queries return empty without touching the
    /// embedder.
    pub async fn search_memory(
        &self,
        user_id: &str,
        query_text: &str,
        group_id: Option<&str>,
        k: Option<usize>,
    ) -> Result<Vec<VectorHit>> {
        if !self.cfg.enabled {
            return Ok(Vec::new());
        }
        let trimmed = query_text.trim();
        if trimmed.chars().count() < MIN_MEMORY_QUERY_CHARS
            || MEMORY_SKIP_PATTERNS.contains(&trimmed)
        {
            return Ok(Vec::new());
        }

        let query_vec = normalize(self.embedder.embed(trimmed).await?);

        let mut hits = match group_id {
            Some(gid) => {
                let mut hits = self.search_group_scope(gid, &query_vec, k)?;
                if self.cfg.cross_scene {
                    hits.extend(
                        self.search_user_other_groups(user_id, gid, &query_vec)
                            .await?,
                    );
                }
                hits
            }
            None => self.search_private_scope(user_id, &query_vec, k)?,
        };

        let now = Utc::now().timestamp();
        for hit in hits.iter_mut() {
            hit.score = time_weighted_score(hit.similarity, hit.timestamp, now);
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(hits)
    }

    fn search_private_scope(
        &self,
        user_id: &str,
        query_vec: &[f32],
        k: Option<usize>,
    ) -> Result<Vec<VectorHit>> {
        if !self.private_db_path(user_id).exists() {
            return Ok(Vec::new());
        }

        let neighbors = {
            let mut states = self.private_states.lock().unwrap();
            let state = self.load_private_state(&mut states, user_id)?;
            if state.index.is_empty() {
                return Ok(Vec::new());
            }
            let fetch = k.unwrap_or(self.cfg.retrieve_count) + FETCH_MARGIN;
            state
                .index
                .search(query_vec, fetch.min(state.index.len()))
                .into_iter()
                .filter_map(|(pos, sim)| state.id_map.get(pos).map(|r| (*r, sim)))
                .collect::<Vec<_>>()
        };

        let conn = self.open_private_db(user_id)?;
        let mut hits = Vec::new();
        for (id_ref, similarity) in neighbors {
            if similarity < self.cfg.similarity_threshold {
                continue;
            }
            let (table, row_id) = match id_ref {
                IdRef::Private(id) => ("private_memories", id),
                IdRef::Group(id) => {
                    if !self.cfg.cross_scene {
                        continue;
                    }
                    ("group_memories", id)
                }
            };
            let row = conn
                .query_row(
                    &format!("SELECT id, role, content, timestamp FROM {table} WHERE id = ?1"),
                    [row_id],
                    |row| {
                        Ok(VectorHit {
                            id: row.get(0)?,
                            role: row.get(1)?,
                            content: row.get(2)?,
                            timestamp: row.get(3)?,
                            sender_name: None,
                            similarity,
                            score: 0.0,
                        })
                    },
                )
                .ok();
            // Missing rows are dangling id-map entries left by GC.
            if let Some(hit) = row {
                hits.push(hit);
            }
        }
        Ok(hits)
    }

    fn search_group_scope(
        &self,
        group_id: &str,
        query_vec: &[f32],
        k: Option<usize>,
    ) -> Result<Vec<VectorHit>> {
        if !self.group_db_path(group_id).exists() {
            return Ok(Vec::new());
        }

        let neighbors = {
            let mut states = self.group_states.lock().unwrap();
            let state = self.load_group_state(&mut states, group_id)?;
            if state.index.is_empty() {
                return Ok(Vec::new());
            }
            let fetch = k.unwrap_or(self.cfg.retrieve_count) + FETCH_MARGIN;
            state
                .index
                .search(query_vec, fetch.min(state.index.len()))
                .into_iter()
                .filter_map(|(pos, sim)| state.id_map.get(pos).map(|id| (*id, sim)))
                .collect::<Vec<_>>()
        };

        let conn = self.open_group_db(group_id)?;
        let mut hits = Vec::new();
        for (row_id, similarity) in neighbors {
            if similarity < self.cfg.similarity_threshold {
                continue;
            }
            let row = conn
                .query_row(
                    "SELECT id, role, content, timestamp, sender_name
                     FROM member_memories WHERE id = ?1",
                    [row_id],
                    |row| {
                        Ok(VectorHit {
                            id: row.get(0)?,
                            role: row.get(1)?,
                            content: row.get(2)?,
                            timestamp: row.get(3)?,
                            sender_name: row.get(4)?,
                            similarity,
                            score: 0.0,
                        })
                    },
                )
                .ok();
            if let Some(hit) = row {
                hits.push(hit);
            }
        }
        Ok(hits)
    }

    /// Cross-scene widening: scan the user's memories from other groups and
    /// keep those over threshold. Embeds row contents one by one, so this is
    /// only reached behind the `cross_scene` knob.
    async fn search_user_other_groups(
        &self,
        user_id: &str,
        current_group_id: &str,
        query_vec: &[f32],
    ) -> Result<Vec<VectorHit>> {
        if !self.private_db_path(user_id).exists() {
            return Ok(Vec::new());
        }

        let rows: Vec<(i64, String, String, i64)> = {
            let conn = self.open_private_db(user_id)?;
            let mut stmt = conn.prepare(
                "SELECT id, group_id, content, timestamp FROM group_memories
                 WHERE group_id != ?1
                 ORDER BY timestamp DESC
                 LIMIT ?2",
            )?;
            let collected = stmt
                .query_map(
                    rusqlite::params![current_group_id, CROSS_SCENE_SCAN_LIMIT as i64],
                    |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    },
                )?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            collected
        };

        let mut hits = Vec::new();
        for (id, gid, content, timestamp) in rows {
            let vec = match self.embedder.embed(&content).await {
                Ok(v) => normalize(v),
                Err(e) => {
                    debug!("cross-scene embed failed: {e}");
                    continue;
                }
            };
            let similarity = dot(query_vec, &vec);
            if similarity >= self.cfg.similarity_threshold {
                hits.push(VectorHit {
                    id,
                    role: "Pair".to_string(),
                    content,
                    timestamp,
                    sender_name: Some(format!("[来自群{gid}]")),
                    similarity,
                    score: 0.0,
                });
            }
        }
        Ok(hits)
    }

    /// Render hits into the prompt block:
    /// `- [MM-DD HH:MM] {sender} [role] content`, newest-scored first, cut
    /// at `max_chars` of content.
    pub fn format_hits(hits: &[VectorHit], max_chars: usize) -> String {
        let mut lines = Vec::new();
        let mut total = 0usize;
        for hit in hits {
            let content_len = hit.content.chars().count();
            if total + content_len > max_chars {
                break;
            }
            let time_str = Local
                .timestamp_opt(hit.timestamp, 0)
                .single()
                .map(|t| t.format("%m-%d %H:%M").to_string())
                .unwrap_or_default();
            let sender = hit
                .sender_name
                .as_deref()
                .map(|s| format!(" {s}"))
                .unwrap_or_default();
            lines.push(format!("- [{time_str}]{sender} [{}] {}", hit.role, hit.content));
            total += content_len;
        }
        lines.join("\n")
    }

    // --- knowledge base ---------------------------------------------------

    pub async fn search_knowledge(
        &self,
        query_text: &str,
        k: Option<usize>,
    ) -> Result<Vec<KnowledgeHit>> {
        if !self.cfg.enabled {
            return Ok(Vec::new());
        }
        let trimmed = query_text.trim();
        if trimmed.chars().count() < MIN_KB_QUERY_CHARS || KB_SKIP_PATTERNS.contains(&trimmed) {
            return Ok(Vec::new());
        }

        let query_vec = normalize(self.embedder.embed(trimmed).await?);
        let want = k.unwrap_or(4);

        let neighbors = {
            let mut guard = self.kb_state.lock().unwrap();
            let state = self.load_kb_state(&mut guard)?;
            if state.index.is_empty() {
                return Ok(Vec::new());
            }
            let fetch = (want * 2).min(state.index.len());
            state
                .index
                .search(&query_vec, fetch)
                .into_iter()
                .filter_map(|(pos, sim)| state.id_map.get(pos).map(|id| (*id, sim)))
                .collect::<Vec<_>>()
        };

        let conn = self.open_kb_db()?;
        let mut hits = Vec::new();
        let mut filtered = 0usize;
        for (row_id, similarity) in neighbors {
            if similarity < self.cfg.kb_similarity_threshold {
                filtered += 1;
                continue;
            }
            let row = conn
                .query_row(
                    "SELECT source, content, title FROM knowledge WHERE id = ?1",
                    [row_id],
                    |row| {
                        let source: String = row.get(0)?;
                        let title: Option<String> = row.get(2)?;
                        Ok(KnowledgeHit {
                            title: title.unwrap_or_else(|| source.clone()),
                            source,
                            content: row.get(1)?,
                            similarity,
                        })
                    },
                )
                .ok();
            if let Some(hit) = row {
                hits.push(hit);
            }
        }
        hits.truncate(want);
        debug!(passed = hits.len(), filtered, "knowledge search done");
        Ok(hits)
    }

    pub fn format_knowledge(hits: &[KnowledgeHit]) -> String {
        hits.iter()
            .enumerate()
            .map(|(i, h)| {
                format!(
                    "{}. 标题：{}\n   内容：{}\n   相关性：{:.2}",
                    i + 1,
                    h.title,
                    h.content,
                    h.similarity
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Ingest one knowledge entry. Immutable after insert.
    pub async fn add_knowledge(
        &self,
        source: &str,
        title: Option<&str>,
        content: &str,
        category: Option<&str>,
    ) -> Result<i64> {
        let vector = normalize(self.embedder.embed(content).await?);
        let conn = self.open_kb_db()?;
        conn.execute(
            "INSERT INTO knowledge (source, content, title, category)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![source, content, title, category],
        )?;
        let row_id = conn.last_insert_rowid();

        let (index_path, map_path) = self.kb_index_paths();
        let mut guard = self.kb_state.lock().unwrap();
        let state = self.load_kb_state(&mut guard)?;
        state.index.add(vector)?;
        state.id_map.push(row_id);
        state.index.save(&index_path)?;
        save_id_map(&map_path, &state.id_map)?;
        Ok(row_id)
    }

    fn load_kb_state<'a>(
        &self,
        guard: &'a mut Option<ScopeState<i64>>,
    ) -> Result<&'a mut ScopeState<i64>> {
        if guard.is_none() {
            let (index_path, map_path) = self.kb_index_paths();
            let index = FlatIndex::load(&index_path, self.cfg.dim)?;
            let id_map: Vec<i64> = load_id_map(&map_path)?;
            *guard = Some(ScopeState { index, id_map });
        }
        Ok(guard.as_mut().unwrap())
    }

    // --- maintenance ------------------------------------------------------

    /// Drop every trace of one user's private store.
    pub fn clear_user_memory(&self, user_id: &str) -> Result<()> {
        let db_path = self.private_db_path(user_id);
        let (index_path, map_path) = self.private_index_paths(user_id);
        remove_if_exists(&db_path)?;
        remove_if_exists(&index_path)?;
        remove_if_exists(&map_path)?;
        self.private_states.lock().unwrap().remove(user_id);
        warn!(user_id, "user memory cleared");
        Ok(())
    }

    pub fn clear_group_memory(&self, group_id: &str) -> Result<()> {
        let db_path = self.group_db_path(group_id);
        let (index_path, map_path) = self.group_index_paths(group_id);
        remove_if_exists(&db_path)?;
        remove_if_exists(&index_path)?;
        remove_if_exists(&map_path)?;
        self.group_states.lock().unwrap().remove(group_id);
        warn!(group_id, "group memory cleared");
        Ok(())
    }

    /// Re-embed every row of one user's store in id order and replace the
    /// index atomically. Used after GC and from the admin surface.
    pub async fn rebuild_private_index(&self, user_id: &str) -> Result<usize> {
        if !self.private_db_path(user_id).exists() {
            return Ok(0);
        }
        let rows: Vec<(IdRef, String)> = {
            let conn = self.open_private_db(user_id)?;
            let mut rows = Vec::new();
            let mut stmt =
                conn.prepare("SELECT id, content FROM private_memories ORDER BY id")?;
            for row in stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))? {
                let (id, content) = row?;
                rows.push((IdRef::Private(id), content));
            }
            let mut stmt = conn.prepare("SELECT id, content FROM group_memories ORDER BY id")?;
            for row in stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))? {
                let (id, content) = row?;
                rows.push((IdRef::Group(id), content));
            }
            rows
        };

        let mut index = FlatIndex::new(self.cfg.dim);
        let mut id_map = Vec::with_capacity(rows.len());
        for (id_ref, content) in rows {
            let vec = normalize(self.embedder.embed(&content).await?);
            index.add(vec)?;
            id_map.push(id_ref);
        }

        let (index_path, map_path) = self.private_index_paths(user_id);
        index.save(&index_path)?;
        save_id_map(&map_path, &id_map)?;
        let count = index.len();
        self.private_states
            .lock()
            .unwrap()
            .insert(user_id.to_string(), ScopeState { index, id_map });
        info!(user_id, vectors = count, "private index rebuilt");
        Ok(count)
    }

    pub async fn rebuild_group_index(&self, group_id: &str) -> Result<usize> {
        if !self.group_db_path(group_id).exists() {
            return Ok(0);
        }
        let rows: Vec<(i64, String)> = {
            let conn = self.open_group_db(group_id)?;
            let mut stmt =
                conn.prepare("SELECT id, content FROM member_memories ORDER BY id")?;
            let collected = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            collected
        };

        let mut index = FlatIndex::new(self.cfg.dim);
        let mut id_map = Vec::with_capacity(rows.len());
        for (id, content) in rows {
            let vec = normalize(self.embedder.embed(&content).await?);
            index.add(vec)?;
            id_map.push(id);
        }

        let (index_path, map_path) = self.group_index_paths(group_id);
        index.save(&index_path)?;
        save_id_map(&map_path, &id_map)?;
        let count = index.len();
        self.group_states
            .lock()
            .unwrap()
            .insert(group_id.to_string(), ScopeState { index, id_map });
        info!(group_id, vectors = count, "group index rebuilt");
        Ok(count)
    }

    // --- row-level access for GC and admin views --------------------------

    pub fn user_memory_stats(&self, user_id: &str) -> Result<UserMemoryStats> {
        if !self.private_db_path(user_id).exists() {
            return Ok(UserMemoryStats::default());
        }
        let conn = self.open_private_db(user_id)?;
        let private: usize =
            conn.query_row("SELECT COUNT(*) FROM private_memories", [], |r| r.get(0))?;
        let group: usize =
            conn.query_row("SELECT COUNT(*) FROM group_memories", [], |r| r.get(0))?;
        Ok(UserMemoryStats {
            total: private + group,
            private,
            group,
        })
    }

    /// Oldest private rows, `(id, content)` pairs ordered by timestamp.
    pub fn oldest_private_rows(&self, user_id: &str, limit: usize) -> Result<Vec<(i64, String)>> {
        if !self.private_db_path(user_id).exists() {
            return Ok(Vec::new());
        }
        let conn = self.open_private_db(user_id)?;
        let mut stmt = conn.prepare(
            "SELECT id, content FROM private_memories ORDER BY timestamp ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |r| Ok((r.get(0)?, r.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn delete_private_rows(&self, user_id: &str, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.open_private_db(user_id)?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let mut stmt = conn.prepare(&format!(
            "DELETE FROM private_memories WHERE id IN ({placeholders})"
        ))?;
        let deleted = stmt.execute(rusqlite::params_from_iter(ids.iter()))?;
        Ok(deleted)
    }

    /// Insert a GC summary row. The index is intentionally not updated here;
    /// see `MemoryGc`.
    pub fn insert_summary_row(&self, user_id: &str, summary: &str) -> Result<i64> {
        let conn = self.open_private_db(user_id)?;
        conn.execute(
            "INSERT INTO private_memories (role, content, timestamp, query, reply)
             VALUES ('summary', ?1, ?2, NULL, NULL)",
            rusqlite::params![summary, Utc::now().timestamp()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All user ids that own a private store, from the directory listing.
    pub fn list_user_ids(&self) -> Vec<String> {
        list_scope_ids(&self.cfg.data_dir.join("private"), "user_")
    }

    pub fn list_group_ids(&self) -> Vec<String> {
        list_scope_ids(&self.cfg.data_dir.join("groups"), "group_")
    }

    pub fn global_stats(&self) -> GlobalMemoryStats {
        let users = self.list_user_ids();
        let groups = self.list_group_ids();
        let mut stats = GlobalMemoryStats {
            user_count: users.len(),
            group_count: groups.len(),
            ..Default::default()
        };
        for user in &users {
            if let Ok(s) = self.user_memory_stats(user) {
                stats.total_private_memories += s.private;
                stats.total_group_memories += s.group;
            }
        }
        for group in &groups {
            if let Ok(conn) = self.open_group_db(group) {
                if let Ok(n) = conn.query_row::<usize, _, _>(
                    "SELECT COUNT(*) FROM member_memories",
                    [],
                    |r| r.get(0),
                ) {
                    stats.total_group_memories += n;
                }
            }
        }
        stats
    }
}

fn time_weighted_score(similarity: f32, timestamp: i64, now: i64) -> f32 {
    let age = (now - timestamp).max(0) as f64;
    let freshness = (-age / FRESHNESS_TAU_SECS).exp();
    similarity * (1.0 + 0.3 * freshness as f32)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

fn list_scope_ids(dir: &Path, prefix: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut ids = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(stem) = name.strip_suffix(".db") {
            if let Some(id) = stem.strip_prefix(prefix) {
                ids.push(id.to_string());
            }
        }
    }
    ids.sort();
    ids
}
