//! Learned sticker collection.
//!
//! Incoming emoji images are deduplicated by content hash, described by the
//! vision model (the caller provides the description), and indexed by the
//! description's embedding. Retrieval embeds the reply text and returns the
//! best match over a threshold, so the bot can answer with a sticker that
//! fits the mood.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use aika_llm::Embedder;

use crate::error::Result;
use crate::index::{load_id_map, normalize, save_id_map, FlatIndex};

pub struct EmojiStore {
    dir: PathBuf,
    conn: Mutex<Connection>,
    state: Mutex<Option<(FlatIndex, Vec<i64>)>>,
    embedder: Arc<dyn Embedder>,
    dim: usize,
    threshold: f32,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EmojiStats {
    pub count: usize,
}

impl EmojiStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        embedder: Arc<dyn Embedder>,
        threshold: f32,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("images"))?;
        let conn = Connection::open(dir.join("emoji.db"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS emojis (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                hash        TEXT NOT NULL UNIQUE,
                file_name   TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            )",
        )?;
        let dim = embedder.dim();
        Ok(Self {
            dir,
            conn: Mutex::new(conn),
            state: Mutex::new(None),
            embedder,
            dim,
            threshold,
        })
    }

    fn index_paths(&self) -> (PathBuf, PathBuf) {
        (self.dir.join("emoji.index"), self.dir.join("emoji.idmap"))
    }

    /// Store one image with its description. Returns false when the exact
    /// same bytes were already learned.
    pub async fn learn(&self, image: &[u8], extension: &str, description: &str) -> Result<bool> {
        let hash = content_hash(image);
        {
            let conn = self.conn.lock().unwrap();
            let exists: Option<i64> = conn
                .query_row("SELECT id FROM emojis WHERE hash = ?1", [&hash], |r| {
                    r.get(0)
                })
                .ok();
            if exists.is_some() {
                debug!(%hash, "emoji already known");
                return Ok(false);
            }
        }

        let vector = normalize(self.embedder.embed(description).await?);
        let file_name = format!("{hash}.{extension}");
        std::fs::write(self.dir.join("images").join(&file_name), image)?;

        let row_id = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO emojis (hash, file_name, description, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![hash, file_name, description, chrono::Utc::now().timestamp()],
            )?;
            conn.last_insert_rowid()
        };

        let (index_path, map_path) = self.index_paths();
        let mut guard = self.state.lock().unwrap();
        let (index, id_map) = self.load_state(&mut guard)?;
        index.add(vector)?;
        id_map.push(row_id);
        index.save(&index_path)?;
        save_id_map(&map_path, id_map)?;

        info!(description, "emoji learned");
        Ok(true)
    }

    /// Best-matching sticker for a text, or None below threshold.
    pub async fn search(&self, text: &str) -> Result<Option<(PathBuf, f32)>> {
        let query = normalize(self.embedder.embed(text).await?);

        let best = {
            let mut guard = self.state.lock().unwrap();
            let (index, id_map) = self.load_state(&mut guard)?;
            if index.is_empty() {
                return Ok(None);
            }
            index
                .search(&query, 1)
                .into_iter()
                .next()
                .and_then(|(pos, sim)| id_map.get(pos).map(|id| (*id, sim)))
        };

        let Some((row_id, similarity)) = best else {
            return Ok(None);
        };
        if similarity < self.threshold {
            return Ok(None);
        }

        let conn = self.conn.lock().unwrap();
        let file_name: Option<String> = conn
            .query_row("SELECT file_name FROM emojis WHERE id = ?1", [row_id], |r| {
                r.get(0)
            })
            .ok();
        Ok(file_name.map(|f| (self.dir.join("images").join(f), similarity)))
    }

    pub fn stats(&self) -> Result<EmojiStats> {
        let conn = self.conn.lock().unwrap();
        let count: usize = conn.query_row("SELECT COUNT(*) FROM emojis", [], |r| r.get(0))?;
        Ok(EmojiStats { count })
    }

    fn load_state<'a>(
        &self,
        guard: &'a mut Option<(FlatIndex, Vec<i64>)>,
    ) -> Result<&'a mut (FlatIndex, Vec<i64>)> {
        if guard.is_none() {
            let (index_path, map_path) = self.index_paths();
            let index = FlatIndex::load(&index_path, self.dim)?;
            let id_map: Vec<i64> = load_id_map(&map_path)?;
            *guard = Some((index, id_map));
        }
        Ok(guard.as_mut().unwrap())
    }
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HashEmbedder;

    fn store(dir: &Path) -> EmojiStore {
        EmojiStore::open(dir, Arc::new(HashEmbedder), 0.3).unwrap()
    }

    #[tokio::test]
    async fn learn_then_find_by_description() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());

        let added = s.learn(b"png-bytes-1", "png", "开心地跳起来的小猫").await.unwrap();
        assert!(added);
        assert_eq!(s.stats().unwrap().count, 1);

        let hit = s.search("开心地跳起来的小猫").await.unwrap();
        let (path, similarity) = hit.expect("expected a sticker match");
        assert!(path.exists());
        assert!(similarity > 0.9);
    }

    #[tokio::test]
    async fn duplicate_bytes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(s.learn(b"same-bytes", "png", "第一次").await.unwrap());
        assert!(!s.learn(b"same-bytes", "png", "第二次").await.unwrap());
        assert_eq!(s.stats().unwrap().count, 1);
    }

    #[tokio::test]
    async fn below_threshold_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        // Threshold above the cosine ceiling: even an exact match misses.
        let s = EmojiStore::open(dir.path(), Arc::new(HashEmbedder), 1.5).unwrap();
        s.learn(b"bytes", "png", "愤怒拍桌").await.unwrap();
        assert!(s.search("愤怒拍桌").await.unwrap().is_none());
    }
}
