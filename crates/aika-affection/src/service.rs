//! Per-user relationship state.
//!
//! A scalar score in [0, 13] nudged a little every turn by a keyword
//! heuristic, mapped onto sixteen named bands. New users start at the
//! bottom. The band can carry a generator-temperature override, read once
//! from `AIKA_AFF_TEMP_*` environment variables at construction.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{AffectionError, Result};

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 13.0;

/// Per-turn delta is clamped to this band.
const MAX_DELTA: f64 = 0.5;

/// Score bands: (level, min, max). The gaps between bands are intentional;
/// `score_to_level` falls back to the bottom band for scores that land in
/// one.
const LEVEL_RANGES: &[(i32, f64, f64)] = &[
    (-2, 0.0, 1.0),
    (-1, 1.1, 2.0),
    (0, 2.1, 3.0),
    (1, 3.1, 4.0),
    (2, 4.1, 5.0),
    (3, 5.1, 6.0),
    (4, 6.1, 7.0),
    (5, 7.1, 8.0),
    (6, 8.1, 9.0),
    (7, 9.1, 10.0),
    (8, 10.1, 11.0),
    (9, 11.1, 11.5),
    (10, 11.6, 12.0),
    (11, 12.1, 12.5),
    (12, 12.6, 12.9),
    (13, 13.0, 13.0),
];

const POSITIVE_LIGHT_WORDS: &[&str] = &[
    "谢谢", "辛苦了", "真好", "可爱", "抱抱", "想你", "喜欢你", "厉害", "棒", "好棒", "开心",
    "高兴", "感谢", "爱你", "么么", "亲亲", "摸摸", "贴贴", "蹭蹭", "好喜欢", "超棒",
];

const POSITIVE_STRONG_WORDS: &[&str] = &[
    "超喜欢你", "最爱你", "离不开你", "我爱你", "永远喜欢", "太爱了", "超级爱", "最喜欢你",
    "爱死你了",
];

const NEGATIVE_LIGHT_WORDS: &[&str] = &["无聊", "烦", "不高兴", "不开心", "累了", "算了", "懒得"];

const NEGATIVE_STRONG_WORDS: &[&str] = &[
    "讨厌你", "闭嘴", "滚", "垃圾", "傻逼", "不想理你", "烦死了", "去死", "恶心", "讨厌",
];

const EMOTICON_PATTERNS: &[&str] = &[
    "~", "w", "ww", "qwq", "QwQ", "T_T", "TvT", "owo", "OwO", "哈哈", "嘿嘿", "嘻嘻", "呜呜",
    "(*´ω｀*)", "(´・ω・`)", "≧▽≦", "^_^", ">_<", "QAQ", "TAT",
];

const COLD_SHORT_REPLIES: &[&str] = &["嗯", "哦", "行", "好", "？", "?", "。", "...", "……"];

/// Env var suffix per level for the optional temperature override.
const TEMP_ENV_KEYS: &[(i32, &str)] = &[
    (-2, "AIKA_AFF_TEMP_HATE"),
    (-1, "AIKA_AFF_TEMP_BAD"),
    (0, "AIKA_AFF_TEMP_UNNOTICED"),
    (1, "AIKA_AFF_TEMP_STRANGER"),
    (2, "AIKA_AFF_TEMP_NORMAL"),
    (3, "AIKA_AFF_TEMP_LITTLE"),
    (4, "AIKA_AFF_TEMP_FAMILIAR"),
    (5, "AIKA_AFF_TEMP_WARM"),
    (6, "AIKA_AFF_TEMP_INTIMATE"),
    (7, "AIKA_AFF_TEMP_LIKE"),
    (8, "AIKA_AFF_TEMP_LIKE_PLUS"),
    (9, "AIKA_AFF_TEMP_ADORE"),
    (10, "AIKA_AFF_TEMP_DEEP_LOVE"),
    (11, "AIKA_AFF_TEMP_TRUE_LOVE"),
    (12, "AIKA_AFF_TEMP_DESTINY"),
    (13, "AIKA_AFF_TEMP_ETERNAL"),
];

pub fn level_name(level: i32) -> &'static str {
    match level {
        -2 => "讨厌",
        -1 => "差劲",
        0 => "不起眼",
        1 => "陌生",
        2 => "一般",
        3 => "稍熟",
        4 => "熟悉",
        5 => "热情",
        6 => "亲密",
        7 => "喜欢",
        8 => "喜欢+",
        9 => "爱慕",
        10 => "深爱",
        11 => "挚爱",
        12 => "命运",
        13 => "永恒",
        _ => "未知",
    }
}

pub fn score_to_level(score: f64) -> i32 {
    for (level, min, max) in LEVEL_RANGES {
        if score >= *min && score <= *max {
            return *level;
        }
    }
    if score > MAX_SCORE {
        return 13;
    }
    -2
}

/// One turn's raw delta before the growth coefficient.
fn base_delta(user_message: &str) -> f64 {
    let text = user_message.trim();
    let length = text.chars().count();
    let mut delta = 0.05;

    if length > 40 {
        delta += 0.05;
    }
    if length > 100 {
        delta += 0.05;
    }

    let light_hits = POSITIVE_LIGHT_WORDS
        .iter()
        .filter(|w| text.contains(*w))
        .count();
    delta += (light_hits as f64 * 0.05).min(0.15);

    if POSITIVE_STRONG_WORDS.iter().any(|w| text.contains(*w)) {
        delta += 0.15;
    }
    if text.contains('?') || text.contains('？') {
        delta += 0.05;
    }
    if EMOTICON_PATTERNS.iter().any(|p| text.contains(*p)) {
        delta += 0.05;
    }
    if NEGATIVE_LIGHT_WORDS.iter().any(|w| text.contains(*w)) {
        delta -= 0.1;
    }
    if NEGATIVE_STRONG_WORDS.iter().any(|w| text.contains(*w)) {
        delta -= 0.3;
    }
    if length <= 3 && COLD_SHORT_REPLIES.contains(&text) {
        delta -= 0.05;
    }
    delta
}

/// Growth slows as the relationship deepens; the top band barely moves.
fn growth_coefficient(old_score: f64) -> f64 {
    if old_score <= 3.0 {
        1.2
    } else if old_score <= 6.0 {
        1.0
    } else if old_score <= 9.0 {
        0.7
    } else if old_score <= 11.0 {
        0.5
    } else if old_score <= 12.5 {
        0.3
    } else {
        0.1
    }
}

/// Full per-turn delta: heuristic base, scaled, clamped to ±0.5.
pub fn compute_delta(user_message: &str, old_score: f64) -> f64 {
    let delta = base_delta(user_message) * growth_coefficient(old_score);
    delta.clamp(-MAX_DELTA, MAX_DELTA)
}

#[derive(Debug, Clone, Serialize)]
pub struct AffectionInfo {
    pub user_id: String,
    pub score: f64,
    pub level: i32,
    pub level_name: String,
    pub total_interactions: u64,
    pub last_interact_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AffectionOverview {
    pub total_users: usize,
    pub avg_score: f64,
    pub level_counts: HashMap<i32, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AffectionPage {
    pub items: Vec<AffectionInfo>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

pub struct AffectionService {
    conn: Mutex<Connection>,
    level_temps: HashMap<i32, f32>,
}

impl AffectionService {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_affection (
                user_id            TEXT PRIMARY KEY,
                affection_score    REAL DEFAULT 0.0,
                last_level         INTEGER DEFAULT -2,
                total_interactions INTEGER DEFAULT 0,
                last_interact_at   TEXT
            )",
        )?;
        let level_temps = load_temp_overrides();
        if !level_temps.is_empty() {
            info!(levels = level_temps.len(), "affection temperature overrides loaded");
        }
        Ok(Self {
            conn: Mutex::new(conn),
            level_temps,
        })
    }

    pub fn open(db_path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::new(Connection::open(db_path)?)
    }

    /// Current (score, level), creating the bottom-band record on first
    /// contact.
    pub fn get_or_create(&self, user_id: &str) -> Result<(f64, i32)> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(f64, i32)> = conn
            .query_row(
                "SELECT affection_score, last_level FROM user_affection WHERE user_id = ?1",
                [user_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .ok();

        match row {
            Some(pair) => Ok(pair),
            None => {
                conn.execute(
                    "INSERT INTO user_affection
                     (user_id, affection_score, last_level, total_interactions, last_interact_at)
                     VALUES (?1, 0.0, -2, 0, ?2)",
                    rusqlite::params![user_id, Utc::now().to_rfc3339()],
                )?;
                Ok((0.0, -2))
            }
        }
    }

    /// Apply one turn. Returns the new score.
    pub fn update_affection(&self, user_id: &str, user_message: &str) -> Result<f64> {
        let (old_score, _) = self.get_or_create(user_id)?;
        let delta = compute_delta(user_message, old_score);
        let new_score = (old_score + delta).clamp(MIN_SCORE, MAX_SCORE);
        let new_level = score_to_level(new_score);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE user_affection
             SET affection_score = ?1, last_level = ?2,
                 total_interactions = total_interactions + 1,
                 last_interact_at = ?3
             WHERE user_id = ?4",
            rusqlite::params![new_score, new_level, Utc::now().to_rfc3339(), user_id],
        )?;

        if delta.abs() >= 0.1 {
            debug!(user_id, old_score, new_score, delta, "affection moved");
        }
        Ok(new_score)
    }

    /// Generator temperature for a user. Scores at or below zero, and bands
    /// without an override, fall back to the configured default.
    pub fn temperature_for(&self, user_id: &str, default_temp: f32) -> Result<f32> {
        let (score, _) = self.get_or_create(user_id)?;
        if score <= 0.0 {
            return Ok(default_temp);
        }
        let level = score_to_level(score);
        Ok(*self.level_temps.get(&level).unwrap_or(&default_temp))
    }

    pub fn info(&self, user_id: &str) -> Result<AffectionInfo> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT affection_score, last_level, total_interactions, last_interact_at
                 FROM user_affection WHERE user_id = ?1",
                [user_id],
                |r| {
                    Ok((
                        r.get::<_, f64>(0)?,
                        r.get::<_, i32>(1)?,
                        r.get::<_, u64>(2)?,
                        r.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .ok();

        let (score, level, interactions, last) = row.unwrap_or((0.0, -2, 0, None));
        Ok(AffectionInfo {
            user_id: user_id.to_string(),
            score: round2(score),
            level,
            level_name: level_name(level).to_string(),
            total_interactions: interactions,
            last_interact_at: last.unwrap_or_default(),
        })
    }

    // --- admin views ------------------------------------------------------

    pub fn overview(&self) -> Result<AffectionOverview> {
        let conn = self.conn.lock().unwrap();
        let total_users: usize =
            conn.query_row("SELECT COUNT(*) FROM user_affection", [], |r| r.get(0))?;
        let avg_score: f64 = conn
            .query_row("SELECT AVG(affection_score) FROM user_affection", [], |r| {
                r.get::<_, Option<f64>>(0)
            })?
            .unwrap_or(0.0);

        let mut level_counts = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT last_level, COUNT(*) FROM user_affection GROUP BY last_level",
        )?;
        for row in stmt.query_map([], |r| Ok((r.get::<_, i32>(0)?, r.get::<_, usize>(1)?)))? {
            let (level, count) = row?;
            level_counts.insert(level, count);
        }

        Ok(AffectionOverview {
            total_users,
            avg_score: round2(avg_score),
            level_counts,
        })
    }

    pub fn list_users(
        &self,
        page: usize,
        page_size: usize,
        level: Option<i32>,
        keyword: Option<&str>,
    ) -> Result<AffectionPage> {
        let page = page.max(1);
        let conn = self.conn.lock().unwrap();

        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(level) = level {
            conditions.push("last_level = ?");
            params.push(Box::new(level));
        }
        if let Some(keyword) = keyword.filter(|k| !k.is_empty()) {
            conditions.push("user_id LIKE ?");
            params.push(Box::new(format!("%{keyword}%")));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let total: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM user_affection {where_clause}"),
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT user_id, affection_score, last_level, total_interactions, last_interact_at
             FROM user_affection {where_clause}
             ORDER BY affection_score DESC
             LIMIT ? OFFSET ?"
        ))?;
        params.push(Box::new(page_size as i64));
        params.push(Box::new(((page - 1) * page_size) as i64));

        let items = stmt
            .query_map(
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                |r| {
                    let level: i32 = r.get(2)?;
                    Ok(AffectionInfo {
                        user_id: r.get(0)?,
                        score: round2(r.get(1)?),
                        level,
                        level_name: level_name(level).to_string(),
                        total_interactions: r.get(3)?,
                        last_interact_at: r.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    })
                },
            )?
            .filter_map(|r| r.ok())
            .collect();

        Ok(AffectionPage {
            items,
            total,
            page,
            page_size,
        })
    }

    /// Operator override: clamp, re-derive the band, write through.
    pub fn admin_set_score(&self, user_id: &str, new_score: f64) -> Result<AffectionInfo> {
        let clamped = new_score.clamp(MIN_SCORE, MAX_SCORE);
        let level = score_to_level(clamped);

        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE user_affection SET affection_score = ?1, last_level = ?2 WHERE user_id = ?3",
            rusqlite::params![clamped, level, user_id],
        )?;
        drop(conn);

        if updated == 0 {
            return Err(AffectionError::UserNotFound {
                user_id: user_id.to_string(),
            });
        }
        info!(user_id, score = clamped, level, "affection score overridden");
        self.info(user_id)
    }
}

fn load_temp_overrides() -> HashMap<i32, f32> {
    let mut temps = HashMap::new();
    for (level, key) in TEMP_ENV_KEYS {
        if let Ok(value) = std::env::var(key) {
            match value.parse::<f32>() {
                Ok(t) => {
                    temps.insert(*level, t);
                }
                Err(_) => tracing::warn!(key = *key, %value, "unparseable affection temperature"),
            }
        }
    }
    temps
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AffectionService {
        AffectionService::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn bands_cover_boundaries() {
        assert_eq!(score_to_level(0.0), -2);
        assert_eq!(score_to_level(1.0), -2);
        assert_eq!(score_to_level(1.1), -1);
        assert_eq!(score_to_level(10.0), 7);
        assert_eq!(score_to_level(12.95), -2); // band gap falls through
        assert_eq!(score_to_level(13.0), 13);
        assert_eq!(score_to_level(14.0), 13);
        assert_eq!(score_to_level(-1.0), -2);
    }

    #[test]
    fn first_contact_greeting_lands_at_006() {
        let s = service();
        let score = s.update_affection("u1", "你好").unwrap();
        assert!((score - 0.06).abs() < 1e-9);
        let (stored, level) = s.get_or_create("u1").unwrap();
        assert!((stored - 0.06).abs() < 1e-9);
        assert_eq!(level, -2);
    }

    #[test]
    fn delta_is_always_clamped() {
        // Pile every positive signal into one long message.
        let msg = format!(
            "{}我爱你谢谢可爱抱抱想你开心高兴感谢??~哈哈",
            "认真长消息".repeat(25)
        );
        let delta = compute_delta(&msg, 0.0);
        assert!(delta <= MAX_DELTA + 1e-9);

        let nasty = "讨厌你闭嘴滚垃圾烦死了无聊";
        let delta = compute_delta(nasty, 0.0);
        assert!(delta >= -MAX_DELTA - 1e-9);
    }

    #[test]
    fn negative_words_pull_down_and_floor_at_zero() {
        let s = service();
        s.update_affection("u1", "讨厌你").unwrap();
        let (score, _) = s.get_or_create("u1").unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn cold_short_reply_penalty() {
        let base = compute_delta("嗯", 5.0);
        let normal = compute_delta("今天吃了拉面", 5.0);
        assert!(base < normal);
    }

    #[test]
    fn growth_slows_near_the_top() {
        let low = compute_delta("谢谢你呀", 1.0);
        let high = compute_delta("谢谢你呀", 12.8);
        assert!(low > high);
        assert!((low / 1.2 - high / 0.1).abs() < 1e-9); // same base, scaled
    }

    #[test]
    fn interactions_counter_increments() {
        let s = service();
        s.update_affection("u1", "第一句").unwrap();
        s.update_affection("u1", "第二句").unwrap();
        let info = s.info("u1").unwrap();
        assert_eq!(info.total_interactions, 2);
        assert_eq!(info.level_name, "讨厌");
    }

    #[test]
    fn temperature_default_for_zero_score() {
        let s = service();
        s.get_or_create("fresh").unwrap();
        assert_eq!(s.temperature_for("fresh", 0.8).unwrap(), 0.8);
    }

    #[test]
    fn admin_override_clamps_and_rederives_level() {
        let s = service();
        s.get_or_create("u1").unwrap();
        let info = s.admin_set_score("u1", 99.0).unwrap();
        assert_eq!(info.score, 13.0);
        assert_eq!(info.level, 13);
        assert_eq!(info.level_name, "永恒");

        assert!(matches!(
            s.admin_set_score("ghost", 5.0),
            Err(AffectionError::UserNotFound { .. })
        ));
    }

    #[test]
    fn overview_counts_levels() {
        let s = service();
        s.get_or_create("a").unwrap();
        s.get_or_create("b").unwrap();
        s.admin_set_score("b", 9.5).unwrap();

        let overview = s.overview().unwrap();
        assert_eq!(overview.total_users, 2);
        assert_eq!(overview.level_counts.get(&-2), Some(&1));
        assert_eq!(overview.level_counts.get(&7), Some(&1));
    }

    #[test]
    fn list_users_pages_and_filters() {
        let s = service();
        for i in 0..5 {
            s.get_or_create(&format!("user{i}")).unwrap();
        }
        s.admin_set_score("user3", 8.5).unwrap();

        let page = s.list_users(1, 2, None, None).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].user_id, "user3"); // highest score first

        let filtered = s.list_users(1, 10, Some(6), None).unwrap();
        assert_eq!(filtered.total, 1);

        let keyword = s.list_users(1, 10, None, Some("user4")).unwrap();
        assert_eq!(keyword.total, 1);
    }
}
