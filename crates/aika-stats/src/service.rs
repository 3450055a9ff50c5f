//! Usage counters: users seen, messages in/out, per-model token spend with
//! daily rollups. Writes happen off the reply path (fire-and-forget from the
//! orchestrator), so every method stays cheap and synchronous under one
//! connection mutex.

use std::sync::Mutex;

use chrono::{Local, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;

/// Cost per token in RMB, matched by substring against the model name.
const COST_RATES: &[(&str, f64)] = &[
    ("deepseek-r1", 16.0 / 1_000_000.0),
    ("deepseek-v3", 3.0 / 1_000_000.0),
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub total_users: u64,
    pub total_msg_received: u64,
    pub total_msg_sent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyStats {
    pub date: String,
    pub msg_received: u64,
    pub msg_sent: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub user_id: String,
    pub first_seen: String,
    pub last_seen: String,
    pub msg_received: u64,
    pub msg_sent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub global: GlobalStats,
    pub models: Vec<ModelStats>,
    pub total_cost: f64,
}

pub struct StatsService {
    conn: Mutex<Connection>,
}

impl StatsService {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS global_stats (
                id                 INTEGER PRIMARY KEY CHECK (id = 1),
                total_users        INTEGER DEFAULT 0,
                total_msg_received INTEGER DEFAULT 0,
                total_msg_sent     INTEGER DEFAULT 0,
                updated_at         TEXT
            );
            INSERT OR IGNORE INTO global_stats (id) VALUES (1);

            CREATE TABLE IF NOT EXISTS model_stats (
                model         TEXT PRIMARY KEY,
                input_tokens  INTEGER DEFAULT 0,
                output_tokens INTEGER DEFAULT 0,
                calls         INTEGER DEFAULT 0,
                cost          REAL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS user_stats (
                user_id      TEXT PRIMARY KEY,
                first_seen   TEXT,
                last_seen    TEXT,
                msg_received INTEGER DEFAULT 0,
                msg_sent     INTEGER DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS daily_stats (
                date          TEXT PRIMARY KEY,
                msg_received  INTEGER DEFAULT 0,
                msg_sent      INTEGER DEFAULT 0,
                input_tokens  INTEGER DEFAULT 0,
                output_tokens INTEGER DEFAULT 0,
                calls         INTEGER DEFAULT 0
            );",
        )?;
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

    /// One inbound message. First sight of a user bumps the user counter.
    pub fn record_incoming(&self, user_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let today = today_str();
        let conn = self.conn.lock().unwrap();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO user_stats (user_id, first_seen, last_seen, msg_received)
             VALUES (?1, ?2, ?2, 0)",
            rusqlite::params![user_id, now],
        )?;
        conn.execute(
            "UPDATE user_stats SET last_seen = ?1, msg_received = msg_received + 1
             WHERE user_id = ?2",
            rusqlite::params![now, user_id],
        )?;
        conn.execute(
            "UPDATE global_stats
             SET total_msg_received = total_msg_received + 1,
                 total_users = total_users + ?1,
                 updated_at = ?2
             WHERE id = 1",
            rusqlite::params![inserted as i64, now],
        )?;
        conn.execute(
            "INSERT INTO daily_stats (date, msg_received) VALUES (?1, 1)
             ON CONFLICT(date) DO UPDATE SET msg_received = msg_received + 1",
            [&today],
        )?;
        Ok(())
    }

    /// One outbound segment.
    pub fn record_outgoing(&self, user_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let today = today_str();
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE user_stats SET msg_sent = msg_sent + 1 WHERE user_id = ?1",
            [user_id],
        )?;
        conn.execute(
            "UPDATE global_stats
             SET total_msg_sent = total_msg_sent + 1, updated_at = ?1
             WHERE id = 1",
            [&now],
        )?;
        conn.execute(
            "INSERT INTO daily_stats (date, msg_sent) VALUES (?1, 1)
             ON CONFLICT(date) DO UPDATE SET msg_sent = msg_sent + 1",
            [&today],
        )?;
        Ok(())
    }

    /// Token accounting for one model call.
    pub fn record_llm_usage(&self, model: &str, input_tokens: u32, output_tokens: u32) -> Result<()> {
        if input_tokens == 0 && output_tokens == 0 {
            return Ok(());
        }
        let cost = cost_for(model, input_tokens as u64 + output_tokens as u64);
        let today = today_str();
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO model_stats (model, input_tokens, output_tokens, calls, cost)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(model) DO UPDATE SET
                 input_tokens = input_tokens + ?2,
                 output_tokens = output_tokens + ?3,
                 calls = calls + 1,
                 cost = cost + ?4",
            rusqlite::params![model, input_tokens as i64, output_tokens as i64, cost],
        )?;
        conn.execute(
            "INSERT INTO daily_stats (date, input_tokens, output_tokens, calls)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(date) DO UPDATE SET
                 input_tokens = input_tokens + ?2,
                 output_tokens = output_tokens + ?3,
                 calls = calls + 1",
            rusqlite::params![today, input_tokens as i64, output_tokens as i64],
        )?;
        debug!(model, input_tokens, output_tokens, "llm usage recorded");
        Ok(())
    }

    pub fn summary(&self) -> Result<StatsSummary> {
        let conn = self.conn.lock().unwrap();
        let global = conn.query_row(
            "SELECT total_users, total_msg_received, total_msg_sent FROM global_stats WHERE id = 1",
            [],
            |r| {
                Ok(GlobalStats {
                    total_users: r.get(0)?,
                    total_msg_received: r.get(1)?,
                    total_msg_sent: r.get(2)?,
                })
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT model, input_tokens, output_tokens, calls, cost
             FROM model_stats ORDER BY calls DESC",
        )?;
        let models: Vec<ModelStats> = stmt
            .query_map([], |r| {
                Ok(ModelStats {
                    model: r.get(0)?,
                    input_tokens: r.get(1)?,
                    output_tokens: r.get(2)?,
                    calls: r.get(3)?,
                    cost: r.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        let total_cost = models.iter().map(|m| m.cost).sum();
        Ok(StatsSummary {
            global,
            models,
            total_cost,
        })
    }

    /// The most recent `days` daily rollups, newest first.
    pub fn daily(&self, days: usize) -> Result<Vec<DailyStats>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT date, msg_received, msg_sent, input_tokens, output_tokens, calls
             FROM daily_stats ORDER BY date DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([days as i64], |r| {
                Ok(DailyStats {
                    date: r.get(0)?,
                    msg_received: r.get(1)?,
                    msg_sent: r.get(2)?,
                    input_tokens: r.get(3)?,
                    output_tokens: r.get(4)?,
                    calls: r.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn user(&self, user_id: &str) -> Result<Option<UserStats>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT user_id, first_seen, last_seen, msg_received, msg_sent
                 FROM user_stats WHERE user_id = ?1",
                [user_id],
                |r| {
                    Ok(UserStats {
                        user_id: r.get(0)?,
                        first_seen: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        last_seen: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        msg_received: r.get(3)?,
                        msg_sent: r.get(4)?,
                    })
                },
            )
            .ok();
        Ok(row)
    }

    /// Most recently active users, for the startup history warm-up.
    pub fn recent_users(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM user_stats ORDER BY last_seen DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

fn cost_for(model: &str, total_tokens: u64) -> f64 {
    let lowered = model.to_lowercase();
    COST_RATES
        .iter()
        .find(|(name, _)| lowered.contains(name))
        .map(|(_, rate)| rate * total_tokens as f64)
        .unwrap_or(0.0)
}

fn today_str() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> StatsService {
        StatsService::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn new_users_counted_once() {
        let s = service();
        s.record_incoming("u1").unwrap();
        s.record_incoming("u1").unwrap();
        s.record_incoming("u2").unwrap();

        let summary = s.summary().unwrap();
        assert_eq!(summary.global.total_users, 2);
        assert_eq!(summary.global.total_msg_received, 3);
    }

    #[test]
    fn outgoing_counts_per_segment() {
        let s = service();
        s.record_incoming("u1").unwrap();
        s.record_outgoing("u1").unwrap();
        s.record_outgoing("u1").unwrap();

        let summary = s.summary().unwrap();
        assert_eq!(summary.global.total_msg_sent, 2);
        assert_eq!(s.user("u1").unwrap().unwrap().msg_sent, 2);
    }

    #[test]
    fn llm_usage_accumulates_per_model_with_cost() {
        let s = service();
        s.record_llm_usage("deepseek-v3", 1000, 500).unwrap();
        s.record_llm_usage("deepseek-v3", 100, 50).unwrap();
        s.record_llm_usage("other-model", 10, 10).unwrap();
        s.record_llm_usage("silent", 0, 0).unwrap(); // ignored

        let summary = s.summary().unwrap();
        let v3 = summary.models.iter().find(|m| m.model == "deepseek-v3").unwrap();
        assert_eq!(v3.calls, 2);
        assert_eq!(v3.input_tokens, 1100);
        assert!((v3.cost - 1650.0 * 3.0 / 1_000_000.0).abs() < 1e-9);

        let other = summary.models.iter().find(|m| m.model == "other-model").unwrap();
        assert_eq!(other.cost, 0.0);
        assert_eq!(summary.models.len(), 2);
    }

    #[test]
    fn daily_rollup_tracks_today() {
        let s = service();
        s.record_incoming("u1").unwrap();
        s.record_llm_usage("deepseek-v3", 10, 20).unwrap();

        let daily = s.daily(7).unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].msg_received, 1);
        assert_eq!(daily[0].input_tokens, 10);
        assert_eq!(daily[0].calls, 1);
    }

    #[test]
    fn recent_users_ordered_by_activity() {
        let s = service();
        s.record_incoming("old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.record_incoming("fresh").unwrap();

        let recent = s.recent_users(10).unwrap();
        assert_eq!(recent[0], "fresh");
    }
}
