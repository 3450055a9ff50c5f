//! SQLite-backed temporary blacklist.
//!
//! The injection guard drops offenders here for a bounded cooldown. Bans
//! upsert: a repeat offense bumps the hit counter and replaces the expiry.
//! Reads purge lazily, a scheduler job sweeps the rest.

use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct BanInfo {
    pub user_id: String,
    /// Epoch seconds.
    pub expires_at: i64,
    pub remaining_minutes: i64,
    pub reason: Option<String>,
    pub blocked_at: i64,
    pub blocked_by: String,
    pub hit_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BanPage {
    pub records: Vec<BanInfo>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BlacklistStats {
    pub active_count: usize,
    pub today_count: usize,
    pub top_reasons: Vec<(String, usize)>,
    pub top_offenders: Vec<(String, u32)>,
}

pub struct TempBlacklist {
    conn: Mutex<Connection>,
}

impl TempBlacklist {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS temp_blacklist (
                user_id    TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL,
                reason     TEXT,
                blocked_at INTEGER NOT NULL,
                blocked_by TEXT DEFAULT 'auto_guard',
                hit_count  INTEGER DEFAULT 1
            )",
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

    /// Ban or re-ban. A second offense extends the expiry and increments the
    /// hit counter.
    pub fn ban(&self, user_id: &str, minutes: i64, reason: Option<&str>, by: &str) -> Result<BanInfo> {
        let now = Utc::now().timestamp();
        let expires_at = now + minutes * 60;

        let conn = self.conn.lock().unwrap();
        let existing: Option<u32> = conn
            .query_row(
                "SELECT hit_count FROM temp_blacklist WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )
            .ok();

        let hit_count = match existing {
            Some(hits) => {
                let hits = hits + 1;
                conn.execute(
                    "UPDATE temp_blacklist
                     SET expires_at = ?1, reason = ?2, blocked_at = ?3, blocked_by = ?4,
                         hit_count = ?5
                     WHERE user_id = ?6",
                    rusqlite::params![expires_at, reason, now, by, hits, user_id],
                )?;
                hits
            }
            None => {
                conn.execute(
                    "INSERT INTO temp_blacklist
                     (user_id, expires_at, reason, blocked_at, blocked_by, hit_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                    rusqlite::params![user_id, expires_at, reason, now, by],
                )?;
                1
            }
        };

        warn!(user_id, minutes, reason = ?reason, by, hit_count, "user banned");
        Ok(BanInfo {
            user_id: user_id.to_string(),
            expires_at,
            remaining_minutes: minutes,
            reason: reason.map(String::from),
            blocked_at: now,
            blocked_by: by.to_string(),
            hit_count,
        })
    }

    pub fn unban(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM temp_blacklist WHERE user_id = ?1", [user_id])?;
        if deleted > 0 {
            info!(user_id, "user unbanned");
        }
        Ok(deleted > 0)
    }

    /// Blocked right now? An expired row is purged on the way out.
    pub fn is_blocked(&self, user_id: &str) -> Result<bool> {
        match self.active_expiry(user_id)? {
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    /// Ban details for an active ban, purging lazily like `is_blocked`.
    pub fn get_info(&self, user_id: &str) -> Result<Option<BanInfo>> {
        if self.active_expiry(user_id)?.is_none() {
            return Ok(None);
        }
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        let info = conn
            .query_row(
                "SELECT expires_at, reason, blocked_at, blocked_by, hit_count
                 FROM temp_blacklist WHERE user_id = ?1",
                [user_id],
                |r| {
                    let expires_at: i64 = r.get(0)?;
                    Ok(BanInfo {
                        user_id: user_id.to_string(),
                        expires_at,
                        remaining_minutes: (expires_at - now).max(0) / 60,
                        reason: r.get(1)?,
                        blocked_at: r.get(2)?,
                        blocked_by: r.get(3)?,
                        hit_count: r.get(4)?,
                    })
                },
            )
            .ok();
        Ok(info)
    }

    fn active_expiry(&self, user_id: &str) -> Result<Option<i64>> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        let expires_at: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM temp_blacklist WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )
            .ok();

        match expires_at {
            Some(expiry) if now < expiry => Ok(Some(expiry)),
            Some(_) => {
                conn.execute("DELETE FROM temp_blacklist WHERE user_id = ?1", [user_id])?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Push an active ban's expiry further out.
    pub fn extend(&self, user_id: &str, minutes: i64) -> Result<Option<BanInfo>> {
        if self.active_expiry(user_id)?.is_none() {
            return Ok(None);
        }
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE temp_blacklist SET expires_at = expires_at + ?1 WHERE user_id = ?2",
                rusqlite::params![minutes * 60, user_id],
            )?;
        }
        info!(user_id, minutes, "ban extended");
        self.get_info(user_id)
    }

    pub fn list_active(&self, page: usize, page_size: usize) -> Result<BanPage> {
        let page = page.max(1);
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();

        let total: usize = conn.query_row(
            "SELECT COUNT(*) FROM temp_blacklist WHERE expires_at > ?1",
            [now],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT user_id, expires_at, reason, blocked_at, blocked_by, hit_count
             FROM temp_blacklist
             WHERE expires_at > ?1
             ORDER BY expires_at DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let records = stmt
            .query_map(
                rusqlite::params![now, page_size as i64, ((page - 1) * page_size) as i64],
                |r| {
                    let expires_at: i64 = r.get(1)?;
                    Ok(BanInfo {
                        user_id: r.get(0)?,
                        expires_at,
                        remaining_minutes: (expires_at - now).max(0) / 60,
                        reason: r.get(2)?,
                        blocked_at: r.get(3)?,
                        blocked_by: r.get(4)?,
                        hit_count: r.get(5)?,
                    })
                },
            )?
            .filter_map(|r| r.ok())
            .collect();

        Ok(BanPage {
            records,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size.max(1)),
        })
    }

    pub fn stats(&self) -> Result<BlacklistStats> {
        let now = Utc::now().timestamp();
        let today_start = now - now.rem_euclid(86_400);
        let conn = self.conn.lock().unwrap();

        let active_count: usize = conn.query_row(
            "SELECT COUNT(*) FROM temp_blacklist WHERE expires_at > ?1",
            [now],
            |r| r.get(0),
        )?;
        let today_count: usize = conn.query_row(
            "SELECT COUNT(*) FROM temp_blacklist WHERE blocked_at >= ?1",
            [today_start],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT COALESCE(reason, ''), COUNT(*) AS cnt
             FROM temp_blacklist GROUP BY reason ORDER BY cnt DESC LIMIT 5",
        )?;
        let top_reasons = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, usize>(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let mut stmt = conn.prepare(
            "SELECT user_id, hit_count FROM temp_blacklist
             WHERE expires_at > ?1 ORDER BY hit_count DESC LIMIT 5",
        )?;
        let top_offenders = stmt
            .query_map([now], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(BlacklistStats {
            active_count,
            today_count,
            top_reasons,
            top_offenders,
        })
    }

    /// Sweep all expired rows; the scheduler runs this every ten minutes.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM temp_blacklist WHERE expires_at < ?1", [now])?;
        if deleted > 0 {
            info!(deleted, "expired blacklist rows swept");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blacklist() -> TempBlacklist {
        TempBlacklist::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn ban_then_blocked_then_unban() {
        let b = blacklist();
        assert!(!b.is_blocked("u1").unwrap());

        let info = b.ban("u1", 30, Some("疑似注入攻击"), "auto_guard").unwrap();
        assert_eq!(info.hit_count, 1);
        assert!(b.is_blocked("u1").unwrap());

        assert!(b.unban("u1").unwrap());
        assert!(!b.is_blocked("u1").unwrap());
        assert!(!b.unban("u1").unwrap());
    }

    #[test]
    fn repeat_ban_increments_hits() {
        let b = blacklist();
        b.ban("u1", 30, Some("first"), "auto_guard").unwrap();
        let info = b.ban("u1", 60, Some("second"), "admin").unwrap();
        assert_eq!(info.hit_count, 2);
        assert_eq!(info.blocked_by, "admin");
        assert_eq!(info.reason.as_deref(), Some("second"));
    }

    #[test]
    fn expired_rows_purge_lazily() {
        let b = blacklist();
        // Negative duration: already expired at insert time.
        b.ban("u1", -5, None, "auto_guard").unwrap();
        assert!(!b.is_blocked("u1").unwrap());
        // The lazy purge removed the row.
        assert!(b.get_info("u1").unwrap().is_none());
        assert_eq!(b.list_active(1, 10).unwrap().total, 0);
    }

    #[test]
    fn info_reports_remaining_minutes() {
        let b = blacklist();
        b.ban("u1", 30, Some("测试"), "auto_guard").unwrap();
        let info = b.get_info("u1").unwrap().unwrap();
        assert!(info.remaining_minutes <= 30 && info.remaining_minutes >= 29);
    }

    #[test]
    fn extend_pushes_expiry() {
        let b = blacklist();
        b.ban("u1", 10, None, "auto_guard").unwrap();
        let before = b.get_info("u1").unwrap().unwrap().expires_at;
        let after = b.extend("u1", 20).unwrap().unwrap().expires_at;
        assert_eq!(after, before + 20 * 60);

        assert!(b.extend("ghost", 5).unwrap().is_none());
    }

    #[test]
    fn cleanup_sweeps_only_expired() {
        let b = blacklist();
        b.ban("gone", -5, None, "auto_guard").unwrap();
        b.ban("active", 30, None, "auto_guard").unwrap();

        assert_eq!(b.cleanup_expired().unwrap(), 1);
        assert!(b.is_blocked("active").unwrap());
    }

    #[test]
    fn stats_aggregate_reasons_and_offenders() {
        let b = blacklist();
        b.ban("u1", 30, Some("注入"), "auto_guard").unwrap();
        b.ban("u1", 30, Some("注入"), "auto_guard").unwrap();
        b.ban("u2", 30, Some("别的"), "auto_guard").unwrap();

        let stats = b.stats().unwrap();
        assert_eq!(stats.active_count, 2);
        assert_eq!(stats.top_offenders[0], ("u1".to_string(), 2));
    }
}
