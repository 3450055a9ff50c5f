//! Read-only SQLite browsing for the admin surface.
//!
//! Everything is confined to the configured data directory: paths are
//! canonicalized and must stay inside it, table names are checked against
//! `sqlite_master`, and the free-form executor accepts a single SELECT with
//! a mutation-keyword blacklist and a forced LIMIT.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

const MAX_PAGE_SIZE: usize = 200;
const ALLOWED_EXTENSIONS: &[&str] = &["db", "sqlite", "sqlite3"];

const DANGEROUS_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "REPLACE", "ATTACH",
    "DETACH", "VACUUM", "REINDEX", "PRAGMA",
];

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseEntry {
    pub name: String,
    pub path: String,
    pub size: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableEntry {
    pub name: String,
    /// -1 when the row count could not be read.
    pub rows: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TablePage {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum BrowseError {
    #[error("path outside the data directory or not a database: {0}")]
    BadPath(String),

    #[error("table not found: {0}")]
    UnknownTable(String),

    #[error("rejected SQL: {0}")]
    RejectedSql(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every browsable database under the data directory, sorted by name.
pub fn list_databases(data_dir: &Path) -> Vec<DatabaseEntry> {
    let mut out = Vec::new();
    collect_databases(data_dir, data_dir, &mut out);
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

fn collect_databases(base: &Path, dir: &Path, out: &mut Vec<DatabaseEntry>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_databases(base, &path, out);
            continue;
        }
        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| ALLOWED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);
        if !ext_ok {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let rel = path
            .strip_prefix(base)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        out.push(DatabaseEntry {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: rel,
            size: format_size(size),
        });
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Resolve a relative database path, rejecting traversal out of `data_dir`.
pub fn validate_db_path(data_dir: &Path, rel_path: &str) -> Result<PathBuf, BrowseError> {
    let candidate = data_dir.join(rel_path);
    let canonical = candidate
        .canonicalize()
        .map_err(|_| BrowseError::BadPath(rel_path.to_string()))?;
    let base = data_dir
        .canonicalize()
        .map_err(|_| BrowseError::BadPath(rel_path.to_string()))?;

    let ext_ok = canonical
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false);
    if !canonical.starts_with(&base) || !ext_ok || !canonical.is_file() {
        return Err(BrowseError::BadPath(rel_path.to_string()));
    }
    Ok(canonical)
}

pub fn list_tables(data_dir: &Path, rel_path: &str) -> Result<Vec<TableEntry>, BrowseError> {
    let db_path = validate_db_path(data_dir, rel_path)?;
    let conn = Connection::open(db_path)?;

    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
    let names: Vec<String> = stmt
        .query_map([], |r| r.get(0))?
        .filter_map(|r| r.ok())
        .filter(|n: &String| !n.starts_with("sqlite_"))
        .collect();

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let rows = conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{name}\""), [], |r| {
                r.get::<_, i64>(0)
            })
            .unwrap_or(-1);
        tables.push(TableEntry { name, rows });
    }
    Ok(tables)
}

pub fn fetch_table_rows(
    data_dir: &Path,
    rel_path: &str,
    table: &str,
    page: usize,
    page_size: usize,
) -> Result<TablePage, BrowseError> {
    let db_path = validate_db_path(data_dir, rel_path)?;
    let conn = Connection::open(db_path)?;

    // Table name goes into the SQL verbatim, so it must exist first.
    let known: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type='table' AND name = ?1",
            [table],
            |r| r.get(0),
        )
        .ok();
    if known.is_none() {
        return Err(BrowseError::UnknownTable(table.to_string()));
    }

    let page = page.max(1);
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
    let total: usize = conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |r| {
        r.get(0)
    })?;

    let mut stmt = conn.prepare(&format!("SELECT * FROM \"{table}\" LIMIT ?1 OFFSET ?2"))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let column_count = columns.len();
    let rows = stmt
        .query_map(
            rusqlite::params![page_size as i64, ((page - 1) * page_size) as i64],
            |row| Ok(row_to_json(row, column_count)),
        )?
        .filter_map(|r| r.ok())
        .collect();

    Ok(TablePage {
        columns,
        rows,
        page,
        page_size,
        total,
    })
}

/// Run one read-only SELECT. Multiple statements, mutation keywords, and
/// unbounded result sets are all rejected or constrained.
pub fn run_select_query(
    data_dir: &Path,
    rel_path: &str,
    sql: &str,
) -> Result<QueryResult, BrowseError> {
    let db_path = validate_db_path(data_dir, rel_path)?;

    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if !upper.starts_with("SELECT") {
        return Err(BrowseError::RejectedSql("only SELECT is allowed".to_string()));
    }
    // A trailing semicolon is fine; an interior one means multiple statements.
    if trimmed.strip_suffix(';').unwrap_or(trimmed).contains(';') {
        return Err(BrowseError::RejectedSql(
            "multiple statements are not allowed".to_string(),
        ));
    }
    static WORD_RE: OnceLock<Regex> = OnceLock::new();
    let word_re = WORD_RE.get_or_init(|| Regex::new(r"[A-Z]+").unwrap());
    for word in word_re.find_iter(&upper) {
        if DANGEROUS_KEYWORDS.contains(&word.as_str()) {
            return Err(BrowseError::RejectedSql(format!(
                "forbidden keyword: {}",
                word.as_str()
            )));
        }
    }

    let mut effective = trimmed.trim_end_matches(';').to_string();
    if !upper.contains("LIMIT") {
        effective.push_str(&format!(" LIMIT {MAX_PAGE_SIZE}"));
    }

    let conn = Connection::open(db_path)?;
    let mut stmt = conn.prepare(&effective)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let column_count = columns.len();
    let rows: Vec<Vec<Value>> = stmt
        .query_map([], |row| Ok(row_to_json(row, column_count)))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(QueryResult {
        row_count: rows.len(),
        columns,
        rows,
    })
}

fn row_to_json(row: &rusqlite::Row<'_>, column_count: usize) -> Vec<Value> {
    (0..column_count)
        .map(|i| match row.get_ref(i) {
            Ok(ValueRef::Null) => Value::Null,
            Ok(ValueRef::Integer(v)) => Value::from(v),
            Ok(ValueRef::Real(v)) => Value::from(v),
            Ok(ValueRef::Text(t)) => Value::from(String::from_utf8_lossy(t).to_string()),
            Ok(ValueRef::Blob(b)) => Value::from(format!("<blob {} bytes>", b.len())),
            Err(_) => Value::Null,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("affection.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE user_affection (user_id TEXT PRIMARY KEY, affection_score REAL);
             INSERT INTO user_affection VALUES ('u1', 2.5), ('u2', 0.0);",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("private")).unwrap();
        let conn = Connection::open(dir.path().join("private").join("user_1.db")).unwrap();
        conn.execute_batch("CREATE TABLE private_memories (id INTEGER PRIMARY KEY)")
            .unwrap();
        dir
    }

    #[test]
    fn databases_are_discovered_recursively() {
        let dir = seeded_dir();
        let dbs = list_databases(dir.path());
        assert_eq!(dbs.len(), 2);
        assert_eq!(dbs[0].name, "affection.db");
        assert!(dbs[1].path.contains("private/"));
    }

    #[test]
    fn traversal_out_of_data_dir_is_rejected() {
        let dir = seeded_dir();
        assert!(validate_db_path(dir.path(), "../etc/passwd").is_err());
        assert!(validate_db_path(dir.path(), "missing.db").is_err());
        assert!(validate_db_path(dir.path(), "affection.db").is_ok());
    }

    #[test]
    fn tables_and_rows_are_browsable() {
        let dir = seeded_dir();
        let tables = list_tables(dir.path(), "affection.db").unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].rows, 2);

        let page = fetch_table_rows(dir.path(), "affection.db", "user_affection", 1, 10).unwrap();
        assert_eq!(page.columns, vec!["user_id", "affection_score"]);
        assert_eq!(page.total, 2);
        assert_eq!(page.rows[0][0], Value::from("u1"));

        assert!(matches!(
            fetch_table_rows(dir.path(), "affection.db", "no_such", 1, 10),
            Err(BrowseError::UnknownTable(_))
        ));
    }

    #[test]
    fn select_executor_constrains_input() {
        let dir = seeded_dir();

        let result = run_select_query(
            dir.path(),
            "affection.db",
            "SELECT user_id FROM user_affection WHERE affection_score > 1.0",
        )
        .unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows[0][0], Value::from("u1"));

        assert!(run_select_query(dir.path(), "affection.db", "DELETE FROM user_affection").is_err());
        assert!(run_select_query(
            dir.path(),
            "affection.db",
            "SELECT 1; SELECT 2",
        )
        .is_err());
        assert!(run_select_query(
            dir.path(),
            "affection.db",
            "SELECT 1 WHERE EXISTS (SELECT 1) AND 'DROP' = 'x' OR 1=1 -- DROP TABLE",
        )
        .is_err());
    }

    #[test]
    fn select_without_limit_gets_one() {
        let dir = seeded_dir();
        // 2 rows here, but the implicit LIMIT must not error out.
        let result =
            run_select_query(dir.path(), "affection.db", "SELECT * FROM user_affection;").unwrap();
        assert_eq!(result.row_count, 2);
    }
}
