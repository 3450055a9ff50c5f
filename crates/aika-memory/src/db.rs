use rusqlite::{Connection, Result};

/// Per-user private database: the user's own turns plus shadow copies of
/// their turns in any group. Idempotent.
pub fn init_private_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS private_memories (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            timestamp   INTEGER NOT NULL,
            query       TEXT,
            reply       TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_private_timestamp
            ON private_memories(timestamp);

        CREATE TABLE IF NOT EXISTS group_memories (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id    TEXT NOT NULL,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            timestamp   INTEGER NOT NULL,
            query       TEXT,
            reply       TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_group_timestamp
            ON group_memories(group_id, timestamp);",
    )
}

/// Per-group database: every member's turns in this group.
pub fn init_group_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS member_memories (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            timestamp   INTEGER NOT NULL,
            sender_name TEXT,
            query       TEXT,
            reply       TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_member_user_timestamp
            ON member_memories(user_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_member_timestamp
            ON member_memories(timestamp);",
    )
}

/// Single global knowledge base. Rows are immutable after ingest.
pub fn init_knowledge_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS knowledge (
            id       INTEGER PRIMARY KEY AUTOINCREMENT,
            source   TEXT NOT NULL,
            content  TEXT NOT NULL,
            title    TEXT,
            category TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_knowledge_source ON knowledge(source);",
    )
}
