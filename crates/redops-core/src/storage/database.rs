//! SQLite connection wrapper and schema bootstrap.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Wrapper around a rusqlite connection with the schema applied.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create db dir {parent:?}"))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path:?}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                 id         TEXT PRIMARY KEY,
                 title      TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS messages (
                 id              TEXT PRIMARY KEY,
                 conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                 role            TEXT NOT NULL,
                 content         TEXT NOT NULL,
                 execution_ids   TEXT,
                 created_at      TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_messages_conversation
                 ON messages(conversation_id);
             CREATE TABLE IF NOT EXISTS process_details (
                 id              INTEGER PRIMARY KEY AUTOINCREMENT,
                 message_id      TEXT NOT NULL,
                 conversation_id TEXT NOT NULL,
                 event_type      TEXT NOT NULL,
                 message         TEXT NOT NULL,
                 payload         TEXT,
                 created_at      TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_process_details_message
                 ON process_details(message_id);",
        )?;
        Ok(())
    }
}
