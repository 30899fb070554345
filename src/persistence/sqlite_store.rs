//! SQLite implementation of the PresenceStore trait

use super::{PersistenceError, PresenceStore};
use crate::models::StateChange;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// SQLite-based presence storage
///
/// A single key-value table holds the state, the session record and the
/// prompt flags; a second table keeps the transition history. The daemon
/// and a headless periodic invocation may open the same file, so a busy
/// timeout is set instead of failing on a locked database.
pub struct SqlitePresenceStore {
    conn: Mutex<Connection>,
}

impl SqlitePresenceStore {
    /// Open (or create) a store at the specified path
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, PersistenceError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = SqlitePresenceStore {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing)
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let store = SqlitePresenceStore {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::LockPoisoned)
    }

    fn parse_change(
        from: String,
        to: String,
        cause: String,
        at_ms: i64,
    ) -> Result<StateChange, PersistenceError> {
        let invalid = |reason: String| PersistenceError::InvalidData {
            key: "transitions".to_string(),
            reason,
        };
        Ok(StateChange {
            from: from.parse().map_err(invalid)?,
            to: to.parse().map_err(invalid)?,
            cause: cause.parse().map_err(invalid)?,
            at: DateTime::from_timestamp_millis(at_ms)
                .ok_or_else(|| invalid(format!("timestamp out of range: {}", at_ms)))?,
        })
    }
}

impl PresenceStore for SqlitePresenceStore {
    fn get_value(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_value(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
             VALUES (?, ?, strftime('%s', 'now'))",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove_value(&self, key: &str) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
        Ok(())
    }

    fn append_transition(&self, change: &StateChange) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO transitions (from_state, to_state, cause, at_ms) VALUES (?, ?, ?, ?)",
            params![
                change.from.as_str(),
                change.to.as_str(),
                change.cause.as_str(),
                change.at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn recent_transitions(&self, limit: usize) -> Result<Vec<StateChange>, PersistenceError> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT from_state, to_state, cause, at_ms FROM transitions
                 ORDER BY id DESC
                 LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<Vec<(String, String, String, i64)>, _>>()?;
            rows
        };

        rows.into_iter()
            .map(|(from, to, cause, at_ms)| Self::parse_change(from, to, cause, at_ms))
            .collect()
    }

    fn prune_transitions(&self, before: DateTime<Utc>) -> Result<usize, PersistenceError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM transitions WHERE at_ms < ?",
            params![before.timestamp_millis()],
        )?;
        Ok(deleted)
    }

    fn clear_all(&self) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "DELETE FROM kv_store;
             DELETE FROM transitions;",
        )?;
        Ok(())
    }
}
