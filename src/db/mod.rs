// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Database module for the group index, publish timer and handoff record

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::handoff::{HandoffRecord, HANDOFF_VERSION};
use crate::{PromptpostError, Result};

/// Database manager for Promptpost (thread-safe wrapper)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Database statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStats {
    pub image_count: i64,
    pub group_count: i64,
}

impl Database {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize()?;
        Ok(db)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PromptpostError::Persistence("Database lock poisoned".to_string()))
    }

    /// Initialize database schema
    fn initialize(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS images (
                filename TEXT PRIMARY KEY,
                group_key TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_images_group_key ON images(group_key);

            CREATE TABLE IF NOT EXISTS publish_timer (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_publish TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS handoff (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                batch_id TEXT NOT NULL,
                filenames TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
        "#)?;
        Ok(())
    }

    // === Group index ===

    /// All indexed file names
    pub fn indexed_filenames(&self) -> Result<BTreeSet<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT filename FROM images")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<BTreeSet<String>>>()?;
        Ok(names)
    }

    /// Insert a record unless the file name is already indexed
    pub fn insert_image(&self, filename: &str, group_key: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO images (filename, group_key) VALUES (?1, ?2)",
            params![filename, group_key],
        )?;
        Ok(inserted > 0)
    }

    /// Delete records by file name; absent names are ignored
    pub fn remove_images(&self, filenames: &[String]) -> Result<usize> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM images WHERE filename = ?1")?;
            for name in filenames {
                removed += stmt.execute(params![name])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// File names sharing a group key, sorted by name
    pub fn filenames_with_key(&self, group_key: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT filename FROM images WHERE group_key = ?1 ORDER BY filename")?;
        let names = stmt
            .query_map(params![group_key], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Stored key of one file
    pub fn group_key_of(&self, filename: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let key = conn
            .query_row(
                "SELECT group_key FROM images WHERE filename = ?1",
                params![filename],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    /// Get database statistics
    pub fn get_stats(&self) -> Result<DbStats> {
        let conn = self.lock_conn()?;
        let image_count: i64 = conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        let group_count: i64 =
            conn.query_row("SELECT COUNT(DISTINCT group_key) FROM images", [], |row| row.get(0))?;
        Ok(DbStats { image_count, group_count })
    }

    // === Publish timer ===

    /// Time of the last successful publish, if any
    pub fn last_publish(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT last_publish FROM publish_timer WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| PromptpostError::Persistence(format!("Bad timer value {:?}: {}", s, e)))
        })
        .transpose()
    }

    pub fn set_last_publish(&self, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO publish_timer (id, last_publish) VALUES (1, ?1)",
            params![at.to_rfc3339()],
        )?;
        Ok(())
    }

    // === Handoff ===

    /// The pending handoff, if one is stored
    pub fn load_handoff(&self) -> Result<Option<HandoffRecord>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT version, batch_id, filenames, created_at FROM handoff WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let (version, batch_id, filenames, created_at) = match row {
            Some(r) => r,
            None => return Ok(None),
        };
        if version != HANDOFF_VERSION {
            return Err(PromptpostError::Persistence(format!(
                "Unsupported handoff version {} (expected {})",
                version, HANDOFF_VERSION
            )));
        }
        let filenames: Vec<String> = serde_json::from_str(&filenames)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| PromptpostError::Persistence(format!("Bad handoff timestamp: {}", e)))?;

        Ok(Some(HandoffRecord { batch_id, filenames, created_at }))
    }

    /// Store a handoff; fails if one is already pending
    pub fn insert_handoff(&self, record: &HandoffRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        let result = conn.execute(
            r#"INSERT INTO handoff (id, version, batch_id, filenames, created_at)
               VALUES (1, ?1, ?2, ?3, ?4)"#,
            params![
                HANDOFF_VERSION,
                record.batch_id,
                serde_json::to_string(&record.filenames)?,
                record.created_at.to_rfc3339()
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(PromptpostError::HandoffPending)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the pending handoff; returns whether one existed
    pub fn clear_handoff(&self) -> Result<bool> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute("DELETE FROM handoff WHERE id = 1", [])?;
        Ok(deleted > 0)
    }

    pub fn has_handoff(&self) -> Result<bool> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM handoff", [], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Run raw SQL against the connection
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.lock_conn()?.execute_batch(sql)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        let db = Database::in_memory().unwrap();
        assert!(db.insert_image("a.png", "castle").unwrap());
        assert!(db.insert_image("b.png", "castle").unwrap());
        assert!(db.insert_image("c.png", "forest").unwrap());
        assert!(!db.insert_image("a.png", "other").unwrap());

        assert_eq!(db.filenames_with_key("castle").unwrap(), vec!["a.png", "b.png"]);
        assert_eq!(db.group_key_of("a.png").unwrap().as_deref(), Some("castle"));
        assert_eq!(db.get_stats().unwrap(), DbStats { image_count: 3, group_count: 2 });
    }

    #[test]
    fn test_remove_is_idempotent() {
        let db = Database::in_memory().unwrap();
        db.insert_image("a.png", "k").unwrap();

        let names = vec!["a.png".to_string(), "ghost.png".to_string()];
        assert_eq!(db.remove_images(&names).unwrap(), 1);
        assert_eq!(db.remove_images(&names).unwrap(), 0);
        assert!(db.indexed_filenames().unwrap().is_empty());
    }

    #[test]
    fn test_timer() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.last_publish().unwrap(), None);

        let at = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc);
        db.set_last_publish(at).unwrap();
        db.set_last_publish(at).unwrap();
        assert_eq!(db.last_publish().unwrap(), Some(at));
    }

    #[test]
    fn test_single_handoff() {
        let db = Database::in_memory().unwrap();
        assert!(db.load_handoff().unwrap().is_none());

        let record = HandoffRecord::new(vec!["b.png".into(), "a.png".into()]);
        db.insert_handoff(&record).unwrap();
        assert!(db.has_handoff().unwrap());

        let again = HandoffRecord::new(vec!["c.png".into()]);
        assert!(matches!(db.insert_handoff(&again), Err(PromptpostError::HandoffPending)));

        let loaded = db.load_handoff().unwrap().unwrap();
        assert_eq!(loaded.filenames, vec!["b.png", "a.png"]);
        assert_eq!(loaded.batch_id, record.batch_id);

        assert!(db.clear_handoff().unwrap());
        assert!(!db.clear_handoff().unwrap());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("promptpost.db");
        {
            let db = Database::open(&path).unwrap();
            db.insert_image("a.png", "k").unwrap();
            db.insert_handoff(&HandoffRecord::new(vec!["a.png".into()])).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.indexed_filenames().unwrap().len(), 1);
        assert!(db.has_handoff().unwrap());
    }
}
