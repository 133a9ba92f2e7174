//! SQLite-backed durable queue store.
//!
//! Holds two tables: pending mutations (replayed in insertion order after a
//! restart) and delta sync session timestamps.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use tether_common::{Error, RecordId, Result, SessionKey};

use crate::record::{Attachment, MutationRecord, SessionRow};
use crate::store::{MutationStore, SessionStore};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS mutation_records (
        record_id TEXT PRIMARY KEY,
        serialized_request TEXT NOT NULL,
        response_type_tag TEXT NOT NULL,
        client_state TEXT NOT NULL,
        bucket TEXT,
        key TEXT,
        region TEXT,
        local_path TEXT,
        mime_type TEXT
    );

    CREATE TABLE IF NOT EXISTS sync_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_key TEXT NOT NULL UNIQUE,
        last_run_time_millis INTEGER NOT NULL DEFAULT 0
    );
"#;

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Durable queue store using a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;

        info!("Queue store opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Look up a single record by id.
    pub fn get(&self, record_id: &RecordId) -> Result<Option<MutationRecord>> {
        self.conn()
            .query_row(
                r#"
                SELECT record_id, serialized_request, response_type_tag, client_state,
                       bucket, key, region, local_path, mime_type
                FROM mutation_records WHERE record_id = ?1
                "#,
                params![record_id.as_str()],
                Self::record_from_row,
            )
            .optional()
            .map_err(storage_err)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MutationRecord> {
        let raw_id: String = row.get(0)?;
        let record_id = RecordId::new(raw_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        let bucket: Option<String> = row.get(4)?;
        let attachment = match bucket {
            Some(bucket) if !bucket.is_empty() => Some(Attachment {
                bucket,
                key: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                region: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                local_path: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                mime_type: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(MutationRecord {
            record_id,
            serialized_request: row.get(1)?,
            response_type_tag: row.get(2)?,
            client_state: row.get(3)?,
            attachment,
        })
    }

    fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
        Ok(SessionRow {
            id: row.get(0)?,
            session_key: SessionKey::from_raw(row.get::<_, String>(1)?),
            last_run_time_millis: row.get(2)?,
        })
    }
}

impl MutationStore for SqliteStore {
    fn insert(&self, record: &MutationRecord) -> Result<()> {
        debug!("Persisting mutation [{}]", record.record_id);
        let attachment = record.attachment.as_ref();
        self.conn()
            .execute(
                r#"
                INSERT INTO mutation_records
                (record_id, serialized_request, response_type_tag, client_state,
                 bucket, key, region, local_path, mime_type)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    record.record_id.as_str(),
                    record.serialized_request,
                    record.response_type_tag,
                    record.client_state,
                    attachment.map(|a| a.bucket.as_str()),
                    attachment.map(|a| a.key.as_str()),
                    attachment.map(|a| a.region.as_str()),
                    attachment.map(|a| a.local_path.as_str()),
                    attachment.map(|a| a.mime_type.as_str()),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Error::InvalidInput(format!("Record {} already queued", record.record_id))
                }
                other => storage_err(other),
            })?;
        Ok(())
    }

    fn remove(&self, record_id: &RecordId) -> Result<()> {
        debug!("Removing mutation [{}] from store", record_id);
        self.conn()
            .execute(
                "DELETE FROM mutation_records WHERE record_id = ?1",
                params![record_id.as_str()],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn update_request(
        &self,
        record_id: &RecordId,
        serialized_request: &str,
        client_state: &str,
    ) -> Result<()> {
        let changed = self
            .conn()
            .execute(
                r#"
                UPDATE mutation_records
                SET serialized_request = ?2, client_state = ?3
                WHERE record_id = ?1
                "#,
                params![record_id.as_str(), serialized_request, client_state],
            )
            .map_err(storage_err)?;

        if changed == 0 {
            return Err(Error::NotFound(format!("No queued record {}", record_id)));
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<MutationRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT record_id, serialized_request, response_type_tag, client_state,
                       bucket, key, region, local_path, mime_type
                FROM mutation_records ORDER BY rowid
                "#,
            )
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([], Self::record_from_row)
            .map_err(storage_err)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(storage_err)?);
        }
        debug!("Loaded {} queued mutations from store", records.len());
        Ok(records)
    }

    fn clear(&self) -> Result<()> {
        info!("Clearing mutation queue store");
        self.conn()
            .execute("DELETE FROM mutation_records", [])
            .map_err(storage_err)?;
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM mutation_records", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(count as usize)
    }
}

impl SessionStore for SqliteStore {
    fn find_or_create(&self, key: &SessionKey) -> Result<SessionRow> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO sync_sessions (session_key, last_run_time_millis) VALUES (?1, 0)",
            params![key.as_str()],
        )
        .map_err(storage_err)?;

        let row = conn
            .query_row(
                "SELECT id, session_key, last_run_time_millis FROM sync_sessions WHERE session_key = ?1",
                params![key.as_str()],
                Self::session_from_row,
            )
            .map_err(storage_err)?;
        Ok(row)
    }

    fn update_last_run(&self, id: i64, last_run_time_millis: i64) -> Result<()> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sync_sessions SET last_run_time_millis = ?2 WHERE id = ?1",
                params![id, last_run_time_millis],
            )
            .map_err(storage_err)?;

        if changed == 0 {
            return Err(Error::NotFound(format!("No session row {}", id)));
        }
        Ok(())
    }

    fn delete(&self, key: &SessionKey) -> Result<bool> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM sync_sessions WHERE session_key = ?1",
                params![key.as_str()],
            )
            .map_err(storage_err)?;
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<SessionRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, session_key, last_run_time_millis FROM sync_sessions ORDER BY id")
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([], Self::session_from_row)
            .map_err(storage_err)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.map_err(storage_err)?);
        }
        Ok(sessions)
    }
}
