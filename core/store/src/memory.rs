//! In-memory queue store for testing.

use std::sync::{Arc, PoisonError, RwLock};

use tether_common::{Error, RecordId, Result, SessionKey};

use crate::record::{MutationRecord, SessionRow};
use crate::store::{MutationStore, SessionStore};

#[derive(Debug, Default)]
struct Tables {
    mutations: Vec<MutationRecord>,
    sessions: Vec<SessionRow>,
    next_session_id: i64,
}

/// In-memory queue store.
///
/// Useful for testing and development. Clones share the same tables, so a
/// clone handed to a second queue instance behaves like reopening the same
/// database after a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f(&tables)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut tables)
    }
}

impl MutationStore for MemoryStore {
    fn insert(&self, record: &MutationRecord) -> Result<()> {
        self.write(|t| {
            if t.mutations.iter().any(|r| r.record_id == record.record_id) {
                return Err(Error::InvalidInput(format!(
                    "Record {} already queued",
                    record.record_id
                )));
            }
            t.mutations.push(record.clone());
            Ok(())
        })
    }

    fn remove(&self, record_id: &RecordId) -> Result<()> {
        self.write(|t| t.mutations.retain(|r| &r.record_id != record_id));
        Ok(())
    }

    fn update_request(
        &self,
        record_id: &RecordId,
        serialized_request: &str,
        client_state: &str,
    ) -> Result<()> {
        self.write(|t| {
            let record = t
                .mutations
                .iter_mut()
                .find(|r| &r.record_id == record_id)
                .ok_or_else(|| Error::NotFound(format!("No queued record {}", record_id)))?;
            record.serialized_request = serialized_request.to_string();
            record.client_state = client_state.to_string();
            Ok(())
        })
    }

    fn load_all(&self) -> Result<Vec<MutationRecord>> {
        Ok(self.read(|t| t.mutations.clone()))
    }

    fn clear(&self) -> Result<()> {
        self.write(|t| t.mutations.clear());
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.read(|t| t.mutations.len()))
    }
}

impl SessionStore for MemoryStore {
    fn find_or_create(&self, key: &SessionKey) -> Result<SessionRow> {
        Ok(self.write(|t| {
            if let Some(row) = t.sessions.iter().find(|s| &s.session_key == key) {
                return row.clone();
            }
            t.next_session_id += 1;
            let row = SessionRow {
                id: t.next_session_id,
                session_key: key.clone(),
                last_run_time_millis: 0,
            };
            t.sessions.push(row.clone());
            row
        }))
    }

    fn update_last_run(&self, id: i64, last_run_time_millis: i64) -> Result<()> {
        self.write(|t| {
            let row = t
                .sessions
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| Error::NotFound(format!("No session row {}", id)))?;
            row.last_run_time_millis = last_run_time_millis;
            Ok(())
        })
    }

    fn delete(&self, key: &SessionKey) -> Result<bool> {
        Ok(self.write(|t| {
            let before = t.sessions.len();
            t.sessions.retain(|s| &s.session_key != key);
            t.sessions.len() != before
        }))
    }

    fn list(&self) -> Result<Vec<SessionRow>> {
        Ok(self.read(|t| t.sessions.clone()))
    }
}
