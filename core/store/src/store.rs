//! Durable queue store trait definitions.

use tether_common::{RecordId, Result, SessionKey};

use crate::record::{MutationRecord, SessionRow};

/// Persistence of pending mutations.
///
/// Implementations must preserve insertion order in [`MutationStore::load_all`]
/// and must make every write durable before returning.
pub trait MutationStore: Send + Sync {
    /// Persist a new record.
    ///
    /// # Errors
    /// - A record with the same id already exists
    /// - Underlying storage failure
    fn insert(&self, record: &MutationRecord) -> Result<()>;

    /// Delete a record. Deleting an unknown id is not an error.
    fn remove(&self, record_id: &RecordId) -> Result<()>;

    /// Replace the request body and client state of a record, keeping its
    /// position in the queue.
    ///
    /// # Errors
    /// - Record not found
    fn update_request(
        &self,
        record_id: &RecordId,
        serialized_request: &str,
        client_state: &str,
    ) -> Result<()>;

    /// Load all records in insertion order.
    fn load_all(&self) -> Result<Vec<MutationRecord>>;

    /// Delete every record.
    fn clear(&self) -> Result<()>;

    /// Number of stored records.
    fn count(&self) -> Result<usize>;
}

/// Persistence of delta sync session timestamps.
pub trait SessionStore: Send + Sync {
    /// Return the row for `key`, creating it with a zero timestamp if absent.
    fn find_or_create(&self, key: &SessionKey) -> Result<SessionRow>;

    /// Record the start time of the last successful run.
    ///
    /// # Errors
    /// - Row not found
    fn update_last_run(&self, id: i64, last_run_time_millis: i64) -> Result<()>;

    /// Delete the row for `key`. Returns whether a row existed.
    fn delete(&self, key: &SessionKey) -> Result<bool>;

    /// List all rows ordered by id.
    fn list(&self) -> Result<Vec<SessionRow>>;
}

/// A store that holds both logical tables.
pub trait QueueStore: MutationStore + SessionStore {}

impl<T: MutationStore + SessionStore> QueueStore for T {}
