//! Persisted data model.

use serde::{Deserialize, Serialize};

use tether_common::{RecordId, SessionKey};

/// Binary payload that must be uploaded before its mutation is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub bucket: String,
    pub key: String,
    pub region: String,
    /// Path of the file on this device.
    pub local_path: String,
    pub mime_type: String,
}

/// A pending write operation as stored on disk.
///
/// The request body is captured once at submission so that replay after a
/// restart does not depend on any live object graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Stable identifier assigned at submission.
    pub record_id: RecordId,
    /// Fully formed wire body (query document + variables).
    pub serialized_request: String,
    /// Identifies which response schema/handler applies.
    pub response_type_tag: String,
    /// Serialized copy of the submitted variables, kept for conflict comparison.
    pub client_state: String,
    /// Optional binary payload.
    pub attachment: Option<Attachment>,
}

impl MutationRecord {
    /// Whether an upload must precede the request.
    pub fn has_attachment(&self) -> bool {
        self.attachment.is_some()
    }
}

/// Bookkeeping row of a delta sync session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    /// Row identifier.
    pub id: i64,
    /// Session identity.
    pub session_key: SessionKey,
    /// Start time of the last successful reconciliation, in epoch millis.
    /// Zero means the session never completed a run.
    pub last_run_time_millis: i64,
}
