//! Identifier types used throughout tether.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a pending mutation.
///
/// Assigned once at submission time and stable for the lifetime of the
/// record, including across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier, e.g. one loaded from the durable store.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "RecordId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a delta sync session.
///
/// Derived from the identities of the baseline query, subscription and
/// delta query a session was started with. Two sessions built from the
/// same operations share one persisted timestamp row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    /// Compose a key from operation identities. Absent parts are kept as
    /// empty segments so that `(a, None, b)` and `(a, b, None)` differ.
    pub fn compose(baseline: &str, subscription: Option<&str>, delta: Option<&str>) -> Self {
        Self(format!(
            "{}|{}|{}",
            baseline,
            subscription.unwrap_or_default(),
            delta.unwrap_or_default()
        ))
    }

    /// Wrap a raw key, e.g. one read back from the session table.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
