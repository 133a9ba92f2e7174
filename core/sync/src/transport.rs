//! Collaborator contracts consumed by the sync engine.
//!
//! The engine owns no network, upload, or cache code of its own. Everything
//! that leaves the process goes through one of the traits defined here, so a
//! host application can plug in its own GraphQL client, object-store uploader
//! and normalized cache.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::pin::Pin;

use tether_common::{Error, RecordId, Result};
use tether_store::{Attachment, MutationRecord};

/// Stream of messages delivered by an open subscription.
///
/// The stream ends when the server completes the subscription or the
/// connection is lost.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Where a query should be answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchPolicy {
    /// Answer from the local normalized cache only.
    CacheOnly,
    /// Always go to the network.
    NetworkOnly,
}

/// A GraphQL operation: document text plus variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation name, also used as the response type tag.
    pub name: String,
    /// Document text.
    pub document: String,
    /// Variables object.
    pub variables: Value,
}

impl Operation {
    /// Create an operation with an empty variables object.
    pub fn new(name: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            document: document.into(),
            variables: Value::Object(Map::new()),
        }
    }

    /// Replace the variables object.
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    /// Set a single variable, turning the variables into an object if needed.
    pub fn set_variable(&mut self, name: &str, value: Value) {
        if !self.variables.is_object() {
            self.variables = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.variables {
            map.insert(name.to_string(), value);
        }
    }

    /// Serialize into the wire body `{"query": ..., "variables": ...}`.
    ///
    /// Newlines are stripped from the document.
    pub fn wire_body(&self) -> Result<String> {
        let body = json!({
            "query": self.document.replace('\n', ""),
            "variables": self.variables,
        });
        Ok(serde_json::to_string(&body)?)
    }

    /// Stable identity of this operation, used when composing session keys.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.name, self.variables)
    }
}

/// A mutation submitted by the application.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub operation: Operation,
    /// File that must be uploaded before the mutation is sent.
    pub attachment: Option<Attachment>,
}

impl MutationRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Build the durable form of this request under the given record id.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the variables cannot be encoded.
    pub fn to_record(&self, record_id: RecordId) -> Result<MutationRecord> {
        Ok(MutationRecord {
            record_id,
            serialized_request: self.operation.wire_body()?,
            response_type_tag: self.operation.name.clone(),
            client_state: serde_json::to_string(&self.operation.variables)?,
            attachment: self.attachment.clone(),
        })
    }
}

/// Successful result of a queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResponse {
    pub record_id: RecordId,
    pub response_type_tag: String,
    /// The `data` member of the server response.
    pub payload: Value,
}

/// Continuation invoked exactly once with the outcome of a live submission.
pub type MutationCallback = Box<dyn FnOnce(Result<MutationResponse>) + Send + 'static>;

/// Classified outcome of sending one mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The server accepted the mutation; carries the response data.
    Success(Value),
    /// The server rejected a conditional write; carries the server state.
    ConditionalFailure(Value),
    /// The server rejected the mutation for any other reason.
    Rejected(String),
    /// The request never reached a verdict (network down, timeout).
    Transient(String),
}

/// Outcome of uploading an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    /// The object store refused the file. The mutation fails.
    Rejected(String),
    /// The upload could not complete right now. The mutation is retried later.
    Transient(String),
}

/// Network transport used for mutations, queries and subscriptions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a serialized mutation body and classify the response.
    ///
    /// Implementations that receive a raw GraphQL response body can use
    /// [`crate::conflict::classify_response`] to build the outcome.
    async fn send_mutation(&self, serialized_request: &str) -> MutationOutcome;

    /// Run a query under the given fetch policy.
    ///
    /// A cache-only query that misses returns `Ok(Value::Null)` rather than
    /// an error.
    async fn send_query(&self, operation: &Operation, policy: FetchPolicy) -> Result<Value>;

    /// Open a subscription and return its message stream.
    async fn open_subscription(&self, operation: &Operation) -> Result<MessageStream>;
}

/// Uploads mutation attachments to an object store.
#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(&self, attachment: &Attachment) -> UploadOutcome;
}

/// Normalized cache updated with the results of live submissions.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn apply(&self, response: &MutationResponse) -> Result<()>;
}

/// Receives results of durable records that have no live continuation,
/// typically mutations submitted before the process last restarted.
pub trait PersistentMutationListener: Send + Sync {
    fn on_response(&self, response: &MutationResponse);

    fn on_failure(&self, record_id: &RecordId, response_type_tag: &str, error: &Error);
}
