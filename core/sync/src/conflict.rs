//! Conflict detection and resolution handoff.
//!
//! A conflict is a conditional-write rejection from the server. The engine
//! never decides how to merge: it packages server state and client state into
//! a [`ConflictEnvelope`] and hands it to an application [`ConflictResolver`]
//! together with a one-shot [`ConflictHandle`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use tether_common::RecordId;
use tether_store::MutationRecord;

use crate::transport::{MutationOutcome, MutationRequest};

/// Error type reported by the server for a failed conditional write.
pub const CONDITIONAL_CHECK_ERROR_TYPE: &str = "DynamoDB:ConditionalCheckFailedException";

/// Message fragment reported by the server for a failed conditional write.
pub const CONDITIONAL_REQUEST_MESSAGE: &str = "The conditional request failed";

/// Everything a resolver needs to decide on a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEnvelope {
    pub record_id: RecordId,
    pub response_type_tag: String,
    /// Name of the operation inside the rejected document.
    pub operation_type_name: String,
    /// Current state of the record on the server.
    pub server_state: Value,
    /// Variables the client sent.
    pub client_state: Value,
}

impl ConflictEnvelope {
    /// Build an envelope for a rejected record.
    pub fn new(record: &MutationRecord, server_state: Value) -> Self {
        let client_state = serde_json::from_str(&record.client_state)
            .unwrap_or_else(|_| Value::String(record.client_state.clone()));
        let operation_type_name = operation_name_of(&record.serialized_request)
            .unwrap_or_else(|| record.response_type_tag.clone());

        Self {
            record_id: record.record_id.clone(),
            response_type_tag: record.response_type_tag.clone(),
            operation_type_name,
            server_state,
            client_state,
        }
    }
}

/// A resolver's decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Give up; the mutation fails with a conflict error.
    Fail,
    /// Send this request in place of the rejected one.
    Retry(MutationRequest),
}

/// One-shot decision handle passed to a resolver.
///
/// Consuming it with [`fail`](Self::fail) or [`retry`](Self::retry) records
/// the decision. Dropping it without deciding counts as a failure.
#[derive(Debug)]
pub struct ConflictHandle {
    record_id: RecordId,
    decision: oneshot::Sender<Resolution>,
}

impl ConflictHandle {
    fn new(record_id: RecordId) -> (Self, oneshot::Receiver<Resolution>) {
        let (decision, rx) = oneshot::channel();
        (
            Self {
                record_id,
                decision,
            },
            rx,
        )
    }

    /// Id of the record under resolution.
    pub fn record_id(&self) -> &RecordId {
        &self.record_id
    }

    /// Fail the mutation.
    pub fn fail(self) {
        let _ = self.decision.send(Resolution::Fail);
    }

    /// Retry with a replacement request.
    pub fn retry(self, request: MutationRequest) {
        let _ = self.decision.send(Resolution::Retry(request));
    }
}

/// Application-supplied conflict policy.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: ConflictEnvelope, handle: ConflictHandle);
}

/// Resolver backed by a plain closure.
pub struct FnResolver<F> {
    f: F,
}

impl<F> FnResolver<F>
where
    F: Fn(ConflictEnvelope, ConflictHandle) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ConflictResolver for FnResolver<F>
where
    F: Fn(ConflictEnvelope, ConflictHandle) + Send + Sync,
{
    async fn resolve(&self, conflict: ConflictEnvelope, handle: ConflictHandle) {
        (self.f)(conflict, handle)
    }
}

/// Run a resolver and wait for its decision.
///
/// The resolver runs on its own task. A timeout, a dropped handle, or a
/// panicking resolver all resolve to [`Resolution::Fail`].
pub(crate) async fn run_resolver(
    resolver: Arc<dyn ConflictResolver>,
    envelope: ConflictEnvelope,
    limit: Duration,
) -> Resolution {
    let record_id = envelope.record_id.clone();
    let (handle, decision) = ConflictHandle::new(record_id.clone());
    let task = tokio::spawn(async move { resolver.resolve(envelope, handle).await });

    match tokio::time::timeout(limit, decision).await {
        Ok(Ok(resolution)) => {
            debug!("Resolver decided on {}: {:?}", record_id, resolution);
            resolution
        }
        Ok(Err(_)) => {
            warn!("Resolver for {} dropped its handle without deciding", record_id);
            Resolution::Fail
        }
        Err(_) => {
            task.abort();
            warn!("Resolver for {} timed out after {:?}", record_id, limit);
            Resolution::Fail
        }
    }
}

/// Classify a raw GraphQL response body.
///
/// The first entry of `errors` decides the outcome. It is a conditional
/// failure when its `errorType` is [`CONDITIONAL_CHECK_ERROR_TYPE`] or its
/// message contains [`CONDITIONAL_REQUEST_MESSAGE`], and it carries a `data`
/// member with the server state. A `data` member holding a JSON string is
/// decoded.
pub fn classify_response(body: &Value) -> MutationOutcome {
    let first_error = body
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first());

    let Some(error) = first_error else {
        return MutationOutcome::Success(body.get("data").cloned().unwrap_or(Value::Null));
    };

    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let is_conditional = error.get("errorType").and_then(Value::as_str)
        == Some(CONDITIONAL_CHECK_ERROR_TYPE)
        || message.contains(CONDITIONAL_REQUEST_MESSAGE);

    if is_conditional {
        if let Some(data) = error.get("data").filter(|d| !d.is_null()) {
            let server_state = match data {
                Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| data.clone()),
                other => other.clone(),
            };
            return MutationOutcome::ConditionalFailure(server_state);
        }
    }

    if message.is_empty() {
        MutationOutcome::Rejected(error.to_string())
    } else {
        MutationOutcome::Rejected(message.to_string())
    }
}

/// Extract the operation name from a wire body such as
/// `{"query": "mutation UpdatePost($id: ID!) {...}"}`.
fn operation_name_of(serialized_request: &str) -> Option<String> {
    let body: Value = serde_json::from_str(serialized_request).ok()?;
    let query = body.get("query")?.as_str()?;
    let rest = query.trim_start().strip_prefix("mutation")?;
    let name: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}
