//! In-process fakes for the collaborator traits.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

use tether_common::{Error, RecordId, Result};
use tether_store::Attachment;

use crate::transport::{
    AttachmentUploader, FetchPolicy, MessageStream, MutationOutcome, MutationRequest,
    MutationResponse, Operation, PersistentMutationListener, Transport, UploadOutcome,
};

/// `UpdatePost` mutation carrying a title that tests use as a label.
pub(crate) fn update(title: &str) -> MutationRequest {
    MutationRequest::new(
        Operation::new(
            "UpdatePost",
            "mutation UpdatePost($id: ID!, $title: String) {\n  updatePost(id: $id, title: $title) { id title }\n}",
        )
        .with_variables(json!({"id": "p1", "title": title})),
    )
}

/// Poll `condition` until it holds, panicking after two seconds.
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    mutation_script: Mutex<VecDeque<MutationOutcome>>,
    mutation_delay: Mutex<Duration>,
    sent: Mutex<Vec<Value>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    query_script: Mutex<HashMap<(String, FetchPolicy), VecDeque<Result<Value>>>>,
    queries: Mutex<Vec<(String, FetchPolicy, Value)>>,
    network_gate: Option<Semaphore>,
    subscriptions: Mutex<Vec<mpsc::UnboundedSender<Result<Value>>>>,
    subscription_failures: Mutex<VecDeque<Error>>,
    opened: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Network queries block until [`release`](Self::release) is called.
    pub(crate) fn gated() -> Arc<Self> {
        Arc::new(Self {
            network_gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    pub(crate) fn release(&self, queries: usize) {
        if let Some(gate) = &self.network_gate {
            gate.add_permits(queries);
        }
    }

    pub(crate) fn script_mutation(&self, outcome: MutationOutcome) {
        self.mutation_script.lock().unwrap().push_back(outcome);
    }

    pub(crate) fn set_mutation_delay(&self, delay: Duration) {
        *self.mutation_delay.lock().unwrap() = delay;
    }

    pub(crate) fn script_query(&self, name: &str, policy: FetchPolicy, result: Result<Value>) {
        self.query_script
            .lock()
            .unwrap()
            .entry((name.to_string(), policy))
            .or_default()
            .push_back(result);
    }

    pub(crate) fn fail_next_subscription(&self, error: Error) {
        self.subscription_failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn sent_bodies(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_titles(&self) -> Vec<String> {
        self.sent_bodies()
            .iter()
            .map(|body| body["variables"]["title"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub(crate) fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn queries(&self) -> Vec<(String, FetchPolicy, Value)> {
        self.queries.lock().unwrap().clone()
    }

    /// Names of the queries sent to the network, in order.
    pub(crate) fn network_queries(&self) -> Vec<String> {
        self.queries()
            .into_iter()
            .filter(|(_, policy, _)| *policy == FetchPolicy::NetworkOnly)
            .map(|(name, _, _)| name)
            .collect()
    }

    pub(crate) fn subscriptions_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Push a message on the most recently opened subscription.
    pub(crate) fn push_message(&self, message: Value) {
        if let Some(sender) = self.subscriptions.lock().unwrap().last() {
            let _ = sender.send(Ok(message));
        }
    }

    /// Complete every open subscription.
    pub(crate) fn close_subscriptions(&self) {
        self.subscriptions.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_mutation(&self, serialized_request: &str) -> MutationOutcome {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let body: Value = serde_json::from_str(serialized_request).unwrap_or(Value::Null);
        self.sent.lock().unwrap().push(body.clone());

        let delay = *self.mutation_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.mutation_script.lock().unwrap().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        scripted.unwrap_or_else(|| MutationOutcome::Success(json!({"echo": body["variables"]})))
    }

    async fn send_query(&self, operation: &Operation, policy: FetchPolicy) -> Result<Value> {
        self.queries
            .lock()
            .unwrap()
            .push((operation.name.clone(), policy, operation.variables.clone()));

        if policy == FetchPolicy::NetworkOnly {
            if let Some(gate) = &self.network_gate {
                gate.acquire().await.map_err(|e| Error::Network(e.to_string()))?.forget();
            }
        }

        let scripted = self
            .query_script
            .lock()
            .unwrap()
            .get_mut(&(operation.name.clone(), policy))
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(json!({"query": operation.name, "policy": format!("{:?}", policy)})))
    }

    async fn open_subscription(&self, _operation: &Operation) -> Result<MessageStream> {
        if let Some(error) = self.subscription_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscriptions.lock().unwrap().push(sender);
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })))
    }
}

#[derive(Default)]
pub(crate) struct ScriptedUploader {
    outcomes: Mutex<VecDeque<UploadOutcome>>,
    uploads: AtomicUsize,
}

impl ScriptedUploader {
    pub(crate) fn script(&self, outcome: UploadOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub(crate) fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttachmentUploader for ScriptedUploader {
    async fn upload(&self, _attachment: &Attachment) -> UploadOutcome {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(UploadOutcome::Uploaded)
    }
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    responses: Mutex<Vec<MutationResponse>>,
    failures: Mutex<Vec<(RecordId, String, String)>>,
}

impl RecordingListener {
    pub(crate) fn response_tags(&self) -> Vec<String> {
        self.responses
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.response_type_tag.clone())
            .collect()
    }

    pub(crate) fn failures(&self) -> Vec<(RecordId, String, String)> {
        self.failures.lock().unwrap().clone()
    }

    pub(crate) fn failure_count(&self) -> usize {
        self.failures.lock().unwrap().len()
    }
}

impl PersistentMutationListener for RecordingListener {
    fn on_response(&self, response: &MutationResponse) {
        self.responses.lock().unwrap().push(response.clone());
    }

    fn on_failure(&self, record_id: &RecordId, response_type_tag: &str, error: &Error) {
        self.failures.lock().unwrap().push((
            record_id.clone(),
            response_type_tag.to_string(),
            error.to_string(),
        ));
    }
}

/// Collects mutation callbacks by label.
#[derive(Clone, Default)]
pub(crate) struct Completions {
    results: Arc<Mutex<Vec<(String, Option<Result<MutationResponse>>)>>>,
}

impl Completions {
    pub(crate) fn callback(
        &self,
        label: &str,
    ) -> impl FnOnce(Result<MutationResponse>) + Send + 'static {
        let results = self.results.clone();
        let label = label.to_string();
        move |result| results.lock().unwrap().push((label, Some(result)))
    }

    pub(crate) fn len(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels in completion order.
    pub(crate) fn labels(&self) -> Vec<String> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .map(|(label, _)| label.clone())
            .collect()
    }

    /// Take the result delivered for `label`.
    pub(crate) fn take(&self, label: &str) -> Option<Result<MutationResponse>> {
        self.results
            .lock()
            .unwrap()
            .iter_mut()
            .find(|(l, _)| l == label)
            .and_then(|(_, result)| result.take())
    }
}
