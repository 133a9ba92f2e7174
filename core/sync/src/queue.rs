//! Dual-tier mutation queue with a single-flight dispatcher.
//!
//! Mutations live in two ordered tiers. The durable tier holds records loaded
//! from the store at startup; those were submitted by an earlier process and
//! have no live continuation. The in-session tier holds records submitted
//! since startup together with their callbacks. Every queued record is also
//! written to the store before it is acknowledged, except a submission made
//! while online with nothing queued, which is persisted only if its send is
//! interrupted.
//!
//! One dispatcher task drains both tiers, durable tier first, sending at most
//! one mutation at a time and only while the network is available.

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tether_common::{Error, RecordId, Result};
use tether_store::{MutationRecord, MutationStore};

use crate::config::SyncConfig;
use crate::conflict::{run_resolver, ConflictEnvelope, ConflictResolver, Resolution};
use crate::signals::ConnectivityEvent;
use crate::transport::{
    AttachmentUploader, MutationCallback, MutationOutcome, MutationRequest, MutationResponse,
    PersistentMutationListener, ResponseCache, Transport, UploadOutcome,
};

/// External services the queue talks to.
#[derive(Clone)]
pub struct QueueCollaborators {
    pub transport: Arc<dyn Transport>,
    pub uploader: Option<Arc<dyn AttachmentUploader>>,
    pub resolver: Option<Arc<dyn ConflictResolver>>,
    pub cache: Option<Arc<dyn ResponseCache>>,
    pub listener: Option<Arc<dyn PersistentMutationListener>>,
}

impl QueueCollaborators {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            uploader: None,
            resolver: None,
            cache: None,
            listener: None,
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn AttachmentUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn PersistentMutationListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

/// What the dispatcher is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchState {
    /// Ready to send the next record.
    #[default]
    Idle,
    /// A record is on the wire.
    InFlight,
    /// A transient failure stopped dispatch until connectivity returns.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Durable,
    InSession,
    PassThrough,
}

#[derive(Debug)]
enum Signal {
    Kick,
    Shutdown,
}

struct InSessionEntry {
    record: MutationRecord,
    callback: MutationCallback,
    /// Whether the record has a row in the store. Only a pass-through
    /// submission that has not yet been interrupted has none.
    persisted: bool,
}

#[derive(Default)]
struct QueueState {
    connected: bool,
    shutting_down: bool,
    dispatch: DispatchState,
    durable: VecDeque<MutationRecord>,
    in_session: VecDeque<InSessionEntry>,
    in_flight: Option<RecordId>,
    /// Cancelled records still present in a tier.
    cancelled: HashSet<RecordId>,
    /// Records whose completion is being handled.
    settled: HashSet<RecordId>,
}

impl QueueState {
    fn is_live(&self, record_id: &RecordId) -> bool {
        !self.cancelled.contains(record_id) && !self.settled.contains(record_id)
    }

    fn contains(&self, record_id: &RecordId) -> bool {
        self.is_live(record_id)
            && (self.durable.iter().any(|r| &r.record_id == record_id)
                || self
                    .in_session
                    .iter()
                    .any(|e| &e.record.record_id == record_id))
    }

    fn pending(&self) -> usize {
        let durable = self
            .durable
            .iter()
            .filter(|r| self.is_live(&r.record_id))
            .count();
        let in_session = self
            .in_session
            .iter()
            .filter(|e| self.is_live(&e.record.record_id))
            .count();
        durable + in_session
    }

    /// Head of the durable tier, else head of the in-session tier.
    /// Dead heads are discarded on the way.
    fn next_job(&mut self) -> Option<(MutationRecord, Tier)> {
        while let Some(head) = self.durable.front() {
            if self.is_live(&head.record_id) {
                return Some((head.clone(), Tier::Durable));
            }
            if let Some(dead) = self.durable.pop_front() {
                self.cancelled.remove(&dead.record_id);
            }
        }
        while let Some(head) = self.in_session.front() {
            if self.is_live(&head.record.record_id) {
                let tier = if head.persisted {
                    Tier::InSession
                } else {
                    Tier::PassThrough
                };
                return Some((head.record.clone(), tier));
            }
            if let Some(dead) = self.in_session.pop_front() {
                self.cancelled.remove(&dead.record.record_id);
            }
        }
        None
    }

    /// Rewrite a queued request in place. Returns whether the record has a
    /// store row to update as well.
    fn replace_request(&mut self, record_id: &RecordId, serialized_request: &str, client_state: &str) -> bool {
        let durable = self.durable.iter_mut().map(|r| (r, true));
        let in_session = self.in_session.iter_mut().map(|e| (&mut e.record, e.persisted));
        let mut persisted = false;
        for (record, has_row) in durable.chain(in_session) {
            if &record.record_id == record_id {
                record.serialized_request = serialized_request.to_string();
                record.client_state = client_state.to_string();
                persisted |= has_row;
            }
        }
        persisted
    }

    /// Remove a settled record from both tiers, returning its callback.
    fn take_entry(&mut self, record_id: &RecordId) -> Option<MutationCallback> {
        self.durable.retain(|r| &r.record_id != record_id);
        let position = self
            .in_session
            .iter()
            .position(|e| &e.record.record_id == record_id)?;
        self.in_session.remove(position).map(|e| e.callback)
    }
}

struct QueueInner {
    store: Arc<dyn MutationStore>,
    collaborators: QueueCollaborators,
    resolver_timeout: Duration,
    max_conflict_retries: u32,
    state: Mutex<QueueState>,
    pending: watch::Sender<usize>,
    signals: mpsc::UnboundedSender<Signal>,
}

/// Offline-first mutation queue.
pub struct MutationQueue {
    inner: Arc<QueueInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl MutationQueue {
    /// Open the queue, loading the durable tier from `store`.
    ///
    /// # Preconditions
    /// - Called from within a tokio runtime.
    ///
    /// # Postconditions
    /// - The dispatcher task is running and, if `online`, already draining
    ///   the durable tier.
    ///
    /// # Errors
    /// - No tokio runtime is available.
    /// - The store cannot be read.
    pub fn open(
        store: Arc<dyn MutationStore>,
        collaborators: QueueCollaborators,
        config: &SyncConfig,
        online: bool,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::InvalidInput("Mutation queue must be opened inside a tokio runtime".to_string())
        })?;

        let durable: VecDeque<MutationRecord> = store.load_all()?.into();
        info!("Loaded {} durable mutations", durable.len());

        let state = QueueState {
            connected: online,
            durable,
            ..QueueState::default()
        };
        let (pending, _) = watch::channel(state.pending());
        let (signals, receiver) = mpsc::unbounded_channel();

        let inner = Arc::new(QueueInner {
            store,
            collaborators,
            resolver_timeout: config.resolver_timeout,
            max_conflict_retries: config.max_conflict_retries,
            state: Mutex::new(state),
            pending,
            signals,
        });

        let dispatcher = runtime.spawn(dispatch_loop(inner.clone(), receiver));
        inner.kick();

        Ok(Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Submit a mutation. `callback` runs exactly once with its outcome,
    /// unless the mutation is cancelled first.
    ///
    /// When the network is up and nothing is queued, the mutation goes to the
    /// dispatcher without touching the store; it is only persisted if its
    /// send is interrupted. Otherwise it is persisted and appended to the
    /// in-session tier. Either way it is sent by the dispatcher, one request
    /// at a time.
    ///
    /// # Errors
    /// - The request cannot be serialized.
    /// - The store rejects the record. The callback is then never invoked.
    pub fn submit<F>(&self, request: &MutationRequest, callback: F) -> Result<RecordId>
    where
        F: FnOnce(Result<MutationResponse>) + Send + 'static,
    {
        let record = request.to_record(RecordId::generate())?;
        let record_id = record.record_id.clone();
        let callback: MutationCallback = Box::new(callback);

        let queued = {
            let mut state = self.inner.lock();
            let pass_through = state.connected
                && !state.shutting_down
                && state.dispatch == DispatchState::Idle
                && state.in_flight.is_none()
                && state.pending() == 0;
            if pass_through {
                state.in_session.push_back(InSessionEntry {
                    record,
                    callback,
                    persisted: false,
                });
                self.inner.pending.send_replace(state.pending());
                None
            } else {
                Some((record, callback))
            }
        };

        match queued {
            None => {
                debug!("Sending {} without persisting it", record_id);
                self.inner.kick();
            }
            Some((record, callback)) => {
                self.inner.enqueue(record, callback)?;
                debug!("Queued {}", record_id);
            }
        }
        Ok(record_id)
    }

    /// Cancel a queued or in-flight mutation. Returns whether it was found.
    ///
    /// A queued record is removed from the store immediately. An in-flight
    /// call is allowed to finish, but its result is discarded and its store
    /// row removed when it completes.
    pub fn cancel(&self, record_id: &RecordId) -> bool {
        let queued = {
            let mut state = self.inner.lock();
            if !state.contains(record_id) {
                return false;
            }
            state.cancelled.insert(record_id.clone());
            self.inner.pending.send_replace(state.pending());
            state.in_flight.as_ref() != Some(record_id)
        };

        if queued {
            if let Err(e) = self.inner.store.remove(record_id) {
                warn!("Failed to remove cancelled mutation {}: {}", record_id, e);
            }
        }
        info!("Cancelled mutation {}", record_id);
        true
    }

    /// Whether both tiers are empty, ignoring cancelled records.
    pub fn is_empty(&self) -> bool {
        self.pending_count() == 0
    }

    /// Number of live records across both tiers.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending()
    }

    /// Current dispatcher state.
    pub fn dispatch_state(&self) -> DispatchState {
        self.inner.lock().dispatch
    }

    /// Drop every queued record from memory and from the store.
    ///
    /// An in-flight call finishes but its result is discarded. Callbacks of
    /// cleared records are never invoked.
    pub fn clear(&self) -> Result<()> {
        let cleared = {
            let mut state = self.inner.lock();
            let cleared = state.pending();
            state.durable.clear();
            state.in_session.clear();
            state.cancelled.clear();
            if let Some(in_flight) = state.in_flight.clone() {
                state.cancelled.insert(in_flight);
            }
            self.inner.pending.send_replace(0);
            cleared
        };
        self.inner.store.clear()?;
        info!("Cleared {} queued mutations", cleared);
        Ok(())
    }

    /// React to a connectivity transition.
    pub fn handle_connectivity(&self, event: ConnectivityEvent) {
        {
            let mut state = self.inner.lock();
            match event {
                ConnectivityEvent::BecameOnline => {
                    state.connected = true;
                    if state.dispatch == DispatchState::Paused {
                        info!("Connectivity restored, resuming mutation dispatch");
                        state.dispatch = DispatchState::Idle;
                    }
                }
                ConnectivityEvent::BecameOffline => {
                    debug!("Connectivity lost, mutation dispatch will stop");
                    state.connected = false;
                }
            }
        }
        self.inner.kick();
    }

    /// Wait until both tiers are empty.
    pub async fn drain(&self) {
        let mut pending = self.inner.pending.subscribe();
        loop {
            if *pending.borrow_and_update() == 0 {
                return;
            }
            if pending.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the dispatcher after the current record, if any, completes.
    ///
    /// Unsent records that were never persisted are written to the store so
    /// the next queue opened on it replays them.
    pub async fn shutdown(&self) {
        self.inner.lock().shutting_down = true;
        let _ = self.inner.signals.send(Signal::Shutdown);

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                error!("Mutation dispatcher ended abnormally: {}", e);
            }
        }

        let mut state = self.inner.lock();
        if let Err(e) = self.inner.persist_unsent(&mut state) {
            warn!("Failed to persist unsent mutations: {}", e);
        }
    }
}

impl Drop for MutationQueue {
    fn drop(&mut self) {
        let _ = self.inner.signals.send(Signal::Shutdown);
    }
}

async fn dispatch_loop(inner: Arc<QueueInner>, mut signals: mpsc::UnboundedReceiver<Signal>) {
    debug!("Mutation dispatcher started");
    while let Some(signal) = signals.recv().await {
        match signal {
            Signal::Kick => inner.pump().await,
            Signal::Shutdown => break,
        }
    }
    debug!("Mutation dispatcher stopped");
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kick(&self) {
        let _ = self.signals.send(Signal::Kick);
    }

    fn publish(&self) {
        let pending = self.lock().pending();
        self.pending.send_replace(pending);
    }

    /// Write in-session records that have no store row yet, in queue order.
    /// Runs under the state lock so each record is written exactly once and
    /// store order stays submission order.
    fn persist_unsent(&self, state: &mut QueueState) -> Result<()> {
        let QueueState {
            in_session,
            cancelled,
            settled,
            ..
        } = state;
        for entry in in_session.iter_mut().filter(|e| !e.persisted) {
            let record_id = &entry.record.record_id;
            if cancelled.contains(record_id) || settled.contains(record_id) {
                continue;
            }
            self.store.insert(&entry.record)?;
            entry.persisted = true;
        }
        Ok(())
    }

    fn enqueue(&self, record: MutationRecord, callback: MutationCallback) -> Result<()> {
        {
            let mut state = self.lock();
            self.persist_unsent(&mut state)?;
            self.store.insert(&record)?;
            state.in_session.push_back(InSessionEntry {
                record,
                callback,
                persisted: true,
            });
            self.pending.send_replace(state.pending());
        }
        self.kick();
        Ok(())
    }

    /// Send records one at a time until the tiers are empty, the network is
    /// down, or a transient failure pauses dispatch.
    async fn pump(&self) {
        loop {
            let (record, tier) = {
                let mut state = self.lock();
                if state.shutting_down
                    || !state.connected
                    || state.dispatch != DispatchState::Idle
                {
                    return;
                }
                let Some((record, tier)) = state.next_job() else {
                    return;
                };
                state.dispatch = DispatchState::InFlight;
                state.in_flight = Some(record.record_id.clone());
                (record, tier)
            };

            debug!("Dispatching {} from {:?} tier", record.record_id, tier);
            let result = self.execute(record.clone()).await;
            self.finish(&record, result).await;
        }
    }

    /// Upload, send, and run conflict resolution for one record.
    ///
    /// A failure that never reached the server comes back as a transient
    /// error.
    async fn execute(&self, mut record: MutationRecord) -> Result<MutationResponse> {
        if let Some(attachment) = &record.attachment {
            let Some(uploader) = &self.collaborators.uploader else {
                return Err(Error::Upload("No attachment uploader configured".to_string()));
            };
            match uploader.upload(attachment).await {
                UploadOutcome::Uploaded => debug!("Uploaded attachment for {}", record.record_id),
                UploadOutcome::Rejected(reason) => return Err(Error::Upload(reason)),
                UploadOutcome::Transient(reason) => return Err(Error::Network(reason)),
            }
        }

        let mut conflicts = 0;
        loop {
            let outcome = self
                .collaborators
                .transport
                .send_mutation(&record.serialized_request)
                .await;

            let server_state = match outcome {
                MutationOutcome::Success(payload) => {
                    return Ok(MutationResponse {
                        record_id: record.record_id.clone(),
                        response_type_tag: record.response_type_tag.clone(),
                        payload,
                    })
                }
                MutationOutcome::Rejected(reason) => return Err(Error::Rejected(reason)),
                MutationOutcome::Transient(reason) => return Err(Error::Network(reason)),
                MutationOutcome::ConditionalFailure(server_state) => server_state,
            };

            let conflict_error = || Error::Conflict(format!("{} (server state: {})", record.record_id, server_state));
            let Some(resolver) = &self.collaborators.resolver else {
                return Err(conflict_error());
            };
            if conflicts >= self.max_conflict_retries || self.is_cancelled(&record.record_id) {
                return Err(conflict_error());
            }
            conflicts += 1;

            let envelope = ConflictEnvelope::new(&record, server_state.clone());
            info!("Conflict on {}, invoking resolver", record.record_id);
            let request = match run_resolver(resolver.clone(), envelope, self.resolver_timeout).await {
                Resolution::Fail => return Err(conflict_error()),
                Resolution::Retry(request) => request,
            };

            let replacement = request.to_record(record.record_id.clone())?;
            record.serialized_request = replacement.serialized_request;
            record.client_state = replacement.client_state;

            {
                let mut state = self.lock();
                let persisted = state.replace_request(
                    &record.record_id,
                    &record.serialized_request,
                    &record.client_state,
                );
                if persisted {
                    if let Err(e) = self.store.update_request(
                        &record.record_id,
                        &record.serialized_request,
                        &record.client_state,
                    ) {
                        warn!("Failed to persist resolved request for {}: {}", record.record_id, e);
                    }
                }
            }
        }
    }

    fn is_cancelled(&self, record_id: &RecordId) -> bool {
        self.lock().cancelled.contains(record_id)
    }

    async fn finish(&self, record: &MutationRecord, result: Result<MutationResponse>) {
        let record_id = &record.record_id;
        let result = match result {
            Err(e) if e.is_transient() => match self.hold(record_id, &e) {
                Ok(true) => return,
                Ok(false) => Err(Error::Cancelled(record_id.to_string())),
                Err(store_error) => Err(store_error),
            },
            result => result,
        };

        let (callback, suppressed) = {
            let mut state = self.lock();
            state.in_flight = None;
            state.dispatch = DispatchState::Idle;
            state.settled.insert(record_id.clone());
            let callback = state.take_entry(record_id);
            (callback, state.cancelled.remove(record_id))
        };

        if let Err(e) = self.store.remove(record_id) {
            warn!("Failed to remove completed mutation {}: {}", record_id, e);
        }

        if suppressed {
            debug!("Discarding result of cancelled mutation {}", record_id);
        } else {
            self.deliver(record, result, callback).await;
        }
        self.lock().settled.remove(record_id);
        self.publish();
    }

    /// Keep an interrupted record at the head of its tier and pause dispatch
    /// until the next online edge. A pass-through record is persisted first.
    /// Returns false when the record was cancelled while it was on the wire.
    ///
    /// # Errors
    /// - The pass-through record cannot be persisted.
    fn hold(&self, record_id: &RecordId, reason: &Error) -> Result<bool> {
        let mut state = self.lock();
        if state.cancelled.contains(record_id) {
            return Ok(false);
        }
        self.persist_unsent(&mut state)?;
        state.in_flight = None;
        state.dispatch = DispatchState::Paused;
        info!("Mutation {} paused until connectivity returns: {}", record_id, reason);
        Ok(true)
    }

    /// Route a result to its live callback, or to the persistent listener.
    async fn deliver(
        &self,
        record: &MutationRecord,
        result: Result<MutationResponse>,
        callback: Option<MutationCallback>,
    ) {
        match &result {
            Ok(_) => info!("Mutation {} succeeded", record.record_id),
            Err(e) => warn!("Mutation {} failed: {}", record.record_id, e),
        }

        if let Some(callback) = callback {
            if let (Ok(response), Some(cache)) = (&result, &self.collaborators.cache) {
                if let Err(e) = cache.apply(response).await {
                    warn!("Failed to update response cache for {}: {}", record.record_id, e);
                }
            }
            deliver_to_callback(callback, result);
            return;
        }

        match (&self.collaborators.listener, &result) {
            (Some(listener), Ok(response)) => listener.on_response(response),
            (Some(listener), Err(e)) => {
                listener.on_failure(&record.record_id, &record.response_type_tag, e)
            }
            (None, _) => debug!("No listener for durable mutation {}", record.record_id),
        }
    }
}

fn deliver_to_callback(callback: MutationCallback, result: Result<MutationResponse>) {
    if catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
        error!("Mutation callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictHandle, FnResolver};
    use crate::testing::{eventually, update, Completions, FakeTransport, RecordingListener, ScriptedUploader};
    use async_trait::async_trait;
    use serde_json::json;
    use tether_store::{Attachment, MemoryStore, SqliteStore};

    fn open(
        store: Arc<dyn MutationStore>,
        collaborators: QueueCollaborators,
        online: bool,
    ) -> MutationQueue {
        MutationQueue::open(store, collaborators, &SyncConfig::default(), online).unwrap()
    }

    fn go_online(queue: &MutationQueue) {
        queue.handle_connectivity(ConnectivityEvent::BecameOnline);
    }

    #[tokio::test]
    async fn test_fifo_order_within_session() {
        let transport = FakeTransport::new();
        let queue = open(
            Arc::new(MemoryStore::new()),
            QueueCollaborators::new(transport.clone()),
            false,
        );
        let done = Completions::default();

        for title in ["a", "b", "c"] {
            queue.submit(&update(title), done.callback(title)).unwrap();
        }
        assert_eq!(queue.pending_count(), 3);
        assert!(transport.sent_titles().is_empty());

        go_online(&queue);
        queue.drain().await;

        assert_eq!(transport.sent_titles(), vec!["a", "b", "c"]);
        eventually("all callbacks", || done.len() == 3).await;
        assert_eq!(done.labels(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_durable_tier_goes_first() {
        let store = MemoryStore::new();
        store
            .insert(&update("old").to_record(RecordId::generate()).unwrap())
            .unwrap();

        let transport = FakeTransport::new();
        let listener = Arc::new(RecordingListener::default());
        let queue = open(
            Arc::new(store.clone()),
            QueueCollaborators::new(transport.clone()).with_listener(listener.clone()),
            false,
        );
        let done = Completions::default();
        queue.submit(&update("new"), done.callback("new")).unwrap();

        go_online(&queue);
        queue.drain().await;
        eventually("live callback", || done.len() == 1).await;

        assert_eq!(transport.sent_titles(), vec!["old", "new"]);
        assert_eq!(listener.response_tags(), vec!["UpdatePost"]);
        assert!(done.take("new").unwrap().is_ok());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pending_mutations_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        {
            let store = Arc::new(SqliteStore::open(&path).unwrap());
            let queue = open(store, QueueCollaborators::new(FakeTransport::new()), false);
            let done = Completions::default();
            queue.submit(&update("first"), done.callback("first")).unwrap();
            queue.submit(&update("second"), done.callback("second")).unwrap();
            queue.shutdown().await;
            assert!(done.is_empty());
        }

        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let transport = FakeTransport::new();
        let listener = Arc::new(RecordingListener::default());
        let queue = open(
            store.clone(),
            QueueCollaborators::new(transport.clone()).with_listener(listener.clone()),
            true,
        );
        queue.drain().await;
        eventually("listener", || listener.response_tags().len() == 2).await;

        assert_eq!(transport.sent_titles(), vec!["first", "second"]);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let transport = FakeTransport::new();
        transport.set_mutation_delay(Duration::from_millis(10));
        let queue = open(
            Arc::new(MemoryStore::new()),
            QueueCollaborators::new(transport.clone()),
            false,
        );
        let done = Completions::default();
        for i in 0..5 {
            let title = format!("m{}", i);
            queue.submit(&update(&title), done.callback(&title)).unwrap();
        }

        go_online(&queue);
        queue.drain().await;

        assert_eq!(transport.sent_titles().len(), 5);
        assert_eq!(transport.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_pass_through_when_online_and_empty() {
        let transport = FakeTransport::new();
        let store = MemoryStore::new();
        let queue = open(
            Arc::new(store.clone()),
            QueueCollaborators::new(transport.clone()),
            true,
        );
        let done = Completions::default();

        queue.submit(&update("direct"), done.callback("direct")).unwrap();
        eventually("direct callback", || done.len() == 1).await;

        let response = done.take("direct").unwrap().unwrap();
        assert_eq!(response.payload["echo"]["title"], "direct");
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_online_submissions_are_single_flight() {
        let transport = FakeTransport::new();
        transport.set_mutation_delay(Duration::from_millis(50));
        let store = MemoryStore::new();
        let queue = open(
            Arc::new(store.clone()),
            QueueCollaborators::new(transport.clone()),
            true,
        );
        let done = Completions::default();

        for title in ["a", "b", "c"] {
            queue.submit(&update(title), done.callback(title)).unwrap();
        }
        queue.drain().await;
        eventually("all callbacks", || done.len() == 3).await;

        assert_eq!(transport.max_concurrency(), 1);
        assert_eq!(transport.sent_titles(), vec!["a", "b", "c"]);
        assert_eq!(done.labels(), vec!["a", "b", "c"]);
        assert_eq!(store.count().unwrap(), 0);
        assert!(queue.inner.lock().settled.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_pass_through_keeps_its_place() {
        let transport = FakeTransport::new();
        transport.set_mutation_delay(Duration::from_millis(30));
        transport.script_mutation(MutationOutcome::Transient("socket closed".to_string()));
        let store = MemoryStore::new();
        let queue = open(
            Arc::new(store.clone()),
            QueueCollaborators::new(transport.clone()),
            true,
        );
        let done = Completions::default();

        queue.submit(&update("a"), done.callback("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.submit(&update("b"), done.callback("b")).unwrap();

        eventually("pause", || queue.dispatch_state() == DispatchState::Paused).await;
        assert_eq!(store.count().unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.sent_titles(), vec!["a"]);
        assert!(done.is_empty());

        queue.handle_connectivity(ConnectivityEvent::BecameOffline);
        go_online(&queue);
        queue.drain().await;
        eventually("callbacks", || done.len() == 2).await;

        assert_eq!(transport.sent_titles(), vec!["a", "a", "b"]);
        assert_eq!(done.labels(), vec!["a", "b"]);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_persists_unsent_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let transport = FakeTransport::new();

        {
            let store = Arc::new(SqliteStore::open(&path).unwrap());
            let queue = open(store.clone(), QueueCollaborators::new(transport.clone()), true);
            queue.submit(&update("unsent"), |_| {}).unwrap();
            assert_eq!(store.count().unwrap(), 0);
            queue.shutdown().await;
        }

        assert!(transport.sent_titles().is_empty());
        let records = SqliteStore::open(&path).unwrap().load_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].response_type_tag, "UpdatePost");
        assert!(records[0].serialized_request.contains("unsent"));
    }

    #[tokio::test]
    async fn test_queued_behind_pass_through_keeps_store_order() {
        let transport = FakeTransport::new();
        transport.set_mutation_delay(Duration::from_millis(50));
        let store = MemoryStore::new();
        let queue = open(
            Arc::new(store.clone()),
            QueueCollaborators::new(transport.clone()),
            true,
        );

        let first = queue.submit(&update("a"), |_| {}).unwrap();
        let second = queue.submit(&update("b"), |_| {}).unwrap();

        let stored: Vec<RecordId> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|r| r.record_id)
            .collect();
        assert_eq!(stored, vec![first, second]);
        queue.drain().await;
        assert_eq!(store.count().unwrap(), 0);
    }

    fn retry_with_server_version() -> Arc<dyn ConflictResolver> {
        Arc::new(FnResolver::new(|conflict: ConflictEnvelope, handle: ConflictHandle| {
            let mut variables = conflict.client_state.clone();
            variables["expectedVersion"] = conflict.server_state["version"].clone();
            handle.retry(MutationRequest::new(
                update("resolved").operation.with_variables(variables),
            ));
        }))
    }

    #[tokio::test]
    async fn test_conflict_resolved_by_retry() {
        let transport = FakeTransport::new();
        transport.script_mutation(MutationOutcome::ConditionalFailure(json!({"version": 5})));
        let queue = open(
            Arc::new(MemoryStore::new()),
            QueueCollaborators::new(transport.clone()).with_resolver(retry_with_server_version()),
            false,
        );
        let done = Completions::default();
        let id = queue.submit(&update("post"), done.callback("post")).unwrap();

        go_online(&queue);
        queue.drain().await;
        eventually("callback", || done.len() == 1).await;

        let response = done.take("post").unwrap().unwrap();
        assert_eq!(response.record_id, id);
        let sent = transport.sent_bodies();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1]["variables"]["expectedVersion"], 5);
        assert_eq!(sent[1]["variables"]["title"], "post");
    }

    #[tokio::test]
    async fn test_conflict_without_resolver_fails() {
        let transport = FakeTransport::new();
        transport.script_mutation(MutationOutcome::ConditionalFailure(json!({"version": 2})));
        let queue = open(
            Arc::new(MemoryStore::new()),
            QueueCollaborators::new(transport.clone()),
            false,
        );
        let done = Completions::default();
        queue.submit(&update("post"), done.callback("post")).unwrap();

        go_online(&queue);
        queue.drain().await;
        eventually("callback", || done.len() == 1).await;
        assert!(matches!(done.take("post"), Some(Err(Error::Conflict(_)))));
    }

    #[tokio::test]
    async fn test_conflict_retry_limit() {
        let transport = FakeTransport::new();
        transport.script_mutation(MutationOutcome::ConditionalFailure(json!({"version": 5})));
        transport.script_mutation(MutationOutcome::ConditionalFailure(json!({"version": 6})));
        let queue = open(
            Arc::new(MemoryStore::new()),
            QueueCollaborators::new(transport.clone()).with_resolver(retry_with_server_version()),
            false,
        );
        let done = Completions::default();
        queue.submit(&update("post"), done.callback("post")).unwrap();

        go_online(&queue);
        queue.drain().await;
        eventually("callback", || done.len() == 1).await;

        assert!(matches!(done.take("post"), Some(Err(Error::Conflict(_)))));
        assert_eq!(transport.sent_bodies().len(), 2);
    }

    struct Silent;

    #[async_trait]
    impl ConflictResolver for Silent {
        async fn resolve(&self, _conflict: ConflictEnvelope, handle: ConflictHandle) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            handle.fail();
        }
    }

    #[tokio::test]
    async fn test_resolver_timeout_does_not_block_queue() {
        let transport = FakeTransport::new();
        transport.script_mutation(MutationOutcome::ConditionalFailure(json!({"version": 1})));
        let config = SyncConfig {
            resolver_timeout: Duration::from_millis(50),
            ..SyncConfig::default()
        };
        let queue = MutationQueue::open(
            Arc::new(MemoryStore::new()),
            QueueCollaborators::new(transport.clone()).with_resolver(Arc::new(Silent)),
            &config,
            false,
        )
        .unwrap();
        let done = Completions::default();
        queue.submit(&update("stuck"), done.callback("stuck")).unwrap();
        queue.submit(&update("next"), done.callback("next")).unwrap();

        go_online(&queue);
        queue.drain().await;
        eventually("both callbacks", || done.len() == 2).await;

        assert!(matches!(done.take("stuck"), Some(Err(Error::Conflict(_)))));
        assert!(done.take("next").unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_queued_mutation() {
        let transport = FakeTransport::new();
        let store = MemoryStore::new();
        let queue = open(
            Arc::new(store.clone()),
            QueueCollaborators::new(transport.clone()),
            false,
        );
        let done = Completions::default();
        let first = queue.submit(&update("a"), done.callback("a")).unwrap();
        queue.submit(&update("b"), done.callback("b")).unwrap();

        assert!(queue.cancel(&first));
        assert!(!queue.cancel(&first));
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(queue.pending_count(), 1);

        go_online(&queue);
        queue.drain().await;
        eventually("callback", || done.len() == 1).await;

        assert_eq!(transport.sent_titles(), vec!["b"]);
        assert_eq!(done.labels(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_suppresses_result() {
        let transport = FakeTransport::new();
        transport.set_mutation_delay(Duration::from_millis(100));
        let store = MemoryStore::new();
        let queue = open(
            Arc::new(store.clone()),
            QueueCollaborators::new(transport.clone()),
            false,
        );
        let done = Completions::default();
        let id = queue.submit(&update("slow"), done.callback("slow")).unwrap();

        go_online(&queue);
        eventually("in flight", || queue.dispatch_state() == DispatchState::InFlight).await;
        assert!(queue.cancel(&id));
        assert!(queue.is_empty());

        eventually("row removed", || store.count().unwrap() == 0).await;
        eventually("idle", || queue.dispatch_state() == DispatchState::Idle).await;
        assert_eq!(transport.sent_titles(), vec!["slow"]);
        assert!(done.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_pauses_until_online_edge() {
        let transport = FakeTransport::new();
        transport.script_mutation(MutationOutcome::Transient("timeout".to_string()));
        let store = MemoryStore::new();
        let queue = open(
            Arc::new(store.clone()),
            QueueCollaborators::new(transport.clone()),
            false,
        );
        let done = Completions::default();
        queue.submit(&update("a"), done.callback("a")).unwrap();
        queue.submit(&update("b"), done.callback("b")).unwrap();

        go_online(&queue);
        eventually("pause", || queue.dispatch_state() == DispatchState::Paused).await;
        assert_eq!(transport.sent_titles(), vec!["a"]);
        assert_eq!(store.count().unwrap(), 2);

        queue.handle_connectivity(ConnectivityEvent::BecameOffline);
        go_online(&queue);
        queue.drain().await;
        eventually("callbacks", || done.len() == 2).await;

        assert_eq!(transport.sent_titles(), vec!["a", "a", "b"]);
        assert_eq!(done.labels(), vec!["a", "b"]);
    }

    fn photo() -> Attachment {
        Attachment {
            bucket: "media".to_string(),
            key: "photos/1.jpg".to_string(),
            region: "eu-west-1".to_string(),
            local_path: "/tmp/1.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rejected_upload_fails_mutation() {
        let transport = FakeTransport::new();
        let uploader = Arc::new(ScriptedUploader::default());
        uploader.script(UploadOutcome::Rejected("access denied".to_string()));
        let queue = open(
            Arc::new(MemoryStore::new()),
            QueueCollaborators::new(transport.clone()).with_uploader(uploader.clone()),
            false,
        );
        let done = Completions::default();
        queue
            .submit(&update("pic").with_attachment(photo()), done.callback("pic"))
            .unwrap();

        go_online(&queue);
        queue.drain().await;
        eventually("callback", || done.len() == 1).await;

        assert!(matches!(done.take("pic"), Some(Err(Error::Upload(_)))));
        assert!(transport.sent_titles().is_empty());
    }

    #[tokio::test]
    async fn test_transient_upload_pauses() {
        let transport = FakeTransport::new();
        let uploader = Arc::new(ScriptedUploader::default());
        uploader.script(UploadOutcome::Transient("no route".to_string()));
        let queue = open(
            Arc::new(MemoryStore::new()),
            QueueCollaborators::new(transport.clone()).with_uploader(uploader.clone()),
            false,
        );
        let done = Completions::default();
        queue
            .submit(&update("pic").with_attachment(photo()), done.callback("pic"))
            .unwrap();

        go_online(&queue);
        eventually("pause", || queue.dispatch_state() == DispatchState::Paused).await;
        assert!(transport.sent_titles().is_empty());

        queue.handle_connectivity(ConnectivityEvent::BecameOffline);
        go_online(&queue);
        queue.drain().await;
        eventually("callback", || done.len() == 1).await;

        assert!(done.take("pic").unwrap().is_ok());
        assert_eq!(uploader.upload_count(), 2);
    }

    #[tokio::test]
    async fn test_durable_failure_goes_to_listener() {
        let store = MemoryStore::new();
        let record = update("old").to_record(RecordId::generate()).unwrap();
        store.insert(&record).unwrap();

        let transport = FakeTransport::new();
        transport.script_mutation(MutationOutcome::Rejected("validation".to_string()));
        let listener = Arc::new(RecordingListener::default());
        let queue = open(
            Arc::new(store),
            QueueCollaborators::new(transport).with_listener(listener.clone()),
            true,
        );
        queue.drain().await;
        eventually("failure", || listener.failure_count() == 1).await;

        let failures = listener.failures();
        assert_eq!(failures[0].0, record.record_id);
        assert_eq!(failures[0].1, "UpdatePost");
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let store = MemoryStore::new();
        let queue = open(
            Arc::new(store.clone()),
            QueueCollaborators::new(FakeTransport::new()),
            false,
        );
        let done = Completions::default();
        queue.submit(&update("a"), done.callback("a")).unwrap();
        queue.submit(&update("b"), done.callback("b")).unwrap();

        queue.clear().unwrap();

        assert!(queue.is_empty());
        assert_eq!(store.count().unwrap(), 0);
        queue.drain().await;
    }
}
