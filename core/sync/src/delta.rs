//! Delta sync sessions.
//!
//! A session keeps a local view current with up to three operations: a
//! baseline query returning the full view, an optional subscription pushing
//! live changes, and an optional delta query returning changes since a
//! timestamp. Each run answers from cache first, makes sure the subscription
//! is open, then asks the network for either a fresh baseline or a delta.
//! Subscription messages that arrive while a run is in progress are buffered
//! and delivered after the run's result, so the application never applies a
//! live change on top of a stale baseline.
//!
//! Each session runs on its own task and is driven by commands: run requests
//! from the retry timer, the refresh timer, connectivity and lifecycle edges,
//! and explicit refreshes.

use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use tether_common::{Error, Result, SessionKey};
use tether_store::SessionStore;

use crate::config::SyncConfig;
use crate::retry::RetryConfig;
use crate::scheduler::TimerSlot;
use crate::signals::{ConnectivityEvent, LifecycleEvent};
use crate::transport::{FetchPolicy, MessageStream, Operation, Transport};

/// Receives baseline or delta query results.
pub type QueryCallback = Arc<dyn Fn(Result<Value>) + Send + Sync>;

/// Receives subscription events.
pub type SubscriptionCallback = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// Event delivered to a subscription callback.
#[derive(Debug)]
pub enum SubscriptionEvent {
    Message(Value),
    Failed(Error),
    /// The subscription ended because the session was cancelled.
    Completed,
}

/// A delta query and the name of its "changes since" variable.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaQuery {
    operation: Operation,
    since_parameter: String,
}

impl DeltaQuery {
    pub fn new(operation: Operation, since_parameter: impl Into<String>) -> Self {
        Self {
            operation,
            since_parameter: since_parameter.into(),
        }
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// The query asking for changes since `since_millis`.
    ///
    /// The timestamp is sent as a decimal string.
    pub fn at(&self, since_millis: i64) -> Operation {
        let mut operation = self.operation.clone();
        operation.set_variable(&self.since_parameter, Value::String(since_millis.to_string()));
        operation
    }
}

/// Everything needed to start a delta sync session.
pub struct DeltaSyncRequest {
    baseline: Operation,
    on_baseline: QueryCallback,
    subscription: Option<(Operation, SubscriptionCallback)>,
    delta: Option<(DeltaQuery, QueryCallback)>,
    refresh_interval: Duration,
}

impl DeltaSyncRequest {
    /// A session that runs `baseline` and reports its results to `on_baseline`.
    pub fn new<F>(baseline: Operation, on_baseline: F) -> Self
    where
        F: Fn(Result<Value>) + Send + Sync + 'static,
    {
        Self {
            baseline,
            on_baseline: Arc::new(on_baseline),
            subscription: None,
            delta: None,
            refresh_interval: Duration::ZERO,
        }
    }

    pub fn with_subscription<F>(mut self, subscription: Operation, on_event: F) -> Self
    where
        F: Fn(SubscriptionEvent) + Send + Sync + 'static,
    {
        self.subscription = Some((subscription, Arc::new(on_event)));
        self
    }

    pub fn with_delta_query<F>(mut self, delta: DeltaQuery, on_delta: F) -> Self
    where
        F: Fn(Result<Value>) + Send + Sync + 'static,
    {
        self.delta = Some((delta, Arc::new(on_delta)));
        self
    }

    /// How old the last run may be before the baseline is fetched again
    /// instead of a delta. Zero disables periodic refresh.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Key identifying this combination of operations in the session store.
    pub fn session_key(&self) -> SessionKey {
        let subscription = self.subscription.as_ref().map(|(op, _)| op.identity());
        let delta = self.delta.as_ref().map(|(query, _)| query.operation.identity());
        SessionKey::compose(
            &self.baseline.identity(),
            subscription.as_deref(),
            delta.as_deref(),
        )
    }
}

impl fmt::Debug for DeltaSyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaSyncRequest")
            .field("baseline", &self.baseline.name)
            .field("subscription", &self.subscription.as_ref().map(|(op, _)| &op.name))
            .field("delta", &self.delta.as_ref().map(|(q, _)| &q.operation.name))
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

/// Step of a run in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStep {
    CacheBaseline,
    Subscribing,
    NetworkBaseline,
    NetworkDelta,
    Flushing,
}

/// Observable state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initializing,
    Running(RunStep),
    /// Caught up; subscription messages are delivered as they arrive.
    Processing,
    /// The last run failed and a retry is scheduled.
    RetryBackoff,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageMode {
    Queuing,
    Processing,
}

#[derive(Debug)]
enum Command {
    Run { forced: bool },
    Resubscribe,
}

struct SessionState {
    row_id: Option<i64>,
    last_run_time_millis: i64,
    mode: MessageMode,
    pending_messages: VecDeque<Value>,
    retry_attempt: u32,
    phase: SessionPhase,
    subscription: Option<JoinHandle<()>>,
    subscription_open: bool,
    cancelled: bool,
}

struct Session {
    id: u64,
    key: SessionKey,
    request: DeltaSyncRequest,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    query_timeout: Duration,
    backoff: RetryConfig,
    controller: Weak<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    retry_timer: TimerSlot,
    refresh_timer: TimerSlot,
    state: Mutex<SessionState>,
    /// Serializes callback invocations.
    delivery: Mutex<()>,
}

#[derive(Debug, Clone, Copy)]
struct Signals {
    network_up: bool,
    foreground: bool,
}

struct Shared {
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    query_timeout: Duration,
    backoff: RetryConfig,
    signals: Mutex<Signals>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
    runtime: Handle,
}

impl Shared {
    fn signals(&self) -> MutexGuard<'_, Signals> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions().values().cloned().collect()
    }
}

/// Owns the registry of active delta sync sessions.
pub struct DeltaSyncController {
    shared: Arc<Shared>,
}

impl DeltaSyncController {
    /// Create a controller.
    ///
    /// # Errors
    /// - No tokio runtime is available.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::InvalidInput("Delta sync controller needs a tokio runtime".to_string())
        })?;

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                store,
                query_timeout: config.query_timeout,
                backoff: config.backoff.clone(),
                signals: Mutex::new(Signals {
                    network_up: config.initially_online,
                    foreground: config.initially_foreground,
                }),
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                runtime,
            }),
        })
    }

    /// Start a session and kick off its first run.
    pub fn start(&self, request: DeltaSyncRequest) -> DeltaSyncHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let key = request.session_key();
        let (commands, receiver) = mpsc::unbounded_channel();

        let session = Arc::new(Session {
            id,
            key,
            request,
            transport: self.shared.transport.clone(),
            store: self.shared.store.clone(),
            query_timeout: self.shared.query_timeout,
            backoff: self.shared.backoff.clone(),
            controller: Arc::downgrade(&self.shared),
            commands,
            cancel: CancellationToken::new(),
            retry_timer: TimerSlot::new(),
            refresh_timer: TimerSlot::new(),
            state: Mutex::new(SessionState {
                row_id: None,
                last_run_time_millis: 0,
                mode: MessageMode::Queuing,
                pending_messages: VecDeque::new(),
                retry_attempt: 0,
                phase: SessionPhase::Initializing,
                subscription: None,
                subscription_open: false,
                cancelled: false,
            }),
            delivery: Mutex::new(()),
        });

        self.shared.sessions().insert(id, session.clone());
        info!("Starting delta sync session {} ({})", id, session.key);

        self.shared
            .runtime
            .spawn(session_loop(session.clone(), receiver));
        session.request_run(false);

        DeltaSyncHandle { session }
    }

    /// React to a connectivity transition.
    ///
    /// Coming online re-runs every session once and cancels pending retries.
    /// Repeated online reports without an offline report in between are
    /// ignored.
    pub fn handle_connectivity(&self, event: ConnectivityEvent) {
        {
            let mut signals = self.shared.signals();
            match event {
                ConnectivityEvent::BecameOnline if signals.network_up => {
                    debug!("Ignoring duplicate online notification");
                    return;
                }
                ConnectivityEvent::BecameOnline => signals.network_up = true,
                ConnectivityEvent::BecameOffline => {
                    signals.network_up = false;
                    return;
                }
            }
        }
        self.rerun_all("network available");
    }

    /// React to a lifecycle transition.
    ///
    /// Returning to the foreground re-runs every session once, if the
    /// network is up.
    pub fn handle_lifecycle(&self, event: LifecycleEvent) {
        {
            let mut signals = self.shared.signals();
            match event {
                LifecycleEvent::EnteredForeground if signals.foreground => return,
                LifecycleEvent::EnteredForeground => {
                    signals.foreground = true;
                    if !signals.network_up {
                        return;
                    }
                }
                LifecycleEvent::EnteredBackground => {
                    signals.foreground = false;
                    return;
                }
            }
        }
        self.rerun_all("returned to foreground");
    }

    fn rerun_all(&self, reason: &str) {
        let sessions = self.shared.snapshot();
        info!("Re-running {} delta sync sessions: {}", sessions.len(), reason);
        for session in sessions {
            session.retry_timer.cancel();
            session.request_run(false);
        }
    }

    /// Number of sessions that have not been cancelled.
    pub fn active_sessions(&self) -> usize {
        self.shared.sessions().len()
    }

    /// Whether the controller currently believes the network is up.
    pub fn network_up(&self) -> bool {
        self.shared.signals().network_up
    }

    /// Cancel every session.
    pub fn cancel_all(&self) {
        for session in self.shared.snapshot() {
            session.cancel();
        }
    }
}

impl Drop for DeltaSyncController {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Handle to a running session.
#[derive(Clone)]
pub struct DeltaSyncHandle {
    session: Arc<Session>,
}

impl DeltaSyncHandle {
    pub fn id(&self) -> u64 {
        self.session.id
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session.key
    }

    /// Stop the session. Idempotent.
    ///
    /// Timers are cancelled, the subscription is closed and its callback
    /// receives [`SubscriptionEvent::Completed`]. A query already on the wire
    /// is not interrupted, but its result is discarded.
    pub fn cancel(&self) {
        self.session.cancel();
    }

    /// Re-run now, fetching the baseline regardless of the last run time.
    pub fn force_refresh(&self) {
        self.session.retry_timer.cancel();
        self.session.request_run(true);
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.lock().phase
    }

    /// Start time of the last successful run, in milliseconds since the epoch.
    pub fn last_run_millis(&self) -> i64 {
        self.session.lock().last_run_time_millis
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.is_cancelled()
    }
}

impl fmt::Debug for DeltaSyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaSyncHandle")
            .field("id", &self.session.id)
            .field("key", &self.session.key)
            .field("phase", &self.phase())
            .finish()
    }
}

async fn session_loop(session: Arc<Session>, mut commands: mpsc::UnboundedReceiver<Command>) {
    loop {
        let command = tokio::select! {
            _ = session.cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::Run { mut forced } => {
                // A run reopens the subscription anyway, so queued requests
                // collapse into this one.
                while let Ok(queued) = commands.try_recv() {
                    if let Command::Run { forced: more } = queued {
                        forced |= more;
                    }
                }
                session.run(forced).await;
            }
            Command::Resubscribe => session.resubscribe().await,
        }
    }
    debug!("Delta sync session {} stopped", session.id);
}

async fn pump_subscription(session: Weak<Session>, mut stream: MessageStream, cancel: CancellationToken) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = stream.next() => item,
        };
        let Some(live) = session.upgrade() else {
            return;
        };
        match item {
            Some(Ok(message)) => live.on_message(message),
            Some(Err(e)) => {
                live.on_subscription_failed(e);
                return;
            }
            None => {
                live.on_subscription_closed();
                return;
            }
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn guarded(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("Delta sync callback panicked");
    }
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    fn set_phase(&self, phase: SessionPhase) {
        let mut state = self.lock();
        if !state.cancelled {
            state.phase = phase;
        }
    }

    fn network_up(&self) -> bool {
        self.controller
            .upgrade()
            .is_some_and(|controller| controller.signals().network_up)
    }

    fn request_run(&self, forced: bool) {
        if !self.is_cancelled() {
            let _ = self.commands.send(Command::Run { forced });
        }
    }

    async fn run(self: &Arc<Self>, forced: bool) {
        if self.is_cancelled() {
            return;
        }
        self.set_phase(SessionPhase::Initializing);

        if let Err(e) = self.load_row() {
            warn!("Delta sync session {} cannot load its record: {}", self.id, e);
            self.schedule_retry();
            return;
        }

        self.set_phase(SessionPhase::Running(RunStep::CacheBaseline));
        let cached = self.query(&self.request.baseline, FetchPolicy::CacheOnly).await;
        match cached {
            Ok(value) => self.deliver_query(&self.request.on_baseline, Ok(value)),
            Err(e) => return self.fail_run(&self.request.on_baseline, e),
        }

        if self.request.subscription.is_some() {
            self.set_phase(SessionPhase::Running(RunStep::Subscribing));
            self.lock().mode = MessageMode::Queuing;
            if let Err(e) = self.ensure_subscription().await {
                warn!("Delta sync session {} cannot subscribe: {}", self.id, e);
                self.deliver_subscription(SubscriptionEvent::Failed(e));
                self.schedule_retry();
                return;
            }
        }

        let started = now_millis();
        let last_run = self.lock().last_run_time_millis;
        let interval = i64::try_from(self.request.refresh_interval.as_millis()).unwrap_or(i64::MAX);
        let delta = self
            .request
            .delta
            .as_ref()
            .filter(|_| !forced && started.saturating_sub(last_run) < interval);

        let (result, callback, used_baseline) = match delta {
            Some((query, on_delta)) => {
                self.set_phase(SessionPhase::Running(RunStep::NetworkDelta));
                debug!("Session {} fetching changes since {}", self.id, last_run);
                let result = self.query(&query.at(last_run), FetchPolicy::NetworkOnly).await;
                (result, on_delta, false)
            }
            None => {
                self.set_phase(SessionPhase::Running(RunStep::NetworkBaseline));
                let result = self.query(&self.request.baseline, FetchPolicy::NetworkOnly).await;
                (result, &self.request.on_baseline, true)
            }
        };

        let value = match result {
            Ok(value) => value,
            Err(e) => return self.fail_run(callback, e),
        };
        if self.is_cancelled() {
            debug!("Discarding result for cancelled session {}", self.id);
            return;
        }

        self.set_phase(SessionPhase::Running(RunStep::Flushing));
        self.record_run(started);
        self.deliver_query(callback, Ok(value));
        self.flush();

        {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.retry_attempt = 0;
            state.phase = SessionPhase::Processing;
        }
        info!("Delta sync session {} caught up", self.id);

        if used_baseline && !self.request.refresh_interval.is_zero() {
            let session = Arc::downgrade(self);
            self.refresh_timer.schedule(self.request.refresh_interval, move || {
                if let Some(session) = session.upgrade() {
                    session.request_run(true);
                }
            });
        }
    }

    fn load_row(&self) -> Result<()> {
        if self.lock().row_id.is_some() {
            return Ok(());
        }
        let row = self.store.find_or_create(&self.key)?;
        debug!(
            "Session {} uses row {} (last run {})",
            self.id, row.id, row.last_run_time_millis
        );
        let mut state = self.lock();
        state.row_id = Some(row.id);
        state.last_run_time_millis = row.last_run_time_millis;
        Ok(())
    }

    fn record_run(&self, millis: i64) {
        let row_id = {
            let mut state = self.lock();
            state.last_run_time_millis = millis;
            state.row_id
        };
        if let Some(row_id) = row_id {
            if let Err(e) = self.store.update_last_run(row_id, millis) {
                warn!("Failed to persist last run for session {}: {}", self.id, e);
            }
        }
    }

    async fn query(&self, operation: &Operation, policy: FetchPolicy) -> Result<Value> {
        let call = self.transport.send_query(operation, policy);
        match tokio::time::timeout(self.query_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} ({:?}) did not answer within {:?}",
                operation.name, policy, self.query_timeout
            ))),
        }
    }

    fn fail_run(self: &Arc<Self>, callback: &QueryCallback, error: Error) {
        if self.is_cancelled() {
            return;
        }
        warn!("Delta sync session {} run failed: {}", self.id, error);
        self.deliver_query(callback, Err(error));
        self.schedule_retry();
    }

    fn schedule_retry(self: &Arc<Self>) {
        let attempt = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.phase = SessionPhase::RetryBackoff;
            let attempt = state.retry_attempt;
            state.retry_attempt = attempt.saturating_add(1);
            attempt
        };

        let delay = self.backoff.delay_for_attempt(attempt);
        info!("Delta sync session {} retrying in {:?}", self.id, delay);
        let session = Arc::downgrade(self);
        self.retry_timer.schedule(delay, move || {
            if let Some(session) = session.upgrade() {
                session.request_run(false);
            }
        });
    }

    async fn ensure_subscription(self: &Arc<Self>) -> Result<()> {
        let Some((operation, _)) = &self.request.subscription else {
            return Ok(());
        };
        if self.lock().subscription_open {
            return Ok(());
        }

        let stream = match tokio::time::timeout(
            self.query_timeout,
            self.transport.open_subscription(operation),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "Subscription {} did not open within {:?}",
                    operation.name, self.query_timeout
                )))
            }
        };

        let mut state = self.lock();
        if state.cancelled {
            return Ok(());
        }
        state.subscription_open = true;
        state.subscription = Some(tokio::spawn(pump_subscription(
            Arc::downgrade(self),
            stream,
            self.cancel.clone(),
        )));
        info!("Subscription {} open for session {}", operation.name, self.id);
        Ok(())
    }

    async fn resubscribe(self: &Arc<Self>) {
        if self.is_cancelled() {
            return;
        }
        if let Err(e) = self.ensure_subscription().await {
            warn!("Delta sync session {} cannot resubscribe: {}", self.id, e);
            self.deliver_subscription(SubscriptionEvent::Failed(e));
            self.schedule_retry();
        }
    }

    fn on_message(&self, message: Value) {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            if state.mode == MessageMode::Queuing {
                trace!("Session {} buffering subscription message", self.id);
                state.pending_messages.push_back(message);
                return;
            }
        }
        self.record_run(now_millis());
        self.call_subscription(SubscriptionEvent::Message(message));
    }

    fn on_subscription_closed(&self) {
        {
            let mut state = self.lock();
            state.subscription_open = false;
            state.subscription = None;
            if state.cancelled {
                return;
            }
        }
        info!("Subscription for session {} completed", self.id);
        if self.network_up() {
            let _ = self.commands.send(Command::Resubscribe);
        }
    }

    fn on_subscription_failed(self: &Arc<Self>, error: Error) {
        {
            let mut state = self.lock();
            state.subscription_open = false;
            state.subscription = None;
            if state.cancelled {
                return;
            }
        }
        warn!("Subscription for session {} failed: {}", self.id, error);
        self.deliver_subscription(SubscriptionEvent::Failed(error));
        self.schedule_retry();
    }

    /// Deliver buffered messages in arrival order, then switch to direct delivery.
    fn flush(&self) {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = std::mem::take(&mut self.lock().pending_messages);
        if !pending.is_empty() {
            debug!("Session {} flushing {} buffered messages", self.id, pending.len());
        }
        for message in pending {
            if self.is_cancelled() {
                return;
            }
            self.call_subscription(SubscriptionEvent::Message(message));
        }
        self.lock().mode = MessageMode::Processing;
    }

    fn deliver_query(&self, callback: &QueryCallback, result: Result<Value>) {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            return;
        }
        guarded(|| callback(result));
    }

    fn deliver_subscription(&self, event: SubscriptionEvent) {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            return;
        }
        self.call_subscription(event);
    }

    fn call_subscription(&self, event: SubscriptionEvent) {
        if let Some((_, callback)) = &self.request.subscription {
            guarded(|| callback(event));
        }
    }

    fn cancel(&self) {
        let (subscription, was_open) = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.phase = SessionPhase::Cancelled;
            state.pending_messages.clear();
            let was_open = std::mem::replace(&mut state.subscription_open, false);
            (state.subscription.take(), was_open)
        };

        self.cancel.cancel();
        self.retry_timer.cancel();
        self.refresh_timer.cancel();
        if let Some(task) = subscription {
            task.abort();
        }
        if let Some(controller) = self.controller.upgrade() {
            controller.sessions().remove(&self.id);
        }
        info!("Delta sync session {} cancelled", self.id);

        if was_open {
            self.call_subscription(SubscriptionEvent::Completed);
        }
    }
}
