//! Sync engine facade wiring the mutation queue, delta sync sessions and
//! the connectivity and lifecycle monitors together.

use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tether_common::{RecordId, Result};
use tether_store::{MutationStore, QueueStore, SessionStore};

use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::delta::{DeltaSyncController, DeltaSyncHandle, DeltaSyncRequest};
use crate::queue::{DispatchState, MutationQueue, QueueCollaborators};
use crate::signals::{ConnectivityEvent, ConnectivityMonitor, LifecycleEvent, LifecycleMonitor};
use crate::transport::{
    AttachmentUploader, MutationRequest, MutationResponse, PersistentMutationListener,
    ResponseCache, Transport,
};

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    mutation_store: Arc<dyn MutationStore>,
    session_store: Arc<dyn SessionStore>,
    collaborators: QueueCollaborators,
    config: SyncConfig,
}

impl SyncEngineBuilder {
    pub fn uploader(mut self, uploader: Arc<dyn AttachmentUploader>) -> Self {
        self.collaborators = self.collaborators.with_uploader(uploader);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.collaborators = self.collaborators.with_resolver(resolver);
        self
    }

    pub fn response_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.collaborators = self.collaborators.with_cache(cache);
        self
    }

    pub fn persistent_listener(mut self, listener: Arc<dyn PersistentMutationListener>) -> Self {
        self.collaborators = self.collaborators.with_listener(listener);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Open the queue, create the delta sync controller and start forwarding
    /// monitor events to both.
    ///
    /// # Errors
    /// - Called outside a tokio runtime.
    /// - The durable queue cannot be loaded.
    pub fn build(self) -> Result<SyncEngine> {
        let connectivity = Arc::new(ConnectivityMonitor::new(self.config.initially_online));
        let lifecycle = Arc::new(LifecycleMonitor::new(self.config.initially_foreground));

        let delta = Arc::new(DeltaSyncController::new(
            self.collaborators.transport.clone(),
            self.session_store,
            &self.config,
        )?);
        let queue = Arc::new(MutationQueue::open(
            self.mutation_store,
            self.collaborators,
            &self.config,
            connectivity.level(),
        )?);

        // Subscribe before returning so no report made after build() is missed
        let events = SignalEvents {
            connectivity: connectivity.subscribe(),
            lifecycle: lifecycle.subscribe(),
        };
        let forwarder = tokio::spawn(forward_signals(
            queue.clone(),
            delta.clone(),
            connectivity.clone(),
            lifecycle.clone(),
            events,
        ));

        info!("Sync engine started");
        Ok(SyncEngine {
            queue,
            delta,
            connectivity,
            lifecycle,
            forwarder,
        })
    }
}

/// Offline-first sync engine.
pub struct SyncEngine {
    queue: Arc<MutationQueue>,
    delta: Arc<DeltaSyncController>,
    connectivity: Arc<ConnectivityMonitor>,
    lifecycle: Arc<LifecycleMonitor>,
    forwarder: JoinHandle<()>,
}

impl SyncEngine {
    /// Start building an engine around a transport and a queue store.
    pub fn builder<S>(transport: Arc<dyn Transport>, store: Arc<S>) -> SyncEngineBuilder
    where
        S: QueueStore + 'static,
    {
        let mutation_store: Arc<dyn MutationStore> = store.clone();
        let session_store: Arc<dyn SessionStore> = store;
        SyncEngineBuilder {
            mutation_store,
            session_store,
            collaborators: QueueCollaborators::new(transport),
            config: SyncConfig::default(),
        }
    }

    /// Submit a mutation; see [`MutationQueue::submit`].
    pub fn submit_mutation<F>(&self, request: &MutationRequest, callback: F) -> Result<RecordId>
    where
        F: FnOnce(Result<MutationResponse>) + Send + 'static,
    {
        self.queue.submit(request, callback)
    }

    /// Cancel a queued or in-flight mutation.
    pub fn cancel_mutation(&self, record_id: &RecordId) -> bool {
        self.queue.cancel(record_id)
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.queue.dispatch_state()
    }

    /// Drop every queued mutation.
    pub fn clear_queue(&self) -> Result<()> {
        self.queue.clear()
    }

    /// Wait until the mutation queue is empty.
    pub async fn drain(&self) {
        self.queue.drain().await
    }

    /// Start a delta sync session.
    pub fn start_delta_sync(&self, request: DeltaSyncRequest) -> DeltaSyncHandle {
        self.delta.start(request)
    }

    pub fn active_delta_syncs(&self) -> usize {
        self.delta.active_sessions()
    }

    /// Report whether the network is reachable.
    pub fn report_connectivity(&self, online: bool) {
        self.connectivity.report(online);
    }

    /// Report whether the application is in the foreground.
    pub fn report_lifecycle(&self, foreground: bool) {
        self.lifecycle.report(foreground);
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn lifecycle(&self) -> &LifecycleMonitor {
        &self.lifecycle
    }

    /// Cancel every delta sync session and stop the dispatcher.
    ///
    /// Queued mutations stay in the store and are picked up by the next
    /// engine opened on it.
    pub async fn shutdown(&self) {
        info!("Sync engine shutting down");
        self.forwarder.abort();
        self.delta.cancel_all();
        self.queue.shutdown().await;
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

struct SignalEvents {
    connectivity: broadcast::Receiver<ConnectivityEvent>,
    lifecycle: broadcast::Receiver<LifecycleEvent>,
}

async fn forward_signals(
    queue: Arc<MutationQueue>,
    delta: Arc<DeltaSyncController>,
    connectivity: Arc<ConnectivityMonitor>,
    lifecycle: Arc<LifecycleMonitor>,
    events: SignalEvents,
) {
    let SignalEvents {
        connectivity: mut connectivity_events,
        lifecycle: mut lifecycle_events,
    } = events;

    loop {
        tokio::select! {
            event = connectivity_events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} connectivity events, resyncing", missed);
                        current_connectivity(&connectivity)
                    }
                    Err(RecvError::Closed) => break,
                };
                info!("Connectivity changed: {:?}", event);
                queue.handle_connectivity(event);
                delta.handle_connectivity(event);
            }
            event = lifecycle_events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} lifecycle events, resyncing", missed);
                        current_lifecycle(&lifecycle)
                    }
                    Err(RecvError::Closed) => break,
                };
                info!("Lifecycle changed: {:?}", event);
                delta.handle_lifecycle(event);
            }
        }
    }
}

fn current_connectivity(monitor: &ConnectivityMonitor) -> ConnectivityEvent {
    if monitor.level() {
        ConnectivityEvent::BecameOnline
    } else {
        ConnectivityEvent::BecameOffline
    }
}

fn current_lifecycle(monitor: &LifecycleMonitor) -> LifecycleEvent {
    if monitor.level() {
        LifecycleEvent::EnteredForeground
    } else {
        LifecycleEvent::EnteredBackground
    }
}
