//! Tether sync engine
//!
//! Offline-first synchronization for GraphQL clients, including:
//! - A durable, dual-tier mutation queue with a single-flight dispatcher
//! - Conflict handoff to application resolvers
//! - Delta sync sessions combining baseline, subscription and delta queries
//! - Edge-triggered connectivity and lifecycle monitors
//! - Exponential backoff for failed sync runs

pub mod config;
pub mod conflict;
pub mod delta;
pub mod engine;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod signals;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use config::SyncConfig;
pub use conflict::{
    classify_response, ConflictEnvelope, ConflictHandle, ConflictResolver, FnResolver, Resolution,
};
pub use delta::{
    DeltaQuery, DeltaSyncController, DeltaSyncHandle, DeltaSyncRequest, RunStep, SessionPhase,
    SubscriptionEvent,
};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use queue::{DispatchState, MutationQueue, QueueCollaborators};
pub use retry::RetryConfig;
pub use scheduler::TimerSlot;
pub use signals::{ConnectivityEvent, ConnectivityMonitor, LifecycleEvent, LifecycleMonitor};
pub use transport::{
    AttachmentUploader, FetchPolicy, MessageStream, MutationCallback, MutationOutcome,
    MutationRequest, MutationResponse, Operation, PersistentMutationListener, ResponseCache,
    Transport, UploadOutcome,
};
