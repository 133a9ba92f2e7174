//! Durable queue store for tether.
//!
//! This module persists pending mutations and delta sync session bookkeeping
//! so that queued work survives a process restart.
//!
//! # Design Principles
//! - Durability precedes liveness: a record is written here before any
//!   in-process representation of it exists
//! - Insertion order is the replay order
//! - Trait-based so tests and embedders can swap the backend

pub mod memory;
pub mod record;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use record::{Attachment, MutationRecord, SessionRow};
pub use sqlite::SqliteStore;
pub use store::{MutationStore, QueueStore, SessionStore};
