//! Common utilities and types shared across the tether crates.
//!
//! This module provides the error taxonomy and identifier types used by the
//! durable store, the mutation queue and the delta sync controller.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{RecordId, SessionKey};
