//! Edge-triggered connectivity and lifecycle monitors.
//!
//! Hosts report the current level (online or not, foreground or not) as often
//! as they like. Subscribers only hear about transitions.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_BUFFER: usize = 16;

/// An event emitted when a boolean level changes.
pub trait Edge: Clone + fmt::Debug + Send + 'static {
    /// Event for a false-to-true transition.
    fn rising() -> Self;
    /// Event for a true-to-false transition.
    fn falling() -> Self;
}

/// Network connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOnline,
    BecameOffline,
}

impl Edge for ConnectivityEvent {
    fn rising() -> Self {
        Self::BecameOnline
    }

    fn falling() -> Self {
        Self::BecameOffline
    }
}

/// Application lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    EnteredForeground,
    EnteredBackground,
}

impl Edge for LifecycleEvent {
    fn rising() -> Self {
        Self::EnteredForeground
    }

    fn falling() -> Self {
        Self::EnteredBackground
    }
}

/// Turns level reports into edge events on a broadcast channel.
pub struct EdgeDetector<E: Edge> {
    level: Mutex<bool>,
    events: broadcast::Sender<E>,
}

/// Reports network reachability.
pub type ConnectivityMonitor = EdgeDetector<ConnectivityEvent>;

/// Reports foreground and background transitions.
pub type LifecycleMonitor = EdgeDetector<LifecycleEvent>;

impl<E: Edge> EdgeDetector<E> {
    /// Create a detector starting at the given level.
    pub fn new(initial: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            level: Mutex::new(initial),
            events,
        }
    }

    /// Report the current level. Returns the emitted event, if the level changed.
    pub fn report(&self, level: bool) -> Option<E> {
        let mut current = self.level.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == level {
            return None;
        }
        *current = level;

        let event = if level { E::rising() } else { E::falling() };
        debug!("Edge detected: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// Current level.
    pub fn level(&self) -> bool {
        *self.level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to future transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.events.subscribe()
    }
}

impl<E: Edge> fmt::Debug for EdgeDetector<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeDetector")
            .field("level", &self.level())
            .finish()
    }
}
