#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tephra-bus** – In-process signal bus for tephra.
//!
//! The engine and the SQL connection announce what they are doing through a
//! small set of typed signals: transaction lifecycle (`begin`, `end`,
//! `rollback`, `finally`) and per-event outcomes (`result`, `error`). The bus
//! is broadcast-only and lossy for lagging subscribers; it carries no
//! persistence or ordering guarantees beyond what the broadcast channel
//! provides.
//!
//! Listeners run on their own tasks and must not block the emitting side;
//! long work belongs in the listener, scheduled by the listener.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tephra_types::Event;

//─────────────────────────────
//  Signals
//─────────────────────────────

/// Typed signal emitted by the connection and the dispatch engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub enum DbSignal {
    /// A write transaction was opened.
    Begin,
    /// A write transaction committed.
    End,
    /// A write transaction rolled back.
    Rollback,
    /// A write transaction finished, either way. Always follows `End` or
    /// `Rollback`.
    Finally,
    /// A root event was handled successfully and its changes committed.
    Result(Event),
    /// A root event failed; its error row is durable.
    Error(Event),
}

//─────────────────────────────
//  Bus trait
//─────────────────────────────

/// Publish/subscribe surface for [`DbSignal`]s.
///
/// Implementations must be thread-safe and support multiple subscribers.
/// Publishing never blocks; slow subscribers may miss signals.
pub trait SignalBus: Send + Sync {
    /// Publish a signal to all current subscribers.
    fn publish(&self, signal: &DbSignal) -> Result<()>;

    /// Subscribe to the live signal stream.
    ///
    /// The receiver sees signals published after the subscription was
    /// created. Receivers that fall behind get a lag error and skip ahead.
    fn subscribe(&self) -> broadcast::Receiver<DbSignal>;
}

//─────────────────────────────
//  In-memory bus
//─────────────────────────────

/// Broadcast-only bus over a Tokio channel with a bounded ring buffer.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<DbSignal>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryBus {
    /// Create a bus whose ring buffer holds `capacity` signals for slow
    /// subscribers before older ones are dropped.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl SignalBus for InMemoryBus {
    fn publish(&self, signal: &DbSignal) -> Result<()> {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(signal.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DbSignal> {
        self.tx.subscribe()
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Signal could not be published.
    #[error("failed to publish signal: {0}")]
    PublishFailed(String),
    /// Subscription failed.
    #[error("failed to create subscription: {0}")]
    SubscriptionFailed(String),
}
