#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tephra-engine** – The event dispatch engine of tephra.
//!
//! Every mutation enters through [`EventDb::dispatch`]: the event is
//! appended to the log, then a single cooperative worker runs it through the
//! preprocess → reduce → apply → derive pipeline across all registered
//! models, expanding dispatched sub-events depth-first, inside one
//! `BEGIN IMMEDIATE` transaction. The finished event - result, child
//! subtree, or error - is written back to its log row, and the caller's
//! future resolves.
//!
//! Rebuilding the database by replaying the log always reproduces the same
//! state: handlers only see the transaction, versions are dense, and replay
//! drops previously derived children before re-running the pipeline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use tephra_bus::SignalBus;
use tephra_store::connection::DEFAULT_BUSY_RETRIES;
use tephra_store::{meta, Connection, ConnectionOptions};

mod ctx;
mod model;
mod pipeline;
mod views;

pub use ctx::PhaseCtx;
pub use model::{CrudChange, Deriver, Model, Preprocessor, Reducer};
pub use pipeline::MAX_EVENT_DEPTH;
pub use views::{ReadStore, RwStore};

pub use tephra_bus::{DbSignal, InMemoryBus};
pub use tephra_store::{ColumnDef, EventQueue, MetaState, StoreError};
pub use tephra_types::{Event, EventDraft, EventError, Phase, Reduction, HANDLE_KEY};

use model::Registry;
use pipeline::EventTree;

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors surfaced by the dispatch engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The event reached its terminal-failure state; the carried event's
    /// `error` map names the failing phase and cause.
    #[error("event {} failed", .0.v)]
    Failed(Event),
    /// Storage-layer failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The event or draft was malformed.
    #[error(transparent)]
    Invalid(#[from] EventError),
    /// A model or column name is unusable as an identifier.
    #[error("invalid model name {0:?}")]
    BadModelName(String),
    /// Two models share a name.
    #[error("duplicate model {0:?}")]
    DuplicateModel(String),
    /// An operation referenced a model that was never registered.
    #[error("unknown model {0:?}")]
    UnknownModel(String),
    /// The engine's worker is gone; no more events will be processed.
    #[error("engine is closed")]
    Closed,
}

//─────────────────────────────
//  Options
//─────────────────────────────

/// Settings for an [`EventDb`].
#[derive(Debug, Clone)]
pub struct EventDbOptions {
    /// Database file path.
    pub path: PathBuf,
    /// Retry budget for busy write transactions.
    pub busy_retries: u32,
    /// Ring-buffer capacity of the signal bus.
    pub bus_capacity: usize,
    /// Suppress the engine's own error logging; failures still surface
    /// through event rows and rejected futures.
    pub quiet: bool,
    /// Open the database with incremental auto-vacuum.
    pub incremental_vacuum: bool,
}

impl EventDbOptions {
    /// Options with defaults for the given database file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_retries: DEFAULT_BUSY_RETRIES,
            bus_capacity: 1024,
            quiet: false,
            incremental_vacuum: false,
        }
    }
}

//─────────────────────────────
//  EventDb
//─────────────────────────────

type Outcome = Result<Event, Event>;

pub(crate) struct Inner {
    pub(crate) conn: Arc<Connection>,
    pub(crate) queue: EventQueue,
    registry: Arc<Registry>,
    bus: InMemoryBus,
    waiters: std::sync::Mutex<HashMap<i64, Vec<oneshot::Sender<Outcome>>>>,
    notify: Notify,
    quiet: bool,
}

/// An event-sourced document database.
///
/// Construction opens (or creates) the file, migrates the log, metadata and
/// model tables, and starts the dispatch worker. Dropping the handle stops
/// the worker; queued events stay in the log and are processed on the next
/// open.
pub struct EventDb {
    inner: Arc<Inner>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventDb {
    /// Open the database and register `models`.
    ///
    /// Model registration order is contractual: it is the order handlers run
    /// in within every phase and the order reductions are applied.
    pub async fn open(options: EventDbOptions, models: Vec<Model>) -> Result<Self, EngineError> {
        let registry = Arc::new(Registry::new(models)?);
        let bus = InMemoryBus::new(options.bus_capacity);

        let mut conn_options = ConnectionOptions::new(&options.path);
        conn_options.busy_retries = options.busy_retries;
        conn_options.incremental_vacuum = options.incremental_vacuum;
        let conn = Arc::new(Connection::new(conn_options, bus.clone()));

        let migrate_registry = registry.clone();
        conn.with_txn::<_, EngineError, _>(move |c| {
            Box::pin(async move {
                EventQueue::migrate(c).await?;
                meta::migrate(c).await?;
                for (name, model) in migrate_registry.iter() {
                    tephra_store::docs::migrate_model(c, name, model.columns()).await?;
                }
                Ok(())
            })
        })
        .await?;

        let inner = Arc::new(Inner {
            queue: EventQueue::new(conn.clone()),
            conn,
            registry,
            bus,
            waiters: std::sync::Mutex::new(HashMap::new()),
            notify: Notify::new(),
            quiet: options.quiet,
        });

        // Tail events left queued by a previous process are picked up
        // immediately.
        inner.notify.notify_one();
        let worker = tokio::spawn(worker_loop(inner.clone()));

        Ok(Self {
            inner,
            worker: std::sync::Mutex::new(Some(worker)),
        })
    }

    /// Append an event and wait for it to be handled.
    ///
    /// Concurrent dispatches are assigned sequential versions in call order.
    /// The future resolves with the handled event, or rejects with
    /// [`EngineError::Failed`] carrying the failed event. Abandoning the
    /// future does not cancel processing.
    pub async fn dispatch(
        &self,
        kind: impl Into<String>,
        data: Option<Value>,
        ts: Option<i64>,
    ) -> Result<Event, EngineError> {
        self.inner.dispatch(kind.into(), data, ts).await
    }

    /// Wait for the event at `v` to reach a terminal state.
    ///
    /// Resolves immediately when it already has.
    pub async fn handled_version(&self, v: i64) -> Result<Event, EngineError> {
        self.inner.handled_version(v).await
    }

    /// Handle on the underlying event queue.
    pub fn queue(&self) -> EventQueue {
        self.inner.queue.clone()
    }

    /// Upsert a full event row and wake the worker.
    ///
    /// Writing a row with a null `result` re-queues that version; any
    /// pre-existing `events` subtree is dropped and re-derived when the
    /// event is processed.
    pub async fn queue_set(&self, event: &Event) -> Result<(), EngineError> {
        event.validate()?;
        self.inner.queue.set(event).await?;
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Read-only view over all registered models, serving committed state.
    pub fn store(&self) -> ReadStore {
        ReadStore {
            inner: self.inner.clone(),
        }
    }

    /// Writable view of one model; writes are logged as system events.
    pub fn rw_store(&self, model: &str) -> Result<RwStore, EngineError> {
        self.inner.check_model(model)?;
        Ok(RwStore {
            inner: self.inner.clone(),
            model: model.to_string(),
        })
    }

    /// Subscribe to transaction lifecycle and dispatch outcome signals.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DbSignal> {
        self.inner.bus.subscribe()
    }

    /// Current bookkeeping state: version pointer and outcome counters.
    pub async fn stats(&self) -> Result<MetaState, EngineError> {
        let pool = self.inner.conn.readers().await?;
        Ok(meta::get_state(pool).await?)
    }

    /// The highest fully-processed version.
    pub async fn version(&self) -> Result<i64, EngineError> {
        Ok(self.stats().await?.v)
    }

    /// Stop the dispatch worker. Events queued afterwards are processed on
    /// the next open.
    pub async fn close(&self) {
        let handle = lock_ignore_poison(&self.worker).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for EventDb {
    fn drop(&mut self) {
        if let Some(handle) = lock_ignore_poison(&self.worker).take() {
            handle.abort();
        }
    }
}

//─────────────────────────────
//  Dispatch internals
//─────────────────────────────

impl Inner {
    async fn dispatch(
        &self,
        kind: String,
        data: Option<Value>,
        ts: Option<i64>,
    ) -> Result<Event, EngineError> {
        if kind.is_empty() {
            return Err(EventError::EmptyKind.into());
        }
        let queued = self.queue.add(&kind, data, ts).await?;
        debug!(v = queued.v, kind = %queued.kind, "dispatched event");
        self.notify.notify_one();
        self.handled_version(queued.v).await
    }

    async fn handled_version(&self, v: i64) -> Result<Event, EngineError> {
        let rx = {
            let (tx, rx) = oneshot::channel();
            lock_ignore_poison(&self.waiters).entry(v).or_default().push(tx);
            rx
        };
        // The worker may already have finished this version; settle from the
        // persisted row so the waiter above cannot hang.
        if let Some(outcome) = self.terminal_outcome(v).await? {
            self.settle(v, outcome);
        }
        match rx.await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(event)) => Err(EngineError::Failed(event)),
            Err(_) => Err(EngineError::Closed),
        }
    }

    async fn terminal_outcome(&self, v: i64) -> Result<Option<Outcome>, EngineError> {
        match self.queue.get(v).await? {
            Some(event) if event.is_handled() => Ok(Some(Ok(event))),
            Some(event) if event.is_failed() => Ok(Some(Err(event))),
            _ => Ok(None),
        }
    }

    fn settle(&self, v: i64, outcome: Outcome) {
        let senders = lock_ignore_poison(&self.waiters).remove(&v);
        if let Some(senders) = senders {
            for tx in senders {
                let _ = tx.send(outcome.clone());
            }
        }
    }

    pub(crate) fn check_model(&self, name: &str) -> Result<(), EngineError> {
        if self.registry.contains(name) {
            Ok(())
        } else {
            Err(EngineError::UnknownModel(name.to_string()))
        }
    }

    /// Process the next queued event, if any. `Ok(true)` means one event
    /// reached a terminal state and the worker should look again.
    async fn process_next(&self) -> Result<bool, EngineError> {
        let event = match self.queue.next_unhandled().await? {
            Some(event) => event,
            None => return Ok(false),
        };
        let v = event.v;
        match self.process_root(event).await {
            Ok(handled) => {
                let _ = self.bus.publish(&DbSignal::Result(handled.clone()));
                self.settle(v, Ok(handled));
            }
            Err(EngineError::Failed(failed)) => {
                if !self.quiet {
                    error!(v, error = ?failed.error, "event failed");
                }
                let _ = self.bus.publish(&DbSignal::Error(failed.clone()));
                self.settle(v, Err(failed));
            }
            Err(other) => return Err(other),
        }
        Ok(true)
    }

    /// Run one root event through the pipeline inside a write transaction.
    async fn process_root(&self, mut event: Event) -> Result<Event, EngineError> {
        // Replay determinism: children are re-derived, never inherited from
        // a previous run.
        event.events.clear();
        event.result = None;
        event.error = None;

        let fallback = event.clone();
        let registry = self.registry.clone();
        let outcome = self
            .conn
            .with_txn::<_, EngineError, _>(move |c| {
                Box::pin(async move {
                    let mut tree = EventTree::new(event);
                    tree.run(c, &registry).await;
                    let event = tree.into_event();
                    if event.is_failed() {
                        // Bubble the failed event out through the error arm
                        // so the transaction rolls back.
                        return Err(EngineError::Failed(event));
                    }
                    EventQueue::write_back(c, &event).await?;
                    Ok(event)
                })
            })
            .await;

        match outcome {
            Ok(event) => Ok(event),
            Err(EngineError::Failed(failed)) => {
                self.persist_failure(&failed).await?;
                Err(EngineError::Failed(failed))
            }
            Err(EngineError::Store(err)) => {
                // The transaction machinery itself gave out (busy budget
                // exhausted, I/O). Consume the version with a durable
                // `_handle` failure so the log stays dense.
                let mut failed = fallback;
                failed.add_error(HANDLE_KEY, json!(err.to_string()));
                self.persist_failure(&failed).await?;
                Err(EngineError::Failed(failed))
            }
            Err(other) => Err(other),
        }
    }

    /// Make a failure durable in its own micro-transaction: the event row
    /// gets its error map and the version pointer still advances.
    async fn persist_failure(&self, event: &Event) -> Result<(), EngineError> {
        let event = event.clone();
        self.conn
            .with_txn::<_, EngineError, _>(move |c| {
                Box::pin(async move {
                    EventQueue::write_back(c, &event).await?;
                    meta::advance(c, event.v, true).await?;
                    Ok(())
                })
            })
            .await
    }
}

async fn worker_loop(inner: Arc<Inner>) {
    loop {
        // Arm the wakeup before checking the queue so a dispatch landing
        // in between cannot be missed.
        let notified = inner.notify.notified();
        match inner.process_next().await {
            Ok(true) => continue,
            Ok(false) => notified.await,
            Err(err) => {
                if !inner.quiet {
                    error!(error = %err, "event worker stalled, backing off");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn lock_ignore_poison<'a, T>(mutex: &'a std::sync::Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
