#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tephra-types** – Core event and reduction primitives for tephra.
//!
//! This crate defines the persisted event shape, the child-event drafts that
//! handlers dispatch, and the reduction records that reducers return. It sits
//! at the deterministic core layer and has no I/O concerns; the storage and
//! engine crates build on these types.
//!
//! Every mutation of a tephra database is derived from an [`Event`]. Events
//! carry a dense, monotonic version `v`; replaying the event log from an
//! empty database always reproduces the same state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

//─────────────────────────────
//  Event
//─────────────────────────────

/// A persisted unit of change in the event log.
///
/// Root events are allocated a unique, dense version `v` by the queue. Child
/// events produced while processing a root share the root's `v` and live in
/// the parent's `events` list, in depth-first dispatch order.
///
/// An event is **handled** once `result` is populated and `error` is empty;
/// handled events are never re-processed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonic version. Positive and dense for root events; children
    /// inherit their root's version.
    pub v: i64,
    /// Application-defined event type, e.g. `user.signup`. Never empty.
    #[serde(rename = "type")]
    pub kind: String,
    /// Wall-clock timestamp in epoch milliseconds, caller-supplied or
    /// assigned at enqueue time.
    pub ts: i64,
    /// Arbitrary document payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Model name → reduction output, populated after a successful apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    /// Child events produced during processing, in pre-order dispatch order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
    /// Failure causes keyed by phase (`_preprocess_<model>`, `_reduce_<model>`,
    /// `_apply_<model>`, `_derive_<model>`, `_handle`). Only set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Map<String, Value>>,
}

impl Event {
    /// Create a fresh, unprocessed event.
    pub fn new(v: i64, kind: impl Into<String>, data: Option<Value>, ts: i64) -> Self {
        Self {
            v,
            kind: kind.into(),
            ts,
            data,
            result: None,
            events: Vec::new(),
            error: None,
        }
    }

    /// Whether this event reached its terminal-success state.
    pub fn is_handled(&self) -> bool {
        self.result.is_some() && self.error.is_none()
    }

    /// Whether this event reached its terminal-failure state.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Record a failure cause under the given phase key.
    pub fn add_error(&mut self, key: impl Into<String>, cause: Value) {
        self.error
            .get_or_insert_with(Map::new)
            .insert(key.into(), cause);
    }

    /// Validate the invariants a queued event must satisfy.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.kind.is_empty() {
            return Err(EventError::EmptyKind);
        }
        if self.v <= 0 {
            return Err(EventError::BadVersion(self.v));
        }
        Ok(())
    }
}

//─────────────────────────────
//  Event drafts
//─────────────────────────────

/// What `dispatch` accepts: the caller-facing subset of an event.
///
/// Drafts are turned into full events by the engine - root drafts get a fresh
/// version from the queue, child drafts inherit their parent's version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventDraft {
    /// Application-defined event type. Never empty.
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary document payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Optional caller-supplied timestamp (epoch milliseconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl EventDraft {
    /// Draft with no payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            ts: None,
        }
    }

    /// Draft carrying a payload.
    pub fn with_data(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data: Some(data),
            ts: None,
        }
    }
}

//─────────────────────────────
//  Reductions
//─────────────────────────────

/// The state change a reducer describes for its model.
///
/// Reducers never write; they return a reduction and the engine applies it
/// inside the surrounding transaction, in the fixed order `rm`, `ins`, `set`,
/// `upd`. An absent list means "no change of that kind". The `events` list
/// appends further child events to the node being processed, after any
/// children the reducer dispatched inline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Reduction {
    /// Whole rows to upsert.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<Value>,
    /// Rows to insert; an existing id is an apply error.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ins: Vec<Value>,
    /// Partial updates, shallow-merged into the existing row by id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upd: Vec<Value>,
    /// Ids to delete.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rm: Vec<Value>,
    /// Child events to append to the current node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventDraft>,
}

impl Reduction {
    /// Reduction that upserts a single row.
    pub fn set_one(row: Value) -> Self {
        Self {
            set: vec![row],
            ..Self::default()
        }
    }

    /// The value stored under the model's key in `event.result`.
    ///
    /// Child events are part of the event tree, not of the reduction output,
    /// so the `events` list is stripped here.
    pub fn to_result_value(&self) -> Value {
        let mut stripped = self.clone();
        stripped.events = Vec::new();
        // Reduction serializes to a plain JSON object; this cannot fail.
        serde_json::to_value(&stripped).unwrap_or(Value::Null)
    }
}

//─────────────────────────────
//  Phase keys
//─────────────────────────────

/// The pipeline phase a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Event rewriting before reduction.
    Preprocess,
    /// Pure description of state changes.
    Reduce,
    /// Engine-side application of reductions.
    Apply,
    /// Post-apply reads, writes and follow-up dispatches.
    Derive,
}

impl Phase {
    /// The `event.error` key for a failure of this phase in the given model.
    pub fn error_key(self, model: &str) -> String {
        let tag = match self {
            Phase::Preprocess => "preprocess",
            Phase::Reduce => "reduce",
            Phase::Apply => "apply",
            Phase::Derive => "derive",
        };
        format!("_{tag}_{model}")
    }
}

/// The `event.error` key for engine-level failures (depth guard, transaction
/// retry exhaustion).
pub const HANDLE_KEY: &str = "_handle";

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Validation failures for events and drafts.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EventError {
    /// The event type is missing or empty.
    #[error("event type must be a non-empty string")]
    EmptyKind,
    /// The event version is zero or negative.
    #[error("event version must be positive, got {0}")]
    BadVersion(i64),
}
