//! The context handed to every phase handler.
//!
//! A context borrows the current event node and the open write transaction.
//! Reads go through the transaction, so a handler sees the post-apply state
//! of earlier phases and earlier events, not just committed state.
//! Handler errors are data: every fallible method reports a JSON value that
//! the engine records under the failing phase's error key.

use serde_json::Value;
use sqlx::SqliteConnection;

use tephra_store::{docs, StoreError};
use tephra_types::{Event, EventDraft};

/// Per-handler view of the event being processed.
pub struct PhaseCtx<'a> {
    event: &'a mut Event,
    conn: &'a mut SqliteConnection,
    is_main_event: bool,
    children: Vec<EventDraft>,
}

impl<'a> PhaseCtx<'a> {
    pub(crate) fn new(
        event: &'a mut Event,
        conn: &'a mut SqliteConnection,
        is_main_event: bool,
    ) -> Self {
        Self {
            event,
            conn,
            is_main_event,
            children: Vec::new(),
        }
    }

    /// The event this handler is looking at.
    pub fn event(&self) -> &Event {
        self.event
    }

    /// Mutable access to the current event, for preprocessors that rewrite
    /// `data` or `kind` in place.
    pub fn event_mut(&mut self) -> &mut Event {
        self.event
    }

    /// True iff the current event is the root of the dispatch tree.
    pub fn is_main_event(&self) -> bool {
        self.is_main_event
    }

    /// Append a child event to the current node.
    ///
    /// Children run the full pipeline depth-first, after this node's phases
    /// finish and before this node's next sibling. Dispatch returns nothing;
    /// the child shares the root's version and appears in `event.events`.
    pub fn dispatch(&mut self, kind: impl Into<String>, data: Option<Value>) {
        self.children.push(EventDraft {
            kind: kind.into(),
            data,
            ts: None,
        });
    }

    pub(crate) fn into_children(self) -> Vec<EventDraft> {
        self.children
    }

    //───────────────────── reads ─────────────────────

    /// Fetch a document from any model, seeing post-apply state.
    pub async fn get(&mut self, model: &str, id: &str) -> Result<Option<Value>, Value> {
        docs::get(&mut *self.conn, model, id).await.map_err(data_err)
    }

    /// First document of `model` matching all query pairs.
    pub async fn search_one(
        &mut self,
        model: &str,
        query: &[(&str, Value)],
    ) -> Result<Option<Value>, Value> {
        docs::search_one(&mut *self.conn, model, query)
            .await
            .map_err(data_err)
    }

    /// All documents of `model` matching the query pairs.
    pub async fn search(
        &mut self,
        model: &str,
        query: &[(&str, Value)],
    ) -> Result<Vec<Value>, Value> {
        docs::search(&mut *self.conn, model, query)
            .await
            .map_err(data_err)
    }

    //───────────────────── writes (derive phase) ─────────────────────

    /// Upsert a document directly, inside the surrounding transaction.
    ///
    /// Direct writes belong in derivers; reducers describe writes instead of
    /// performing them.
    pub async fn put(&mut self, model: &str, row: &Value) -> Result<(), Value> {
        docs::put(&mut *self.conn, model, row).await.map_err(data_err)
    }

    /// Shallow-merge a patch into an existing document.
    pub async fn update(&mut self, model: &str, patch: &Value) -> Result<Value, Value> {
        docs::update(&mut *self.conn, model, patch)
            .await
            .map_err(data_err)
    }

    /// Delete a document by id.
    pub async fn remove(&mut self, model: &str, id: &str) -> Result<(), Value> {
        docs::delete(&mut *self.conn, model, id)
            .await
            .map_err(data_err)
    }
}

fn data_err(err: StoreError) -> Value {
    Value::String(err.to_string())
}
