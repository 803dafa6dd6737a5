//! The dispatch tree and its pre-order driver.
//!
//! The tree is data, not a call stack: every dispatched child becomes a node
//! in an arena, and an explicit stack drives the depth-first traversal. That
//! keeps the depth counter honest, makes replay trivial (drop the subtree
//! and rebuild it) and lets the finished tree serialise straight into the
//! event's `events` column.
//!
//! Phase order per node is Preprocess → Reduce → Apply → Derive; models run
//! in registry order inside every phase; children run after their parent's
//! phases and before the parent's next sibling.

use serde_json::{json, Map, Value};
use sqlx::SqliteConnection;

use tephra_store::{docs, meta, StoreError};
use tephra_types::{Event, EventDraft, Phase, Reduction, HANDLE_KEY};

use crate::ctx::PhaseCtx;
use crate::model::Registry;

/// Dispatch chains longer than this fail the root with a `_handle` error.
pub const MAX_EVENT_DEPTH: usize = 100;

struct Node {
    event: Event,
    parent: Option<usize>,
    children: Vec<usize>,
    depth: usize,
    path: String,
}

struct PhaseFailure {
    key: String,
    cause: Value,
    path: String,
    from_root: bool,
}

pub(crate) struct EventTree {
    nodes: Vec<Node>,
}

impl EventTree {
    pub(crate) fn new(root: Event) -> Self {
        let path = format!(".{}", root.kind);
        Self {
            nodes: vec![Node {
                event: root,
                parent: None,
                children: Vec::new(),
                depth: 0,
                path,
            }],
        }
    }

    /// Drive the pipeline over the whole tree.
    ///
    /// On the first phase failure the traversal stops and the root event is
    /// marked failed; the caller decides what to do with the transaction.
    pub(crate) async fn run(&mut self, conn: &mut SqliteConnection, registry: &Registry) {
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            if let Err(failure) = self.run_phases(idx, conn, registry).await {
                self.fail_root(failure);
                return;
            }
            // Reversed so the first-dispatched child is processed first.
            for &child in self.nodes[idx].children.iter().rev() {
                stack.push(child);
            }
        }
    }

    async fn run_phases(
        &mut self,
        idx: usize,
        conn: &mut SqliteConnection,
        registry: &Registry,
    ) -> Result<(), PhaseFailure> {
        let is_main = idx == 0;
        let v = self.nodes[idx].event.v;

        // Phase 1: preprocess.
        for (name, model) in registry.iter() {
            let handler = match model.preprocessor() {
                Some(handler) => handler,
                None => continue,
            };
            let key = Phase::Preprocess.error_key(name);

            let v_before = self.nodes[idx].event.v;
            let outcome;
            let drafts;
            {
                let node = &mut self.nodes[idx];
                let mut ctx = PhaseCtx::new(&mut node.event, &mut *conn, is_main);
                outcome = handler.preprocess(&mut ctx).await;
                drafts = ctx.into_children();
            }
            match outcome {
                Ok(None) => {}
                Ok(Some(mut replacement)) => {
                    // The subtree and the outcome fields belong to the
                    // engine; a replacement event cannot smuggle them in.
                    replacement.events = Vec::new();
                    replacement.result = None;
                    replacement.error = None;
                    self.nodes[idx].event = replacement;
                }
                Err(cause) => return Err(self.failure(idx, key, cause)),
            }

            let event = &self.nodes[idx].event;
            if event.kind.is_empty() {
                return Err(self.failure(
                    idx,
                    key,
                    json!("preprocessor removed the event type"),
                ));
            }
            if event.v != v_before {
                let cause = format!(
                    "preprocessor changed the event version from {v_before} to {}",
                    event.v
                );
                return Err(self.failure(idx, key, json!(cause)));
            }
            self.add_children(idx, drafts)?;
        }

        // Phase 2: reduce. Reductions are collected here and applied below;
        // reducers describe writes, the engine performs them.
        let mut reductions: Vec<(String, Reduction)> = Vec::new();
        for (name, model) in registry.iter() {
            let handler = match model.reducer() {
                Some(handler) => handler,
                None => continue,
            };
            let key = Phase::Reduce.error_key(name);

            let outcome;
            let drafts;
            {
                let node = &mut self.nodes[idx];
                let mut ctx = PhaseCtx::new(&mut node.event, &mut *conn, is_main);
                outcome = handler.reduce(&mut ctx).await;
                drafts = ctx.into_children();
            }
            let reduction = match outcome {
                Ok(reduction) => reduction,
                Err(cause) => return Err(self.failure(idx, key, cause)),
            };
            self.add_children(idx, drafts)?;

            if let Some(mut reduction) = reduction {
                let follow_ups = std::mem::take(&mut reduction.events);
                self.add_children(idx, follow_ups)?;
                self.nodes[idx]
                    .event
                    .result
                    .get_or_insert_with(Map::new)
                    .insert(name.to_string(), reduction.to_result_value());
                reductions.push((name.to_string(), reduction));
            }
        }

        // Phase 3: apply, in registry order. Only root events move the
        // version pointer; children ride on their root's version.
        for (name, reduction) in &reductions {
            if let Err(err) = apply_reduction(conn, name, reduction).await {
                let key = Phase::Apply.error_key(name);
                return Err(self.failure(idx, key, json!(err.to_string())));
            }
        }
        if is_main {
            if let Err(err) = meta::advance(conn, v, false).await {
                return Err(self.failure(idx, HANDLE_KEY.to_string(), json!(err.to_string())));
            }
        }

        // Phase 4: derive.
        for (name, model) in registry.iter() {
            let handler = match model.deriver() {
                Some(handler) => handler,
                None => continue,
            };
            let key = Phase::Derive.error_key(name);

            let outcome;
            let drafts;
            {
                let node = &mut self.nodes[idx];
                let mut ctx = PhaseCtx::new(&mut node.event, &mut *conn, is_main);
                outcome = handler.derive(&mut ctx).await;
                drafts = ctx.into_children();
            }
            if let Err(cause) = outcome {
                return Err(self.failure(idx, key, cause));
            }
            self.add_children(idx, drafts)?;
        }

        // A processed event always carries a result map, even an empty one;
        // that is what marks it handled.
        self.nodes[idx].event.result.get_or_insert_with(Map::new);
        Ok(())
    }

    fn add_children(&mut self, idx: usize, drafts: Vec<EventDraft>) -> Result<(), PhaseFailure> {
        if drafts.is_empty() {
            return Ok(());
        }
        let (v, ts, depth, parent_path) = {
            let node = &self.nodes[idx];
            (node.event.v, node.event.ts, node.depth, node.path.clone())
        };
        for draft in drafts {
            let path = format!("{parent_path}.{}", draft.kind);
            if draft.kind.is_empty() {
                return Err(PhaseFailure {
                    key: HANDLE_KEY.to_string(),
                    cause: json!(format!("{parent_path}: dispatched a sub-event without a type")),
                    path,
                    from_root: false,
                });
            }
            if depth + 1 > MAX_EVENT_DEPTH {
                return Err(PhaseFailure {
                    key: HANDLE_KEY.to_string(),
                    cause: json!(format!("{path}: sub-events are nested too deep")),
                    path,
                    from_root: false,
                });
            }
            let child = self.nodes.len();
            let ts = draft.ts.unwrap_or(ts);
            self.nodes.push(Node {
                event: Event::new(v, draft.kind, draft.data, ts),
                parent: Some(idx),
                children: Vec::new(),
                depth: depth + 1,
                path,
            });
            self.nodes[idx].children.push(child);
        }
        Ok(())
    }

    fn failure(&self, idx: usize, key: String, cause: Value) -> PhaseFailure {
        PhaseFailure {
            key,
            cause,
            path: self.nodes[idx].path.clone(),
            from_root: idx == 0,
        }
    }

    /// Record a failure at the root. Errors from deep nodes are wrapped with
    /// the failing node's kind-path, except `_handle` errors, whose cause
    /// already carries the path.
    fn fail_root(&mut self, failure: PhaseFailure) {
        let cause = if failure.from_root || failure.key == HANDLE_KEY {
            failure.cause
        } else {
            json!({ "path": failure.path, "error": failure.cause })
        };
        let root = &mut self.nodes[0].event;
        root.result = None;
        root.add_error(failure.key, cause);
    }

    /// Collapse the arena back into a single event with its child subtree.
    pub(crate) fn into_event(mut self) -> Event {
        // Children always have a larger index than their parent, so a single
        // reverse pass folds every subtree before its owner is moved.
        for i in (1..self.nodes.len()).rev() {
            let mut event = std::mem::take(&mut self.nodes[i].event);
            event.events.reverse();
            if let Some(parent) = self.nodes[i].parent {
                self.nodes[parent].event.events.push(event);
            }
        }
        let mut root = std::mem::take(&mut self.nodes[0].event);
        root.events.reverse();
        root
    }
}

/// Apply one model's reduction inside the open transaction, in the fixed
/// order `rm`, `ins`, `set`, `upd`.
async fn apply_reduction(
    conn: &mut SqliteConnection,
    model: &str,
    reduction: &Reduction,
) -> Result<(), StoreError> {
    for id in &reduction.rm {
        let id = removal_id(id)?;
        docs::delete(&mut *conn, model, &id).await?;
    }
    for row in &reduction.ins {
        docs::insert(&mut *conn, model, row).await?;
    }
    for row in &reduction.set {
        docs::put(&mut *conn, model, row).await?;
    }
    for patch in &reduction.upd {
        docs::update(&mut *conn, model, patch).await?;
    }
    Ok(())
}

fn removal_id(value: &Value) -> Result<String, StoreError> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(StoreError::MissingId),
    }
}
