//! Model registry: named document collections with optional phase handlers.
//!
//! A model is a record of capability slots, not a class hierarchy. Any
//! combination of preprocessor, reducer and deriver is legal; a model with
//! none of them is a plain document table that other models' handlers can
//! read and write.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tephra_store::ColumnDef;
use tephra_types::{Event, Reduction};

use crate::ctx::PhaseCtx;
use crate::EngineError;

//─────────────────────────────
//  Phase handler traits
//─────────────────────────────

/// First pipeline phase: rewrite the event before anything reduces it.
///
/// A preprocessor may mutate the event's `data` and `kind` in place through
/// the context, return a replacement event, or fail with an error value.
/// It must not empty the event type or move the version; the engine treats
/// either as a preprocess failure.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    /// Inspect or rewrite the current event. `Ok(None)` keeps the (possibly
    /// mutated) event, `Ok(Some(event))` replaces it wholesale.
    async fn preprocess(&self, ctx: &mut PhaseCtx<'_>) -> Result<Option<Event>, Value>;
}

/// Second pipeline phase: describe the model's state change for this event.
///
/// Reducers never write. They return a [`Reduction`] that the engine applies
/// inside the surrounding transaction, or `None` when the event does not
/// concern this model.
#[async_trait]
pub trait Reducer: Send + Sync {
    /// Compute the reduction for the current event.
    async fn reduce(&self, ctx: &mut PhaseCtx<'_>) -> Result<Option<Reduction>, Value>;
}

/// Fourth pipeline phase: react to the applied state.
///
/// Derivers run after every reduction of the current event is applied. They
/// may read any model's post-apply state, write directly through the
/// context, and dispatch follow-up events.
#[async_trait]
pub trait Deriver: Send + Sync {
    /// Derive side effects from the applied event.
    async fn derive(&self, ctx: &mut PhaseCtx<'_>) -> Result<(), Value>;
}

//─────────────────────────────
//  Model
//─────────────────────────────

/// A named document collection with optional phase handlers.
pub struct Model {
    name: String,
    columns: Vec<ColumnDef>,
    preprocessor: Option<Arc<dyn Preprocessor>>,
    reducer: Option<Arc<dyn Reducer>>,
    deriver: Option<Arc<dyn Deriver>>,
}

impl Model {
    /// A model with no handlers and no declared columns.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            preprocessor: None,
            reducer: None,
            deriver: None,
        }
    }

    /// A document model with the built-in CRUD reducer.
    ///
    /// Writes performed outside a dispatch through
    /// [`RwStore`](crate::RwStore) synthesise events of this model's name;
    /// the CRUD reducer turns them back into row changes, so direct writes
    /// stay replayable from the log.
    pub fn document(name: impl Into<String>) -> Self {
        let name = name.into();
        let crud = CrudReducer { model: name.clone() };
        Self::new(name).with_reducer(Arc::new(crud))
    }

    /// Declare a JSON column.
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Declare several JSON columns at once.
    pub fn with_columns(mut self, columns: Vec<ColumnDef>) -> Self {
        self.columns.extend(columns);
        self
    }

    /// Install the preprocess handler.
    pub fn with_preprocessor(mut self, handler: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = Some(handler);
        self
    }

    /// Install the reduce handler.
    pub fn with_reducer(mut self, handler: Arc<dyn Reducer>) -> Self {
        self.reducer = Some(handler);
        self
    }

    /// Install the derive handler.
    pub fn with_deriver(mut self, handler: Arc<dyn Deriver>) -> Self {
        self.deriver = Some(handler);
        self
    }

    /// The model's name, which is also its table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared JSON columns.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub(crate) fn preprocessor(&self) -> Option<&Arc<dyn Preprocessor>> {
        self.preprocessor.as_ref()
    }

    pub(crate) fn reducer(&self) -> Option<&Arc<dyn Reducer>> {
        self.reducer.as_ref()
    }

    pub(crate) fn deriver(&self) -> Option<&Arc<dyn Deriver>> {
        self.deriver.as_ref()
    }
}

//─────────────────────────────
//  Built-in CRUD reducer
//─────────────────────────────

/// The change payload of a synthesised write event.
///
/// [`RwStore`](crate::RwStore) serialises one of these into `event.data`;
/// the CRUD reducer deserialises it back into a [`Reduction`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum CrudChange {
    /// Upsert whole rows.
    Set {
        /// Rows to upsert.
        rows: Vec<Value>,
    },
    /// Insert rows, failing on existing ids.
    Ins {
        /// Rows to insert.
        rows: Vec<Value>,
    },
    /// Shallow-merge partial rows by id.
    Upd {
        /// Partial rows to merge.
        rows: Vec<Value>,
    },
    /// Delete rows by id.
    Rm {
        /// Ids to delete.
        ids: Vec<Value>,
    },
}

impl CrudChange {
    /// The reduction this change describes.
    pub fn into_reduction(self) -> Reduction {
        match self {
            CrudChange::Set { rows } => Reduction {
                set: rows,
                ..Reduction::default()
            },
            CrudChange::Ins { rows } => Reduction {
                ins: rows,
                ..Reduction::default()
            },
            CrudChange::Upd { rows } => Reduction {
                upd: rows,
                ..Reduction::default()
            },
            CrudChange::Rm { ids } => Reduction {
                rm: ids,
                ..Reduction::default()
            },
        }
    }
}

struct CrudReducer {
    model: String,
}

#[async_trait]
impl Reducer for CrudReducer {
    async fn reduce(&self, ctx: &mut PhaseCtx<'_>) -> Result<Option<Reduction>, Value> {
        if ctx.event().kind != self.model {
            return Ok(None);
        }
        let data = match ctx.event().data.clone() {
            Some(data) => data,
            None => return Ok(None),
        };
        let change: CrudChange = serde_json::from_value(data)
            .map_err(|e| Value::String(format!("malformed write event: {e}")))?;
        Ok(Some(change.into_reduction()))
    }
}

//─────────────────────────────
//  Registry
//─────────────────────────────

/// Ordered name → model mapping. Registration order is the order handlers
/// run in within every phase, and the order reductions apply in.
pub(crate) struct Registry {
    models: IndexMap<String, Model>,
}

impl Registry {
    pub(crate) fn new(models: Vec<Model>) -> Result<Self, EngineError> {
        let mut map = IndexMap::with_capacity(models.len());
        for model in models {
            if !valid_name(model.name()) {
                return Err(EngineError::BadModelName(model.name().to_string()));
            }
            for column in model.columns() {
                if !valid_name(&column.name) {
                    return Err(EngineError::BadModelName(format!(
                        "{}.{}",
                        model.name(),
                        column.name
                    )));
                }
            }
            let name = model.name().to_string();
            if map.insert(name.clone(), model).is_some() {
                return Err(EngineError::DuplicateModel(name));
            }
        }
        Ok(Self { models: map })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &Model)> {
        self.models.iter().map(|(name, model)| (name.as_str(), model))
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }
}

/// Model and column names end up inside quoted SQL identifiers; keep them to
/// the boring subset.
fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
