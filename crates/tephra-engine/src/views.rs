//! Read-only and writable model views.
//!
//! The read store serves committed state from the read pool and never sees
//! an in-progress dispatch. The writable store is the out-of-dispatch write
//! path: every write synthesises a system event so that direct writes stay
//! in the log and replay like any other mutation.

use std::sync::Arc;

use serde_json::Value;

use tephra_store::docs;
use tephra_types::Event;

use crate::model::CrudChange;
use crate::{EngineError, Inner};

//─────────────────────────────
//  Read-only view
//─────────────────────────────

/// Committed-state reads over every registered model.
#[derive(Clone)]
pub struct ReadStore {
    pub(crate) inner: Arc<Inner>,
}

impl ReadStore {
    /// Fetch a document by id.
    pub async fn get(&self, model: &str, id: &str) -> Result<Option<Value>, EngineError> {
        self.inner.check_model(model)?;
        let pool = self.inner.conn.readers().await?;
        Ok(docs::get(pool, model, id).await?)
    }

    /// First document matching all query pairs, in id order.
    pub async fn search_one(
        &self,
        model: &str,
        query: &[(&str, Value)],
    ) -> Result<Option<Value>, EngineError> {
        self.inner.check_model(model)?;
        let pool = self.inner.conn.readers().await?;
        Ok(docs::search_one(pool, model, query).await?)
    }

    /// All documents matching the query pairs, in id order.
    pub async fn search(
        &self,
        model: &str,
        query: &[(&str, Value)],
    ) -> Result<Vec<Value>, EngineError> {
        self.inner.check_model(model)?;
        let pool = self.inner.conn.readers().await?;
        Ok(docs::search(pool, model, query).await?)
    }

    /// Number of documents matching the query pairs.
    pub async fn count(&self, model: &str, query: &[(&str, Value)]) -> Result<i64, EngineError> {
        self.inner.check_model(model)?;
        let pool = self.inner.conn.readers().await?;
        Ok(docs::count(pool, model, query).await?)
    }
}

//─────────────────────────────
//  Writable view
//─────────────────────────────

/// Out-of-dispatch writes to one model, logged as events.
///
/// Each method dispatches an event whose kind is the model's name and whose
/// data describes the change; the model's CRUD reducer (see
/// [`Model::document`](crate::Model::document)) turns it back into row
/// changes. The returned event is the handled log entry.
pub struct RwStore {
    pub(crate) inner: Arc<Inner>,
    pub(crate) model: String,
}

impl RwStore {
    /// Upsert a whole row.
    pub async fn set(&self, row: Value) -> Result<Event, EngineError> {
        self.write(CrudChange::Set { rows: vec![row] }).await
    }

    /// Insert a row, failing if the id exists.
    pub async fn insert(&self, row: Value) -> Result<Event, EngineError> {
        self.write(CrudChange::Ins { rows: vec![row] }).await
    }

    /// Shallow-merge a partial row into the existing one.
    pub async fn update(&self, patch: Value) -> Result<Event, EngineError> {
        self.write(CrudChange::Upd { rows: vec![patch] }).await
    }

    /// Delete a row by id.
    pub async fn remove(&self, id: impl Into<String>) -> Result<Event, EngineError> {
        self.write(CrudChange::Rm {
            ids: vec![Value::String(id.into())],
        })
        .await
    }

    async fn write(&self, change: CrudChange) -> Result<Event, EngineError> {
        let data = serde_json::to_value(&change)
            .map_err(tephra_store::StoreError::from)?;
        self.inner
            .dispatch(self.model.clone(), Some(data), None)
            .await
    }
}
