#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tephra-store** – Single-writer SQLite layer for tephra.
//!
//! Everything the dispatch engine persists goes through this crate: one
//! writer connection with strict transaction discipline, a lazily-opened
//! read pool over the same file, the append-only event queue (`history`
//! table), the `metadata` bookkeeping row, and the per-model document
//! tables with their JSON expression indexes.
//!
//! The writer connection is the sole serialisation point in the process.
//! `BEGIN IMMEDIATE` transactions are chained behind a mutex, busy
//! contention is retried with jittered backoff, and every transaction
//! announces its lifecycle on the signal bus.

pub mod connection;
pub mod docs;
pub mod meta;
pub mod queue;
pub mod sql;

pub use connection::{Connection, ConnectionOptions};
pub use docs::ColumnDef;
pub use meta::MetaState;
pub use queue::EventQueue;

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors surfaced by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write was attempted on a read-only connection.
    #[error("connection is read-only")]
    ReadOnly,
    /// The database stayed busy past the retry budget.
    #[error("database busy after {0} attempts")]
    Busy(u32),
    /// An insert hit an existing primary key.
    #[error("row {id:?} already exists in {table:?}")]
    Duplicate {
        /// Table the insert targeted.
        table: String,
        /// Conflicting row id.
        id: String,
    },
    /// A partial update referenced a row that does not exist.
    #[error("cannot update missing row {id:?} in {table:?}")]
    MissingRow {
        /// Table the update targeted.
        table: String,
        /// Missing row id.
        id: String,
    },
    /// A document carries no usable `id` field.
    #[error("document has no usable id")]
    MissingId,
    /// Underlying SQLite failure.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    /// A stored JSON column failed to parse.
    #[error("invalid stored json: {0}")]
    Json(#[from] serde_json::Error),
}
