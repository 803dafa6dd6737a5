//! Writer/reader connection management and transaction discipline.
//!
//! One process owns exactly one writer connection per database file. Write
//! transactions are serialised behind a mutex and opened with
//! `BEGIN IMMEDIATE`; busy contention is retried with jittered backoff up to
//! a bounded budget. Readers get a separate lazily-opened pool on the same
//! file and, thanks to WAL, proceed concurrently with the writer, seeing
//! committed state only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{Connection as _, SqliteConnection};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use tephra_bus::{DbSignal, InMemoryBus, SignalBus};

use crate::StoreError;

/// Transactions re-attempt `BEGIN IMMEDIATE` this many times by default
/// before giving up on a busy database.
pub const DEFAULT_BUSY_RETRIES: u32 = 10;

//─────────────────────────────
//  Options
//─────────────────────────────

/// Settings for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Database file path.
    pub path: PathBuf,
    /// Refuse all writes; `with_txn` fails immediately.
    pub read_only: bool,
    /// Retry budget for `BEGIN IMMEDIATE` on a busy database.
    pub busy_retries: u32,
    /// SQLite-side busy timeout applied to every statement.
    pub busy_timeout: Duration,
    /// Open the file with incremental auto-vacuum enabled.
    pub incremental_vacuum: bool,
    /// Size of the read pool.
    pub read_pool_size: u32,
}

impl ConnectionOptions {
    /// Options with defaults for the given database file.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            read_only: false,
            busy_retries: DEFAULT_BUSY_RETRIES,
            busy_timeout: Duration::from_millis(500),
            incremental_vacuum: false,
            read_pool_size: 4,
        }
    }
}

//─────────────────────────────
//  Connection
//─────────────────────────────

/// A single-writer SQLite connection with a lazily-opened read pool.
///
/// Both handles open on first use. The write-mode open enables WAL,
/// foreign keys and recursive triggers; the read pool opens the same file
/// read-only.
pub struct Connection {
    options: ConnectionOptions,
    writer: OnceCell<Mutex<SqliteConnection>>,
    readers: OnceCell<SqlitePool>,
    bus: InMemoryBus,
}

impl Connection {
    /// Create a connection that will open `options.path` on first use,
    /// announcing transaction lifecycle on `bus`.
    pub fn new(options: ConnectionOptions, bus: InMemoryBus) -> Self {
        Self {
            options,
            writer: OnceCell::new(),
            readers: OnceCell::new(),
            bus,
        }
    }

    /// The options this connection was created with.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// The signal bus transactions report to.
    pub fn signals(&self) -> &InMemoryBus {
        &self.bus
    }

    fn write_options(&self) -> SqliteConnectOptions {
        let mut opts = SqliteConnectOptions::new()
            .filename(&self.options.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(self.options.busy_timeout)
            .pragma("recursive_triggers", "ON");
        if self.options.incremental_vacuum {
            opts = opts.auto_vacuum(SqliteAutoVacuum::Incremental);
        }
        opts
    }

    async fn writer(&self) -> Result<&Mutex<SqliteConnection>, StoreError> {
        if self.options.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.writer
            .get_or_try_init(|| async {
                debug!(path = %self.options.path.display(), "opening writer connection");
                let conn = SqliteConnection::connect_with(&self.write_options()).await?;
                Ok(Mutex::new(conn))
            })
            .await
    }

    /// The read pool, opened on first use.
    ///
    /// Readers see committed state only; an in-progress write transaction is
    /// invisible to them.
    pub async fn readers(&self) -> Result<&SqlitePool, StoreError> {
        self.readers
            .get_or_try_init(|| async {
                debug!(path = %self.options.path.display(), "opening read pool");
                let opts = SqliteConnectOptions::new()
                    .filename(&self.options.path)
                    .read_only(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(self.options.busy_timeout);
                let pool = SqlitePoolOptions::new()
                    .max_connections(self.options.read_pool_size)
                    .connect_with(opts)
                    .await?;
                Ok(pool)
            })
            .await
    }

    /// Run `f` with exclusive access to the writer connection, outside any
    /// transaction. Single statements are atomic on their own.
    pub async fn with_writer<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, E>>,
    {
        let writer = self.writer().await.map_err(E::from)?;
        let mut conn = writer.lock().await;
        f(&mut conn).await
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// Callers are serialised: at most one transaction body runs at a time,
    /// in lock-acquisition order. Emits `Begin`; commits and emits `End` then
    /// `Finally` when `f` succeeds; rolls back and emits `Rollback` then
    /// `Finally` when it fails. Busy contention on the `BEGIN` is retried
    /// with jittered backoff up to the configured budget, after which
    /// [`StoreError::Busy`] surfaces.
    pub async fn with_txn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, E>>,
    {
        let writer = self.writer().await.map_err(E::from)?;
        let mut conn = writer.lock().await;

        self.begin_immediate(&mut conn).await.map_err(E::from)?;
        let _ = self.bus.publish(&DbSignal::Begin);

        match f(&mut conn).await {
            Ok(value) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| E::from(StoreError::from(e)))?;
                let _ = self.bus.publish(&DbSignal::End);
                let _ = self.bus.publish(&DbSignal::Finally);
                Ok(value)
            }
            Err(err) => {
                if let Err(rb) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!(error = %rb, "rollback failed after transaction error");
                }
                let _ = self.bus.publish(&DbSignal::Rollback);
                let _ = self.bus.publish(&DbSignal::Finally);
                Err(err)
            }
        }
    }

    async fn begin_immediate(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        let mut attempt = 0u32;
        loop {
            match sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
                Ok(_) => return Ok(()),
                Err(err) if is_busy(&err) => {
                    attempt += 1;
                    if attempt > self.options.busy_retries {
                        return Err(StoreError::Busy(attempt));
                    }
                    let backoff = backoff_with_jitter(attempt);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, "database busy, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Reclaim a bounded number of free pages when incremental auto-vacuum
    /// is enabled. No-op otherwise.
    pub async fn vacuum_step(&self) -> Result<(), StoreError> {
        if !self.options.incremental_vacuum {
            return Ok(());
        }
        let writer = self.writer().await?;
        let mut conn = writer.lock().await;
        sqlx::query("PRAGMA incremental_vacuum(64)")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            let code = code.as_deref().unwrap_or("");
            code == "5" || code == "517" || db.message().contains("database is locked")
        }
        _ => false,
    }
}

/// Exponential backoff with random jitter, bounded well under a second so a
/// full retry budget stays responsive.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 1u64 << attempt.min(6);
    let jitter = rand::thread_rng().gen_range(0..=base);
    Duration::from_millis(base + jitter)
}
