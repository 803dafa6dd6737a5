//! Append-only event queue backed by the `history` table.
//!
//! Versions are allocated inside the insert statement, so `v` is strictly
//! monotonic and dense starting from 1 as long as every write goes through
//! the single writer connection.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::sync::Arc;
use tracing::debug;

use tephra_types::Event;

use crate::connection::Connection;
use crate::StoreError;

const COLUMNS: &str = "v, type, ts, data, result, events, error";

/// The append-only event log.
///
/// `add`, `set` and the read operations run in their own micro-transactions
/// on the writer connection; the `*_tx` associated functions operate on a
/// transaction the caller already holds.
#[derive(Clone)]
pub struct EventQueue {
    conn: Arc<Connection>,
}

impl EventQueue {
    /// Queue handle over the given connection.
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// Create the `history` table. Runs inside the caller's transaction.
    pub async fn migrate(conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                v INTEGER PRIMARY KEY,
                type TEXT NOT NULL,
                ts INTEGER NOT NULL,
                data TEXT,
                result TEXT,
                events TEXT,
                error TEXT
            ) STRICT
            "#,
        )
        .execute(&mut *conn)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_type ON history(type)")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Append a fresh event, allocating `v = max(v) + 1`.
    ///
    /// `ts` defaults to the current wall clock in epoch milliseconds. The
    /// returned event has a null `result`; it is queued, not handled.
    pub async fn add(
        &self,
        kind: &str,
        data: Option<Value>,
        ts: Option<i64>,
    ) -> Result<Event, StoreError> {
        let ts = ts.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let data_text = match &data {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        let kind = kind.to_string();
        let event = self
            .conn
            .with_txn::<_, StoreError, _>(move |c| {
                Box::pin(async move {
                    let sql = format!(
                        "INSERT INTO history (v, type, ts, data) \
                         VALUES ((SELECT COALESCE(MAX(v), 0) + 1 FROM history), ?, ?, ?) \
                         RETURNING {COLUMNS}"
                    );
                    let row = sqlx::query(&sql)
                        .bind(&kind)
                        .bind(ts)
                        .bind(data_text)
                        .fetch_one(&mut *c)
                        .await?;
                    event_from_row(&row)
                })
            })
            .await?;
        debug!(v = event.v, kind = %event.kind, "queued event");
        Ok(event)
    }

    /// Upsert a full event row at the event's own `v`.
    ///
    /// This is the replay entry point: writing a row with a null `result`
    /// re-queues that version, and the engine re-derives its children from
    /// scratch.
    pub async fn set(&self, event: &Event) -> Result<(), StoreError> {
        let event = event.clone();
        self.conn
            .with_txn::<_, StoreError, _>(move |c| {
                Box::pin(async move { Self::write_back(c, &event).await })
            })
            .await
    }

    /// Upsert a full event row inside the caller's transaction.
    pub async fn write_back(
        conn: &mut SqliteConnection,
        event: &Event,
    ) -> Result<(), StoreError> {
        let data = opt_json(&event.data)?;
        let result = match &event.result {
            Some(map) => Some(serde_json::to_string(map)?),
            None => None,
        };
        let events = if event.events.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&event.events)?)
        };
        let error = match &event.error {
            Some(map) => Some(serde_json::to_string(map)?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO history (v, type, ts, data, result, events, error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(v) DO UPDATE SET
                type = excluded.type,
                ts = excluded.ts,
                data = excluded.data,
                result = excluded.result,
                events = excluded.events,
                error = excluded.error
            "#,
        )
        .bind(event.v)
        .bind(&event.kind)
        .bind(event.ts)
        .bind(data)
        .bind(result)
        .bind(events)
        .bind(error)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Fetch the event at `v`, if any.
    pub async fn get(&self, v: i64) -> Result<Option<Event>, StoreError> {
        self.conn
            .with_writer::<_, StoreError, _>(move |c| {
                Box::pin(async move {
                    let sql = format!("SELECT {COLUMNS} FROM history WHERE v = ?");
                    let row = sqlx::query(&sql).bind(v).fetch_optional(&mut *c).await?;
                    row.as_ref().map(event_from_row).transpose()
                })
            })
            .await
    }

    /// The event with the smallest `v` strictly greater than `after_v`.
    pub async fn get_next(&self, after_v: i64) -> Result<Option<Event>, StoreError> {
        self.conn
            .with_writer::<_, StoreError, _>(move |c| {
                Box::pin(async move {
                    let sql = format!(
                        "SELECT {COLUMNS} FROM history WHERE v > ? ORDER BY v LIMIT 1"
                    );
                    let row = sqlx::query(&sql)
                        .bind(after_v)
                        .fetch_optional(&mut *c)
                        .await?;
                    row.as_ref().map(event_from_row).transpose()
                })
            })
            .await
    }

    /// The unprocessed event with the smallest `v`: null `result` and null
    /// `error`.
    pub async fn next_unhandled(&self) -> Result<Option<Event>, StoreError> {
        self.conn
            .with_writer::<_, StoreError, _>(|c| {
                Box::pin(async move {
                    let sql = format!(
                        "SELECT {COLUMNS} FROM history \
                         WHERE result IS NULL AND error IS NULL ORDER BY v LIMIT 1"
                    );
                    let row = sqlx::query(&sql).fetch_optional(&mut *c).await?;
                    row.as_ref().map(event_from_row).transpose()
                })
            })
            .await
    }

    /// The highest allocated version, 0 when the log is empty.
    pub async fn max_v(&self) -> Result<i64, StoreError> {
        self.conn
            .with_writer::<_, StoreError, _>(|c| {
                Box::pin(async move {
                    let row = sqlx::query("SELECT COALESCE(MAX(v), 0) AS v FROM history")
                        .fetch_one(&mut *c)
                        .await?;
                    Ok(row.get("v"))
                })
            })
            .await
    }
}

fn opt_json(value: &Option<Value>) -> Result<Option<String>, StoreError> {
    match value {
        Some(v) => Ok(Some(serde_json::to_string(v)?)),
        None => Ok(None),
    }
}

fn opt_parse<T: serde::de::DeserializeOwned>(
    text: Option<String>,
) -> Result<Option<T>, StoreError> {
    match text {
        Some(t) => Ok(Some(serde_json::from_str(&t)?)),
        None => Ok(None),
    }
}

/// Decode a `history` row into an [`Event`].
pub(crate) fn event_from_row(row: &SqliteRow) -> Result<Event, StoreError> {
    Ok(Event {
        v: row.get("v"),
        kind: row.get("type"),
        ts: row.get("ts"),
        data: opt_parse(row.get("data"))?,
        result: opt_parse(row.get("result"))?,
        events: opt_parse(row.get("events"))?.unwrap_or_default(),
        error: opt_parse(row.get("error"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use serde_json::json;
    use tephra_bus::InMemoryBus;

    async fn test_queue(dir: &tempfile::TempDir) -> EventQueue {
        let conn = Arc::new(Connection::new(
            ConnectionOptions::new(dir.path().join("q.db")),
            InMemoryBus::new(64),
        ));
        conn.with_txn::<_, StoreError, _>(|c| Box::pin(EventQueue::migrate(c)))
            .await
            .unwrap();
        EventQueue::new(conn)
    }

    #[tokio::test]
    async fn add_allocates_dense_versions() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir).await;

        let first = queue.add("hi", None, None).await.unwrap();
        let second = queue.add("ho", Some(json!({"n": 2})), None).await.unwrap();

        assert_eq!(first.v, 1);
        assert_eq!(second.v, 2);
        assert_eq!(queue.max_v().await.unwrap(), 2);
        assert!(first.result.is_none());
    }

    #[tokio::test]
    async fn get_and_get_next() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir).await;

        queue.add("a", None, Some(10)).await.unwrap();
        queue.add("b", None, Some(20)).await.unwrap();

        let got = queue.get(2).await.unwrap().unwrap();
        assert_eq!(got.kind, "b");
        assert_eq!(got.ts, 20);

        let next = queue.get_next(1).await.unwrap().unwrap();
        assert_eq!(next.v, 2);
        assert!(queue.get_next(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_upserts_and_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir).await;

        let mut event = queue.add("hi", None, None).await.unwrap();
        event.result = Some(serde_json::Map::new());
        queue.set(&event).await.unwrap();
        assert!(queue.next_unhandled().await.unwrap().is_none());

        // Clearing the result re-queues the version.
        event.result = None;
        queue.set(&event).await.unwrap();
        let unhandled = queue.next_unhandled().await.unwrap().unwrap();
        assert_eq!(unhandled.v, event.v);
    }

    #[tokio::test]
    async fn next_unhandled_skips_failed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir).await;

        let mut failed = queue.add("bad", None, None).await.unwrap();
        failed.add_error("_handle", json!("boom"));
        queue.set(&failed).await.unwrap();
        let pending = queue.add("good", None, None).await.unwrap();

        let next = queue.next_unhandled().await.unwrap().unwrap();
        assert_eq!(next.v, pending.v);
    }

    #[tokio::test]
    async fn round_trips_child_events() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir).await;

        let mut event = queue.add("hi", None, None).await.unwrap();
        let mut child = Event::new(event.v, "child", Some(json!(1)), event.ts);
        child.result = Some(serde_json::Map::new());
        event.events.push(child);
        queue.set(&event).await.unwrap();

        let back = queue.get(event.v).await.unwrap().unwrap();
        assert_eq!(back.events.len(), 1);
        assert_eq!(back.events[0].kind, "child");
        assert_eq!(back.events[0].v, event.v);
    }
}
