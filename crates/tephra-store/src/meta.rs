//! Version pointer and bookkeeping counters.
//!
//! A single `metadata` row tracks the highest applied version `v` plus
//! handled/failed totals. It is written inside the same transaction as the
//! model changes it accounts for, so rebuilding from the log can never
//! disagree with it.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection};

use crate::StoreError;

const STATE_KEY: &str = "state";

/// The persisted bookkeeping state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MetaState {
    /// Highest version of any fully-processed root event.
    pub v: i64,
    /// Count of successfully handled root events.
    pub handled: i64,
    /// Count of failed root events.
    pub failed: i64,
}

/// Create the `metadata` table. Runs inside the caller's transaction.
pub async fn migrate(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY NOT NULL,
            json TEXT NOT NULL
        ) STRICT
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Read the current state through any executor; zeroes when absent.
pub async fn get_state<'e, E>(executor: E) -> Result<MetaState, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT json FROM metadata WHERE key = ?")
        .bind(STATE_KEY)
        .fetch_optional(executor)
        .await?;
    match row {
        Some(row) => {
            let text: String = row.get("json");
            Ok(serde_json::from_str(&text)?)
        }
        None => Ok(MetaState::default()),
    }
}

/// Advance the version pointer to `v` and bump the outcome counter.
///
/// `v` never moves backwards; replaying an old version only touches the
/// counters.
pub async fn advance(
    conn: &mut SqliteConnection,
    v: i64,
    failed: bool,
) -> Result<MetaState, StoreError> {
    let mut state = get_state(&mut *conn).await?;
    state.v = state.v.max(v);
    if failed {
        state.failed += 1;
    } else {
        state.handled += 1;
    }
    let text = serde_json::to_string(&state)?;
    sqlx::query(
        "INSERT INTO metadata (key, json) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET json = excluded.json",
    )
    .bind(STATE_KEY)
    .bind(text)
    .execute(&mut *conn)
    .await?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionOptions};
    use crate::StoreError;
    use tephra_bus::InMemoryBus;

    #[tokio::test]
    async fn advances_version_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::new(
            ConnectionOptions::new(dir.path().join("m.db")),
            InMemoryBus::new(4),
        );

        let state = conn
            .with_txn::<_, StoreError, _>(|c| {
                Box::pin(async move {
                    migrate(c).await?;
                    advance(c, 1, false).await?;
                    advance(c, 2, true).await?;
                    // Replays never move the pointer backwards.
                    advance(c, 1, false).await
                })
            })
            .await
            .unwrap();

        assert_eq!(state.v, 2);
        assert_eq!(state.handled, 2);
        assert_eq!(state.failed, 1);

        let read_back = conn
            .with_writer::<_, StoreError, _>(|c| Box::pin(get_state(c)))
            .await
            .unwrap();
        assert_eq!(read_back, state);
    }
}
