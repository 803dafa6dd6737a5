//! Document tables: one table per model, a TEXT primary key and the whole
//! row as compact JSON.
//!
//! Declared columns become `json_extract` expression indexes rather than
//! real columns, so the document stays the single source of truth. All
//! operations are generic over the executor and serve both the open write
//! transaction and the read pool.

use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Row, SqliteConnection};

use crate::sql::{json_path, quote_ident};
use crate::StoreError;

//─────────────────────────────
//  Schema
//─────────────────────────────

/// A declared JSON column of a document model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Top-level field name inside the document.
    pub name: String,
    /// Whether lookups on this field get an expression index.
    pub indexed: bool,
}

impl ColumnDef {
    /// A plain, unindexed column declaration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexed: false,
        }
    }

    /// A column declaration with an expression index.
    pub fn indexed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexed: true,
        }
    }
}

/// Create the table and indexes for a model. Runs inside the caller's
/// transaction.
pub async fn migrate_model(
    conn: &mut SqliteConnection,
    table: &str,
    columns: &[ColumnDef],
) -> Result<(), StoreError> {
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY NOT NULL, json TEXT NOT NULL) STRICT",
        quote_ident(table)
    );
    sqlx::query(&ddl).execute(&mut *conn).await?;

    for column in columns.iter().filter(|c| c.indexed) {
        let ddl = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (json_extract(json, '$.{}'))",
            quote_ident(&format!("idx_{}_{}", table, column.name)),
            quote_ident(table),
            column.name
        );
        sqlx::query(&ddl).execute(&mut *conn).await?;
    }
    Ok(())
}

//─────────────────────────────
//  Reads
//─────────────────────────────

/// Fetch a document by id.
pub async fn get<'e, E>(executor: E, table: &str, id: &str) -> Result<Option<Value>, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT json FROM {} WHERE id = ?", quote_ident(table));
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;
    row.map(parse_doc).transpose()
}

/// First document matching all query pairs, in id order.
pub async fn search_one<'e, E>(
    executor: E,
    table: &str,
    query: &[(&str, Value)],
) -> Result<Option<Value>, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT json FROM {}{} ORDER BY id LIMIT 1",
        quote_ident(table),
        where_clause(query)
    );
    let row = bind_query(sqlx::query(&sql), query)
        .fetch_optional(executor)
        .await?;
    row.map(parse_doc).transpose()
}

/// All documents matching the query pairs, in id order.
pub async fn search<'e, E>(
    executor: E,
    table: &str,
    query: &[(&str, Value)],
) -> Result<Vec<Value>, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT json FROM {}{} ORDER BY id",
        quote_ident(table),
        where_clause(query)
    );
    let rows = bind_query(sqlx::query(&sql), query)
        .fetch_all(executor)
        .await?;
    rows.into_iter().map(parse_doc).collect()
}

/// Number of documents matching the query pairs.
pub async fn count<'e, E>(
    executor: E,
    table: &str,
    query: &[(&str, Value)],
) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT COUNT(*) AS n FROM {}{}",
        quote_ident(table),
        where_clause(query)
    );
    let row = bind_query(sqlx::query(&sql), query)
        .fetch_one(executor)
        .await?;
    Ok(row.get("n"))
}

//─────────────────────────────
//  Writes
//─────────────────────────────

/// Upsert a whole document.
pub async fn put(
    conn: &mut SqliteConnection,
    table: &str,
    row: &Value,
) -> Result<(), StoreError> {
    let id = doc_id(row)?;
    let sql = format!(
        "INSERT INTO {} (id, json) VALUES (?, ?) \
         ON CONFLICT(id) DO UPDATE SET json = excluded.json",
        quote_ident(table)
    );
    sqlx::query(&sql)
        .bind(&id)
        .bind(serde_json::to_string(row)?)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Insert a document, failing on an existing id.
pub async fn insert(
    conn: &mut SqliteConnection,
    table: &str,
    row: &Value,
) -> Result<(), StoreError> {
    let id = doc_id(row)?;
    let sql = format!("INSERT INTO {} (id, json) VALUES (?, ?)", quote_ident(table));
    let result = sqlx::query(&sql)
        .bind(&id)
        .bind(serde_json::to_string(row)?)
        .execute(&mut *conn)
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(StoreError::Duplicate {
            table: table.to_string(),
            id,
        }),
        Err(err) => Err(err.into()),
    }
}

/// Shallow-merge a patch into an existing document and return the merged
/// value. The patch must carry the target id.
pub async fn update(
    conn: &mut SqliteConnection,
    table: &str,
    patch: &Value,
) -> Result<Value, StoreError> {
    let id = doc_id(patch)?;
    let existing = get(&mut *conn, table, &id)
        .await?
        .ok_or_else(|| StoreError::MissingRow {
            table: table.to_string(),
            id: id.clone(),
        })?;

    let mut merged = existing;
    if let (Some(target), Some(fields)) = (merged.as_object_mut(), patch.as_object()) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }

    let sql = format!("UPDATE {} SET json = ? WHERE id = ?", quote_ident(table));
    sqlx::query(&sql)
        .bind(serde_json::to_string(&merged)?)
        .bind(&id)
        .execute(&mut *conn)
        .await?;
    Ok(merged)
}

/// Delete a document by id. Deleting a missing id is a no-op.
pub async fn delete(
    conn: &mut SqliteConnection,
    table: &str,
    id: &str,
) -> Result<(), StoreError> {
    let sql = format!("DELETE FROM {} WHERE id = ?", quote_ident(table));
    sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
    Ok(())
}

//─────────────────────────────
//  Helpers
//─────────────────────────────

/// Extract the primary key from a document: a string or numeric `id` field.
/// Numeric ids are stringified for the key column; the document keeps the
/// original value.
pub fn doc_id(row: &Value) -> Result<String, StoreError> {
    match row.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(StoreError::MissingId),
    }
}

fn parse_doc(row: SqliteRow) -> Result<Value, StoreError> {
    let text: String = row.get("json");
    Ok(serde_json::from_str(&text)?)
}

fn where_clause(query: &[(&str, Value)]) -> String {
    if query.is_empty() {
        return String::new();
    }
    let clauses: Vec<String> = query
        .iter()
        .map(|(_, value)| {
            if value.is_null() {
                "json_extract(json, ?) IS NULL".to_string()
            } else {
                "json_extract(json, ?) = ?".to_string()
            }
        })
        .collect();
    format!(" WHERE {}", clauses.join(" AND "))
}

fn bind_query<'q>(
    mut q: Query<'q, Sqlite, SqliteArguments<'q>>,
    query: &'q [(&str, Value)],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for (field, value) in query {
        q = q.bind(json_path(field));
        q = match value {
            Value::Null => q,
            Value::String(s) => q.bind(s.as_str()),
            Value::Bool(b) => q.bind(*b),
            Value::Number(n) if n.is_i64() => q.bind(n.as_i64().unwrap_or_default()),
            Value::Number(n) => q.bind(n.as_f64().unwrap_or_default()),
            other => q.bind(other.to_string()),
        };
    }
    q
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            let code = code.as_deref().unwrap_or("");
            code == "1555" || code == "2067" || db.message().contains("UNIQUE constraint")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionOptions};
    use crate::StoreError;
    use serde_json::json;
    use std::sync::Arc;
    use tephra_bus::InMemoryBus;

    async fn test_table(dir: &tempfile::TempDir) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(
            ConnectionOptions::new(dir.path().join("d.db")),
            InMemoryBus::new(4),
        ));
        conn.with_txn::<_, StoreError, _>(|c| {
            Box::pin(async move {
                let columns = [ColumnDef::indexed("count"), ColumnDef::new("note")];
                migrate_model(c, "foo", &columns).await
            })
        })
        .await
        .unwrap();
        conn
    }

    #[tokio::test]
    async fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let conn = test_table(&dir).await;

        conn.with_txn::<_, StoreError, _>(|c| {
            Box::pin(async move {
                put(c, "foo", &json!({"id": "a", "count": 1})).await?;
                put(c, "foo", &json!({"id": "a", "count": 2})).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        let doc = conn
            .with_writer::<_, StoreError, _>(|c| Box::pin(get(c, "foo", "a")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc, json!({"id": "a", "count": 2}));

        conn.with_txn::<_, StoreError, _>(|c| Box::pin(delete(c, "foo", "a")))
            .await
            .unwrap();
        let gone = conn
            .with_writer::<_, StoreError, _>(|c| Box::pin(get(c, "foo", "a")))
            .await
            .unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let conn = test_table(&dir).await;

        let result = conn
            .with_txn::<_, StoreError, _>(|c| {
                Box::pin(async move {
                    insert(c, "foo", &json!({"id": "a"})).await?;
                    insert(c, "foo", &json!({"id": "a"})).await
                })
            })
            .await;
        assert!(matches!(result, Err(StoreError::Duplicate { .. })));
    }

    #[tokio::test]
    async fn update_merges_shallowly() {
        let dir = tempfile::tempdir().unwrap();
        let conn = test_table(&dir).await;

        let merged = conn
            .with_txn::<_, StoreError, _>(|c| {
                Box::pin(async move {
                    put(c, "foo", &json!({"id": "a", "count": 1, "note": "x"})).await?;
                    update(c, "foo", &json!({"id": "a", "count": 5})).await
                })
            })
            .await
            .unwrap();
        assert_eq!(merged, json!({"id": "a", "count": 5, "note": "x"}));

        let missing = conn
            .with_txn::<_, StoreError, _>(|c| {
                Box::pin(async move { update(c, "foo", &json!({"id": "nope", "count": 1})).await })
            })
            .await;
        assert!(matches!(missing, Err(StoreError::MissingRow { .. })));
    }

    #[tokio::test]
    async fn search_matches_json_fields() {
        let dir = tempfile::tempdir().unwrap();
        let conn = test_table(&dir).await;

        conn.with_txn::<_, StoreError, _>(|c| {
            Box::pin(async move {
                put(c, "foo", &json!({"id": "a", "count": 1, "note": "keep"})).await?;
                put(c, "foo", &json!({"id": "b", "count": 2, "note": "keep"})).await?;
                put(c, "foo", &json!({"id": "c", "count": 2})).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        let pool = conn.readers().await.unwrap();
        let twos = search(pool, "foo", &[("count", json!(2))]).await.unwrap();
        assert_eq!(twos.len(), 2);
        assert_eq!(doc_id(&twos[0]).unwrap(), "b");

        let one = search_one(pool, "foo", &[("count", json!(2)), ("note", json!("keep"))])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc_id(&one).unwrap(), "b");

        let missing_note = search(pool, "foo", &[("note", Value::Null)]).await.unwrap();
        assert_eq!(missing_note.len(), 1);
        assert_eq!(doc_id(&missing_note[0]).unwrap(), "c");

        assert_eq!(count(pool, "foo", &[]).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn numeric_ids_are_stringified() {
        assert_eq!(doc_id(&json!({"id": 42})).unwrap(), "42");
        assert!(doc_id(&json!({"note": "no id"})).is_err());
        assert!(doc_id(&json!({"id": ""})).is_err());
    }
}
