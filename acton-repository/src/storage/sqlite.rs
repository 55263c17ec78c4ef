//! SQLite storage backend
//!
//! UUIDs are stored as hyphenated text and timestamps as fixed-width RFC 3339
//! text (`2024-05-01T10:00:00.000000Z`), so they sort correctly as strings.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column as _, Row as _, Sqlite, TypeInfo as _, ValueRef as _};
use tracing::debug;

use super::{channel_stream, row_channel, Dialect, RowStream, Storage};
use crate::error::{DatabaseError, DatabaseOperation};
use crate::record::{Row, Value, ValueKind};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, <Sqlite as sqlx::Database>::Arguments<'q>>;

/// [`Storage`] over a sqlx `SqlitePool`
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Wrap an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool for a `sqlite:` URL, creating the file if missing
    ///
    /// In-memory databases get a single long-lived connection so every query
    /// sees the same database.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| DatabaseError::from(e).with_operation(DatabaseOperation::Connect))?
            .create_if_missing(true);

        let pool_options = if url.contains(":memory:") || url.contains("mode=memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::from(e).with_operation(DatabaseOperation::Connect))?;
        Ok(Self { pool })
    }

    /// Open a private in-memory database
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// The underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null(_) => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(n) => query.bind(*n),
        Value::Float(n) => query.bind(*n),
        Value::Text(s) => query.bind(s.clone()),
        Value::Uuid(id) => query.bind(id.hyphenated().to_string()),
        Value::Timestamp(ts) => query.bind(format_timestamp(ts)),
        Value::Bytes(bytes) => query.bind(bytes.clone()),
    }
}

fn build_query<'q>(sql: &'q str, params: &[Value]) -> SqliteQuery<'q> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| bind_value(query, value))
}

fn decode_row(row: &SqliteRow) -> Result<Row, DatabaseError> {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null(ValueKind::Any)
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Value::Int(row.try_get::<i64, _>(index)?),
                "REAL" => Value::Float(row.try_get::<f64, _>(index)?),
                "BLOB" => Value::Bytes(row.try_get::<Vec<u8>, _>(index)?),
                _ => Value::Text(row.try_get::<String, _>(index)?),
            }
        };
        out.push(column.name(), value);
    }
    Ok(out)
}

#[async_trait]
impl Storage for SqliteStorage {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DatabaseError> {
        debug!(sql, params = params.len(), "sqlite execute");
        let result = build_query(sql, params)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::from(e).with_operation(DatabaseOperation::Execute))?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DatabaseError> {
        debug!(sql, params = params.len(), "sqlite query");
        let rows = build_query(sql, params)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from)?;
        rows.iter().map(decode_row).collect()
    }

    fn stream(&self, sql: String, params: Vec<Value>) -> RowStream {
        debug!(sql = %sql, params = params.len(), "sqlite stream");
        let pool = self.pool.clone();
        let (tx, rx) = row_channel();
        tokio::spawn(async move {
            let mut rows = build_query(&sql, &params).fetch(&pool);
            loop {
                let item = match rows.try_next().await {
                    Ok(Some(row)) => decode_row(&row),
                    Ok(None) => break,
                    Err(e) => Err(DatabaseError::from(e).with_operation(DatabaseOperation::Stream)),
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        channel_stream(rx)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseErrorKind;
    use futures::StreamExt;
    use uuid::Uuid;

    async fn storage() -> SqliteStorage {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage
            .execute(
                "CREATE TABLE items (id TEXT PRIMARY KEY, n INTEGER, score REAL, label TEXT, at TEXT, data BLOB)",
                &[],
            )
            .await
            .unwrap();
        storage
            .execute("CREATE UNIQUE INDEX idx_items_label ON items (label)", &[])
            .await
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn test_insert_and_query_roundtrip() {
        let storage = storage().await;
        let id = Uuid::new_v4();
        let at: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        let affected = storage
            .execute(
                "INSERT INTO items (id, n, score, label, at, data) VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    Value::Uuid(id),
                    Value::Int(3),
                    Value::Float(1.5),
                    Value::Null(ValueKind::Text),
                    Value::Timestamp(at),
                    Value::Bytes(vec![1, 2]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = storage
            .query("SELECT id, n, score, label, at, data FROM items WHERE id = ?", &[Value::Uuid(id)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get_as::<Uuid>("id").unwrap(), id);
        assert_eq!(row.get("n"), Some(&Value::Int(3)));
        assert_eq!(row.get("score"), Some(&Value::Float(1.5)));
        assert!(row.get("label").unwrap().is_null());
        assert_eq!(row.get_as::<DateTime<Utc>>("at").unwrap(), at);
        assert_eq!(row.get("data"), Some(&Value::Bytes(vec![1, 2])));
    }

    #[tokio::test]
    async fn test_unique_violation_is_classified() {
        let storage = storage().await;
        let sql = "INSERT INTO items (id, label) VALUES (?, ?)";
        storage
            .execute(sql, &[Value::Uuid(Uuid::new_v4()), Value::from("dup")])
            .await
            .unwrap();
        let err = storage
            .execute(sql, &[Value::Uuid(Uuid::new_v4()), Value::from("dup")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, DatabaseErrorKind::UniqueViolation);
        assert_eq!(err.operation, DatabaseOperation::Execute);
        assert!(err.message.contains("items.label"));
    }

    #[tokio::test]
    async fn test_stream_yields_all_rows() {
        let storage = storage().await;
        for n in 0..5 {
            storage
                .execute(
                    "INSERT INTO items (id, n) VALUES (?, ?)",
                    &[Value::Uuid(Uuid::new_v4()), Value::Int(n)],
                )
                .await
                .unwrap();
        }
        let rows: Vec<_> = storage
            .stream("SELECT n FROM items ORDER BY n".to_string(), Vec::new())
            .collect()
            .await;
        let values: Vec<_> = rows
            .into_iter()
            .map(|row| row.unwrap().get_as::<i64>("n").unwrap())
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_query_error_is_returned() {
        let storage = storage().await;
        let err = storage.query("SELECT * FROM missing", &[]).await.unwrap_err();
        assert_eq!(err.kind, DatabaseErrorKind::QueryFailed);
    }
}
