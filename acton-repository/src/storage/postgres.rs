//! PostgreSQL storage backend

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::TryStreamExt;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as _, Postgres, Row as _, TypeInfo as _};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{channel_stream, row_channel, Dialect, RowStream, Storage};
use crate::error::{DatabaseError, DatabaseOperation};
use crate::record::{ColumnType, Row, Value, ValueKind};

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, <Postgres as sqlx::Database>::Arguments<'q>>;

/// [`Storage`] over a sqlx `PgPool`
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool (single attempt; see [`crate::database::connect`] for retries)
    pub async fn connect(
        url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| DatabaseError::from(e).with_operation(DatabaseOperation::Connect))?;
        Ok(Self { pool })
    }

    /// The underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_value<'q>(query: PgQuery<'q>, value: &Value) -> PgQuery<'q> {
    match value {
        Value::Null(kind) => match kind {
            ValueKind::Bool => query.bind(None::<bool>),
            ValueKind::Int => query.bind(None::<i64>),
            ValueKind::Float => query.bind(None::<f64>),
            ValueKind::Uuid => query.bind(None::<Uuid>),
            ValueKind::Timestamp => query.bind(None::<DateTime<Utc>>),
            ValueKind::Bytes => query.bind(None::<Vec<u8>>),
            ValueKind::Text | ValueKind::Any => query.bind(None::<String>),
        },
        Value::Bool(b) => query.bind(*b),
        Value::Int(n) => query.bind(*n),
        Value::Float(n) => query.bind(*n),
        Value::Text(s) => query.bind(s.clone()),
        Value::Uuid(id) => query.bind(*id),
        Value::Timestamp(ts) => query.bind(*ts),
        Value::Bytes(bytes) => query.bind(bytes.clone()),
    }
}

fn build_query<'q>(sql: &'q str, params: &[Value]) -> PgQuery<'q> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| bind_value(query, value))
}

fn decode_row(row: &PgRow) -> Result<Row, DatabaseError> {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "UUID" => row.try_get::<Option<Uuid>, _>(index)?.to_value(),
            "TIMESTAMPTZ" => row.try_get::<Option<DateTime<Utc>>, _>(index)?.to_value(),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(index)?
                .map(|ts| ts.and_utc())
                .to_value(),
            "INT2" => row
                .try_get::<Option<i16>, _>(index)?
                .map(i64::from)
                .to_value(),
            "INT4" => row
                .try_get::<Option<i32>, _>(index)?
                .map(i64::from)
                .to_value(),
            "INT8" => row.try_get::<Option<i64>, _>(index)?.to_value(),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(index)?
                .map(f64::from)
                .to_value(),
            "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.to_value(),
            "BOOL" => row.try_get::<Option<bool>, _>(index)?.to_value(),
            "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(index)?.to_value(),
            _ => row.try_get_unchecked::<Option<String>, _>(index)?.to_value(),
        };
        out.push(column.name(), value);
    }
    Ok(out)
}

#[async_trait]
impl Storage for PgStorage {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DatabaseError> {
        let sql = Dialect::Postgres.rewrite_placeholders(sql);
        debug!(sql = %sql, params = params.len(), "postgres execute");
        let result = build_query(&sql, params)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::from(e).with_operation(DatabaseOperation::Execute))?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DatabaseError> {
        let sql = Dialect::Postgres.rewrite_placeholders(sql);
        debug!(sql = %sql, params = params.len(), "postgres query");
        let rows = build_query(&sql, params)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from)?;
        rows.iter().map(decode_row).collect()
    }

    fn stream(&self, sql: String, params: Vec<Value>) -> RowStream {
        let sql = Dialect::Postgres.rewrite_placeholders(&sql).into_owned();
        debug!(sql = %sql, params = params.len(), "postgres stream");
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
