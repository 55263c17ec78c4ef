//! Storage collaborator
//!
//! The repository talks to the relational store through the narrow [`Storage`]
//! trait: execute a statement, fetch rows, stream rows. Statements always use
//! `?` placeholders; backends rewrite them to their native form.
//!
//! Two sqlx backends are provided:
//!
//! - [`SqliteStorage`] over a `SqlitePool`
//! - [`PgStorage`] over a `PgPool`

use std::borrow::Cow;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::DatabaseError;
use crate::record::{Row, Value};

mod postgres;
mod sqlite;

pub use postgres::PgStorage;
pub use sqlite::SqliteStorage;

/// Rows produced by [`Storage::stream`]
pub type RowStream = BoxStream<'static, Result<Row, DatabaseError>>;

/// Buffered rows between a streaming query task and its consumer
const STREAM_BUFFER: usize = 64;

/// SQL dialect of a storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// PostgreSQL
    Postgres,
    /// SQLite
    Sqlite,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl Dialect {
    /// Pick a dialect from a connection URL scheme
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if url.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else {
            None
        }
    }

    /// Whether `to_tsvector`/`to_tsquery` are available
    pub fn supports_fulltext(&self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// Rewrite `?` placeholders into the dialect's native form
    ///
    /// Question marks inside single-quoted literals are left alone.
    pub fn rewrite_placeholders<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        match self {
            Self::Sqlite => Cow::Borrowed(sql),
            Self::Postgres => {
                let mut out = String::with_capacity(sql.len() + 8);
                let mut index = 0;
                let mut in_literal = false;
                for ch in sql.chars() {
                    match ch {
                        '\'' => {
                            in_literal = !in_literal;
                            out.push(ch);
                        }
                        '?' if !in_literal => {
                            index += 1;
                            out.push('$');
                            out.push_str(&index.to_string());
                        }
                        _ => out.push(ch),
                    }
                }
                Cow::Owned(out)
            }
        }
    }
}

/// Number of `?` placeholders in a statement fragment
///
/// Question marks inside single-quoted literals are not placeholders.
pub fn count_placeholders(sql: &str) -> usize {
    let mut in_literal = false;
    sql.chars()
        .filter(|ch| match *ch {
            '\'' => {
                in_literal = !in_literal;
                false
            }
            '?' => !in_literal,
            _ => false,
        })
        .count()
}

/// Narrow interface to the relational store
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Dialect used to render statements
    fn dialect(&self) -> Dialect;

    /// Execute a statement, returning the number of affected rows
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DatabaseError>;

    /// Run a query and collect every row
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DatabaseError>;

    /// Run a query and stream its rows
    fn stream(&self, sql: String, params: Vec<Value>) -> RowStream;

    /// Close the underlying pool
    async fn close(&self) {}
}

/// Turn the receiving half of a row channel into a [`RowStream`]
pub(crate) fn channel_stream(
    rx: mpsc::Receiver<Result<Row, DatabaseError>>,
) -> RowStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

/// Sender used by backends to feed [`channel_stream`]
pub(crate) fn row_channel() -> (
    mpsc::Sender<Result<Row, DatabaseError>>,
    mpsc::Receiver<Result<Row, DatabaseError>>,
) {
    mpsc::channel(STREAM_BUFFER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(
            Dialect::from_url("postgres://u:p@localhost/db"),
            Some(Dialect::Postgres)
        );
        assert_eq!(
            Dialect::from_url("postgresql://localhost/db"),
            Some(Dialect::Postgres)
        );
        assert_eq!(Dialect::from_url("sqlite::memory:"), Some(Dialect::Sqlite));
        assert_eq!(Dialect::from_url("mysql://localhost/db"), None);
    }

    #[test]
    fn test_postgres_placeholder_rewrite() {
        let sql = "SELECT * FROM t WHERE (a = ?) AND (b in (?,?)) AND c = 'what?'";
        assert_eq!(
            Dialect::Postgres.rewrite_placeholders(sql),
            "SELECT * FROM t WHERE (a = $1) AND (b in ($2,$3)) AND c = 'what?'"
        );
        assert_eq!(Dialect::Sqlite.rewrite_placeholders(sql), sql);
    }

    #[test]
    fn test_count_placeholders() {
        assert_eq!(count_placeholders("a = ? AND b = ?"), 2);
        assert_eq!(count_placeholders("deleted_at IS NULL"), 0);
        assert_eq!(count_placeholders("name <> 'who?'"), 0);
        assert_eq!(count_placeholders("a = ? AND b = 'it''s ?' AND c = ?"), 2);
    }

    #[tokio::test]
    async fn test_channel_stream_ends_when_sender_dropped() {
        let (tx, rx) = row_channel();
        let mut row = Row::new();
        row.push("n", Value::Int(1));
        tx.send(Ok(row.clone())).await.unwrap();
        drop(tx);

        let rows: Vec<_> = channel_stream(rx).collect().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].as_ref().unwrap(), &row);
    }
}
