//! # acton-repository
//!
//! Typed record repository for relational stores (PostgreSQL and SQLite via sqlx).
//!
//! ## Features
//!
//! - **Typed CRUD**: create/load/update/delete over any [`Record`](record::Record) type
//! - **Query builder**: filters, `IN` lists, full-text search, ordering, paging and cursors
//! - **Soft delete**: `deleted_at` marking with inclusive lookups, restore and hard delete
//! - **Safety**: identity checks before storage calls; mutations touch exactly one row
//! - **Hooks**: before/after create and update, after delete, with column injection
//! - **Error classification**: not-found and unique-violation detection with user messages
//! - **Query stats**: per-descriptor latency aggregation with periodic top-N reports
//!
//! ## Example
//!
//! ```rust,ignore
//! use acton_repository::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let stats = StatsCollector::spawn(&config.stats);
//!     let database = config.database.clone().unwrap_or_else(|| DatabaseConfig::new("sqlite::memory:"));
//!     let repo = Repository::connect(&database, stats.handle()).await?;
//!
//!     let ctx = RequestContext::background();
//!     let mut user = User::new("ada@example.com", "Ada");
//!     repo.create(&ctx, &mut user).await?;
//!
//!     let (page, more) = repo
//!         .query::<User>(&ctx)
//!         .filter("name", FilterOperator::Equal, "Ada")
//!         .with_page_size(25)
//!         .all_with_page_full()
//!         .await?;
//!
//!     stats.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod config;
pub mod context;
pub mod cursor;
pub mod database;
pub mod error;
pub mod hooks;
pub mod observability;
pub mod query;
pub mod record;
pub mod repository;
pub mod stats;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::classify::{is_not_found, is_unique_violation, ErrorClassifier, UniqueIndex};
    pub use crate::config::{Config, DatabaseConfig, StatsConfig};
    pub use crate::context::RequestContext;
    pub use crate::cursor::Cursor;
    pub use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation, Error, Result};
    pub use crate::hooks::{HookContext, HookKind};
    pub use crate::observability::init_tracing;
    pub use crate::query::{Expr, FilterOperator, Predicate, Query, RecordStream};
    pub use crate::record::{ColumnValues, Record, RecordMeta, RecordSchema, Row, Value};
    pub use crate::repository::{
        Repository, RepositoryError, RepositoryErrorKind, RepositoryOperation,
    };
    pub use crate::stats::{QueryStat, StatsCollector, StatsHandle};
    pub use crate::storage::{Dialect, PgStorage, SqliteStorage, Storage};
}
