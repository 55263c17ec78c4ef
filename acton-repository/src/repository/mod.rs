//! Typed record repository
//!
//! [`Repository`] gives create/read/update/delete over any [`Record`] type,
//! backed by one [`Storage`]. Every mutation:
//!
//! - checks the record identity before touching storage
//! - runs the before/after [hooks](crate::hooks) for the record type
//! - affects at most one row; more is reported as
//!   [`RepositoryErrorKind::MultiRowMutation`]
//! - routes storage failures through the [`ErrorClassifier`]
//! - records one latency sample on the [`StatsHandle`]
//!
//! # Example
//!
//! ```rust,ignore
//! use acton_repository::prelude::*;
//!
//! let repo = Repository::connect(&DatabaseConfig::new("sqlite::memory:"), stats.handle()).await?;
//! let ctx = RequestContext::background();
//!
//! repo.add_unique_index::<User>(&ctx, "idx_email", "email taken", &["email"]).await?;
//!
//! let mut user = User::new("ada@example.com", "Ada");
//! repo.create(&ctx, &mut user).await?;
//!
//! user.name = "Ada Lovelace".to_string();
//! repo.update_columns(&ctx, &mut user, &["name"]).await?;
//!
//! repo.delete(&ctx, &mut user).await?;
//! assert!(repo.by_id::<User>(&ctx, user.id()).await.unwrap_err().is_not_found());
//! ```

mod error;

pub use error::{RepositoryError, RepositoryErrorKind, RepositoryOperation};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, error};
use uuid::Uuid;

use crate::classify::{ErrorClassifier, UniqueIndex};
use crate::config::DatabaseConfig;
use crate::context::RequestContext;
use crate::error::DatabaseError;
use crate::hooks::{HookContext, HookKind, ListenerRegistry};
use crate::query::{FilterOperator, Query};
use crate::record::{ColumnValues, Record, Row, Value, ValueError, ValueKind, DELETED_AT, ID, UPDATED_AT};
use crate::stats::StatsHandle;
use crate::storage::{count_placeholders, Storage};

/// Entity label used for errors from raw statements
const RAW_ENTITY: &str = "raw";

/// Whether an update sees soft-deleted rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Live,
    Unscoped,
}

/// Current time at the precision the backends store
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Values handed to a mutation that do not fit the record's columns
fn value_error<R: Record>(operation: RepositoryOperation, err: ValueError) -> RepositoryError {
    malformed::<R>(operation, err.to_string())
}

fn require_identity<R: Record>(
    operation: RepositoryOperation,
    record: &R,
) -> Result<(), RepositoryError> {
    if record.is_id_nil() {
        return Err(RepositoryError::invalid_identity(
            operation,
            format!("{} has no identity", R::TYPE_NAME),
        )
        .with_entity_type(R::TYPE_NAME));
    }
    Ok(())
}

fn malformed<R: Record>(operation: RepositoryOperation, message: String) -> RepositoryError {
    RepositoryError::new(operation, RepositoryErrorKind::MalformedQuery, message)
        .with_entity_type(R::TYPE_NAME)
}

/// Reject `id` and columns the schema does not know
fn check_columns<'a, R, I>(operation: RepositoryOperation, columns: I) -> Result<(), RepositoryError>
where
    R: Record,
    I: IntoIterator<Item = &'a str>,
{
    let schema = R::schema();
    for column in columns {
        if column == ID {
            return Err(malformed::<R>(
                operation,
                "the identity column cannot be updated".to_string(),
            ));
        }
        if !schema.has_column(column) {
            return Err(malformed::<R>(
                operation,
                format!("unknown column {} on {}", column, R::TYPE_NAME),
            ));
        }
    }
    Ok(())
}

/// `column = ?` clauses with their parameters, in column order
fn assign(values: &ColumnValues) -> (Vec<String>, Vec<Value>) {
    values
        .iter()
        .map(|(column, value)| (format!("{} = ?", column), value.clone()))
        .unzip()
}

fn check_placeholders(sql: &str, params: &[Value]) -> Result<(), RepositoryError> {
    let placeholders = count_placeholders(sql);
    if placeholders != params.len() {
        return Err(RepositoryError::new(
            RepositoryOperation::Raw,
            RepositoryErrorKind::MalformedQuery,
            format!(
                "invalid expression placeholders count: '{}' has {} placeholder(s), {} param(s)",
                sql,
                placeholders,
                params.len()
            ),
        ));
    }
    Ok(())
}

/// Record repository over one storage backend
///
/// `Send + Sync`; share it by reference or in an `Arc`.
pub struct Repository {
    storage: Arc<dyn Storage>,
    stats: StatsHandle,
    listeners: ListenerRegistry,
    classifier: Arc<ErrorClassifier>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("dialect", &self.storage.dialect())
            .field("stats_enabled", &self.stats.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Create a repository over an open storage backend
    pub fn new(storage: Arc<dyn Storage>, stats: StatsHandle) -> Self {
        Self {
            storage,
            stats,
            listeners: ListenerRegistry::new(),
            classifier: Arc::new(ErrorClassifier::new()),
        }
    }

    /// Connect to the configured database and create a repository over it
    pub async fn connect(config: &DatabaseConfig, stats: StatsHandle) -> crate::error::Result<Self> {
        let storage = crate::database::connect(config).await?;
        Ok(Self::new(storage, stats))
    }

    /// Underlying storage
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Stats sink
    pub fn stats(&self) -> &StatsHandle {
        &self.stats
    }

    /// Error classifier holding the registered unique indexes
    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Application listener registry
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub(crate) fn classifier_handle(&self) -> Arc<ErrorClassifier> {
        Arc::clone(&self.classifier)
    }

    pub(crate) fn classify(
        &self,
        operation: RepositoryOperation,
        entity_type: &str,
        err: DatabaseError,
    ) -> RepositoryError {
        self.classifier.classify(operation, entity_type, err)
    }

    /// Close the storage pool
    pub async fn close(&self) {
        self.storage.close().await;
    }

    /// Start a query over `R`
    pub fn query<R: Record>(&self, ctx: &RequestContext) -> Query<'_, R> {
        Query::new(self, ctx)
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        operation: RepositoryOperation,
        entity_type: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<u64, RepositoryError> {
        debug!(operation = %operation, sql, params = params.len(), "executing statement");
        ctx.guard(operation, async {
            self.storage
                .execute(sql, params)
                .await
                .map_err(|e| self.classify(operation, entity_type, e))
        })
        .await
    }

    // ---- registration ----

    /// Register an application listener for one record type and hook kind
    pub async fn add_listener<R, F>(&self, hook: HookKind, listener: F)
    where
        R: Record,
        F: Fn(&RequestContext, HookKind, &R, &mut HookContext) + Send + Sync + 'static,
    {
        self.listeners.add::<R, F>(hook, listener).await;
    }

    /// Create a unique index on `R`'s table and register its violation message
    pub async fn add_unique_index<R: Record>(
        &self,
        ctx: &RequestContext,
        name: &str,
        message: &str,
        columns: &[&str],
    ) -> Result<(), RepositoryError> {
        self.create_index::<R>(ctx, "CREATE UNIQUE INDEX", name, columns)
            .await?;
        self.classifier.register(UniqueIndex::new(
            name,
            R::TABLE,
            columns.iter().copied(),
            message,
        ));
        Ok(())
    }

    /// Create a plain index on `R`'s table
    pub async fn add_index<R: Record>(
        &self,
        ctx: &RequestContext,
        name: &str,
        columns: &[&str],
    ) -> Result<(), RepositoryError> {
        self.create_index::<R>(ctx, "CREATE INDEX", name, columns)
            .await
    }

    async fn create_index<R: Record>(
        &self,
        ctx: &RequestContext,
        statement: &str,
        name: &str,
        columns: &[&str],
    ) -> Result<(), RepositoryError> {
        let operation = RepositoryOperation::Index;
        if columns.is_empty() {
            return Err(malformed::<R>(operation, format!("index {} has no columns", name)));
        }
        let schema = R::schema();
        if let Some(unknown) = columns.iter().find(|c| !schema.has_column(c)) {
            return Err(malformed::<R>(
                operation,
                format!("unknown column {} on {}", unknown, R::TYPE_NAME),
            ));
        }
        let sql = format!(
            "{} IF NOT EXISTS {} ON {} ({})",
            statement,
            name,
            R::TABLE,
            columns.join(", ")
        );
        self.execute(ctx, operation, R::TYPE_NAME, &sql, &[])
            .await?;
        Ok(())
    }

    /// Register a violation message for a constraint created elsewhere
    pub fn register_unique_message(&self, name: &str, message: &str) {
        self.classifier.register_message(name, message);
    }

    // ---- create ----

    /// Insert a new record
    ///
    /// The record must not have an identity yet; one is generated here. If the
    /// insert fails the identity is reset to nil.
    pub async fn create<R: Record>(
        &self,
        ctx: &RequestContext,
        record: &mut R,
    ) -> Result<(), RepositoryError> {
        let _timer = self.stats.timer(format!("creating {}", R::TYPE_NAME));
        let operation = RepositoryOperation::Create;

        if !record.is_id_nil() {
            return Err(RepositoryError::invalid_identity(
                operation,
                "cannot create a record that already has an identity",
            )
            .with_entity(R::TYPE_NAME, record.id().to_string()));
        }

        record.generate_id();
        let created = now();
        {
            let meta = record.meta_mut();
            meta.created_at = created;
            meta.updated_at = created;
        }

        let result = self.insert(ctx, record).await;
        if result.is_err() {
            record.meta_mut().id = Uuid::nil();
        }
        result
    }

    async fn insert<R: Record>(
        &self,
        ctx: &RequestContext,
        record: &mut R,
    ) -> Result<(), RepositoryError> {
        let operation = RepositoryOperation::Create;
        let schema = R::schema();

        let mut hctx = HookContext::for_all_columns();
        self.listeners
            .dispatch(ctx, HookKind::BeforeCreate, &*record, &mut hctx)
            .await;
        check_columns::<R, _>(operation, hctx.fields().keys().map(String::as_str))?;
        schema
            .apply(record, hctx.fields())
            .map_err(|e| value_error::<R>(operation, e))?;
        let derived = schema.before_save(record);
        schema
            .apply(record, &derived)
            .map_err(|e| value_error::<R>(operation, e))?;

        let values = schema.values(record);
        let columns: Vec<&str> = values.keys().map(String::as_str).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            R::TABLE,
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );
        let params: Vec<Value> = values.values().cloned().collect();
        self.execute(ctx, operation, R::TYPE_NAME, &sql, &params)
            .await?;

        self.listeners
            .dispatch(ctx, HookKind::AfterCreate, &*record, &mut hctx)
            .await;
        Ok(())
    }

    /// Create every record concurrently; the first failure is returned
    ///
    /// Every create runs to completion, so each record ends up either stored
    /// with its identity or reset to a nil identity. No transaction spans the
    /// records: those created alongside a failure stay.
    pub async fn create_multi<R: Record>(
        &self,
        ctx: &RequestContext,
        records: &mut [R],
    ) -> Result<(), RepositoryError> {
        futures::future::join_all(records.iter_mut().map(|record| self.create(ctx, record)))
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()?;
        Ok(())
    }

    // ---- read ----

    async fn find_by_id<R: Record>(
        &self,
        ctx: &RequestContext,
        operation: RepositoryOperation,
        id: Uuid,
        include_deleted: bool,
    ) -> Result<R, RepositoryError> {
        if id.is_nil() {
            return Err(RepositoryError::invalid_identity(
                operation,
                format!("cannot look up {} by nil id", R::TYPE_NAME),
            )
            .with_entity_type(R::TYPE_NAME));
        }
        let mut query = self
            .query::<R>(ctx)
            .filter(ID, FilterOperator::Equal, id);
        if include_deleted {
            query = query.include_deleted();
        }
        query.first().await.map_err(|e| {
            let e = e.with_operation(operation);
            if e.is_not_found() {
                e.with_entity(R::TYPE_NAME, id.to_string())
            } else {
                e
            }
        })
    }

    /// Refresh a record from storage by its identity
    pub async fn load<R: Record>(
        &self,
        ctx: &RequestContext,
        record: &mut R,
    ) -> Result<(), RepositoryError> {
        let _timer = self.stats.timer(format!("loading {}", R::TYPE_NAME));
        let operation = RepositoryOperation::Load;
        require_identity(operation, record)?;
        *record = self
            .find_by_id::<R>(ctx, operation, record.id(), false)
            .await?;
        Ok(())
    }

    /// Reload several records in order
    pub async fn reload<R: Record>(
        &self,
        ctx: &RequestContext,
        records: &mut [R],
    ) -> Result<(), RepositoryError> {
        for record in records.iter_mut() {
            self.load(ctx, record).await?;
        }
        Ok(())
    }

    /// Fetch a live record by identity
    pub async fn by_id<R: Record>(
        &self,
        ctx: &RequestContext,
        id: Uuid,
    ) -> Result<R, RepositoryError> {
        let _timer = self.stats.timer(format!("getting {}", R::TYPE_NAME));
        self.find_by_id(ctx, RepositoryOperation::FindById, id, false)
            .await
    }

    /// Fetch a live record by the text form of its identity
    pub async fn by_string_id<R: Record>(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> Result<R, RepositoryError> {
        let operation = RepositoryOperation::FindById;
        if id.is_empty() {
            return Err(
                RepositoryError::invalid_identity(operation, "empty id").with_entity_type(R::TYPE_NAME)
            );
        }
        let id = Uuid::parse_str(id).map_err(|e| {
            RepositoryError::invalid_identity(operation, format!("invalid id {}: {}", id, e))
                .with_entity_type(R::TYPE_NAME)
        })?;
        self.by_id(ctx, id).await
    }

    /// Fetch a record by identity, soft-deleted or not
    pub async fn get_deleted_by_id<R: Record>(
        &self,
        ctx: &RequestContext,
        id: Uuid,
    ) -> Result<R, RepositoryError> {
        let _timer = self
            .stats
            .timer(format!("getting deleted {}", R::TYPE_NAME));
        self.find_by_id(ctx, RepositoryOperation::FindById, id, true)
            .await
    }

    // ---- update ----

    /// Write the named columns, reading their values from the record
    pub async fn update_columns<R: Record>(
        &self,
        ctx: &RequestContext,
        record: &mut R,
        columns: &[&str],
    ) -> Result<(), RepositoryError> {
        let _timer = self.stats.timer(format!("updating {}", R::TYPE_NAME));
        let operation = RepositoryOperation::Update;
        require_identity(operation, record)?;
        check_columns::<R, _>(operation, columns.iter().copied())?;

        let schema = R::schema();
        let values: ColumnValues = columns
            .iter()
            .filter_map(|column| {
                schema
                    .value_of(record, column)
                    .map(|value| (column.to_string(), value))
            })
            .collect();
        self.save_columns(ctx, operation, record, HookContext::for_columns(values), Scope::Live)
            .await
    }

    /// Write explicit column values and apply them to the record
    pub async fn update_column_values<R: Record>(
        &self,
        ctx: &RequestContext,
        record: &mut R,
        values: ColumnValues,
    ) -> Result<(), RepositoryError> {
        let _timer = self.stats.timer(format!("updating {}", R::TYPE_NAME));
        let operation = RepositoryOperation::Update;
        require_identity(operation, record)?;
        check_columns::<R, _>(operation, values.keys().map(String::as_str))?;

        self.save_columns(ctx, operation, record, HookContext::for_columns(values), Scope::Live)
            .await
    }

    /// Create a record without identity, otherwise write all of its columns
    pub async fn create_or_update<R: Record>(
        &self,
        ctx: &RequestContext,
        record: &mut R,
    ) -> Result<(), RepositoryError> {
        if record.is_id_nil() {
            return self.create(ctx, record).await;
        }
        let _timer = self.stats.timer(format!("saving {}", R::TYPE_NAME));
        self.save_columns(
            ctx,
            RepositoryOperation::Save,
            record,
            HookContext::for_all_columns(),
            Scope::Live,
        )
        .await
    }

    /// Create a record without identity, otherwise write the named columns
    pub async fn create_or_update_columns<R: Record>(
        &self,
        ctx: &RequestContext,
        record: &mut R,
        columns: &[&str],
    ) -> Result<(), RepositoryError> {
        if record.is_id_nil() {
            return self.create(ctx, record).await;
        }
        self.update_columns(ctx, record, columns).await
    }

    /// Clear `deleted_at` on a soft-deleted record
    pub async fn restore<R: Record>(
        &self,
        ctx: &RequestContext,
        record: &mut R,
    ) -> Result<(), RepositoryError> {
        let _timer = self.stats.timer(format!("restoring {}", R::TYPE_NAME));
        let operation = RepositoryOperation::Restore;
        require_identity(operation, record)?;
        if !R::schema().soft_delete() {
            return Err(malformed::<R>(
                operation,
                format!("{} is not soft deleted", R::TYPE_NAME),
            ));
        }
        let mut values = ColumnValues::new();
        values.insert(DELETED_AT.to_string(), Value::Null(ValueKind::Timestamp));
        self.save_columns(ctx, operation, record, HookContext::for_columns(values), Scope::Unscoped)
            .await
    }

    /// Add `delta` to a numeric column in storage and refresh it on the record
    ///
    /// The sum is computed by the statement, so concurrent increments of the
    /// same row all apply. Hooks other than `AfterUpdate` do not run.
    pub async fn incr_column<R: Record>(
        &self,
        ctx: &RequestContext,
        record: &mut R,
        column: &str,
        delta: impl Into<Value>,
    ) -> Result<(), RepositoryError> {
        let _timer = self.stats.timer(format!("updating {}", R::TYPE_NAME));
        let operation = RepositoryOperation::Update;
        require_identity(operation, record)?;
        check_columns::<R, _>(operation, [column])?;

        let schema = R::schema();
        if !matches!(schema.kind_of(column), Some(ValueKind::Int | ValueKind::Float)) {
            return Err(malformed::<R>(
                operation,
                format!("cannot increment non-numeric column {} on {}", column, R::TYPE_NAME),
            ));
        }
        let delta = delta.into();
        if !matches!(delta, Value::Int(_) | Value::Float(_)) {
            return Err(malformed::<R>(
                operation,
                format!("increment of {} must be numeric, found {}", column, delta.kind()),
            ));
        }

        let id = record.id();
        let updated = now();
        let assignments = vec![
            format!("{0} = {0} + ?", column),
            format!("{} = ?", UPDATED_AT),
        ];
        self.update_row::<R>(
            ctx,
            operation,
            id,
            assignments,
            vec![delta, Value::from(updated)],
            Scope::Live,
        )
        .await?;

        let sql = format!("SELECT {} FROM {} WHERE {} = ?", column, R::TABLE, ID);
        let params = [Value::from(id)];
        debug!(operation = %operation, sql = %sql, "reading incremented column");
        let rows = ctx
            .guard(operation, async {
                self.storage
                    .query(&sql, &params)
                    .await
                    .map_err(|e| self.classify(operation, R::TYPE_NAME, e))
            })
            .await?;
        let value = rows
            .first()
            .and_then(|row| row.get(column))
            .cloned()
            .ok_or_else(|| {
                RepositoryError::not_found(R::TYPE_NAME, id.to_string()).with_operation(operation)
            })?;
        schema.set(record, column, value.clone()).map_err(|e| {
            RepositoryError::decode(operation, e.to_string()).with_entity(R::TYPE_NAME, id.to_string())
        })?;
        record.meta_mut().updated_at = updated;

        let mut values = ColumnValues::new();
        values.insert(column.to_string(), value);
        values.insert(UPDATED_AT.to_string(), Value::from(updated));
        let mut hctx = HookContext::for_columns(values);
        self.listeners
            .dispatch(ctx, HookKind::AfterUpdate, &*record, &mut hctx)
            .await;
        Ok(())
    }

    /// Hook dispatch and column merging shared by every update
    ///
    /// The record is updated in place before the statement so `before_save`
    /// sees the new values, and rolled back if the statement fails.
    async fn save_columns<R: Record>(
        &self,
        ctx: &RequestContext,
        operation: RepositoryOperation,
        record: &mut R,
        mut hctx: HookContext,
        scope: Scope,
    ) -> Result<(), RepositoryError> {
        let schema = R::schema();

        self.listeners
            .dispatch(ctx, HookKind::BeforeUpdate, &*record, &mut hctx)
            .await;
        check_columns::<R, _>(operation, hctx.fields().keys().map(String::as_str))?;

        let previous = schema.values(record);
        let result: Result<(), RepositoryError> = async {
            schema
                .apply(record, hctx.fields())
                .map_err(|e| value_error::<R>(operation, e))?;
            let derived = schema.before_save(record);
            schema
                .apply(record, &derived)
                .map_err(|e| value_error::<R>(operation, e))?;
            record.meta_mut().updated_at = now();

            let mut values = if hctx.all_fields() {
                schema.values(record)
            } else {
                let mut values = hctx.fields().clone();
                values.extend(derived);
                values.insert(UPDATED_AT.to_string(), Value::from(record.meta().updated_at));
                values
            };
            values.remove(ID);

            let (assignments, params) = assign(&values);
            self.update_row::<R>(ctx, operation, record.id(), assignments, params, scope)
                .await
        }
        .await;

        if let Err(err) = result {
            if let Err(restore) = schema.apply(record, &previous) {
                error!(
                    record = R::TYPE_NAME,
                    error = %restore,
                    "failed to restore record after unsuccessful update"
                );
            }
            return Err(err);
        }

        self.listeners
            .dispatch(ctx, HookKind::AfterUpdate, &*record, &mut hctx)
            .await;
        Ok(())
    }

    /// `UPDATE ... WHERE id = ?` enforcing that exactly one row changes
    ///
    /// `assignments` are `SET` clauses; `params` bind their placeholders in order.
    async fn update_row<R: Record>(
        &self,
        ctx: &RequestContext,
        operation: RepositoryOperation,
        id: Uuid,
        assignments: Vec<String>,
        mut params: Vec<Value>,
        scope: Scope,
    ) -> Result<(), RepositoryError> {
        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            R::TABLE,
            assignments.join(", "),
            ID
        );
        if scope == Scope::Live && R::schema().soft_delete() {
            sql.push_str(&format!(" AND {} IS NULL", DELETED_AT));
        }
        params.push(Value::from(id));

        let rows = self
            .execute(ctx, operation, R::TYPE_NAME, &sql, &params)
            .await?;
        self.expect_one_row::<R>(operation, id, rows)
    }

    fn expect_one_row<R: Record>(
        &self,
        operation: RepositoryOperation,
        id: Uuid,
        rows: u64,
    ) -> Result<(), RepositoryError> {
        match rows {
            1 => Ok(()),
            0 => Err(RepositoryError::not_found(R::TYPE_NAME, id.to_string()).with_operation(operation)),
            n => {
                error!(
                    record = R::TYPE_NAME,
                    id = %id,
                    operation = %operation,
                    rows = n,
                    "mutation affected more than one row"
                );
                Err(RepositoryError::multi_row_mutation(operation, n)
                    .with_entity(R::TYPE_NAME, id.to_string()))
            }
        }
    }

    // ---- delete ----

    /// Delete a record
    ///
    /// Soft-deleting types get `deleted_at` and `updated_at` set; other types
    /// are removed physically.
    pub async fn delete<R: Record>(
        &self,
        ctx: &RequestContext,
        record: &mut R,
    ) -> Result<(), RepositoryError> {
        let _timer = self.stats.timer(format!("deleting {}", R::TYPE_NAME));
        let operation = RepositoryOperation::Delete;
        require_identity(operation, record)?;

        if !R::schema().soft_delete() {
            return self.remove(ctx, operation, record).await;
        }

        let deleted = now();
        let mut values = ColumnValues::new();
        values.insert(DELETED_AT.to_string(), Value::from(deleted));
        values.insert(UPDATED_AT.to_string(), Value::from(deleted));
        let (assignments, params) = assign(&values);
        self.update_row::<R>(ctx, operation, record.id(), assignments, params, Scope::Live)
            .await?;

        {
            let meta = record.meta_mut();
            meta.deleted_at = Some(deleted);
            meta.updated_at = deleted;
        }
        let mut hctx = HookContext::for_columns(values);
        self.listeners
            .dispatch(ctx, HookKind::AfterDelete, &*record, &mut hctx)
            .await;
        Ok(())
    }

    /// Remove a record physically, whether or not it is soft deleted
    pub async fn hard_delete<R: Record>(
        &self,
        ctx: &RequestContext,
        record: &mut R,
    ) -> Result<(), RepositoryError> {
        let _timer = self
            .stats
            .timer(format!("hard deleting {}", R::TYPE_NAME));
        let operation = RepositoryOperation::HardDelete;
        require_identity(operation, record)?;
        self.remove(ctx, operation, record).await
    }

    async fn remove<R: Record>(
        &self,
        ctx: &RequestContext,
        operation: RepositoryOperation,
        record: &mut R,
    ) -> Result<(), RepositoryError> {
        let id = record.id();
        let sql = format!("DELETE FROM {} WHERE {} = ?", R::TABLE, ID);
        let rows = self
            .execute(ctx, operation, R::TYPE_NAME, &sql, &[Value::from(id)])
            .await?;
        self.expect_one_row::<R>(operation, id, rows)?;

        let mut hctx = HookContext::for_columns(ColumnValues::new());
        self.listeners
            .dispatch(ctx, HookKind::AfterDelete, &*record, &mut hctx)
            .await;
        Ok(())
    }

    // ---- raw access ----

    /// Run a raw query and collect its rows
    pub async fn raw_rows(
        &self,
        ctx: &RequestContext,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, RepositoryError> {
        let _timer = self.stats.timer("raw rows");
        check_placeholders(sql, params)?;
        debug!(sql, params = params.len(), "raw query");
        ctx.guard(RepositoryOperation::Raw, async {
            self.storage
                .query(sql, params)
                .await
                .map_err(|e| self.classify(RepositoryOperation::Raw, RAW_ENTITY, e))
        })
        .await
    }

    /// Execute a raw statement, returning the affected row count
    ///
    /// No single-row check applies.
    pub async fn raw_execute(
        &self,
        ctx: &RequestContext,
        sql: &str,
        params: &[Value],
    ) -> Result<u64, RepositoryError> {
        let _timer = self.stats.timer("raw execute");
        check_placeholders(sql, params)?;
        self.execute(ctx, RepositoryOperation::Raw, RAW_ENTITY, sql, params)
            .await
    }

    /// Stream the rows of a raw query; ends early when the context is cancelled
    pub fn raw_stream(
        &self,
        ctx: &RequestContext,
        sql: &str,
        params: Vec<Value>,
    ) -> BoxStream<'static, Result<Row, RepositoryError>> {
        if let Err(err) = check_placeholders(sql, &params) {
            return futures::stream::once(async move { Err(err) }).boxed();
        }
        let classifier = self.classifier_handle();
        self.storage
            .stream(sql.to_string(), params)
            .take_until(ctx.cancellation_token().clone().cancelled_owned())
            .map(move |row| {
                row.map_err(|e| classifier.classify(RepositoryOperation::Raw, RAW_ENTITY, e))
            })
            .boxed()
    }
}
