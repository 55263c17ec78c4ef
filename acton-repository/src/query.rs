//! Fluent query builder
//!
//! A [`Query`] accumulates filters, ordering, paging and soft-delete visibility
//! for one record type, then runs as one of the terminal operations
//! [`first`](Query::first), [`all`](Query::all),
//! [`all_with_page_full`](Query::all_with_page_full), [`count`](Query::count)
//! or [`stream`](Query::stream).
//!
//! Filter fragments use `?` placeholders. A fragment whose placeholder count
//! differs from its parameter count poisons the query; the terminal operation
//! then fails with [`RepositoryErrorKind::MalformedQuery`] without touching
//! storage.
//!
//! Every terminal operation records one stats sample labelled with a
//! descriptor of what the query did, e.g. `filter:email = ? page-size:25 all:User`.
//!
//! # Example
//!
//! ```rust,ignore
//! let (users, page_full) = repo
//!     .query::<User>(&ctx)
//!     .filter("age", FilterOperator::GreaterThanOrEqual, 18)
//!     .filter_in("country", ["NO", "SE", "NO"])
//!     .order_by_desc("created_at")
//!     .with_page_size(25)
//!     .with_page_no(2)
//!     .all_with_page_full()
//!     .await?;
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};

use crate::context::RequestContext;
use crate::cursor::Cursor;
use crate::error::DatabaseError;
use crate::record::{Record, Value, DELETED_AT};
use crate::repository::{Repository, RepositoryError, RepositoryErrorKind, RepositoryOperation};
use crate::stats::StatsTimer;
use crate::storage::count_placeholders;

/// Page size used when none is set
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// Page size of [`Query::with_max_page_size`]
pub const MAX_PAGE_SIZE: u64 = i32::MAX as u64;

/// Comparison operators for [`Query::filter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// Equal to (=)
    Equal,
    /// Not equal to (!=)
    NotEqual,
    /// Greater than (>)
    GreaterThan,
    /// Greater than or equal to (>=)
    GreaterThanOrEqual,
    /// Less than (<)
    LessThan,
    /// Less than or equal to (<=)
    LessThanOrEqual,
    /// Pattern matching (LIKE)
    Like,
    /// Negated pattern matching (NOT LIKE)
    NotLike,
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "!="),
            Self::GreaterThan => write!(f, ">"),
            Self::GreaterThanOrEqual => write!(f, ">="),
            Self::LessThan => write!(f, "<"),
            Self::LessThanOrEqual => write!(f, "<="),
            Self::Like => write!(f, "LIKE"),
            Self::NotLike => write!(f, "NOT LIKE"),
        }
    }
}

/// Expression built from SQL text and bound values
///
/// Parts are joined with single spaces; each value becomes a `?`.
///
/// ```rust
/// use acton_repository::query::Expr;
///
/// let (sql, params) = Expr::new().sql("lower(email) =").value("a@example.com").build();
/// assert_eq!(sql, "lower(email) = ?");
/// assert_eq!(params.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expr {
    parts: Vec<ExprPart>,
}

#[derive(Debug, Clone, PartialEq)]
enum ExprPart {
    Sql(String),
    Value(Value),
}

impl Expr {
    /// Empty expression
    pub fn new() -> Self {
        Self::default()
    }

    /// Append SQL text
    #[must_use]
    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        self.parts.push(ExprPart::Sql(sql.into()));
        self
    }

    /// Append a bound value
    #[must_use]
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.parts.push(ExprPart::Value(value.into()));
        self
    }

    /// Render to SQL and parameters
    pub fn build(self) -> (String, Vec<Value>) {
        let mut sql = Vec::with_capacity(self.parts.len());
        let mut params = Vec::new();
        for part in self.parts {
            match part {
                ExprPart::Sql(text) => sql.push(text),
                ExprPart::Value(value) => {
                    sql.push("?".to_string());
                    params.push(value);
                }
            }
        }
        (sql.join(" "), params)
    }
}

/// Compiled filter: conjunction of parenthesised fragments and their parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    /// SQL with `?` placeholders; empty when there is no filter
    pub sql: String,
    /// Parameters in placeholder order
    pub params: Vec<Value>,
}

impl Predicate {
    /// Whether there is no filter
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Fragment {
    sql: String,
    params: Vec<Value>,
}

/// Query over one record type
///
/// Built per call; not shared between tasks.
pub struct Query<'r, R: Record> {
    repo: &'r Repository,
    ctx: RequestContext,
    error: Option<RepositoryError>,
    page_no: u64,
    page_size: Option<u64>,
    offset: Option<u64>,
    include_deleted: bool,
    descriptor: Vec<String>,
    filters: Vec<Fragment>,
    order_by: Vec<Fragment>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> fmt::Debug for Query<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("record", &R::TYPE_NAME)
            .field("descriptor", &self.descriptor)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<'r, R: Record> Query<'r, R> {
    pub(crate) fn new(repo: &'r Repository, ctx: &RequestContext) -> Self {
        Self {
            repo,
            ctx: ctx.clone(),
            error: None,
            page_no: 0,
            page_size: None,
            offset: None,
            include_deleted: false,
            descriptor: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            _record: PhantomData,
        }
    }

    fn poison(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(
                RepositoryError::malformed_query(message).with_entity_type(R::TYPE_NAME),
            );
        }
    }

    fn check_placeholders(&mut self, sql: &str, params: &[Value]) -> bool {
        let placeholders = count_placeholders(sql);
        if placeholders != params.len() {
            self.poison(format!(
                "invalid expression placeholders count: '{}' has {} placeholder(s), {} param(s)",
                sql,
                placeholders,
                params.len()
            ));
            return false;
        }
        true
    }

    fn push_filter(mut self, label: &str, sql: String, params: Vec<Value>) -> Self {
        self.descriptor.push(format!("{}:{}", label, sql));
        if self.check_placeholders(&sql, &params) && !sql.is_empty() {
            self.filters.push(Fragment { sql, params });
        }
        self
    }

    /// `column <op> ?`
    #[must_use]
    pub fn filter(self, column: &str, op: FilterOperator, value: impl Into<Value>) -> Self {
        let sql = format!("{} {} ?", column, op);
        self.push_filter("filter", sql, vec![value.into()])
    }

    /// `column in (?,?,...)` over the distinct values, in first-seen order
    ///
    /// An empty list matches no rows.
    #[must_use]
    pub fn filter_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut unique: Vec<Value> = Vec::new();
        for value in values {
            let value = value.into();
            if !unique.contains(&value) {
                unique.push(value);
            }
        }
        if unique.is_empty() {
            return self.push_filter("filter-in", "1 = 0".to_string(), Vec::new());
        }
        let placeholders = vec!["?"; unique.len()].join(",");
        let sql = format!("{} in ({})", column, placeholders);
        self.push_filter("filter-in", sql, unique)
    }

    /// Raw SQL fragment with its parameters
    #[must_use]
    pub fn filter_raw<I, V>(self, expression: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let params = params.into_iter().map(Into::into).collect();
        self.push_filter("filter", expression.into(), params)
    }

    /// Filter built from an [`Expr`]
    #[must_use]
    pub fn filter_expr(self, expr: Expr) -> Self {
        let (sql, params) = expr.build();
        self.push_filter("filter", sql, params)
    }

    /// Postgres full-text match of `terms` against the concatenated `columns`
    ///
    /// Each term is split on `&`; the trimmed, non-empty words are all required.
    /// Whole words only. Other dialects poison the query.
    #[must_use]
    pub fn fulltext_search(mut self, columns: &[&str], terms: &[&str]) -> Self {
        if !self.repo.storage().dialect().supports_fulltext() {
            self.poison(format!(
                "fulltext search is not supported by {}",
                self.repo.storage().dialect()
            ));
            return self;
        }
        let words: Vec<&str> = terms
            .iter()
            .flat_map(|term| term.split('&'))
            .map(str::trim)
            .filter(|word| !word.is_empty())
            .collect();
        let expr = Expr::new()
            .sql(format!(
                "to_tsvector(concat({})) @@ to_tsquery(",
                columns.join(", ' ', ")
            ))
            .value(words.join(" & "))
            .sql(")");
        self.filter_expr(expr)
    }

    /// Case-insensitive substring match of every term against the space-joined `columns`
    ///
    /// Portable across dialects but never uses an index.
    #[must_use]
    pub fn filter_substring(mut self, columns: &[&str], terms: &[&str]) -> Self {
        if columns.is_empty() {
            self.poison("substring search needs at least one column".to_string());
            return self;
        }
        let haystack = columns
            .iter()
            .map(|column| format!("coalesce({}, '')", column))
            .collect::<Vec<_>>()
            .join(" || ' ' || ");
        for term in terms.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            let pattern = format!("%{}%", term.to_lowercase());
            self = self.push_filter(
                "substring",
                format!("lower({}) LIKE ?", haystack),
                vec![Value::from(pattern)],
            );
        }
        self
    }

    /// `column is not null`
    #[must_use]
    pub fn filter_is_not_null(self, column: &str) -> Self {
        self.push_filter("not_null", format!("{} is not null", column), Vec::new())
    }

    /// `column is null`
    #[must_use]
    pub fn filter_is_null(self, column: &str) -> Self {
        self.push_filter("null", format!("{} is null", column), Vec::new())
    }

    /// Raw ORDER BY term with its parameters
    #[must_use]
    pub fn order_by_raw<I, V>(mut self, expression: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let sql = expression.into();
        let params: Vec<Value> = params.into_iter().map(Into::into).collect();
        self.descriptor.push(format!("order_by:{}", sql));
        if self.check_placeholders(&sql, &params) {
            self.order_by.push(Fragment { sql, params });
        }
        self
    }

    /// `ORDER BY column asc`
    #[must_use]
    pub fn order_by_asc(self, column: &str) -> Self {
        self.order_by_raw(format!("{} asc", column), Vec::<Value>::new())
    }

    /// `ORDER BY column desc`
    #[must_use]
    pub fn order_by_desc(self, column: &str) -> Self {
        self.order_by_raw(format!("{} desc", column), Vec::<Value>::new())
    }

    /// Zero-based page number
    #[must_use]
    pub fn with_page_no(mut self, page_no: u64) -> Self {
        self.descriptor.push(format!("page:{}", page_no));
        self.page_no = page_no;
        self
    }

    /// Page number from text; empty means page 0, anything unparsable poisons the query
    #[must_use]
    pub fn with_page_no_str(mut self, page_no: &str) -> Self {
        if page_no.is_empty() {
            return self.with_page_no(0);
        }
        match page_no.trim().parse::<u64>() {
            Ok(n) => self.with_page_no(n),
            Err(e) => {
                self.poison(format!("invalid page: {}: {}", page_no, e));
                self
            }
        }
    }

    /// Rows per page
    #[must_use]
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.descriptor.push(format!("page-size:{}", page_size));
        self.page_size = Some(page_size);
        self
    }

    /// [`DEFAULT_PAGE_SIZE`] rows per page
    #[must_use]
    pub fn with_default_page_size(self) -> Self {
        self.with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Effectively unlimited page size
    #[must_use]
    pub fn with_max_page_size(self) -> Self {
        self.with_page_size(MAX_PAGE_SIZE)
    }

    /// Page with a cursor's limit and offset instead of the page number
    #[must_use]
    pub fn with_cursor(mut self, cursor: &Cursor) -> Self {
        self = self.with_page_size(u64::from(cursor.limit()));
        self.descriptor.push("cursor".to_string());
        self.offset = Some(u64::from(cursor.offset()));
        self
    }

    /// Also return soft-deleted rows
    #[must_use]
    pub fn include_deleted(mut self) -> Self {
        self.descriptor.push("include-deleted".to_string());
        self.include_deleted = true;
        self
    }

    /// The compiled filter fragments
    ///
    /// The soft-delete restriction is not included; it is added when the query runs.
    pub fn predicate(&self) -> Predicate {
        Predicate {
            sql: self
                .filters
                .iter()
                .map(|f| format!("({})", f.sql))
                .collect::<Vec<_>>()
                .join(" AND "),
            params: self
                .filters
                .iter()
                .flat_map(|f| f.params.iter().cloned())
                .collect(),
        }
    }

    /// The stats descriptor accumulated so far
    pub fn descriptor(&self) -> String {
        self.descriptor.join(" ")
    }

    fn page_size(&self) -> u64 {
        self.page_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    fn page_offset(&self) -> u64 {
        self.offset
            .unwrap_or_else(|| self.page_no.saturating_mul(self.page_size()))
    }

    fn where_clause(&self) -> Predicate {
        let mut predicate = self.predicate();
        if R::schema().soft_delete() && !self.include_deleted {
            let clause = format!("({} IS NULL)", DELETED_AT);
            if predicate.sql.is_empty() {
                predicate.sql = clause;
            } else {
                predicate.sql = format!("{} AND {}", predicate.sql, clause);
            }
        }
        predicate
    }

    fn select_sql(&self, limit: u64, offset: u64) -> (String, Vec<Value>) {
        let Predicate { sql: filter, mut params } = self.where_clause();
        let mut sql = format!("SELECT {} FROM {}", R::schema().select_list(), R::TABLE);
        if !filter.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&filter);
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(
                &self
                    .order_by
                    .iter()
                    .map(|o| o.sql.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            params.extend(self.order_by.iter().flat_map(|o| o.params.iter().cloned()));
        }
        sql.push_str(&format!(" LIMIT {}", limit));
        if offset > 0 {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        (sql, params)
    }

    fn start(&mut self, terminal: &str) -> StatsTimer {
        self.descriptor.push(format!("{}:{}", terminal, R::TYPE_NAME));
        self.repo.stats().timer(self.descriptor())
    }

    fn take_error(&mut self, operation: RepositoryOperation) -> Result<(), RepositoryError> {
        match self.error.take() {
            Some(err) => Err(err.with_operation(operation)),
            None => Ok(()),
        }
    }

    async fn fetch(
        &self,
        operation: RepositoryOperation,
        sql: String,
        params: Vec<Value>,
    ) -> Result<Vec<R>, RepositoryError> {
        let rows = self
            .ctx
            .guard(operation, async {
                self.repo
                    .storage()
                    .query(&sql, &params)
                    .await
                    .map_err(|e| self.repo.classify(operation, R::TYPE_NAME, e))
            })
            .await?;
        let schema = R::schema();
        rows.into_iter()
            .map(|row| {
                schema.decode(row).map_err(|e| {
                    RepositoryError::decode(operation, e.to_string()).with_entity_type(R::TYPE_NAME)
                })
            })
            .collect()
    }

    /// The first matching row; [`RepositoryErrorKind::NotFound`] when none
    pub async fn first(mut self) -> Result<R, RepositoryError> {
        let _timer = self.start("first");
        self.take_error(RepositoryOperation::First)?;

        let (sql, params) = self.select_sql(1, 0);
        self.fetch(RepositoryOperation::First, sql, params)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                RepositoryError::new(
                    RepositoryOperation::First,
                    RepositoryErrorKind::NotFound,
                    "Record not found",
                )
                .with_entity_type(R::TYPE_NAME)
            })
    }

    /// One page of matching rows (default page size 50)
    pub async fn all(mut self) -> Result<Vec<R>, RepositoryError> {
        let _timer = self.start("all");
        self.take_error(RepositoryOperation::FindAll)?;

        let (sql, params) = self.select_sql(self.page_size(), self.page_offset());
        self.fetch(RepositoryOperation::FindAll, sql, params).await
    }

    /// One page of matching rows and whether the page is full
    pub async fn all_with_page_full(self) -> Result<(Vec<R>, bool), RepositoryError> {
        let page_size = self.page_size();
        let records = self.all().await?;
        let full = records.len() as u64 >= page_size;
        Ok((records, full))
    }

    /// Number of matching rows, ignoring paging and ordering
    pub async fn count(mut self) -> Result<u64, RepositoryError> {
        let _timer = self.start("count");
        self.take_error(RepositoryOperation::Count)?;

        let Predicate { sql: filter, params } = self.where_clause();
        let mut sql = format!("SELECT COUNT(*) AS count FROM {}", R::TABLE);
        if !filter.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&filter);
        }

        let operation = RepositoryOperation::Count;
        let rows = self
            .ctx
            .guard(operation, async {
                self.repo
                    .storage()
                    .query(&sql, &params)
                    .await
                    .map_err(|e| self.repo.classify(operation, R::TYPE_NAME, e))
            })
            .await?;
        let count = rows
            .into_iter()
            .next()
            .and_then(|row| row.get_index(0).cloned())
            .ok_or_else(|| RepositoryError::decode(operation, "count returned no rows"))?
            .into_column::<i64>()
            .map_err(|e| RepositoryError::decode(operation, e.to_string()))?;
        u64::try_from(count).map_err(|e| RepositoryError::decode(operation, e.to_string()))
    }

    /// Stream one page of records whose `columns` contain every term
    ///
    /// See [`filter_substring`](Self::filter_substring); the page size bounds
    /// the number of results.
    pub fn substring_search(self, columns: &[&str], terms: &[&str]) -> RecordStream<R> {
        self.filter_substring(columns, terms).stream()
    }

    /// Stream one page of matching rows
    ///
    /// The stream ends early when the request context is cancelled. The stats
    /// sample is recorded when the stream is dropped.
    pub fn stream(mut self) -> RecordStream<R> {
        let timer = self.start("stream");
        if let Err(err) = self.take_error(RepositoryOperation::Stream) {
            return RecordStream::failed(err, timer);
        }

        let (sql, params) = self.select_sql(self.page_size(), self.page_offset());
        let classifier = self.repo.classifier_handle();
        let rows = self
            .repo
            .storage()
            .stream(sql, params)
            .take_until(self.ctx.cancellation_token().clone().cancelled_owned());
        let inner = rows
            .map(move |row| {
                let operation = RepositoryOperation::Stream;
                row.map_err(|e: DatabaseError| classifier.classify(operation, R::TYPE_NAME, e))
                    .and_then(|row| {
                        R::schema().decode(row).map_err(|e| {
                            RepositoryError::decode(operation, e.to_string())
                                .with_entity_type(R::TYPE_NAME)
                        })
                    })
            })
            .boxed();
        RecordStream {
            inner,
            _timer: timer,
            _record: PhantomData,
        }
    }
}

/// Stream of decoded records returned by [`Query::stream`]
pub struct RecordStream<R> {
    inner: BoxStream<'static, Result<R, RepositoryError>>,
    _timer: StatsTimer,
    _record: PhantomData<fn() -> R>,
}

impl<R: Send + 'static> RecordStream<R> {
    fn failed(err: RepositoryError, timer: StatsTimer) -> Self {
        Self {
            inner: futures::stream::once(async move { Err(err) }).boxed(),
            _timer: timer,
            _record: PhantomData,
        }
    }
}

impl<R> fmt::Debug for RecordStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStream").finish_non_exhaustive()
    }
}

impl<R> Stream for RecordStream<R> {
    type Item = Result<R, RepositoryError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsCollector;
    use crate::testing::{self, User};
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_filter_in_deduplicates() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        let query = repo.query::<User>(&ctx).filter_in("code", ["a", "a", "b"]);
        let predicate = query.predicate();
        assert_eq!(predicate.sql, "(code in (?,?))");
        assert_eq!(predicate.params, vec![Value::from("a"), Value::from("b")]);
    }

    #[tokio::test]
    async fn test_fragments_joined_with_and() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        let predicate = repo
            .query::<User>(&ctx)
            .filter("name", FilterOperator::Equal, "Ada")
            .filter_is_not_null("email")
            .filter_raw("lower(email) LIKE ?", ["%@example.com"])
            .predicate();
        assert_eq!(
            predicate.sql,
            "(name = ?) AND (email is not null) AND (lower(email) LIKE ?)"
        );
        assert_eq!(predicate.params.len(), 2);
    }

    #[tokio::test]
    async fn test_descriptor_labels() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        let query = repo
            .query::<User>(&ctx)
            .filter("email", FilterOperator::Equal, "x")
            .with_page_size(25)
            .order_by_desc("created_at");
        assert_eq!(
            query.descriptor(),
            "filter:email = ? page-size:25 order_by:created_at desc"
        );
    }

    #[tokio::test]
    async fn test_placeholder_mismatch_poisons_without_storage_call() {
        let (repo, calls) = testing::counting_repository().await;
        let ctx = RequestContext::background();
        let err = repo
            .query::<User>(&ctx)
            .filter_raw("a = ? AND b = ?", [1_i64])
            .filter("name", FilterOperator::Equal, "still ignored")
            .all()
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::MalformedQuery);
        assert_eq!(err.operation, RepositoryOperation::FindAll);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        let err = repo
            .query::<User>(&ctx)
            .order_by_raw("field(name, ?)", Vec::<Value>::new())
            .count()
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::MalformedQuery);
    }

    #[tokio::test]
    async fn test_invalid_page_string_poisons() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        let err = repo
            .query::<User>(&ctx)
            .with_page_no_str("two")
            .all()
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::MalformedQuery);

        let users = repo
            .query::<User>(&ctx)
            .with_page_no_str("")
            .all()
            .await
            .unwrap();
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn test_question_mark_in_literal_is_not_a_placeholder() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        testing::seed_users(&repo, 2, "quoted").await;

        let count = repo
            .query::<User>(&ctx)
            .filter_raw("name <> 'who?'", Vec::<Value>::new())
            .filter_raw("email LIKE '%?%' OR name = ?", ["quoted"])
            .count()
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_substring_search() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        testing::seed_users(&repo, 3, "alpha").await;
        testing::seed_users(&repo, 2, "beta").await;

        let found: Vec<User> = repo
            .query::<User>(&ctx)
            .substring_search(&["name", "email"], &["ALPHA-1", " example "])
            .try_collect()
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].email, "alpha-1@example.com");

        let limited: Vec<User> = repo
            .query::<User>(&ctx)
            .with_page_size(2)
            .substring_search(&["name"], &["ph"])
            .try_collect()
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        let all = repo
            .query::<User>(&ctx)
            .filter_substring(&["email"], &["@EXAMPLE.com"])
            .count()
            .await
            .unwrap();
        assert_eq!(all, 5);

        let err = repo
            .query::<User>(&ctx)
            .filter_substring(&[], &["x"])
            .count()
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::MalformedQuery);
    }

    #[tokio::test]
    async fn test_fulltext_requires_postgres() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        let err = repo
            .query::<User>(&ctx)
            .fulltext_search(&["name", "email"], &["ada & lovelace"])
            .first()
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::MalformedQuery);
    }

    #[tokio::test]
    async fn test_fulltext_predicate_on_postgres() {
        let repo = testing::postgres_dialect_repository();
        let ctx = RequestContext::background();
        let predicate = repo
            .query::<User>(&ctx)
            .fulltext_search(&["name", "email"], &["ada & lovelace", " & ", "count"])
            .predicate();
        assert_eq!(
            predicate.sql,
            "(to_tsvector(concat(name, ' ', email)) @@ to_tsquery( ? ))"
        );
        assert_eq!(
            predicate.params,
            vec![Value::from("ada & lovelace & count")]
        );
    }

    #[tokio::test]
    async fn test_page_size_and_page_full() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        testing::seed_users(&repo, 100, "team-a").await;
        testing::seed_users(&repo, 5, "team-b").await;

        let (page, full) = repo
            .query::<User>(&ctx)
            .filter("name", FilterOperator::Equal, "team-a")
            .with_page_size(25)
            .with_page_no(0)
            .all_with_page_full()
            .await
            .unwrap();
        assert_eq!(page.len(), 25);
        assert!(full);

        let (last, full) = repo
            .query::<User>(&ctx)
            .filter("name", FilterOperator::Equal, "team-b")
            .with_page_size(25)
            .all_with_page_full()
            .await
            .unwrap();
        assert_eq!(last.len(), 5);
        assert!(!full);
    }

    #[tokio::test]
    async fn test_default_page_size_is_fifty() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        testing::seed_users(&repo, 60, "many").await;
        let page = repo.query::<User>(&ctx).all().await.unwrap();
        assert_eq!(page.len(), 50);
        let all = repo
            .query::<User>(&ctx)
            .with_max_page_size()
            .all()
            .await
            .unwrap();
        assert_eq!(all.len(), 60);
    }

    #[tokio::test]
    async fn test_paging_ordering_and_cursor() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        testing::seed_users(&repo, 7, "paged").await;

        let emails = |users: Vec<User>| users.into_iter().map(|u| u.email).collect::<Vec<_>>();

        let second = repo
            .query::<User>(&ctx)
            .order_by_asc("email")
            .with_page_size(3)
            .with_page_no(1)
            .all()
            .await
            .unwrap();
        assert_eq!(
            emails(second),
            vec!["paged-3@example.com", "paged-4@example.com", "paged-5@example.com"]
        );

        let cursor = Cursor::new(2, 0).next_page().next_page();
        let by_cursor = repo
            .query::<User>(&ctx)
            .order_by_asc("email")
            .with_cursor(&cursor)
            .all()
            .await
            .unwrap();
        assert_eq!(
            emails(by_cursor),
            vec!["paged-4@example.com", "paged-5@example.com"]
        );

        let desc = repo
            .query::<User>(&ctx)
            .order_by_desc("email")
            .first()
            .await
            .unwrap();
        assert_eq!(desc.email, "paged-6@example.com");
    }

    #[tokio::test]
    async fn test_count_and_first_not_found() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        testing::seed_users(&repo, 4, "counted").await;

        let count = repo
            .query::<User>(&ctx)
            .filter_in("email", ["counted-0@example.com", "counted-1@example.com"])
            .order_by_asc("email")
            .with_page_size(1)
            .count()
            .await
            .unwrap();
        assert_eq!(count, 2);

        let err = repo
            .query::<User>(&ctx)
            .filter("email", FilterOperator::Equal, "nobody@example.com")
            .first()
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::NotFound);
        assert_eq!(err.entity_type.as_deref(), Some("User"));
        assert!(crate::classify::is_not_found(&err));

        let none = repo
            .query::<User>(&ctx)
            .filter_in("email", Vec::<String>::new())
            .count()
            .await
            .unwrap();
        assert_eq!(none, 0);
    }

    #[tokio::test]
    async fn test_soft_deleted_rows_hidden_unless_included() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        let mut users = testing::seed_users(&repo, 3, "soft").await;
        repo.delete(&ctx, &mut users[0]).await.unwrap();

        assert_eq!(repo.query::<User>(&ctx).count().await.unwrap(), 2);
        assert_eq!(
            repo.query::<User>(&ctx).include_deleted().count().await.unwrap(),
            3
        );
        let deleted = repo
            .query::<User>(&ctx)
            .include_deleted()
            .filter_is_not_null(DELETED_AT)
            .first()
            .await
            .unwrap();
        assert_eq!(deleted.meta.id, users[0].meta.id);
    }

    #[tokio::test]
    async fn test_stream_yields_page() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        testing::seed_users(&repo, 5, "streamed").await;

        let streamed: Vec<User> = repo
            .query::<User>(&ctx)
            .order_by_asc("email")
            .with_page_size(4)
            .stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(streamed.len(), 4);
        assert_eq!(streamed[0].email, "streamed-0@example.com");
    }

    #[tokio::test]
    async fn test_stream_stops_on_cancel() {
        let repo = testing::repository().await;
        let ctx = RequestContext::background();
        testing::seed_users(&repo, 3, "cancelled").await;

        ctx.cancel();
        let streamed: Vec<_> = repo.query::<User>(&ctx).stream().collect().await;
        assert!(streamed.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_records_one_sample() {
        let collector = StatsCollector::spawn(&crate::config::StatsConfig::default());
        let repo = testing::repository_with_stats(collector.handle()).await;
        let ctx = RequestContext::background();

        let _ = repo
            .query::<User>(&ctx)
            .filter("email", FilterOperator::Equal, "x")
            .with_page_size(25)
            .all()
            .await
            .unwrap();
        let _ = repo.query::<User>(&ctx).count().await.unwrap();
        collector.flush().await;

        let stat = collector
            .stat("filter:email = ? page-size:25 all:User")
            .unwrap();
        assert_eq!(stat.count, 1);
        assert_eq!(collector.stat("count:User").map(|s| s.count), Some(1));
        collector.shutdown().await;
    }
}
