//! Record types and repository fixtures for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;

use crate::context::RequestContext;
use crate::error::DatabaseError;
use crate::hooks::{HookContext, HookKind};
use crate::record::{ColumnValues, Record, RecordMeta, RecordSchema, Row, Value};
use crate::repository::Repository;
use crate::stats::StatsHandle;
use crate::storage::{Dialect, RowStream, SqliteStorage, Storage};

const SCHEMA: &[&str] = &[
    "CREATE TABLE users (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        email TEXT NOT NULL,
        name TEXT NOT NULL
    )",
    "CREATE TABLE users_with_hooks (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        name TEXT NOT NULL
    )",
    "CREATE TABLE somethings (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        code TEXT NOT NULL,
        amount INTEGER NOT NULL
    )",
];

#[derive(Debug, Default, Clone, PartialEq)]
pub struct User {
    pub meta: RecordMeta,
    pub email: String,
    pub name: String,
}

impl User {
    pub fn new(email: &str, name: &str) -> Self {
        Self {
            email: email.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }
}

static USER_SCHEMA: Lazy<RecordSchema<User>> = Lazy::new(|| {
    RecordSchema::<User>::builder()
        .column("email", |u: &User| &u.email, |u: &mut User| &mut u.email)
        .column("name", |u: &User| &u.name, |u: &mut User| &mut u.name)
        .build()
});

impl Record for User {
    const TABLE: &'static str = "users";
    const TYPE_NAME: &'static str = "User";

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn schema() -> &'static RecordSchema<Self> {
        &USER_SCHEMA
    }
}

/// Record with a derived `name` column and a record-level listener
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UserWithHooks {
    pub meta: RecordMeta,
    pub first_name: String,
    pub last_name: String,
    pub name: String,
}

impl UserWithHooks {
    pub fn new(first_name: &str, last_name: &str) -> Self {
        Self {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            ..Self::default()
        }
    }
}

fn full_name(user: &UserWithHooks) -> ColumnValues {
    let mut values = ColumnValues::new();
    values.insert(
        "name".to_string(),
        Value::from(format!("{} {}", user.first_name, user.last_name)),
    );
    values
}

fn record_listener(
    _ctx: &RequestContext,
    hook: HookKind,
    _user: &UserWithHooks,
    hctx: &mut HookContext,
) {
    hctx.set_var("record_listener", serde_json::Value::from(hook.to_string()));
}

static USER_WITH_HOOKS_SCHEMA: Lazy<RecordSchema<UserWithHooks>> = Lazy::new(|| {
    RecordSchema::<UserWithHooks>::builder()
        .column(
            "first_name",
            |u: &UserWithHooks| &u.first_name,
            |u: &mut UserWithHooks| &mut u.first_name,
        )
        .column(
            "last_name",
            |u: &UserWithHooks| &u.last_name,
            |u: &mut UserWithHooks| &mut u.last_name,
        )
        .column(
            "name",
            |u: &UserWithHooks| &u.name,
            |u: &mut UserWithHooks| &mut u.name,
        )
        .before_save(full_name)
        .listener(record_listener)
        .build()
});

impl Record for UserWithHooks {
    const TABLE: &'static str = "users_with_hooks";
    const TYPE_NAME: &'static str = "UserWithHooks";

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn schema() -> &'static RecordSchema<Self> {
        &USER_WITH_HOOKS_SCHEMA
    }
}

/// Record deleted physically
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Something {
    pub meta: RecordMeta,
    pub code: String,
    pub amount: i64,
}

impl Something {
    pub fn new(code: &str, amount: i64) -> Self {
        Self {
            code: code.to_string(),
            amount,
            ..Self::default()
        }
    }
}

static SOMETHING_SCHEMA: Lazy<RecordSchema<Something>> = Lazy::new(|| {
    RecordSchema::<Something>::builder()
        .column("code", |s: &Something| &s.code, |s: &mut Something| &mut s.code)
        .column("amount", |s: &Something| &s.amount, |s: &mut Something| &mut s.amount)
        .without_soft_delete()
        .build()
});

impl Record for Something {
    const TABLE: &'static str = "somethings";
    const TYPE_NAME: &'static str = "Something";

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn schema() -> &'static RecordSchema<Self> {
        &SOMETHING_SCHEMA
    }
}

/// Wraps a storage, counting calls and optionally overriding affected rows
#[derive(Debug)]
pub struct CountingStorage {
    inner: Arc<dyn Storage>,
    calls: Arc<AtomicUsize>,
    rows_affected: Option<u64>,
}

#[async_trait]
impl Storage for CountingStorage {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DatabaseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rows = self.inner.execute(sql, params).await?;
        Ok(self.rows_affected.unwrap_or(rows))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DatabaseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.query(sql, params).await
    }

    fn stream(&self, sql: String, params: Vec<Value>) -> RowStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.stream(sql, params)
    }
}

/// Storage that claims a dialect but has no database behind it
#[derive(Debug)]
pub struct OfflineStorage {
    dialect: Dialect,
}

#[async_trait]
impl Storage for OfflineStorage {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64, DatabaseError> {
        Err(DatabaseError::query_failed("storage is offline"))
    }

    async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>, DatabaseError> {
        Err(DatabaseError::query_failed("storage is offline"))
    }

    fn stream(&self, _sql: String, _params: Vec<Value>) -> RowStream {
        futures::stream::empty().boxed()
    }
}

/// In-memory SQLite database with the fixture tables
pub async fn storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::in_memory().await.unwrap();
    for statement in SCHEMA {
        storage.execute(statement, &[]).await.unwrap();
    }
    Arc::new(storage)
}

pub async fn repository() -> Repository {
    repository_with_stats(StatsHandle::disabled()).await
}

pub async fn repository_with_stats(stats: StatsHandle) -> Repository {
    Repository::new(storage().await, stats)
}

pub async fn counting_repository() -> (Repository, Arc<AtomicUsize>) {
    counting_repository_with_rows(None).await
}

pub async fn counting_repository_with_rows(
    rows_affected: Option<u64>,
) -> (Repository, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let storage = CountingStorage {
        inner: storage().await,
        calls: calls.clone(),
        rows_affected,
    };
    (
        Repository::new(Arc::new(storage), StatsHandle::disabled()),
        calls,
    )
}

pub fn postgres_dialect_repository() -> Repository {
    Repository::new(
        Arc::new(OfflineStorage {
            dialect: Dialect::Postgres,
        }),
        StatsHandle::disabled(),
    )
}

/// Create `n` users named `name` with emails `{name}-{i}@example.com`
pub async fn seed_users(repo: &Repository, n: usize, name: &str) -> Vec<User> {
    let ctx = RequestContext::background();
    let mut users = Vec::with_capacity(n);
    for i in 0..n {
        let mut user = User::new(&format!("{}-{}@example.com", name, i), name);
        repo.create(&ctx, &mut user).await.unwrap();
        users.push(user);
    }
    users
}
