//! Storage error classification
//!
//! Maps storage failures onto repository outcomes. Not-found and unique
//! violations are detected through any number of wrapping layers. Unique
//! violations on a registered index surface the registered user message.
//!
//! # Example
//!
//! ```rust
//! use acton_repository::classify::{ErrorClassifier, UniqueIndex};
//! use acton_repository::error::{DatabaseError, DatabaseOperation};
//! use acton_repository::repository::RepositoryOperation;
//!
//! let classifier = ErrorClassifier::new();
//! classifier.register(UniqueIndex::new("idx_email", "users", ["email"], "email taken"));
//!
//! let db = DatabaseError::unique_violation(DatabaseOperation::Execute, "duplicate key")
//!     .with_constraint("idx_email");
//! let err = classifier.classify(RepositoryOperation::Create, "User", db);
//! assert_eq!(err.to_string(), "email taken");
//! ```

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{PoisonError, RwLock};

use crate::error::{DatabaseError, DatabaseErrorKind, Error};
use crate::repository::{RepositoryError, RepositoryErrorKind, RepositoryOperation};

/// SQLSTATE for unique violations
pub const PG_UNIQUE_VIOLATION: &str = "23505";

const SQLITE_UNIQUE_PREFIX: &str = "UNIQUE constraint failed:";

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |e: &&'a (dyn StdError + 'static)| (*e).source())
}

fn database_error_is_unique(err: &DatabaseError) -> bool {
    err.kind == DatabaseErrorKind::UniqueViolation
        || err.code.as_deref() == Some(PG_UNIQUE_VIOLATION)
}

/// Whether an error, or anything it wraps, means "no rows"
pub fn is_not_found(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| {
        if let Some(repo) = e.downcast_ref::<RepositoryError>() {
            repo.kind == RepositoryErrorKind::NotFound
        } else if let Some(db) = e.downcast_ref::<DatabaseError>() {
            db.kind == DatabaseErrorKind::NotFound
        } else if let Some(sqlx_err) = e.downcast_ref::<sqlx::Error>() {
            matches!(sqlx_err, sqlx::Error::RowNotFound)
        } else if let Some(crate_err) = e.downcast_ref::<Error>() {
            match crate_err {
                Error::Repository(repo) => repo.kind == RepositoryErrorKind::NotFound,
                Error::Database(db) => db.kind == DatabaseErrorKind::NotFound,
                _ => false,
            }
        } else {
            false
        }
    })
}

/// Whether an error, or anything it wraps, is a unique constraint violation
pub fn is_unique_violation(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| {
        if let Some(repo) = e.downcast_ref::<RepositoryError>() {
            repo.kind == RepositoryErrorKind::UniqueViolation
        } else if let Some(db) = e.downcast_ref::<DatabaseError>() {
            database_error_is_unique(db)
        } else if let Some(sqlx::Error::Database(db)) = e.downcast_ref::<sqlx::Error>() {
            db.is_unique_violation()
        } else if let Some(crate_err) = e.downcast_ref::<Error>() {
            match crate_err {
                Error::Repository(repo) => repo.kind == RepositoryErrorKind::UniqueViolation,
                Error::Database(db) => database_error_is_unique(db),
                _ => false,
            }
        } else {
            false
        }
    })
}

/// A unique index with its user-facing violation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIndex {
    /// Index (constraint) name
    pub name: String,
    /// Table the index is on, when known
    pub table: Option<String>,
    /// Indexed columns, in order
    pub columns: Vec<String>,
    /// Message shown when the index is violated
    pub message: String,
}

impl UniqueIndex {
    /// Describe an index on a table
    pub fn new<I, S>(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: I,
        message: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            table: Some(table.into()),
            columns: columns.into_iter().map(Into::into).collect(),
            message: message.into(),
        }
    }

    fn matches_columns(&self, table: &str, columns: &[&str]) -> bool {
        self.table.as_deref() == Some(table)
            && self.columns.len() == columns.len()
            && self.columns.iter().zip(columns).all(|(a, b)| a == b)
    }
}

/// Registry of unique indexes and classifier for storage errors
#[derive(Debug, Default)]
pub struct ErrorClassifier {
    indexes: RwLock<HashMap<String, UniqueIndex>>,
}

impl ErrorClassifier {
    /// Create an empty classifier
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a unique index
    pub fn register(&self, index: UniqueIndex) {
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index.name.clone(), index);
    }

    /// Register a message for a constraint name without column information
    pub fn register_message(&self, name: impl Into<String>, message: impl Into<String>) {
        let name = name.into();
        self.register(UniqueIndex {
            name,
            table: None,
            columns: Vec::new(),
            message: message.into(),
        });
    }

    /// Registered message for a constraint
    pub fn user_message(&self, constraint: &str) -> Option<String> {
        self.indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(constraint)
            .map(|index| index.message.clone())
    }

    /// Name of the violated constraint
    ///
    /// Postgres reports it directly. SQLite only reports `table.column` pairs,
    /// which are matched against the registered indexes; when none matches the
    /// pairs themselves are returned.
    pub fn resolve_constraint(&self, err: &DatabaseError) -> Option<String> {
        if let Some(ref constraint) = err.constraint {
            return Some(constraint.clone());
        }
        let failed = err.message.split(SQLITE_UNIQUE_PREFIX).nth(1)?.trim();
        let pairs: Vec<(&str, &str)> = failed
            .split(',')
            .filter_map(|pair| pair.trim().split_once('.'))
            .collect();
        let (table, _) = *pairs.first()?;
        let columns: Vec<&str> = pairs.iter().map(|(_, column)| *column).collect();

        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes
            .values()
            .find(|index| index.matches_columns(table, &columns))
            .map(|index| index.name.clone())
            .or_else(|| Some(failed.to_string()))
    }

    /// Turn a storage error into a repository error for `operation` on `entity_type`
    pub fn classify(
        &self,
        operation: RepositoryOperation,
        entity_type: &str,
        err: DatabaseError,
    ) -> RepositoryError {
        if database_error_is_unique(&err) {
            let constraint = self.resolve_constraint(&err);
            let user_message = constraint.as_deref().and_then(|c| self.user_message(c));
            return RepositoryError::unique_violation(operation, constraint, user_message, err)
                .with_entity_type(entity_type);
        }
        if err.kind == DatabaseErrorKind::NotFound {
            let message = err.message.clone();
            let mut repo = RepositoryError::new(operation, RepositoryErrorKind::NotFound, message)
                .with_entity_type(entity_type);
            repo.source = Some(err);
            return repo;
        }
        RepositoryError::storage(operation, err).with_entity_type(entity_type)
    }
}
