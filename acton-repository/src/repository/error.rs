//! Repository error types
//!
//! Every repository and query operation fails with a [`RepositoryError`]. The
//! [`kind`](RepositoryError::kind) tells callers what happened; the optional
//! [`source`](std::error::Error::source) keeps the storage error that caused it.
//!
//! # Example
//!
//! ```rust
//! use acton_repository::repository::{RepositoryError, RepositoryErrorKind};
//!
//! let error = RepositoryError::not_found("User", "0f8e2b4c-6f1e-4d4b-8a57-3f1d5a2c9e10");
//! assert!(matches!(error.kind, RepositoryErrorKind::NotFound));
//! assert!(error.entity_id.is_some());
//! ```

use std::fmt;

use crate::error::DatabaseError;

/// Operation being performed when the repository error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryOperation {
    /// Inserting a new record
    Create,
    /// Loading a record by its own identity
    Load,
    /// Fetching a record by identity
    FindById,
    /// Fetching the first row of a query
    First,
    /// Fetching a page of rows
    FindAll,
    /// Counting rows matching a query
    Count,
    /// Streaming rows
    Stream,
    /// Updating selected columns
    Update,
    /// Saving every column of an existing record
    Save,
    /// Soft deleting a record
    Delete,
    /// Physically removing a record
    HardDelete,
    /// Clearing the soft-delete marker
    Restore,
    /// Raw passthrough statement
    Raw,
    /// Creating an index
    Index,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Load => write!(f, "load"),
            Self::FindById => write!(f, "find_by_id"),
            Self::First => write!(f, "first"),
            Self::FindAll => write!(f, "find_all"),
            Self::Count => write!(f, "count"),
            Self::Stream => write!(f, "stream"),
            Self::Update => write!(f, "update"),
            Self::Save => write!(f, "save"),
            Self::Delete => write!(f, "delete"),
            Self::HardDelete => write!(f, "hard_delete"),
            Self::Restore => write!(f, "restore"),
            Self::Raw => write!(f, "raw"),
            Self::Index => write!(f, "index"),
        }
    }
}

/// Category of repository error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryErrorKind {
    /// No row matched
    NotFound,
    /// A unique constraint was violated
    UniqueViolation,
    /// Nil identity on a single-row operation, or non-nil identity on create
    InvalidIdentity,
    /// A single-row mutation touched more than one row
    MultiRowMutation,
    /// Placeholder/parameter mismatch or an invalid column
    MalformedQuery,
    /// Any other storage failure
    Storage,
    /// A row could not be decoded into the record type
    Decode,
    /// The request context was cancelled
    Cancelled,
}

impl fmt::Display for RepositoryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::UniqueViolation => write!(f, "unique_violation"),
            Self::InvalidIdentity => write!(f, "invalid_identity"),
            Self::MultiRowMutation => write!(f, "multi_row_mutation"),
            Self::MalformedQuery => write!(f, "malformed_query"),
            Self::Storage => write!(f, "storage"),
            Self::Decode => write!(f, "decode"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structured repository error with operation context
///
/// When a unique violation matches a registered index, [`user_message`](Self::user_message)
/// holds the registered text and `Display` shows only that text. The storage
/// error is kept as the error source.
///
/// # Example
///
/// ```rust
/// use acton_repository::repository::{RepositoryError, RepositoryOperation};
///
/// let error = RepositoryError::malformed_query("expected 2 parameters, got 1")
///     .with_operation(RepositoryOperation::FindAll)
///     .with_entity_type("User");
/// assert!(!error.is_retriable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryError {
    /// The operation being performed when the error occurred
    pub operation: RepositoryOperation,
    /// The category of error
    pub kind: RepositoryErrorKind,
    /// Human-readable error message
    pub message: String,
    /// The record type involved (e.g., "User")
    pub entity_type: Option<String>,
    /// The identity of the record involved
    pub entity_id: Option<String>,
    /// The violated constraint, for unique violations
    pub constraint: Option<String>,
    /// Registered user-facing message for the violated constraint
    pub user_message: Option<String>,
    /// The storage error that caused this one
    pub source: Option<DatabaseError>,
}

impl RepositoryError {
    /// Create a new repository error
    pub fn new(
        operation: RepositoryOperation,
        kind: RepositoryErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            entity_type: None,
            entity_id: None,
            constraint: None,
            user_message: None,
            source: None,
        }
    }

    /// Create a "not found" error with entity context
    ///
    /// # Example
    ///
    /// ```rust
    /// use acton_repository::repository::RepositoryError;
    ///
    /// let error = RepositoryError::not_found("User", "42");
    /// assert_eq!(error.entity_type, Some("User".to_string()));
    /// ```
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(
            RepositoryOperation::FindById,
            RepositoryErrorKind::NotFound,
            "Record not found",
        )
        .with_entity(entity_type, entity_id)
    }

    /// Create an invalid identity error
    pub fn invalid_identity(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::InvalidIdentity, message)
    }

    /// Create a multi-row mutation error
    pub fn multi_row_mutation(operation: RepositoryOperation, rows_affected: u64) -> Self {
        Self::new(
            operation,
            RepositoryErrorKind::MultiRowMutation,
            format!("more than one row affected ({})", rows_affected),
        )
    }

    /// Create a malformed query error
    pub fn malformed_query(message: impl Into<String>) -> Self {
        Self::new(
            RepositoryOperation::FindAll,
            RepositoryErrorKind::MalformedQuery,
            message,
        )
    }

    /// Wrap a storage error with operation context
    pub fn storage(operation: RepositoryOperation, source: DatabaseError) -> Self {
        let mut error = Self::new(
            operation,
            RepositoryErrorKind::Storage,
            source.message.clone(),
        );
        error.source = Some(source);
        error
    }

    /// Create a unique violation error
    ///
    /// With a registered `user_message` that text becomes the displayed message.
    pub fn unique_violation(
        operation: RepositoryOperation,
        constraint: Option<String>,
        user_message: Option<String>,
        source: DatabaseError,
    ) -> Self {
        let message = match (&user_message, &constraint) {
            (Some(msg), _) => msg.clone(),
            (None, Some(name)) => format!("extracting unique message: constraint {}", name),
            (None, None) => "extracting unique message: unknown constraint".to_string(),
        };
        let mut error = Self::new(operation, RepositoryErrorKind::UniqueViolation, message);
        error.constraint = constraint;
        error.user_message = user_message;
        error.source = Some(source);
        error
    }

    /// Create a decode error
    pub fn decode(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::Decode, message)
    }

    /// Create a cancellation error
    pub fn cancelled(operation: RepositoryOperation) -> Self {
        Self::new(
            operation,
            RepositoryErrorKind::Cancelled,
            "request context cancelled",
        )
    }

    /// Add entity context to an existing error
    #[must_use]
    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Add the record type to an existing error
    #[must_use]
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Set the operation that caused the error
    #[must_use]
    pub fn with_operation(mut self, operation: RepositoryOperation) -> Self {
        self.operation = operation;
        self
    }

    /// The registered user-facing message, if any
    pub fn user_message(&self) -> Option<&str> {
        self.user_message.as_deref()
    }

    /// Check if this error is retriable (transient storage errors)
    pub fn is_retriable(&self) -> bool {
        self.kind == RepositoryErrorKind::Storage
            && self.source.as_ref().is_some_and(DatabaseError::is_retriable)
    }

    /// Check if this error means no row matched
    pub fn is_not_found(&self) -> bool {
        self.kind == RepositoryErrorKind::NotFound
    }

    /// Check if this error is a unique violation
    pub fn is_unique_violation(&self) -> bool {
        self.kind == RepositoryErrorKind::UniqueViolation
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref user_message) = self.user_message {
            return write!(f, "{}", user_message);
        }
        write!(
            f,
            "Repository {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        match (&self.entity_type, &self.entity_id) {
            (Some(entity_type), Some(entity_id)) => write!(f, " [{}: {}]", entity_type, entity_id)?,
            (Some(entity_type), None) => write!(f, " [{}]", entity_type)?,
            _ => {}
        }
        Ok(())
    }
}

impl std::error::Error for RepositoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}
