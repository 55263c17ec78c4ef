//! Record identity, lifecycle columns and the per-type column table
//!
//! A record type implements [`Record`] and describes its persisted columns once
//! through a [`RecordSchema`]. The schema is a plain table of typed getters and
//! setters keyed by column name, so the repository can read and write any
//! column without knowing the concrete type.
//!
//! # Example
//!
//! ```rust
//! use acton_repository::record::{Record, RecordMeta, RecordSchema};
//! use once_cell::sync::Lazy;
//!
//! #[derive(Debug, Default, Clone)]
//! struct Tag {
//!     meta: RecordMeta,
//!     label: String,
//! }
//!
//! static TAG_SCHEMA: Lazy<RecordSchema<Tag>> = Lazy::new(|| {
//!     RecordSchema::<Tag>::builder()
//!         .column("label", |t: &Tag| &t.label, |t: &mut Tag| &mut t.label)
//!         .build()
//! });
//!
//! impl Record for Tag {
//!     const TABLE: &'static str = "tags";
//!     const TYPE_NAME: &'static str = "Tag";
//!
//!     fn meta(&self) -> &RecordMeta {
//!         &self.meta
//!     }
//!
//!     fn meta_mut(&mut self) -> &mut RecordMeta {
//!         &mut self.meta
//!     }
//!
//!     fn schema() -> &'static RecordSchema<Self> {
//!         &TAG_SCHEMA
//!     }
//! }
//!
//! let mut tag = Tag::default();
//! assert!(tag.is_id_nil());
//! tag.generate_id();
//! assert!(!tag.is_id_nil());
//! assert!(Tag::schema().has_column("label"));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::hooks::{HookContext, HookKind};

/// Identity column name
pub const ID: &str = "id";
/// Creation timestamp column name
pub const CREATED_AT: &str = "created_at";
/// Last modification timestamp column name
pub const UPDATED_AT: &str = "updated_at";
/// Soft-delete timestamp column name
pub const DELETED_AT: &str = "deleted_at";

/// Column values keyed by column name
pub type ColumnValues = BTreeMap<String, Value>;

/// Type of a column value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Boolean
    Bool,
    /// 64-bit integer
    Int,
    /// 64-bit float
    Float,
    /// Text
    Text,
    /// UUID
    Uuid,
    /// UTC timestamp
    Timestamp,
    /// Binary data
    Bytes,
    /// Unknown or untyped
    Any,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Text => write!(f, "text"),
            Self::Uuid => write!(f, "uuid"),
            Self::Timestamp => write!(f, "timestamp"),
            Self::Bytes => write!(f, "bytes"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// A dynamically typed column value
///
/// Nulls carry their kind so typed backends can bind them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL of the given kind
    Null(ValueKind),
    /// Boolean
    Bool(bool),
    /// 64-bit integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Text
    Text(String),
    /// UUID
    Uuid(Uuid),
    /// UTC timestamp
    Timestamp(DateTime<Utc>),
    /// Binary data
    Bytes(Vec<u8>),
}

impl Value {
    /// The kind of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null(kind) => *kind,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Text(_) => ValueKind::Text,
            Self::Uuid(_) => ValueKind::Uuid,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::Bytes(_) => ValueKind::Bytes,
        }
    }

    /// Whether this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// Convert into a typed column value
    pub fn into_column<T: ColumnType>(self) -> Result<T, ValueError> {
        T::from_value(self)
    }
}

impl<T: ColumnType> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.to_value()
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Errors converting between [`Value`] and typed columns
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    /// NULL found where a value is required
    #[error("unexpected null for {0} column")]
    UnexpectedNull(ValueKind),

    /// The value has the wrong kind
    #[error("expected {expected} value, found {found}")]
    Mismatch {
        /// Kind the column requires
        expected: ValueKind,
        /// Kind that was found
        found: ValueKind,
    },

    /// The value has the right kind but cannot be parsed
    #[error("invalid {kind} value: {message}")]
    Invalid {
        /// Kind the column requires
        kind: ValueKind,
        /// Parse failure
        message: String,
    },

    /// No such column in the schema
    #[error("unknown column: {0}")]
    UnknownColumn(String),
}

/// A Rust type that can be stored in a column
pub trait ColumnType: Sized + Send + Sync + 'static {
    /// Kind used for NULLs of this type
    const KIND: ValueKind;

    /// Convert to a dynamic value
    fn to_value(&self) -> Value;

    /// Convert from a dynamic value
    fn from_value(value: Value) -> Result<Self, ValueError>;
}

fn mismatch(expected: ValueKind, found: &Value) -> ValueError {
    match found {
        Value::Null(_) => ValueError::UnexpectedNull(expected),
        other => ValueError::Mismatch {
            expected,
            found: other.kind(),
        },
    }
}

impl ColumnType for String {
    const KIND: ValueKind = ValueKind::Text;

    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl ColumnType for i64 {
    const KIND: ValueKind = ValueKind::Int;

    fn to_value(&self) -> Value {
        Value::Int(*self)
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Int(n) => Ok(n),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl ColumnType for i32 {
    const KIND: ValueKind = ValueKind::Int;

    fn to_value(&self) -> Value {
        Value::Int(i64::from(*self))
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Int(n) => i32::try_from(n).map_err(|e| ValueError::Invalid {
                kind: Self::KIND,
                message: e.to_string(),
            }),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl ColumnType for f64 {
    const KIND: ValueKind = ValueKind::Float;

    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Float(n) => Ok(n),
            // SQLite returns whole REALs as INTEGER when the column has no declared type
            Value::Int(n) => Ok(n as f64),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl ColumnType for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Bool(b) => Ok(b),
            Value::Int(n) => Ok(n != 0),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl ColumnType for Uuid {
    const KIND: ValueKind = ValueKind::Uuid;

    fn to_value(&self) -> Value {
        Value::Uuid(*self)
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Uuid(id) => Ok(id),
            Value::Text(s) => Uuid::parse_str(&s).map_err(|e| ValueError::Invalid {
                kind: Self::KIND,
                message: e.to_string(),
            }),
            Value::Bytes(bytes) => Uuid::from_slice(&bytes).map_err(|e| ValueError::Invalid {
                kind: Self::KIND,
                message: e.to_string(),
            }),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl ColumnType for DateTime<Utc> {
    const KIND: ValueKind = ValueKind::Timestamp;

    fn to_value(&self) -> Value {
        Value::Timestamp(*self)
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Timestamp(ts) => Ok(ts),
            Value::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| ValueError::Invalid {
                    kind: Self::KIND,
                    message: e.to_string(),
                }),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl ColumnType for Vec<u8> {
    const KIND: ValueKind = ValueKind::Bytes;

    fn to_value(&self) -> Value {
        Value::Bytes(self.clone())
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(mismatch(Self::KIND, &other)),
        }
    }
}

impl<T: ColumnType> ColumnType for Option<T> {
    const KIND: ValueKind = T::KIND;

    fn to_value(&self) -> Value {
        match self {
            Some(inner) => inner.to_value(),
            None => Value::Null(T::KIND),
        }
    }

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null(_) => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

macro_rules! impl_value_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    ColumnType::to_value(&value)
                }
            }
        )*
    };
}

impl_value_from!(String, i64, i32, f64, bool, Uuid, DateTime<Utc>, Vec<u8>);

/// One result row: column names with their values, in select order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    /// Create an empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column
    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    /// Value of a column by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    /// Typed value of a column by name
    pub fn get_as<T: ColumnType>(&self, name: &str) -> Result<T, ValueError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| ValueError::UnknownColumn(name.to_string()))
            .and_then(T::from_value)
    }

    /// Value at a column position
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.columns.get(index).map(|(_, value)| value)
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over `(name, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.into_iter()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

/// Identity and lifecycle columns shared by every record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Identity; nil until the first insert
    pub id: Uuid,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Soft-delete time
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A persisted record type
pub trait Record: Default + Send + Sync + 'static {
    /// Table the records live in
    const TABLE: &'static str;
    /// Name used in errors and stats descriptors
    const TYPE_NAME: &'static str;

    /// Identity and lifecycle columns
    fn meta(&self) -> &RecordMeta;

    /// Mutable identity and lifecycle columns
    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Column table for this type
    fn schema() -> &'static RecordSchema<Self>;

    /// Identity of this record
    fn id(&self) -> Uuid {
        self.meta().id
    }

    /// Assign a fresh identity
    fn generate_id(&mut self) {
        self.meta_mut().id = Uuid::new_v4();
    }

    /// Whether the identity is unassigned
    fn is_id_nil(&self) -> bool {
        self.meta().id.is_nil()
    }
}

/// Derived columns merged into every insert and update
pub type BeforeSaveFn<R> = fn(&R) -> ColumnValues;

/// Listener invoked for every hook on a record type
pub type RecordListener<R> = fn(&RequestContext, HookKind, &R, &mut HookContext);

type Getter<R> = Box<dyn Fn(&R) -> Value + Send + Sync>;
type Setter<R> = Box<dyn Fn(&mut R, Value) -> Result<(), ValueError> + Send + Sync>;

struct Column<R> {
    name: &'static str,
    kind: ValueKind,
    get: Getter<R>,
    set: Setter<R>,
}

/// Column table for a record type
///
/// Built once per type, usually in a `Lazy` static returned by [`Record::schema`].
/// The identity and lifecycle columns are always present.
pub struct RecordSchema<R> {
    columns: Vec<Column<R>>,
    before_save: Option<BeforeSaveFn<R>>,
    listener: Option<RecordListener<R>>,
    soft_delete: bool,
}

impl<R> fmt::Debug for RecordSchema<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSchema")
            .field(
                "columns",
                &self.columns.iter().map(|c| c.name).collect::<Vec<_>>(),
            )
            .field("before_save", &self.before_save.is_some())
            .field("listener", &self.listener.is_some())
            .field("soft_delete", &self.soft_delete)
            .finish()
    }
}

fn meta_id<R: Record>(r: &R) -> &Uuid {
    &r.meta().id
}

fn meta_id_mut<R: Record>(r: &mut R) -> &mut Uuid {
    &mut r.meta_mut().id
}

fn meta_created<R: Record>(r: &R) -> &DateTime<Utc> {
    &r.meta().created_at
}

fn meta_created_mut<R: Record>(r: &mut R) -> &mut DateTime<Utc> {
    &mut r.meta_mut().created_at
}

fn meta_updated<R: Record>(r: &R) -> &DateTime<Utc> {
    &r.meta().updated_at
}

fn meta_updated_mut<R: Record>(r: &mut R) -> &mut DateTime<Utc> {
    &mut r.meta_mut().updated_at
}

fn meta_deleted<R: Record>(r: &R) -> &Option<DateTime<Utc>> {
    &r.meta().deleted_at
}

fn meta_deleted_mut<R: Record>(r: &mut R) -> &mut Option<DateTime<Utc>> {
    &mut r.meta_mut().deleted_at
}

impl<R: Record> RecordSchema<R> {
    /// Start a schema with the identity and lifecycle columns
    pub fn builder() -> RecordSchemaBuilder<R> {
        RecordSchemaBuilder {
            schema: RecordSchema {
                columns: Vec::new(),
                before_save: None,
                listener: None,
                soft_delete: true,
            },
        }
        .column(ID, meta_id::<R>, meta_id_mut::<R>)
        .column(CREATED_AT, meta_created::<R>, meta_created_mut::<R>)
        .column(UPDATED_AT, meta_updated::<R>, meta_updated_mut::<R>)
        .column(DELETED_AT, meta_deleted::<R>, meta_deleted_mut::<R>)
    }

    fn find(&self, name: &str) -> Option<&Column<R>> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in declaration order
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    /// Whether the schema has a column
    pub fn has_column(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Kind of a column
    pub fn kind_of(&self, name: &str) -> Option<ValueKind> {
        self.find(name).map(|c| c.kind)
    }

    /// Whether `delete` marks rows instead of removing them
    pub fn soft_delete(&self) -> bool {
        self.soft_delete
    }

    /// Comma-separated column list for SELECT statements
    pub fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Read one column from a record
    pub fn value_of(&self, record: &R, name: &str) -> Option<Value> {
        self.find(name).map(|c| (c.get)(record))
    }

    /// Read every column from a record
    pub fn values(&self, record: &R) -> ColumnValues {
        self.columns
            .iter()
            .map(|c| (c.name.to_string(), (c.get)(record)))
            .collect()
    }

    /// Write one column into a record
    pub fn set(&self, record: &mut R, name: &str, value: Value) -> Result<(), ValueError> {
        let column = self
            .find(name)
            .ok_or_else(|| ValueError::UnknownColumn(name.to_string()))?;
        (column.set)(record, value)
    }

    /// Write several columns into a record
    pub fn apply(&self, record: &mut R, values: &ColumnValues) -> Result<(), ValueError> {
        for (name, value) in values {
            self.set(record, name, value.clone())?;
        }
        Ok(())
    }

    /// Build a record from a result row; unknown columns are ignored
    pub fn decode(&self, row: Row) -> Result<R, ValueError> {
        let mut record = R::default();
        for (name, value) in row {
            if let Some(column) = self.find(&name) {
                (column.set)(&mut record, value)?;
            }
        }
        Ok(record)
    }

    /// Derived columns from the `before_save` capability, if registered
    pub fn before_save(&self, record: &R) -> ColumnValues {
        self.before_save
            .map(|before_save| before_save(record))
            .unwrap_or_default()
    }

    /// Record-level listener, if registered
    pub fn listener(&self) -> Option<RecordListener<R>> {
        self.listener
    }
}

/// Builder for [`RecordSchema`]
pub struct RecordSchemaBuilder<R> {
    schema: RecordSchema<R>,
}

impl<R: Record> RecordSchemaBuilder<R> {
    /// Add a column backed by a field
    ///
    /// Re-declaring an existing column name replaces it.
    #[must_use]
    pub fn column<T: ColumnType + Clone>(
        mut self,
        name: &'static str,
        get: fn(&R) -> &T,
        get_mut: fn(&mut R) -> &mut T,
    ) -> Self {
        let column = Column {
            name,
            kind: T::KIND,
            get: Box::new(move |record: &R| get(record).to_value()),
            set: Box::new(move |record: &mut R, value: Value| {
                *get_mut(record) = T::from_value(value)?;
                Ok(())
            }),
        };
        match self.schema.columns.iter().position(|c| c.name == name) {
            Some(index) => self.schema.columns[index] = column,
            None => self.schema.columns.push(column),
        }
        self
    }

    /// Register derived columns merged into every write
    #[must_use]
    pub fn before_save(mut self, before_save: BeforeSaveFn<R>) -> Self {
        self.schema.before_save = Some(before_save);
        self
    }

    /// Register a listener called for every hook on this type
    #[must_use]
    pub fn listener(mut self, listener: RecordListener<R>) -> Self {
        self.schema.listener = Some(listener);
        self
    }

    /// Delete rows physically; the table has no `deleted_at` column
    #[must_use]
    pub fn without_soft_delete(mut self) -> Self {
        self.schema.soft_delete = false;
        self.schema.columns.retain(|c| c.name != DELETED_AT);
        self
    }

    /// Finish the schema
    pub fn build(self) -> RecordSchema<R> {
        self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{User, UserWithHooks};

    #[test]
    fn test_meta_columns_always_present() {
        let schema = User::schema();
        for column in [ID, CREATED_AT, UPDATED_AT, DELETED_AT] {
            assert!(schema.has_column(column), "missing {column}");
        }
        assert_eq!(schema.kind_of(ID), Some(ValueKind::Uuid));
        assert_eq!(schema.kind_of(DELETED_AT), Some(ValueKind::Timestamp));
    }

    #[test]
    fn test_values_and_apply() {
        let schema = User::schema();
        let mut user = User::new("a@example.com", "Ada");
        user.generate_id();

        let values = schema.values(&user);
        assert_eq!(values.get("email"), Some(&Value::Text("a@example.com".into())));
        assert_eq!(values.get(DELETED_AT), Some(&Value::Null(ValueKind::Timestamp)));

        let mut changes = ColumnValues::new();
        changes.insert("name".into(), Value::from("Grace"));
        schema.apply(&mut user, &changes).unwrap();
        assert_eq!(user.name, "Grace");
    }

    #[test]
    fn test_set_rejects_wrong_kind_and_unknown_column() {
        let schema = User::schema();
        let mut user = User::default();
        assert!(matches!(
            schema.set(&mut user, "name", Value::Int(3)),
            Err(ValueError::Mismatch { .. })
        ));
        assert_eq!(
            schema.set(&mut user, "nope", Value::Int(3)),
            Err(ValueError::UnknownColumn("nope".into()))
        );
        assert_eq!(
            schema.set(&mut user, "name", Value::Null(ValueKind::Text)),
            Err(ValueError::UnexpectedNull(ValueKind::Text))
        );
    }

    #[test]
    fn test_decode_from_text_encoded_row() {
        let id = Uuid::new_v4();
        let row: Row = vec![
            (ID.to_string(), Value::Text(id.to_string())),
            (
                CREATED_AT.to_string(),
                Value::Text("2024-05-01T10:00:00.000000Z".into()),
            ),
            ("email".to_string(), Value::Text("b@example.com".into())),
            ("extra".to_string(), Value::Int(1)),
        ]
        .into_iter()
        .collect();

        let user = User::schema().decode(row).unwrap();
        assert_eq!(user.meta.id, id);
        assert_eq!(user.email, "b@example.com");
        assert_eq!(user.meta.created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_option_column_roundtrip() {
        let value = Option::<i64>::None.to_value();
        assert_eq!(value, Value::Null(ValueKind::Int));
        assert_eq!(Option::<i64>::from_value(value), Ok(None));
        assert_eq!(Option::<i64>::from_value(Value::Int(7)), Ok(Some(7)));
    }

    #[test]
    fn test_bool_from_integer() {
        assert_eq!(bool::from_value(Value::Int(1)), Ok(true));
        assert_eq!(bool::from_value(Value::Int(0)), Ok(false));
    }

    #[test]
    fn test_before_save_capability() {
        let schema = UserWithHooks::schema();
        let record = UserWithHooks {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            ..Default::default()
        };
        let derived = schema.before_save(&record);
        assert_eq!(derived.get("name"), Some(&Value::from("Ada Lovelace")));
        assert!(User::schema().before_save(&User::default()).is_empty());
    }

    #[test]
    fn test_without_soft_delete_drops_column() {
        use crate::testing::Something;
        let schema = Something::schema();
        assert!(!schema.soft_delete());
        assert!(!schema.has_column(DELETED_AT));
        assert!(!schema.select_list().contains(DELETED_AT));
    }
}
