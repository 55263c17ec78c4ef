//! Change hooks
//!
//! Every mutation fires hooks around the storage call. Listeners see the
//! record and a [`HookContext`] describing the columns being written; before
//! hooks may inject extra column values into the write.
//!
//! Two kinds of listener exist:
//!
//! - a record-level listener registered on the type's
//!   [`RecordSchema`](crate::record::RecordSchema), called first
//! - application listeners registered on the repository per record type and
//!   hook kind, called in registration order
//!
//! # Example
//!
//! ```rust,ignore
//! repo.add_listener::<User, _>(HookKind::BeforeUpdate, |_ctx, _hook, _user, hctx| {
//!     if hctx.has_field("email") {
//!         hctx.set_field("email_verified", false);
//!     }
//! })
//! .await;
//! ```

use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::context::RequestContext;
use crate::record::{ColumnValues, Record, Value};

/// Point in a mutation at which listeners run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Before the insert; may inject column values
    BeforeCreate,
    /// After a successful insert
    AfterCreate,
    /// Before the update; may inject column values
    BeforeUpdate,
    /// After a successful update
    AfterUpdate,
    /// After a successful soft or hard delete
    AfterDelete,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeCreate => write!(f, "before_create"),
            Self::AfterCreate => write!(f, "after_create"),
            Self::BeforeUpdate => write!(f, "before_update"),
            Self::AfterUpdate => write!(f, "after_update"),
            Self::AfterDelete => write!(f, "after_delete"),
        }
    }
}

/// What a mutation is about to write, shared by the before and after hooks of one call
#[derive(Debug, Clone)]
pub struct HookContext {
    fields: ColumnValues,
    explicit: BTreeSet<String>,
    all_fields: bool,
    vars: HashMap<String, serde_json::Value>,
    hook: Option<HookKind>,
}

impl HookContext {
    /// Context for a write of the given columns
    pub fn for_columns(fields: ColumnValues) -> Self {
        let explicit = fields.keys().cloned().collect();
        Self {
            fields,
            explicit,
            all_fields: false,
            vars: HashMap::new(),
            hook: None,
        }
    }

    /// Context for a write of every column (create and save)
    pub fn for_all_columns() -> Self {
        Self {
            fields: ColumnValues::new(),
            explicit: BTreeSet::new(),
            all_fields: true,
            vars: HashMap::new(),
            hook: None,
        }
    }

    /// Whether a column is written by this mutation
    pub fn has_field(&self, name: &str) -> bool {
        self.all_fields || self.fields.contains_key(name)
    }

    /// Whether every column is written
    pub fn all_fields(&self) -> bool {
        self.all_fields
    }

    /// Column values that will be written
    pub fn fields(&self) -> &ColumnValues {
        &self.fields
    }

    /// Inject a column value into the write
    ///
    /// Overriding a column the caller passed explicitly logs a warning; the
    /// injected value wins.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        if self.explicit.contains(&name) {
            warn!(
                column = %name,
                hook = ?self.hook,
                "hook listener overrides explicitly updated column"
            );
        }
        self.fields.insert(name, value.into());
    }

    /// Scratch value shared between the before and after hooks of one call
    pub fn var(&self, name: &str) -> Option<&serde_json::Value> {
        self.vars.get(name)
    }

    /// Set a scratch value
    pub fn set_var(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.vars.insert(name.into(), value);
    }

    /// The hook currently running
    pub fn hook(&self) -> Option<HookKind> {
        self.hook
    }

    #[cfg(test)]
    pub(crate) fn into_fields(self) -> ColumnValues {
        self.fields
    }
}

type ErasedListener =
    Arc<dyn Fn(&RequestContext, HookKind, &dyn Any, &mut HookContext) + Send + Sync>;

/// Application listeners keyed by record type and hook kind
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<(TypeId, HookKind), Vec<ErasedListener>>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry").finish_non_exhaustive()
    }
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one record type and hook kind
    pub async fn add<R, F>(&self, hook: HookKind, listener: F)
    where
        R: Record,
        F: Fn(&RequestContext, HookKind, &R, &mut HookContext) + Send + Sync + 'static,
    {
        let erased: ErasedListener = Arc::new(move |ctx, hook, record, hctx| {
            if let Some(record) = record.downcast_ref::<R>() {
                listener(ctx, hook, record, hctx);
            }
        });
        self.listeners
            .write()
            .await
            .entry((TypeId::of::<R>(), hook))
            .or_default()
            .push(erased);
    }

    /// Number of listeners registered for a record type and hook kind
    pub async fn count<R: Record>(&self, hook: HookKind) -> usize {
        self.listeners
            .read()
            .await
            .get(&(TypeId::of::<R>(), hook))
            .map_or(0, Vec::len)
    }

    /// Run the record-level listener, then every registered listener
    pub async fn dispatch<R: Record>(
        &self,
        ctx: &RequestContext,
        hook: HookKind,
        record: &R,
        hctx: &mut HookContext,
    ) {
        hctx.hook = Some(hook);
        if let Some(listener) = R::schema().listener() {
            listener(ctx, hook, record, hctx);
        }
        let listeners = self
            .listeners
            .read()
            .await
            .get(&(TypeId::of::<R>(), hook))
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener(ctx, hook, record as &dyn Any, hctx);
        }
    }
}
