//! Request-scoped context threaded through every repository call
//!
//! A [`RequestContext`] carries a cancellation token and an optional request id.
//! Storage calls race the token; when it fires the call fails with
//! [`RepositoryErrorKind::Cancelled`](crate::repository::RepositoryErrorKind::Cancelled).

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::repository::{RepositoryError, RepositoryOperation};

/// Cancellation and attribution for one logical request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    request_id: Option<String>,
}

impl RequestContext {
    /// A context that is never cancelled
    pub fn background() -> Self {
        Self::default()
    }

    /// A context bound to an existing cancellation token
    pub fn with_cancel(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            request_id: None,
        }
    }

    /// Attach a request id used in log lines
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// The request id, if any
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// The cancellation token
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this context and every child derived from it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the context has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A child context cancelled together with this one
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            request_id: self.request_id.clone(),
        }
    }

    /// Run `fut` unless the context is cancelled first
    pub(crate) async fn guard<T, F>(
        &self,
        operation: RepositoryOperation,
        fut: F,
    ) -> Result<T, RepositoryError>
    where
        F: Future<Output = Result<T, RepositoryError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(RepositoryError::cancelled(operation));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RepositoryError::cancelled(operation)),
            result = fut => result,
        }
    }
}
