//! Cancellation contexts that remember why they were cancelled.
//!
//! A [`Context`] wraps a [`CancellationToken`] and a cause slot. Children are
//! cancelled with their parent and report the nearest recorded cause.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};

const DEFAULT_CAUSE: &str = "context canceled";

/// A cancellable scope shared by every task working on one operation
#[derive(Clone, Debug, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    token: CancellationToken,
    cause: OnceLock<String>,
    parent: Option<Context>,
}

impl Context {
    /// Create a new root context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context that is cancelled whenever `self` is, but can also be
    /// cancelled on its own
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel with the default cause
    pub fn cancel(&self) {
        self.cancel_with_cause(DEFAULT_CAUSE);
    }

    /// Cancel and record `cause`. Only the first recorded cause is kept.
    pub fn cancel_with_cause(&self, cause: impl Into<String>) {
        let _ = self.inner.cause.set(cause.into());
        self.inner.token.cancel();
    }

    /// Whether this context (or an ancestor) has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Wait until the context is cancelled
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// The cancellation error for this context
    pub fn cause(&self) -> SyncError {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let Some(cause) = ctx.inner.cause.get() {
                return SyncError::Cancelled(cause.clone());
            }
            current = ctx.inner.parent.as_ref();
        }
        SyncError::Cancelled(DEFAULT_CAUSE.to_string())
    }

    /// Return the cancellation error if the context is done
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(self.cause())
        } else {
            Ok(())
        }
    }

    /// The underlying token
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}
