//! Cancel-scope trees with cancellation causes.
//!
//! A [`CancelScope`] is a cancellation token arranged in a parent/child
//! tree, carrying an optional *cause* explaining why it was cancelled.
//! Cancelling a parent cancels every descendant; a descendant that was
//! never given its own cause reports the nearest cancelled ancestor's
//! cause instead.
//!
//! Long-running tasks race their I/O against [`CancelScope::cancelled`]
//! and inspect [`CancelScope::cause`] on the way out to decide whether the
//! shutdown was graceful, retriable, or fatal.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// A cancellation cause. The first cause recorded on a scope wins.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

struct Inner {
    token: CancellationToken,
    cause: OnceLock<Cause>,
    parent: Option<Arc<Inner>>,
}

/// A node in a cancellation tree.
///
/// Cloning a scope yields another handle to the same node; cancelling any
/// clone cancels them all, plus every scope derived via [`CancelScope::child`].
#[derive(Clone)]
pub struct CancelScope {
    inner: Arc<Inner>,
}

impl CancelScope {
    /// Create a new root scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Derive a child scope. The child is cancelled when this scope is,
    /// but cancelling the child leaves this scope alive.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    /// Cancel this scope and its descendants without recording a cause.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    /// Cancel this scope and its descendants, recording `cause`.
    ///
    /// If a cause was already recorded it is kept and `cause` is dropped;
    /// the scope is cancelled either way.
    pub fn cancel_with<E>(&self, cause: E)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cancel_cause(Arc::new(cause));
    }

    /// [`CancelScope::cancel_with`] for an already-shared cause, used when
    /// propagating a cause read from another scope.
    pub fn cancel_cause(&self, cause: Cause) {
        let _ = self.inner.cause.set(cause);
        self.inner.token.cancel();
    }

    /// Whether this scope has been cancelled (directly or by an ancestor).
    pub fn is_done(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolve until this scope is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// The cause this scope was cancelled with.
    ///
    /// Returns the scope's own cause if one was recorded, otherwise the
    /// nearest cancelled ancestor's cause. `None` if the scope is still
    /// live, or was cancelled without a cause anywhere up the chain.
    pub fn cause(&self) -> Option<Cause> {
        let mut cur = Some(&self.inner);
        while let Some(inner) = cur {
            if !inner.token.is_cancelled() {
                return None;
            }
            if let Some(cause) = inner.cause.get() {
                return Some(Arc::clone(cause));
            }
            cur = inner.parent.as_ref();
        }
        None
    }

    /// Whether the recorded cause downcasts to `E` and satisfies `pred`.
    pub fn cause_matches<E, F>(&self, pred: F) -> bool
    where
        E: std::error::Error + 'static,
        F: FnOnce(&E) -> bool,
    {
        match self.cause() {
            Some(cause) => cause.downcast_ref::<E>().map(pred).unwrap_or(false),
            None => false,
        }
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelScope")
            .field("done", &self.is_done())
            .field("cause", &self.cause().map(|c| c.to_string()))
            .finish()
    }
}
