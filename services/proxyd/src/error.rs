//! Error taxonomy for the interception core.
//!
//! The first four variants are the sentinel cancellation causes recorded
//! on cancel scopes; everything else is an operational failure surfaced
//! through `Result`s or the spawner's error sink.

use std::io;
use std::net::SocketAddr;

use ezproxy_scope::Cause;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The spawner was gracefully closed.
    #[error("spawner closed")]
    SpawnerClosed,

    /// A session or listener was gracefully closed.
    #[error("proxy closed")]
    ProxyClosed,

    /// A session or listener ended but should be restarted.
    #[error("proxy closed, retrying")]
    ProxyRetry,

    /// A listener used up its restart budget.
    #[error("listener retried too many times")]
    ProxyMaxRetries,

    /// A listener returned without cancelling its own scope.
    #[error("listener returned without cancelling its scope")]
    ListenerStalled,

    /// The spawner's scope is already done.
    #[error("spawner no longer alive: {0}")]
    SpawnerGone(String),

    /// A filter callback is installed and its scope is still live.
    #[error("filter callback already installed")]
    FilterInstalled,

    #[error("proxy {0} not found")]
    ProxyNotFound(u32),

    #[error("transport already initialized")]
    AlreadyInitialized,

    #[error("failed to initialize transport: {0}")]
    InitFailed(String),

    #[error("no listeners given")]
    NoListeners,

    #[error("server address and listen address must differ")]
    AddrConflict,

    #[error("mpx '{0}' already registered")]
    MpxNameTaken(String),

    #[error("mpx '{name}' collides with an existing listener on {addr}")]
    MpxAddrCollision { name: String, addr: SocketAddr },

    #[error("mpx '{0}' not found")]
    MpxNotFound(String),

    #[error("timed out waiting for proxy tasks to stop")]
    CloseTimeout,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// Wrap an I/O failure with what was being attempted.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ProxyError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether a cancellation cause is the retry sentinel.
    pub fn cause_is_retry(cause: &Cause) -> bool {
        matches!(
            cause.downcast_ref::<ProxyError>(),
            Some(ProxyError::ProxyRetry)
        )
    }

    /// Whether a cancellation cause is a graceful close of either the
    /// session or the whole spawner.
    pub fn cause_is_graceful(cause: &Cause) -> bool {
        matches!(
            cause.downcast_ref::<ProxyError>(),
            Some(ProxyError::ProxyClosed | ProxyError::SpawnerClosed)
        )
    }
}
