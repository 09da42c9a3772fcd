//! Error types for the multiplexer.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by listeners, multiplexers and the TLS terminator.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The listener (or the source it derives from) has been closed.
    #[error("listener closed")]
    ListenerClosed,

    /// No catch-all matcher was registered, some connections would be unroutable.
    #[error("no catch-all matcher registered")]
    MissingCatchAll,

    /// A matcher was registered after a catch-all and can never match.
    #[error("matcher `{name}` is registered after catch-all `{catch_all}` and is unreachable")]
    UnreachableMatcher { name: String, catch_all: String },

    /// Two routes were registered under the same name.
    #[error("duplicate route name `{0}`")]
    DuplicateRoute(String),

    /// IO error from the underlying socket.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl MuxError {
    /// Whether this error reports a closed listener rather than a failure.
    pub fn is_closed(&self) -> bool {
        matches!(self, MuxError::ListenerClosed)
    }
}

/// Errors from acquiring the listen socket.
#[derive(Debug, Error)]
pub enum BindError {
    /// Every attempt allowed by the backoff policy failed.
    #[error("failed to bind tcp listener on {addr} after {attempts} attempts: {source}")]
    Exhausted {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// The shutdown signal fired while still retrying.
    #[error("bind of {addr} cancelled after {attempts} attempts")]
    Cancelled { addr: String, attempts: u32 },
}

/// Reasons a single connection was dropped during classification.
///
/// These never propagate above the multiplexer; they are logged and counted.
#[derive(Debug, Error)]
pub(crate) enum SniffError {
    #[error("peer closed before sending any data")]
    Empty,

    #[error("no matcher accepted the connection")]
    Unmatched,

    #[error("sniff timed out after {0:?}")]
    Timeout(Duration),

    #[error("source closed during sniff")]
    Aborted,

    #[error("io error during sniff: {0}")]
    Io(#[from] io::Error),
}
