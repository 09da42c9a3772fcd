//! Single-port protocol multiplexing.
//!
//! Everything here is a [`Listener`]: the raw TCP socket, each route of a
//! [`Mux`], and the output of a [`TlsTerminator`]. Stages compose by handing
//! one stage's listener to the next:
//!
//! ```text
//! RawListener ─► Mux ─┬─► "http"  DerivedListener
//!                     └─► "tls"   DerivedListener ─► TlsTerminator ─► Mux ─┬─► "https"
//!                                                                         └─► "grpc"
//! ```
//!
//! Closing the raw listener (through its [`CloseHandle`]) makes every stage
//! downstream report [`MuxError::ListenerClosed`] in turn.

pub mod backoff;
mod derived;
pub mod error;
pub mod listener;
pub mod matcher;
pub mod mux;
pub mod sniff;
pub mod tls;

pub use backoff::{bind_with_backoff, normalize_addr, Backoff};
pub use derived::DerivedListener;
pub use error::{BindError, MuxError};
pub use listener::{CloseHandle, Listener, RawListener};
pub use matcher::{Ack, Any, Http1Fast, Http2HeaderField, Matcher, Prefix, MatchResult};
pub use mux::{Mux, MuxBuilder, MuxStats};
pub use sniff::{SniffConfig, Sniffed};
pub use tls::{TlsStats, TlsTerminator, ALPN_H2_HTTP11};
