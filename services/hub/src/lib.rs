//! template-hub server library.
//!
//! The `template-hub` binary serves HTTP, gRPC and, unless running insecure,
//! the same two protocols over TLS on one port. The pieces are exposed as a
//! library for integration testing, along with a client for the gRPC API.

pub mod client;
pub mod config;
pub mod error;
pub mod grpc;
pub mod http;
pub mod lifecycle;
pub mod registry;
pub mod server;
pub mod tls;
pub mod version;

pub use client::{ApiClient, ClientOptions};
pub use config::{Args, ServerConfig};
pub use error::{ClientError, ConfigError, ServeError, ServerError, TlsError};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use server::Server;
