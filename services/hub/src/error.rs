//! Error types for the server.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use thub_mux::{BindError, MuxError};

/// Invalid or unusable configuration, detected before anything binds.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--tls-cert and --tls-key must be given together")]
    IncompleteTlsPair,

    #[error("unsupported tls minimum version `{0}` (expected 1.2 or 1.3)")]
    TlsVersion(String),

    #[error("invalid listen address `{0}`")]
    ListenAddr(String),

    #[error("{name} must be within {range}, got {value}")]
    OutOfRange {
        name: &'static str,
        range: &'static str,
        value: String,
    },

    #[error("failed to read registry data from {path}: {source}")]
    RegistryData {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("static directory {0} does not exist")]
    StaticDir(PathBuf),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// TLS material could not be loaded, generated or turned into a config.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("failed to generate self-signed certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("invalid tls configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// A protocol handler's serve loop ended.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The derived listener it was serving was closed.
    #[error("listener closed")]
    ListenerClosed,

    #[error("listener error: {0}")]
    Listener(#[from] MuxError),

    #[error("grpc transport error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    #[error("invalid reflection descriptors: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),
}

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("failed to build multiplexer: {0}")]
    Mux(#[source] MuxError),

    /// A serve loop ended while the server was not shutting down.
    #[error("failed listening: {task}: {message}")]
    ListenerFatal { task: String, message: String },
}

/// The API client could not connect or a call failed.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server address `{address}`: {reason}")]
    Address { address: String, reason: String },

    #[error("failed to read CA certificate {path}: {source}")]
    CaCert {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("call failed: {0}")]
    Status(#[from] tonic::Status),
}
