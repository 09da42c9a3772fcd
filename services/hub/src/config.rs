//! Server configuration.
//!
//! Every option is a command-line flag with a `TEMPLATE_HUB_*` environment
//! fallback. [`Args::build`] validates the flags and resolves them into a
//! [`ServerConfig`], loading TLS material and registry data on the way; any
//! error there stops startup before a socket is bound.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use thub_mux::{normalize_addr, Backoff, SniffConfig};
use tracing::info;

use crate::error::ConfigError;
use crate::registry::{BlobSource, StaticBlob};
use crate::tls::{TlsMaterial, TlsVersion};

pub const DEFAULT_LISTEN_ADDR: &str = ":8080";

/// Upper bound for gRPC messages in either direction.
pub const MAX_GRPC_MESSAGE_SIZE: usize = 1 << 20;

const MIN_SNIFF_BYTES: usize = 64;
const MAX_SNIFF_BYTES: usize = 1 << 20;

/// Run the template registry server.
#[derive(Debug, Clone, Parser)]
#[command(name = "template-hub", version, about = "Run template registry server")]
pub struct Args {
    /// Server listen address (`host:port` or `:port`).
    #[arg(short = 'l', long, env = "TEMPLATE_HUB_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// Serve everything except health endpoints under this path.
    #[arg(long, env = "TEMPLATE_HUB_ROOT_PATH", default_value = "")]
    pub root_path: String,

    /// Serve plaintext only, without TLS.
    #[arg(short = 'k', long, env = "TEMPLATE_HUB_INSECURE")]
    pub insecure: bool,

    /// Hostname for the generated self-signed certificate.
    #[arg(long, env = "TEMPLATE_HUB_HOSTNAME", default_value = "localhost")]
    pub hostname: String,

    /// TLS certificate chain (PEM).
    #[arg(long, env = "TEMPLATE_HUB_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM).
    #[arg(long, env = "TEMPLATE_HUB_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Lowest accepted TLS version: 1.2 or 1.3.
    #[arg(long, env = "TEMPLATE_HUB_TLS_MIN_VERSION", default_value = "1.2")]
    pub tls_min_version: String,

    /// File served by the registry Pull RPC.
    #[arg(long, env = "TEMPLATE_HUB_REGISTRY_DATA")]
    pub registry_data: Option<PathBuf>,

    /// Directory of static assets served over HTTP.
    #[arg(long, env = "TEMPLATE_HUB_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Drop connections not classified within this many milliseconds (0 disables).
    #[arg(long, env = "TEMPLATE_HUB_SNIFF_TIMEOUT_MS", default_value_t = 10_000)]
    pub sniff_timeout_ms: u64,

    /// Maximum bytes read while classifying a connection.
    #[arg(long, env = "TEMPLATE_HUB_SNIFF_MAX_BYTES", default_value_t = thub_mux::sniff::DEFAULT_MAX_SNIFF_BYTES)]
    pub sniff_max_bytes: usize,

    /// TLS handshake timeout in milliseconds (0 disables).
    #[arg(long, env = "TEMPLATE_HUB_HANDSHAKE_TIMEOUT_MS", default_value_t = 10_000)]
    pub handshake_timeout_ms: u64,

    /// Bind attempts before giving up.
    #[arg(long, env = "TEMPLATE_HUB_BIND_STEPS", default_value_t = 5)]
    pub bind_steps: u32,

    /// Wait before the first bind retry, in milliseconds.
    #[arg(long, env = "TEMPLATE_HUB_BIND_BACKOFF_MS", default_value_t = 500)]
    pub bind_backoff_ms: u64,

    /// Multiplier applied to the wait after each failed bind.
    #[arg(long, env = "TEMPLATE_HUB_BIND_FACTOR", default_value_t = 1.0)]
    pub bind_factor: f64,

    /// Random spread of each wait, as a fraction of it.
    #[arg(long, env = "TEMPLATE_HUB_BIND_JITTER", default_value_t = 0.1)]
    pub bind_jitter: f64,

    /// Seconds to wait for handlers to finish after shutdown starts.
    #[arg(long, env = "TEMPLATE_HUB_SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence.
    #[arg(long, env = "TEMPLATE_HUB_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Fully resolved server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Root path without surrounding slashes; empty for none.
    pub root_path: String,
    /// `None` serves plaintext only.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub registry: Arc<dyn BlobSource>,
    pub static_dir: Option<PathBuf>,
    pub sniff: SniffConfig,
    pub handshake_timeout: Option<Duration>,
    pub backoff: Backoff,
    pub shutdown_timeout: Duration,
    /// Recorder behind `/metrics`; `None` leaves the endpoint out.
    pub metrics: Option<PrometheusHandle>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: normalize_addr(DEFAULT_LISTEN_ADDR),
            root_path: String::new(),
            tls: None,
            registry: Arc::new(StaticBlob::default()),
            static_dir: None,
            sniff: SniffConfig {
                timeout: Some(Duration::from_secs(10)),
                ..SniffConfig::default()
            },
            handshake_timeout: Some(Duration::from_secs(10)),
            backoff: Backoff::default(),
            shutdown_timeout: Duration::from_secs(10),
            metrics: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("root_path", &self.root_path)
            .field("tls", &self.tls.is_some())
            .field("static_dir", &self.static_dir)
            .field("sniff", &self.sniff)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("backoff", &self.backoff)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Trim surrounding slashes: `/api/` becomes `api`.
pub fn trim_root_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn validate_listen_addr(addr: &str) -> Result<(), ConfigError> {
    let valid = addr
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(ConfigError::ListenAddr(addr.to_string()))
    }
}

impl Args {
    /// Validate flags and resolve them into a [`ServerConfig`].
    pub fn build(&self) -> Result<ServerConfig, ConfigError> {
        let listen_addr = normalize_addr(&self.listen);
        validate_listen_addr(&listen_addr)?;

        if self.bind_steps == 0 {
            return Err(ConfigError::OutOfRange {
                name: "bind-steps",
                range: "1..",
                value: self.bind_steps.to_string(),
            });
        }
        if !(self.bind_factor >= 1.0 && self.bind_factor.is_finite()) {
            return Err(ConfigError::OutOfRange {
                name: "bind-factor",
                range: "1.0..",
                value: self.bind_factor.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.bind_jitter) {
            return Err(ConfigError::OutOfRange {
                name: "bind-jitter",
                range: "0.0..=1.0",
                value: self.bind_jitter.to_string(),
            });
        }
        if !(MIN_SNIFF_BYTES..=MAX_SNIFF_BYTES).contains(&self.sniff_max_bytes) {
            return Err(ConfigError::OutOfRange {
                name: "sniff-max-bytes",
                range: "64..=1048576",
                value: self.sniff_max_bytes.to_string(),
            });
        }

        let tls = if self.insecure {
            None
        } else {
            let min_version: TlsVersion = self.tls_min_version.parse()?;
            let material = match (&self.tls_cert, &self.tls_key) {
                (Some(cert), Some(key)) => TlsMaterial::load(cert, key)?,
                (None, None) => TlsMaterial::self_signed(&self.hostname)?,
                _ => return Err(ConfigError::IncompleteTlsPair),
            };
            Some(material.server_config(min_version)?)
        };

        let registry = match &self.registry_data {
            Some(path) => {
                let blob = StaticBlob::preload(path).map_err(|source| ConfigError::RegistryData {
                    path: path.clone(),
                    source,
                })?;
                info!(path = %path.display(), bytes = blob.len(), "Registry data loaded");
                blob
            }
            None => StaticBlob::default(),
        };

        if let Some(dir) = &self.static_dir {
            if !dir.is_dir() {
                return Err(ConfigError::StaticDir(dir.clone()));
            }
        }

        Ok(ServerConfig {
            listen_addr,
            root_path: trim_root_path(&self.root_path),
            tls,
            registry: Arc::new(registry),
            static_dir: self.static_dir.clone(),
            sniff: SniffConfig {
                timeout: millis(self.sniff_timeout_ms),
                max_bytes: self.sniff_max_bytes,
                ..SniffConfig::default()
            },
            handshake_timeout: millis(self.handshake_timeout_ms),
            backoff: Backoff {
                duration: Duration::from_millis(self.bind_backoff_ms),
                factor: self.bind_factor,
                jitter: self.bind_jitter,
                steps: self.bind_steps,
                max: None,
            },
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            metrics: None,
        })
    }
}
