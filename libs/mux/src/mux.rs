//! Connection multiplexer.
//!
//! Wraps one source [`Listener`], classifies every accepted connection by its
//! leading bytes and hands it to the [`DerivedListener`] of the first matching
//! route.
//!
//! ```text
//! source.accept() -> spawn(classify) -> route[i] queue -> DerivedListener[i].accept()
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let mut builder = Mux::builder(raw_listener);
//! let http = builder.route("http", Http1Fast);
//! let grpc = builder.route("grpc", Http2HeaderField::grpc());
//! builder.discard("unmatched", Any);
//! let mux = builder.build()?;
//! tokio::spawn(mux.serve());
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use crate::derived::{derived, DerivedListener, Sink};
use crate::error::{MuxError, SniffError};
use crate::listener::Listener;
use crate::matcher::Matcher;
use crate::sniff::{classify, SniffConfig, Sniffed};

/// Pause after a transient accept error, to avoid a tight loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Counters for one multiplexer.
#[derive(Debug, Default)]
pub struct MuxStats {
    /// Connections accepted from the source.
    pub accepted: AtomicU64,
    /// Connections delivered to a derived listener.
    pub routed: AtomicU64,
    /// Connections that matched a discard route.
    pub discarded: AtomicU64,
    /// Connections no matcher accepted (or that closed before sending data).
    pub unmatched: AtomicU64,
    /// Connections that were not classified within the sniff timeout.
    pub timed_out: AtomicU64,
    /// Connections dropped because of IO errors or shutdown during sniffing.
    pub failed: AtomicU64,
}

impl MuxStats {
    /// Classification failures of any kind.
    pub fn classification_failures(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
            + self.timed_out.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed)
    }
}

enum Target<Io> {
    Listener(Sink<Sniffed<Io>>),
    Discard,
}

struct Route<Io> {
    name: String,
    matcher: Box<dyn Matcher>,
    target: Target<Io>,
}

/// Registers routes for a [`Mux`].
pub struct MuxBuilder<L: Listener> {
    source: L,
    config: SniffConfig,
    routes: Vec<Route<L::Io>>,
    done_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl<L: Listener> MuxBuilder<L> {
    /// Override the sniff configuration.
    pub fn with_config(mut self, config: SniffConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a matcher and get the listener receiving its connections.
    ///
    /// Routes are evaluated in registration order; the first match wins.
    pub fn route<M: Matcher>(
        &mut self,
        name: impl Into<String>,
        matcher: M,
    ) -> DerivedListener<Sniffed<L::Io>> {
        let name = name.into();
        let (sink, listener) = derived(
            &name,
            self.config.queue_depth,
            self.done_tx.subscribe(),
            self.local_addr,
        );
        self.routes.push(Route {
            name,
            matcher: Box::new(matcher),
            target: Target::Listener(sink),
        });
        listener
    }

    /// Register a matcher whose connections are dropped.
    pub fn discard<M: Matcher>(&mut self, name: impl Into<String>, matcher: M) {
        self.routes.push(Route {
            name: name.into(),
            matcher: Box::new(matcher),
            target: Target::Discard,
        });
    }

    /// Validate the route table and build the multiplexer.
    ///
    /// Fails unless exactly one catch-all matcher is registered, as the last
    /// route.
    pub fn build(self) -> Result<Mux<L>, MuxError> {
        let mut names = HashSet::new();
        for route in &self.routes {
            if !names.insert(route.name.as_str()) {
                return Err(MuxError::DuplicateRoute(route.name.clone()));
            }
        }

        let catch_all = self
            .routes
            .iter()
            .position(|r| r.matcher.is_catch_all())
            .ok_or(MuxError::MissingCatchAll)?;

        if let Some(unreachable) = self.routes.get(catch_all + 1) {
            return Err(MuxError::UnreachableMatcher {
                name: unreachable.name.clone(),
                catch_all: self.routes[catch_all].name.clone(),
            });
        }

        Ok(Mux {
            source: self.source,
            config: self.config,
            routes: Arc::new(self.routes),
            done_tx: self.done_tx,
            stats: Arc::new(MuxStats::default()),
        })
    }
}

/// A running classification loop over one source listener.
pub struct Mux<L: Listener> {
    source: L,
    config: SniffConfig,
    routes: Arc<Vec<Route<L::Io>>>,
    done_tx: watch::Sender<bool>,
    stats: Arc<MuxStats>,
}

impl<L: Listener> Mux<L> {
    /// Start registering routes on `source`.
    pub fn builder(source: L) -> MuxBuilder<L> {
        // A listener that cannot report its address still works; derived
        // listeners then report the unspecified address.
        let local_addr = source
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (done_tx, _) = watch::channel(false);

        MuxBuilder {
            source,
            config: SniffConfig::default(),
            routes: Vec::new(),
            done_tx,
            local_addr,
        }
    }

    /// Get multiplexer statistics.
    pub fn stats(&self) -> Arc<MuxStats> {
        Arc::clone(&self.stats)
    }

    /// Accept and classify connections until the source closes.
    ///
    /// Always returns an error: [`MuxError::ListenerClosed`] after a close,
    /// which also closes every derived listener.
    pub async fn serve(self) -> Result<(), MuxError> {
        let Mux {
            source,
            config,
            routes,
            done_tx,
            stats,
        } = self;

        let local_addr = source.local_addr().ok();
        let route_names: Vec<&str> = routes.iter().map(|r| r.name.as_str()).collect();
        info!(local_addr = ?local_addr, routes = ?route_names, "Multiplexer started");

        let err = loop {
            match source.accept().await {
                Ok((stream, peer_addr)) => {
                    stats.accepted.fetch_add(1, Ordering::Relaxed);

                    let routes = Arc::clone(&routes);
                    let stats = Arc::clone(&stats);
                    let config = config.clone();
                    let done = done_tx.subscribe();

                    tokio::spawn(
                        async move {
                            dispatch(stream, peer_addr, &routes, &config, &stats, done).await;
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) if e.is_closed() => break e,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        };

        // Unblocks every derived accept, pending push and in-flight sniff.
        done_tx.send_replace(true);
        info!(local_addr = ?local_addr, "Multiplexer stopped");

        Err(err)
    }
}

/// Classify one connection and deliver it.
async fn dispatch<Io>(
    mut stream: Io,
    peer_addr: SocketAddr,
    routes: &[Route<Io>],
    config: &SniffConfig,
    stats: &MuxStats,
    mut done: watch::Receiver<bool>,
) where
    Io: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(config.max_bytes.min(1024));
    let matchers: Vec<&dyn Matcher> = routes.iter().map(|r| r.matcher.as_ref()).collect();

    let outcome = {
        let sniff = classify(&mut stream, &mut buf, &matchers, config.max_bytes);
        let sniff = async {
            match config.timeout {
                Some(limit) => tokio::time::timeout(limit, sniff)
                    .await
                    .unwrap_or(Err(SniffError::Timeout(limit))),
                None => sniff.await,
            }
        };

        tokio::select! {
            biased;
            _ = done.wait_for(|done| *done) => Err(SniffError::Aborted),
            outcome = sniff => outcome,
        }
    };

    let index = match outcome {
        Ok(index) => index,
        Err(e) => {
            match &e {
                SniffError::Empty | SniffError::Unmatched => {
                    stats.unmatched.fetch_add(1, Ordering::Relaxed)
                }
                SniffError::Timeout(_) => stats.timed_out.fetch_add(1, Ordering::Relaxed),
                SniffError::Aborted | SniffError::Io(_) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed)
                }
            };
            debug!(error = %e, sniffed = buf.len(), "Dropping unclassified connection");
            return;
        }
    };

    let route = &routes[index];
    match &route.target {
        Target::Discard => {
            stats.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(route = %route.name, sniffed = buf.len(), "Discarding connection");
        }
        Target::Listener(sink) => {
            let sniffed = Sniffed::new(stream, buf.freeze());
            match sink.push(sniffed, peer_addr, &mut done).await {
                Ok(()) => {
                    stats.routed.fetch_add(1, Ordering::Relaxed);
                    debug!(route = %sink.name(), "Connection routed");
                }
                Err(_dropped) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(route = %sink.name(), "Derived listener gone, dropping connection");
                }
            }
        }
    }
}
