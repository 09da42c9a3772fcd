//! Server composition: binds the shared port, wires the multiplexers and
//! protocol handlers together and supervises them until shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use thub_mux::{
    bind_with_backoff, Any, BindError, Http1Fast, Http2HeaderField, Listener, Mux, MuxError,
    MuxStats, RawListener, TlsStats, TlsTerminator,
};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::grpc::serve_grpc;
use crate::http::{redirect_router, router, serve_http, HttpOptions};
use crate::lifecycle::{Lifecycle, LifecycleState, ShutdownFlag, Supervisor, Termination};

/// Counters of every stage, logged when the server stops.
#[derive(Default)]
struct PipelineStats {
    muxes: Vec<(&'static str, Arc<MuxStats>)>,
    tls: Option<Arc<TlsStats>>,
}

impl PipelineStats {
    fn log(&self) {
        for (name, stats) in &self.muxes {
            info!(
                mux = %name,
                accepted = stats.accepted.load(Ordering::Relaxed),
                routed = stats.routed.load(Ordering::Relaxed),
                discarded = stats.discarded.load(Ordering::Relaxed),
                unmatched = stats.unmatched.load(Ordering::Relaxed),
                timed_out = stats.timed_out.load(Ordering::Relaxed),
                failed = stats.failed.load(Ordering::Relaxed),
                "Multiplexer statistics"
            );
        }
        if let Some(stats) = &self.tls {
            info!(
                accepted = stats.accepted.load(Ordering::Relaxed),
                handshakes = stats.handshakes.load(Ordering::Relaxed),
                failed = stats.failed.load(Ordering::Relaxed),
                "TLS statistics"
            );
        }
    }
}

/// The template-hub server.
pub struct Server {
    config: ServerConfig,
    lifecycle: Lifecycle,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Observe the server's lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Bind the configured address, then [`serve`](Self::serve) on it.
    ///
    /// Cancellation while still binding is a clean stop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        self.lifecycle.set(LifecycleState::Starting);

        let listener =
            match bind_with_backoff(&self.config.listen_addr, &self.config.backoff, &mut shutdown)
                .await
            {
                Ok(listener) => listener,
                Err(e @ BindError::Cancelled { .. }) => {
                    info!(error = %e, "Shutdown requested while binding");
                    self.lifecycle.set(LifecycleState::Stopped);
                    return Ok(());
                }
                Err(e) => {
                    self.lifecycle.set(LifecycleState::Stopped);
                    return Err(e.into());
                }
            };

        self.serve(listener, shutdown).await
    }

    /// Serve on a bound `listener` until `shutdown` turns true (or its sender
    /// goes away), or until a listener fails.
    ///
    /// A serve loop that ends before shutdown started is fatal and returned
    /// as [`ServerError::ListenerFatal`]; the remaining tasks are aborted.
    pub async fn serve(
        self,
        listener: RawListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        self.lifecycle.set(LifecycleState::Starting);

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.lifecycle.set(LifecycleState::Stopped);
                return Err(ServerError::Mux(MuxError::Io(e)));
            }
        };
        let close = listener.close_handle();
        let flag = ShutdownFlag::new();
        let mut supervisor = Supervisor::new(flag.clone());

        let stats = match self.compose(listener, &mut supervisor) {
            Ok(stats) => stats,
            Err(e) => {
                flag.set();
                close.close();
                supervisor.abort_all().await;
                self.lifecycle.set(LifecycleState::Stopped);
                return Err(e);
            }
        };

        self.lifecycle.set(LifecycleState::Running(local_addr));
        info!(
            addr = %local_addr,
            tls = self.config.tls.is_some(),
            root_path = %self.config.root_path,
            tasks = supervisor.len(),
            "Server running"
        );

        let outcome = loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                exit = supervisor.next() => match exit {
                    Some(exit) if exit.termination == Termination::Fatal => {
                        break Err(ServerError::ListenerFatal {
                            task: exit.name.to_string(),
                            message: exit.message.unwrap_or_default(),
                        });
                    }
                    Some(_) => {}
                    None => break Ok(()),
                },
            }
        };

        self.lifecycle.set(LifecycleState::ShuttingDown);
        flag.set();
        close.close();

        match &outcome {
            Ok(()) => supervisor.drain(self.config.shutdown_timeout).await,
            Err(e) => {
                error!(error = %e, "Stopping after listener failure");
                supervisor.abort_all().await;
            }
        }

        stats.log();
        self.lifecycle.set(LifecycleState::Stopped);
        info!("Server stopped");
        outcome
    }

    /// Build the multiplexer pipeline on `listener` and spawn every stage.
    fn compose(
        &self,
        listener: RawListener,
        supervisor: &mut Supervisor,
    ) -> Result<PipelineStats, ServerError> {
        let options = HttpOptions {
            root_path: self.config.root_path.clone(),
            static_dir: self.config.static_dir.clone(),
            metrics: self.config.metrics.clone(),
        };
        let registry = Arc::clone(&self.config.registry);
        let mut stats = PipelineStats::default();

        let mut mux = Mux::builder(listener).with_config(self.config.sniff.clone());

        let Some(tls_config) = self.config.tls.clone() else {
            let http = mux.route("http", Http1Fast);
            let grpc = mux.route("grpc", Http2HeaderField::grpc());
            mux.discard("discard", Any);
            let mux = mux.build().map_err(ServerError::Mux)?;
            stats.muxes.push(("tcp-mux", mux.stats()));

            supervisor.spawn("tcp-mux", mux.serve());
            supervisor.spawn("http-server", serve_http("http", http, router(&options)));
            supervisor.spawn("grpc-server", serve_grpc(grpc, registry));
            return Ok(stats);
        };

        let http = mux.route("http", Http1Fast);
        let tls = mux.route("tls", Any);
        let mux = mux.build().map_err(ServerError::Mux)?;
        stats.muxes.push(("tcp-mux", mux.stats()));

        let (terminator, decrypted) =
            TlsTerminator::new(tls, tls_config, self.config.handshake_timeout);
        stats.tls = Some(terminator.stats());

        let mut inner = Mux::builder(decrypted).with_config(self.config.sniff.clone());
        let https = inner.route("https", Http1Fast);
        let grpc = inner.route("grpc", Http2HeaderField::grpc());
        let https_h2 = inner.route("https-h2", Any);
        let inner = inner.build().map_err(ServerError::Mux)?;
        stats.muxes.push(("tls-mux", inner.stats()));

        let app = router(&options);

        supervisor.spawn("tcp-mux", mux.serve());
        supervisor.spawn(
            "http-server",
            serve_http("http", http, redirect_router(&options.root_path)),
        );
        supervisor.spawn("tls-terminator", terminator.serve());
        supervisor.spawn("tls-mux", inner.serve());
        supervisor.spawn("https-server", serve_http("https", https, app.clone()));
        supervisor.spawn("https-h2-server", serve_http("https-h2", https_h2, app));
        supervisor.spawn("grpc-server", serve_grpc(grpc, registry));
        Ok(stats)
    }
}
