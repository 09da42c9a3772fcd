//! TLS termination over any [`Listener`].
//!
//! The terminator accepts raw connections from its source, completes the
//! server handshake on a per-connection task and queues the decrypted stream
//! on a [`DerivedListener`]. A failed or stalled handshake only costs that one
//! connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use crate::derived::{derived, DerivedListener, Sink};
use crate::error::MuxError;
use crate::listener::Listener;
use crate::sniff::DEFAULT_QUEUE_DEPTH;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// ALPN protocols offered by servers that carry both gRPC and browsers.
pub const ALPN_H2_HTTP11: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Handshake counters.
#[derive(Debug, Default)]
pub struct TlsStats {
    pub accepted: AtomicU64,
    pub handshakes: AtomicU64,
    pub failed: AtomicU64,
}

/// Wraps a source listener and emits decrypted connections.
pub struct TlsTerminator<L: Listener> {
    source: L,
    acceptor: TlsAcceptor,
    handshake_timeout: Option<Duration>,
    sink: Sink<TlsStream<L::Io>>,
    done_tx: watch::Sender<bool>,
    stats: Arc<TlsStats>,
}

impl<L: Listener> TlsTerminator<L> {
    /// Create a terminator and the listener that receives its output.
    pub fn new(
        source: L,
        config: Arc<rustls::ServerConfig>,
        handshake_timeout: Option<Duration>,
    ) -> (Self, DerivedListener<TlsStream<L::Io>>) {
        let local_addr = source
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (done_tx, done_rx) = watch::channel(false);
        let (sink, listener) = derived("tls", DEFAULT_QUEUE_DEPTH, done_rx, local_addr);

        let terminator = Self {
            source,
            acceptor: TlsAcceptor::from(config),
            handshake_timeout,
            sink,
            done_tx,
            stats: Arc::new(TlsStats::default()),
        };
        (terminator, listener)
    }

    pub fn stats(&self) -> Arc<TlsStats> {
        Arc::clone(&self.stats)
    }

    /// Run handshakes until the source closes.
    ///
    /// Returns [`MuxError::ListenerClosed`] after the source closes; the
    /// output listener is closed at the same time.
    pub async fn serve(self) -> Result<(), MuxError> {
        let TlsTerminator {
            source,
            acceptor,
            handshake_timeout,
            sink,
            done_tx,
            stats,
        } = self;

        info!("TLS terminator started");

        let err = loop {
            match source.accept().await {
                Ok((stream, peer_addr)) => {
                    stats.accepted.fetch_add(1, Ordering::Relaxed);

                    let acceptor = acceptor.clone();
                    let sink = sink.clone();
                    let stats = Arc::clone(&stats);
                    let done = done_tx.subscribe();

                    tokio::spawn(
                        handshake(
                            acceptor,
                            stream,
                            peer_addr,
                            handshake_timeout,
                            sink,
                            stats,
                            done,
                        )
                        .instrument(tracing::info_span!("tls", peer = %peer_addr)),
                    );
                }
                Err(e) if e.is_closed() => break e,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        };

        done_tx.send_replace(true);
        info!("TLS terminator stopped");

        Err(err)
    }
}

async fn handshake<Io>(
    acceptor: TlsAcceptor,
    stream: Io,
    peer_addr: SocketAddr,
    timeout: Option<Duration>,
    sink: Sink<TlsStream<Io>>,
    stats: Arc<TlsStats>,
    mut done: watch::Receiver<bool>,
) where
    Io: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let accept = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, acceptor.accept(stream)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "tls handshake timed out",
                )),
            },
            None => acceptor.accept(stream).await,
        }
    };

    let result = tokio::select! {
        biased;
        _ = done.wait_for(|done| *done) => {
            debug!("Source closed during handshake");
            return;
        }
        result = accept => result,
    };

    let tls = match result {
        Ok(tls) => tls,
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "TLS handshake failed");
            return;
        }
    };

    stats.handshakes.fetch_add(1, Ordering::Relaxed);
    let (_, session) = tls.get_ref();
    debug!(
        alpn = ?session.alpn_protocol().map(String::from_utf8_lossy),
        sni = ?session.server_name(),
        "TLS handshake complete"
    );

    if sink.push(tls, peer_addr, &mut done).await.is_err() {
        debug!("TLS listener closed, dropping connection");
    }
}
