//! Derived listeners: queue-backed listeners fed by a multiplexer or the TLS
//! terminator.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::MuxError;
use crate::listener::Listener;

type Queued<Io> = (Io, SocketAddr);

/// Producer side of a derived listener. Cheap to clone; many classification
/// tasks push concurrently.
pub(crate) struct Sink<Io> {
    name: Arc<str>,
    tx: mpsc::Sender<Queued<Io>>,
}

impl<Io> Clone for Sink<Io> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
        }
    }
}

impl<Io> Sink<Io> {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Queue a connection, waiting for room.
    ///
    /// Gives the connection back if the listener was dropped or `closed`
    /// fired first.
    pub(crate) async fn push(
        &self,
        io: Io,
        peer_addr: SocketAddr,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<(), Io> {
        let permit = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => None,
            permit = self.tx.reserve() => permit.ok(),
        };

        match permit {
            Some(permit) => {
                permit.send((io, peer_addr));
                Ok(())
            }
            None => Err(io),
        }
    }
}

/// A listener exposing only the connections routed to it.
///
/// `accept` pops from a FIFO queue, blocking while it is empty, and fails with
/// [`MuxError::ListenerClosed`] once the producing side has closed.
pub struct DerivedListener<Io> {
    name: Arc<str>,
    rx: Mutex<mpsc::Receiver<Queued<Io>>>,
    closed: watch::Receiver<bool>,
    local_addr: SocketAddr,
}

impl<Io> DerivedListener<Io> {
    /// Name of the route feeding this listener.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<Io> std::fmt::Debug for DerivedListener<Io> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedListener")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Create a connected sink / listener pair.
///
/// `closed` is shared by every listener of one producer; once it turns true
/// (or its sender is dropped) all of them report closed.
pub(crate) fn derived<Io>(
    name: &str,
    depth: usize,
    closed: watch::Receiver<bool>,
    local_addr: SocketAddr,
) -> (Sink<Io>, DerivedListener<Io>) {
    let name: Arc<str> = Arc::from(name);
    let (tx, rx) = mpsc::channel(depth.max(1));
    (
        Sink {
            name: Arc::clone(&name),
            tx,
        },
        DerivedListener {
            name,
            rx: Mutex::new(rx),
            closed,
            local_addr,
        },
    )
}

#[async_trait]
impl<Io> Listener for DerivedListener<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Io = Io;

    async fn accept(&self) -> Result<(Io, SocketAddr), MuxError> {
        let mut closed = self.closed.clone();
        let mut rx = self.rx.lock().await;

        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(MuxError::ListenerClosed),
            queued = rx.recv() => queued.ok_or(MuxError::ListenerClosed),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (_done_tx, done_rx) = watch::channel(false);
        let (sink, listener) = derived::<DuplexStream>("http", 8, done_rx.clone(), addr());
        let mut closed = done_rx.clone();

        for port in 1..=3u16 {
            let (io, _peer) = tokio::io::duplex(8);
            let peer = SocketAddr::new(addr().ip(), port);
            assert!(sink.push(io, peer, &mut closed).await.is_ok());
        }

        for port in 1..=3u16 {
            let (_, peer) = listener.accept().await.unwrap();
            assert_eq!(peer.port(), port);
        }
        assert_eq!(listener.name(), "http");
        assert_eq!(listener.local_addr().unwrap(), addr());
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let (done_tx, done_rx) = watch::channel(false);
        let (_sink, listener) = derived::<DuplexStream>("grpc", 8, done_rx, addr());
        let listener = Arc::new(listener);

        let waiting = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        done_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("accept must unblock on close")
            .unwrap();
        assert!(result.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_dropped_producer_closes() {
        let (done_tx, done_rx) = watch::channel(false);
        let (sink, listener) = derived::<DuplexStream>("tls", 8, done_rx, addr());
        drop(sink);
        drop(done_tx);

        assert!(listener.accept().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_push_after_close_returns_connection() {
        let (done_tx, done_rx) = watch::channel(false);
        let (sink, _listener) = derived::<DuplexStream>("http", 1, done_rx.clone(), addr());
        let mut closed = done_rx;
        done_tx.send(true).unwrap();

        let (io, _peer) = tokio::io::duplex(8);
        assert!(sink.push(io, addr(), &mut closed).await.is_err());
    }
}
