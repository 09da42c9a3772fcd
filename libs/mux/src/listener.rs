//! Listener abstraction and the raw TCP listener.
//!
//! Every stage of the pipeline (raw socket, multiplexer output, TLS output)
//! is a [`Listener`], so multiplexers and the TLS terminator compose freely.
//! Closing is explicit: a [`CloseHandle`] flips a watch channel that every
//! pending `accept` observes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::MuxError;

/// A source of accepted connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Connection type yielded by `accept`.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection.
    ///
    /// Returns [`MuxError::ListenerClosed`] once the listener is closed; any
    /// other error is transient and the caller may keep accepting.
    async fn accept(&self) -> Result<(Self::Io, SocketAddr), MuxError>;

    /// Address of the socket this listener ultimately derives from.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Handle that closes a [`RawListener`] from any task.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    /// Close the listener.
    ///
    /// Returns `true` for the call that actually closed it; later calls are
    /// no-ops and return `false`.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The single bound TCP socket the whole server runs on.
///
/// The socket itself is released when the listener is dropped, which happens
/// when the multiplexer serving it returns after a close.
#[derive(Debug)]
pub struct RawListener {
    inner: TcpListener,
    closed: Arc<watch::Sender<bool>>,
}

impl RawListener {
    /// Bind a TCP listener on `addr`.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self::from_tcp(inner))
    }

    /// Wrap an already bound tokio listener.
    pub fn from_tcp(inner: TcpListener) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner,
            closed: Arc::new(tx),
        }
    }

    /// Get a handle that can close this listener.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            tx: Arc::clone(&self.closed),
        }
    }
}

#[async_trait]
impl Listener for RawListener {
    type Io = TcpStream;

    async fn accept(&self) -> Result<(TcpStream, SocketAddr), MuxError> {
        let mut closed = self.closed.subscribe();

        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => {
                info!("Raw listener closed");
                Err(MuxError::ListenerClosed)
            }
            accepted = self.inner.accept() => {
                let (stream, peer_addr) = accepted?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                }
                Ok((stream, peer_addr))
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let listener = Arc::new(RawListener::bind("127.0.0.1:0").await.unwrap());
        let handle = listener.close_handle();

        let accepting = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.close());

        let result = tokio::time::timeout(Duration::from_secs(1), accepting)
            .await
            .expect("accept should unblock")
            .unwrap();
        assert!(matches!(result, Err(MuxError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = RawListener::bind("127.0.0.1:0").await.unwrap();
        let handle = listener.close_handle();
        let other = handle.clone();

        assert!(!handle.is_closed());
        assert!(handle.close());
        assert!(!other.close());
        assert!(other.is_closed());

        // Accept after close fails immediately.
        assert!(listener.accept().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_accepts_connections() {
        let listener = RawListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_stream, peer) = listener.accept().await.unwrap();
        let client = client.await.unwrap();

        assert_eq!(peer, client.local_addr().unwrap());
    }
}
