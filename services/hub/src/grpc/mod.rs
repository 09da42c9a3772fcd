//! gRPC services and the serve loop over a derived listener.

mod metrics;
pub mod reflection;
mod registry;
mod version;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use thub_mux::Listener;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tonic::codec::CompressionEncoding;
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use registry::RegistryServer;
pub use version::VersionServer;

use crate::config::MAX_GRPC_MESSAGE_SIZE;
use crate::error::ServeError;
use crate::registry::BlobSource;

/// Protobuf messages of the version and registry APIs.
pub mod proto {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VersionRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VersionResponse {
        #[prost(string, tag = "1")]
        pub version: String,
        #[prost(string, tag = "2")]
        pub git_commit: String,
        #[prost(string, tag = "3")]
        pub build_date: String,
        #[prost(string, tag = "4")]
        pub rustc_version: String,
        #[prost(string, tag = "5")]
        pub compiler: String,
        #[prost(string, tag = "6")]
        pub platform: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PullRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PullResponse {
        #[prost(bytes = "bytes", tag = "1")]
        pub chunk: Bytes,
    }
}

include!(concat!(env!("OUT_DIR"), "/thub.version.v1.VersionService.rs"));
include!(concat!(env!("OUT_DIR"), "/thub.registry.v1.RegistryService.rs"));

pub const VERSION_PACKAGE: &str = "thub.version.v1";
pub const VERSION_SERVICE: &str = "thub.version.v1.VersionService";
pub const REGISTRY_PACKAGE: &str = "thub.registry.v1";
pub const REGISTRY_SERVICE: &str = "thub.registry.v1.RegistryService";

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Remote address of a gRPC connection, available in request extensions.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub remote_addr: SocketAddr,
}

/// A derived-listener connection handed to tonic.
#[derive(Debug)]
pub struct GrpcIo<Io> {
    inner: Io,
    peer_addr: SocketAddr,
}

impl<Io> Connected for GrpcIo<Io> {
    type ConnectInfo = PeerInfo;

    fn connect_info(&self) -> PeerInfo {
        PeerInfo {
            remote_addr: self.peer_addr,
        }
    }
}

impl<Io: AsyncRead + Unpin> AsyncRead for GrpcIo<Io> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<Io: AsyncWrite + Unpin> AsyncWrite for GrpcIo<Io> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Turn a listener into the connection stream tonic serves. The stream ends
/// when the listener closes.
fn incoming<L: Listener>(
    listener: L,
) -> impl Stream<Item = Result<GrpcIo<L::Io>, io::Error>> + Send + 'static {
    futures_util::stream::unfold(listener, |listener| async move {
        loop {
            match listener.accept().await {
                Ok((inner, peer_addr)) => {
                    return Some((Ok(GrpcIo { inner, peer_addr }), listener));
                }
                Err(e) if e.is_closed() => return None,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    })
}

/// Serve the version and registry services, plus server reflection, on
/// `listener`.
///
/// Returns [`ServeError::ListenerClosed`] once the listener closes.
pub async fn serve_grpc<L: Listener>(
    listener: L,
    registry: Arc<dyn BlobSource>,
) -> Result<(), ServeError> {
    let version = version_service_server::VersionServiceServer::new(VersionServer::default())
        .max_decoding_message_size(MAX_GRPC_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_GRPC_MESSAGE_SIZE)
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip);

    let registry =
        registry_service_server::RegistryServiceServer::new(RegistryServer::new(registry))
            .max_decoding_message_size(MAX_GRPC_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_GRPC_MESSAGE_SIZE)
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip);

    let reflection = || {
        tonic_reflection::server::Builder::configure()
            .register_file_descriptor_set(reflection::file_descriptor_set())
    };
    let reflection_v1 = reflection().build_v1()?;
    let reflection_v1alpha = reflection().build_v1alpha()?;

    info!("gRPC server started");

    Server::builder()
        .layer(TraceLayer::new_for_grpc())
        .add_service(version)
        .add_service(registry)
        .add_service(reflection_v1)
        .add_service(reflection_v1alpha)
        .serve_with_incoming(Box::pin(incoming(listener)))
        .await?;

    Err(ServeError::ListenerClosed)
}
