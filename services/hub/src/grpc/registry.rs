use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use tonic::{Code, Request, Response, Status};
use tracing::{debug, error};

use super::metrics::{Metered, RpcMetrics, RpcType};
use super::proto::{PullRequest, PullResponse};
use super::registry_service_server::RegistryService;
use super::{PeerInfo, REGISTRY_SERVICE};
use crate::registry::{chunks, BlobSource};

type PullStream = Pin<Box<dyn Stream<Item = Result<PullResponse, Status>> + Send + 'static>>;

/// Streams the registry blob in fixed-size chunks.
pub struct RegistryServer {
    source: Arc<dyn BlobSource>,
}

impl RegistryServer {
    pub fn new(source: Arc<dyn BlobSource>) -> Self {
        Self { source }
    }
}

#[tonic::async_trait]
impl RegistryService for RegistryServer {
    type PullStream = PullStream;

    async fn pull(
        &self,
        request: Request<PullRequest>,
    ) -> Result<Response<Self::PullStream>, Status> {
        let peer = request.extensions().get::<PeerInfo>().map(|p| p.remote_addr);
        let call = RpcMetrics::start(RpcType::ServerStream, REGISTRY_SERVICE, "Pull");

        let blob = match self.source.blob().await {
            Ok(blob) => blob,
            Err(e) => {
                error!(error = %e, "Failed to read registry data");
                call.finish(Code::Internal);
                return Err(Status::internal("failed to read registry data"));
            }
        };

        debug!(?peer, bytes = blob.len(), "Streaming registry");

        let stream =
            tokio_stream::iter(chunks(blob).map(|chunk| Ok::<_, Status>(PullResponse { chunk })));
        Ok(Response::new(Box::pin(Metered::new(stream, call))))
    }
}
