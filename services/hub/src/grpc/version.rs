use tonic::{Code, Request, Response, Status};

use super::metrics::{RpcMetrics, RpcType};
use super::proto::{VersionRequest, VersionResponse};
use super::version_service_server::VersionService;
use super::VERSION_SERVICE;
use crate::version::BuildInfo;

#[derive(Debug, Default)]
pub struct VersionServer;

impl From<BuildInfo> for VersionResponse {
    fn from(info: BuildInfo) -> Self {
        Self {
            version: info.version,
            git_commit: info.git_commit,
            build_date: info.build_date,
            rustc_version: info.rustc_version,
            compiler: info.compiler,
            platform: info.platform,
        }
    }
}

#[tonic::async_trait]
impl VersionService for VersionServer {
    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let call = RpcMetrics::start(RpcType::Unary, VERSION_SERVICE, "Version");
        let response = VersionResponse::from(BuildInfo::current());
        call.sent();
        call.finish(Code::Ok);
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_version_reports_build_info() {
        let response = VersionServer
            .version(Request::new(VersionRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(response.compiler, "rustc");
    }
}
