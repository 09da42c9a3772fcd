//! Client for the gRPC API.
//!
//! Connects eagerly, so an unreachable server is reported by
//! [`ApiClient::connect`] rather than by the first call.

use std::path::PathBuf;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::debug;

use crate::config::MAX_GRPC_MESSAGE_SIZE;
use crate::error::ClientError;
use crate::grpc::proto::{PullRequest, VersionRequest, VersionResponse};
use crate::grpc::registry_service_client::RegistryServiceClient;
use crate::grpc::version_service_client::VersionServiceClient;

/// Environment variable naming the server to talk to.
pub const HOST_ENV: &str = "TEMPLATE_HUB_HOST";
pub const DEFAULT_HOST: &str = "localhost:8080";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server as `host:port`.
    pub host: String,
    /// Speak h2c instead of TLS.
    pub plaintext: bool,
    /// PEM bundle to trust instead of the system roots.
    pub ca_cert: Option<PathBuf>,
    /// Name to verify the server certificate against; defaults to the host.
    pub server_name: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            plaintext: false,
            ca_cert: None,
            server_name: None,
        }
    }
}

impl ClientOptions {
    /// Defaults, with the host taken from `TEMPLATE_HUB_HOST` when set.
    pub fn from_env() -> Self {
        Self {
            host: host_or_default(std::env::var(HOST_ENV).ok()),
            ..Self::default()
        }
    }

    fn uri(&self) -> String {
        let scheme = if self.plaintext { "http" } else { "https" };
        format!("{scheme}://{}", self.host)
    }

    fn server_name(&self) -> &str {
        match &self.server_name {
            Some(name) => name,
            None => self
                .host
                .rsplit_once(':')
                .map_or(self.host.as_str(), |(host, _)| host),
        }
    }
}

fn host_or_default(value: Option<String>) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string())
}

/// A connection to the server, shared by the service clients it hands out.
#[derive(Debug, Clone)]
pub struct ApiClient {
    channel: Channel,
}

impl ApiClient {
    pub async fn connect(options: &ClientOptions) -> Result<Self, ClientError> {
        let mut endpoint =
            Endpoint::from_shared(options.uri()).map_err(|e| ClientError::Address {
                address: options.host.clone(),
                reason: e.to_string(),
            })?;
        endpoint = endpoint.connect_timeout(CONNECT_TIMEOUT);

        if !options.plaintext {
            let mut tls = ClientTlsConfig::new().domain_name(options.server_name());
            tls = match &options.ca_cert {
                Some(path) => {
                    let pem = std::fs::read(path).map_err(|source| ClientError::CaCert {
                        path: path.clone(),
                        source,
                    })?;
                    tls.ca_certificate(Certificate::from_pem(pem))
                }
                None => tls.with_native_roots(),
            };
            endpoint = endpoint.tls_config(tls)?;
        }

        debug!(host = %options.host, plaintext = options.plaintext, "Connecting to template-hub");
        let channel = endpoint.connect().await?;
        Ok(Self { channel })
    }

    pub fn version_client(&self) -> VersionServiceClient<Channel> {
        VersionServiceClient::new(self.channel.clone())
            .max_decoding_message_size(MAX_GRPC_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_GRPC_MESSAGE_SIZE)
    }

    pub fn registry_client(&self) -> RegistryServiceClient<Channel> {
        RegistryServiceClient::new(self.channel.clone())
            .max_decoding_message_size(MAX_GRPC_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_GRPC_MESSAGE_SIZE)
    }

    /// Build information of the server.
    pub async fn version(&self) -> Result<VersionResponse, ClientError> {
        let response = self.version_client().version(VersionRequest {}).await?;
        Ok(response.into_inner())
    }

    /// Pull the registry data, reassembled from its chunks.
    pub async fn pull(&self) -> Result<Bytes, ClientError> {
        let mut stream = self
            .registry_client()
            .pull(PullRequest {})
            .await?
            .into_inner();
        let mut data = BytesMut::new();
        while let Some(msg) = stream.message().await? {
            data.extend_from_slice(&msg.chunk);
        }
        Ok(data.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_or_default() {
        assert_eq!(host_or_default(None), DEFAULT_HOST);
        assert_eq!(host_or_default(Some(" ".to_string())), DEFAULT_HOST);
        assert_eq!(host_or_default(Some("hub:9000".to_string())), "hub:9000");
    }

    #[test]
    fn test_uri_follows_plaintext() {
        let options = ClientOptions::default();
        assert_eq!(options.uri(), "https://localhost:8080");
        let options = ClientOptions {
            plaintext: true,
            ..ClientOptions::default()
        };
        assert_eq!(options.uri(), "http://localhost:8080");
    }

    #[test]
    fn test_server_name_defaults_to_host() {
        let options = ClientOptions {
            host: "hub.example.com:443".to_string(),
            ..ClientOptions::default()
        };
        assert_eq!(options.server_name(), "hub.example.com");

        let options = ClientOptions {
            server_name: Some("localhost".to_string()),
            ..options
        };
        assert_eq!(options.server_name(), "localhost");
    }

    #[tokio::test]
    async fn test_missing_ca_cert() {
        let options = ClientOptions {
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..ClientOptions::default()
        };
        let err = ApiClient::connect(&options).await.unwrap_err();
        assert!(matches!(err, ClientError::CaCert { .. }));
    }
}
