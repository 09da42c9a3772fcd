
use std::time::Duration;

use harness::{http_get, insecure_config, tls_config, tls_connect, TestServer, TEST_TIMEOUT};
use thub_mux::{Backoff, BindError, RawListener};
use thub_server::grpc::proto::{PullRequest, VersionRequest};
use thub_server::grpc::registry_service_client::RegistryServiceClient;
use thub_server::grpc::version_service_client::VersionServiceClient;
use thub_server::{ApiClient, ClientOptions, LifecycleState, Server, ServerError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::ServerReflectionRequest;

fn registry_blob() -> Vec<u8> {
    (0..3000u32).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn http_and_grpc_share_the_port() {
    let blob = registry_blob();
    let server = TestServer::start(insecure_config(&blob)).await;

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    let response = http_get(&mut tcp, "localhost", "/healthz").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "OK\n");

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    let response = http_get(&mut tcp, "localhost", "/api/version").await;
    assert_eq!(response.status, 200);
    let json: serde_json::Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));

    let mut version = VersionServiceClient::connect(server.grpc_url()).await.unwrap();
    let info = version
        .version(VersionRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(info.compiler, "rustc");

    let mut registry = RegistryServiceClient::connect(server.grpc_url()).await.unwrap();
    let mut stream = registry.pull(PullRequest {}).await.unwrap().into_inner();
    let mut chunks = Vec::new();
    while let Some(msg) = stream.message().await.unwrap() {
        chunks.push(msg.chunk);
    }
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().take(2).all(|c| c.len() == 1024));
    assert_eq!(chunks.concat(), blob);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_protocol_is_discarded_in_insecure_mode() {
    let server = TestServer::start(insecure_config(b"")).await;

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    tcp.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(TEST_TIMEOUT, tcp.read(&mut buf))
        .await
        .expect("discarded connection was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    assert_eq!(http_get(&mut tcp, "localhost", "/readyz").await.status, 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn root_path_keeps_health_at_the_top() {
    let config = thub_server::ServerConfig {
        root_path: "hub".to_string(),
        ..insecure_config(b"")
    };
    let server = TestServer::start(config).await;

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    assert_eq!(http_get(&mut tcp, "localhost", "/hub/api/version").await.status, 200);

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    assert_eq!(http_get(&mut tcp, "localhost", "/api/version").await.status, 404);

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    assert_eq!(http_get(&mut tcp, "localhost", "/healthz").await.status, 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn tls_serves_https_and_redirects_plaintext() {
    let (config, material) = tls_config(b"");
    let server = TestServer::start(config).await;

    let mut tls = tls_connect(&material, server.addr).await.unwrap();
    let response = http_get(&mut tls, "localhost", "/api/version").await;
    assert_eq!(response.status, 200);
    assert!(response.body.contains(env!("CARGO_PKG_VERSION")));

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    let response = http_get(&mut tcp, "hub.test", "/templates?page=2").await;
    assert_eq!(response.status, 301);
    assert_eq!(
        response.header("location"),
        Some("https://hub.test/templates?page=2")
    );

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    assert_eq!(http_get(&mut tcp, "hub.test", "/healthz").await.status, 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn grpc_over_tls() {
    let blob = registry_blob();
    let (config, material) = tls_config(&blob);
    let server = TestServer::start(config).await;

    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(material.cert_pem()))
        .domain_name("localhost");
    let channel = Channel::from_shared(format!("https://{}", server.addr))
        .unwrap()
        .tls_config(tls)
        .unwrap()
        .connect()
        .await
        .unwrap();

    let mut version = VersionServiceClient::new(channel.clone());
    let info = version
        .version(VersionRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.version, env!("CARGO_PKG_VERSION"));

    let mut registry = RegistryServiceClient::new(channel);
    let mut stream = registry.pull(PullRequest {}).await.unwrap().into_inner();
    let mut received = Vec::new();
    while let Some(msg) = stream.message().await.unwrap() {
        received.extend_from_slice(&msg.chunk);
    }
    assert_eq!(received, blob);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn api_client_over_plaintext() {
    let blob = registry_blob();
    let server = TestServer::start(insecure_config(&blob)).await;

    let options = ClientOptions {
        host: server.addr.to_string(),
        plaintext: true,
        ..ClientOptions::default()
    };
    let client = ApiClient::connect(&options).await.unwrap();
    assert_eq!(client.version().await.unwrap().version, env!("CARGO_PKG_VERSION"));
    assert_eq!(client.pull().await.unwrap(), blob);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn api_client_verifies_the_server_certificate() {
    let blob = registry_blob();
    let (config, material) = tls_config(&blob);
    let server = TestServer::start(config).await;

    let ca = std::env::temp_dir().join(format!("thub-client-ca-{}.pem", std::process::id()));
    std::fs::write(&ca, material.cert_pem()).unwrap();

    let options = ClientOptions {
        host: server.addr.to_string(),
        ca_cert: Some(ca.clone()),
        server_name: Some("localhost".to_string()),
        ..ClientOptions::default()
    };
    let client = ApiClient::connect(&options).await.unwrap();
    assert_eq!(client.pull().await.unwrap(), blob);

    // Nothing vouches for a self-signed certificate without the CA file.
    let untrusted = ClientOptions {
        ca_cert: None,
        ..options
    };
    let failed = match ApiClient::connect(&untrusted).await {
        Err(_) => true,
        Ok(client) => client.version().await.is_err(),
    };
    assert!(failed);

    let _ = std::fs::remove_file(ca);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn reflection_lists_the_services() {
    let server = TestServer::start(insecure_config(b"")).await;

    let channel = Channel::from_shared(server.grpc_url())
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = ServerReflectionClient::new(channel);
    let request = ServerReflectionRequest {
        host: String::new(),
        message_request: Some(MessageRequest::ListServices(String::new())),
    };
    let mut responses = client
        .server_reflection_info(tokio_stream::once(request))
        .await
        .unwrap()
        .into_inner();
    let response = responses.message().await.unwrap().expect("no reflection response");

    let Some(MessageResponse::ListServicesResponse(list)) = response.message_response else {
        panic!("unexpected reflection response: {:?}", response.message_response);
    };
    let names: Vec<&str> = list.service.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&thub_server::grpc::VERSION_SERVICE));
    assert!(names.contains(&thub_server::grpc::REGISTRY_SERVICE));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn failed_handshake_does_not_affect_next_connection() {
    let (config, material) = tls_config(b"");
    let server = TestServer::start(config).await;

    // A record header announcing a handshake, followed by junk.
    let mut bad = TcpStream::connect(server.addr).await.unwrap();
    bad.write_all(b"\x16\x03\x01\x00\x08not-tls!").await.unwrap();
    let mut buf = [0u8; 256];
    let _ = tokio::time::timeout(TEST_TIMEOUT, bad.read(&mut buf)).await;
    drop(bad);

    let mut tls = tls_connect(&material, server.addr).await.unwrap();
    assert_eq!(http_get(&mut tls, "localhost", "/healthz").await.status, 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn graceful_shutdown_releases_the_port() {
    let server = TestServer::start(insecure_config(b"")).await;
    let addr = server.addr;
    let lifecycle = server.lifecycle.clone();

    // An idle derived accept must not hold up shutdown.
    let idle = TcpStream::connect(addr).await.unwrap();

    server.stop().await.unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    assert!(TcpStream::connect(addr).await.is_err());
    drop(idle);
}

#[tokio::test]
async fn bind_gives_up_after_configured_steps() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();

    let config = thub_server::ServerConfig {
        listen_addr: addr.to_string(),
        backoff: Backoff {
            duration: Duration::from_millis(10),
            jitter: 0.0,
            steps: 2,
            ..Backoff::default()
        },
        ..insecure_config(b"")
    };
    let server = Server::new(config);
    let lifecycle = server.lifecycle();
    let (_shutdown, shutdown_rx) = watch::channel(false);

    let result = tokio::time::timeout(TEST_TIMEOUT, server.run(shutdown_rx))
        .await
        .unwrap();

    assert!(matches!(
        result,
        Err(ServerError::Bind(BindError::Exhausted { attempts: 2, .. }))
    ));
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn shutdown_while_binding_is_clean() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();

    let config = thub_server::ServerConfig {
        listen_addr: addr.to_string(),
        backoff: Backoff {
            duration: Duration::from_millis(50),
            jitter: 0.0,
            steps: 1000,
            ..Backoff::default()
        },
        ..insecure_config(b"")
    };
    let server = Server::new(config);
    let lifecycle = server.lifecycle();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(server.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(lifecycle.state(), LifecycleState::Starting);
    shutdown.send_replace(true);

    let result = tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn listener_closed_underneath_the_server_is_fatal() {
    let listener = RawListener::bind("127.0.0.1:0").await.unwrap();
    let close = listener.close_handle();

    let server = Server::new(insecure_config(b""));
    let lifecycle = server.lifecycle();
    let (_shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(server.serve(listener, shutdown_rx));

    let addr = tokio::time::timeout(TEST_TIMEOUT, lifecycle.wait_running())
        .await
        .unwrap()
        .expect("server stopped before running");
    let mut tcp = TcpStream::connect(addr).await.unwrap();
    assert_eq!(http_get(&mut tcp, "localhost", "/healthz").await.status, 200);

    // No shutdown was requested, so the serve loops ending is a failure.
    assert!(close.close());
    let result = tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .unwrap()
        .unwrap();

    match result {
        Err(ServerError::ListenerFatal { task, .. }) => {
            assert!(["tcp-mux", "http-server", "grpc-server"].contains(&task.as_str()));
        }
        other => panic!("expected a fatal listener error, got {other:?}"),
    }
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    assert!(TcpStream::connect(addr).await.is_err());
}
