//! Per-RPC metrics through the global recorder. Kept in its own binary since
//! a process gets one recorder.


use harness::{http_get, insecure_config, TestServer};
use metrics_exporter_prometheus::PrometheusBuilder;
use thub_server::{ApiClient, ClientOptions, ServerConfig};
use tokio::net::TcpStream;

#[tokio::test]
async fn rpc_metrics_are_served_over_http() {
    let handle = PrometheusBuilder::new().install_recorder().unwrap();
    let config = ServerConfig {
        root_path: "hub".to_string(),
        metrics: Some(handle),
        ..insecure_config(b"abc")
    };
    let server = TestServer::start(config).await;

    let options = ClientOptions {
        host: server.addr.to_string(),
        plaintext: true,
        ..ClientOptions::default()
    };
    let client = ApiClient::connect(&options).await.unwrap();
    client.version().await.unwrap();
    assert_eq!(client.pull().await.unwrap(), &b"abc"[..]);

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    let response = http_get(&mut tcp, "localhost", "/metrics").await;
    assert_eq!(response.status, 200);

    let handled = |method: &str| {
        let method = format!("grpc_method=\"{method}\"");
        response
            .body
            .lines()
            .find(|line| line.starts_with("grpc_server_handled_total{") && line.contains(&method))
            .map(str::to_string)
    };
    let version = handled("Version").expect("Version call not counted");
    assert!(version.contains(r#"grpc_code="Ok""#));
    assert!(version.ends_with(" 1"));
    let pull = handled("Pull").expect("Pull call not counted");
    assert!(pull.contains(r#"grpc_type="server_stream""#));
    assert!(response.body.contains("grpc_server_handling_seconds"));

    server.stop().await.unwrap();
}
