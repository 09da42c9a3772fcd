//! HTTP handlers, routing and the serve loop over a derived listener.

mod health;
pub mod redirect;

use std::path::PathBuf;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue};
use axum::{routing::get, Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use metrics_exporter_prometheus::PrometheusHandle;
use thub_mux::Listener;
use tower::ServiceBuilder;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Instrument};

use crate::error::ServeError;
use crate::version::BuildInfo;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Options for the application router.
#[derive(Clone, Default)]
pub struct HttpOptions {
    /// Root path without surrounding slashes; empty for none.
    pub root_path: String,
    pub static_dir: Option<PathBuf>,
    /// Serve `/metrics` from this recorder.
    pub metrics: Option<PrometheusHandle>,
}

/// Create the application router: health, metrics, version API and static
/// assets.
pub fn router(options: &HttpOptions) -> Router {
    let mut app = health::routes().route("/api/version", get(version));

    if let Some(dir) = &options.static_dir {
        let assets = ServiceBuilder::new()
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static("x-frame-options"),
                HeaderValue::from_static("1"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static("x-xss-protection"),
                HeaderValue::from_static("1"),
            ))
            .service(ServeDir::new(dir));
        app = app.fallback_service(assets);
    }

    let mut app = with_root_path(app, &options.root_path);
    if let Some(handle) = options.metrics.clone() {
        app = app.route("/metrics", get(move || std::future::ready(handle.render())));
    }
    app.layer(TraceLayer::new_for_http())
}

/// Create the plaintext router used when TLS is enabled.
pub fn redirect_router(root_path: &str) -> Router {
    with_root_path(redirect::router(root_path), root_path).layer(TraceLayer::new_for_http())
}

/// Move `app` under `/<root_path>`, keeping health endpoints at the top.
fn with_root_path(app: Router, root_path: &str) -> Router {
    if root_path.is_empty() {
        return app;
    }
    health::routes().nest(&format!("/{root_path}"), app)
}

async fn version() -> Json<BuildInfo> {
    Json(BuildInfo::current())
}

/// Serve `app` on every connection `listener` yields.
///
/// Connections are served with HTTP/1.1 or HTTP/2, whichever the client
/// speaks. Returns [`ServeError::ListenerClosed`] once the listener closes.
pub async fn serve_http<L: Listener>(
    name: &'static str,
    listener: L,
    app: Router,
) -> Result<(), ServeError> {
    info!(listener = %name, "HTTP server started");

    loop {
        let (io, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) if e.is_closed() => return Err(ServeError::ListenerClosed),
            Err(e) => {
                warn!(listener = %name, error = %e, "Accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(
            async move {
                let result = auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(TokioIo::new(io), service)
                    .await;
                if let Err(e) = result {
                    debug!(error = %e, "HTTP connection ended with error");
                }
            }
            .instrument(tracing::info_span!("connection", listener = %name, peer = %peer_addr)),
        );
    }
}
