//! Plaintext server used when TLS is enabled: health endpoints plus a
//! permanent redirect of everything else to HTTPS.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;

use super::health;

/// Build the redirect router. `root_path` is re-inserted in front of the
/// request path, since nesting under it strips it off.
pub fn router(root_path: &str) -> Router {
    let root: Arc<str> = Arc::from(root_path);
    let redirect = Router::new().fallback(redirect).with_state(root);
    health::routes().merge(redirect)
}

/// `https://<host>[/<root>]<path>[?<query>]`
pub fn target(host: &str, root_path: &str, uri: &Uri) -> String {
    let mut target = format!("https://{host}");
    if !root_path.is_empty() {
        target.push('/');
        target.push_str(root_path);
    }
    target.push_str(uri.path());
    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }
    target
}

async fn redirect(State(root): State<Arc<str>>, headers: HeaderMap, uri: Uri) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()));

    let Some(host) = host else {
        return (StatusCode::BAD_REQUEST, "missing host\n").into_response();
    };

    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, target(host, &root, &uri))],
    )
        .into_response()
}
