use axum::{
    body::Body,
    extract::{Request, State},
    http::header::{CONNECTION, HOST, TRANSFER_ENCODING},
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use crate::error::ApiError;
use crate::metrics::UPSTREAM_LATENCY;
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

// Forwards an admitted request to the upstream API and relays its answer
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream, path_and_query);

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Could not read request body: {}", e)))?;

    let mut headers = parts.headers;
    headers.remove(HOST);
    headers.remove(CONNECTION);

    debug!(method = %parts.method, %url, "forwarding request");
    let start_time = Instant::now();

    let upstream = state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            error!(%url, error = %e, "upstream request failed");
            ApiError::Upstream(e.to_string())
        })?;

    let status = upstream.status();
    let mut upstream_headers = upstream.headers().clone();
    let bytes = upstream.bytes().await.map_err(|e| {
        error!(%url, error = %e, "failed to read upstream response");
        ApiError::Upstream(e.to_string())
    })?;

    UPSTREAM_LATENCY.observe(start_time.elapsed().as_secs_f64());

    // body is re-framed by the server
    upstream_headers.remove(TRANSFER_ENCODING);
    upstream_headers.remove(CONNECTION);

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = upstream_headers;
    Ok(response)
}
