use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::ApiError;
use crate::metrics::{ADMITTED_TOTAL, DENIED_TOTAL};
use crate::rate_limit::{Decision, Quota, RateLimiter, UNKNOWN_IDENTIFIER};

const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

// Middleware state: one limiter plus how to find the caller's address
#[derive(Clone)]
pub struct Admission {
    pub limiter: Arc<RateLimiter>,
    pub trust_proxy: bool,
}

impl Admission {
    pub fn new(limiter: Arc<RateLimiter>, trust_proxy: bool) -> Self {
        Self {
            limiter,
            trust_proxy,
        }
    }
}

/// Resolves the caller's address. Proxy headers are only read when
/// `trust_proxy` is set, otherwise clients could spoof their identity.
pub fn client_identifier(request: &Request, trust_proxy: bool) -> String {
    let forwarded = if trust_proxy {
        let headers = request.headers();
        header_str(headers, "x-forwarded-for")
            // "client, proxy1, proxy2": leftmost is the original client
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .or_else(|| header_str(headers, "x-real-ip").map(str::trim))
            .map(str::to_string)
    } else {
        None
    };

    forwarded
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| UNKNOWN_IDENTIFIER.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn set_quota_headers(headers: &mut HeaderMap, quota: &Quota) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(quota.reset_at.timestamp()));
}

// Rate limit middleware, wire with `axum::middleware::from_fn_with_state`
pub async fn enforce(State(admission): State<Admission>, request: Request, next: Next) -> Response {
    let identifier = client_identifier(&request, admission.trust_proxy);
    let route = request.uri().path().to_string();
    let policy = admission.limiter.policy().name.as_str();

    let decision = match admission.limiter.admit(&identifier, &route, Utc::now()) {
        Ok(decision) => decision,
        Err(err) => {
            error!(policy, %identifier, %route, error = %err, "rate limiter failed");
            return ApiError::from(err).into_response();
        }
    };

    let quota = *decision.quota();
    match decision {
        Decision::Allow(_) => {
            ADMITTED_TOTAL.with_label_values(&[policy]).inc();
            let mut response = next.run(request).await;
            set_quota_headers(response.headers_mut(), &quota);
            response
        }
        Decision::Deny {
            retry_after,
            message,
            ..
        } => {
            DENIED_TOTAL.with_label_values(&[policy]).inc();
            warn!(policy, %identifier, %route, retry_after, "rate limit exceeded");

            let mut response = ApiError::RateLimited {
                message,
                retry_after,
            }
            .into_response();
            let headers = response.headers_mut();
            set_quota_headers(headers, &quota);
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
            response
        }
    }
}
