mod config;
mod error;
mod handlers;
mod metrics;
mod middleware;
mod rate_limit;
mod state;

use anyhow::{Context, Result};
use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{MethodRouter, any, get},
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Args;
use crate::handlers::{health_handler, metrics_handler, proxy_handler};
use crate::middleware::{Admission, enforce};
use crate::rate_limit::{LimiterStore, RateLimiter, sweeper};
use crate::state::AppState;

// Proxy route guarded by one admission policy
fn limited(admission: Admission) -> MethodRouter<Arc<AppState>> {
    any(proxy_handler).layer(from_fn_with_state(admission, enforce))
}

// /health and /metrics are never limited. The auth prefix and paths below
// it use the auth policy, everything else the standard one.
// `auth_prefix` comes from `Args::auth_route_prefix`.
fn router(state: Arc<AppState>, standard: Admission, auth: Admission, auth_prefix: &str) -> Router {
    let standard_route = limited(standard);
    let auth_route = limited(auth);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(auth_prefix, auth_route.clone())
        .route(&format!("{auth_prefix}/{{*rest}}"), auth_route)
        .route("/", standard_route.clone())
        .route("/{*path}", standard_route)
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    // each policy owns its store so stacked limits never share counters
    let standard_policy = args.standard_policy().context("Invalid standard rate limit")?;
    let auth_policy = args.auth_policy().context("Invalid auth rate limit")?;
    let auth_prefix = args.auth_route_prefix().context("Invalid auth prefix")?;
    for policy in [&standard_policy, &auth_policy] {
        info!(
            "Rate limit {}: {} requests per {:?}",
            policy.name, policy.max_requests, policy.window
        );
    }

    let standard = Arc::new(RateLimiter::new(standard_policy, Arc::new(LimiterStore::new())));
    let auth = Arc::new(RateLimiter::new(auth_policy, Arc::new(LimiterStore::new())));

    let sweep_interval = Duration::from_secs(args.sweep_interval.max(1));
    tokio::spawn(sweeper(Arc::clone(&standard), sweep_interval));
    tokio::spawn(sweeper(Arc::clone(&auth), sweep_interval));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    let state = Arc::new(AppState {
        client,
        upstream: args.upstream_url(),
    });

    let app = router(
        state,
        Admission::new(standard, args.trust_proxy),
        Admission::new(auth, args.trust_proxy),
        &auth_prefix,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Gateway running on http://localhost:{}", args.port);
    info!("Forwarding to {}", args.upstream_url());
    info!("Auth policy applies under {}", auth_prefix);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}
