use clap::Parser;

use crate::rate_limit::{LimiterError, Policy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid auth prefix {0:?}: {1}")]
    InvalidAuthPrefix(String, &'static str),
}

// Routes that are registered separately and must never be shadowed
const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

// CLI argument structure, every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "admission-gateway")]
#[command(about = "Rate limiting gateway in front of a REST API backend")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    // Backend the admitted requests are forwarded to
    #[arg(short, long, env = "UPSTREAM_URL", default_value = "localhost:5001")]
    pub upstream: String,

    // Standard policy window in milliseconds (default 60s)
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS")]
    pub rate_window_ms: Option<u64>,

    // Standard policy max requests per window (default 60)
    #[arg(long, env = "RATE_LIMIT_MAX")]
    pub rate_limit: Option<u32>,

    #[arg(long, env = "RATE_LIMIT_MESSAGE")]
    pub rate_message: Option<String>,

    // Auth policy window in milliseconds (default 15 minutes)
    #[arg(long, env = "AUTH_RATE_LIMIT_WINDOW_MS")]
    pub auth_window_ms: Option<u64>,

    // Auth policy max requests per window (default 10)
    #[arg(long, env = "AUTH_RATE_LIMIT_MAX")]
    pub auth_limit: Option<u32>,

    #[arg(long, env = "AUTH_RATE_LIMIT_MESSAGE")]
    pub auth_message: Option<String>,

    // Paths under this prefix use the auth policy
    #[arg(long, env = "AUTH_PREFIX", default_value = "/api/auth")]
    pub auth_prefix: String,

    // How often expired counters are swept, in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 600)]
    pub sweep_interval: u64,

    // Read the client address from X-Forwarded-For / X-Real-IP.
    // Only safe behind a proxy that overwrites these headers.
    #[arg(long, env = "TRUST_PROXY", default_value_t = false)]
    pub trust_proxy: bool,
}

impl Args {
    pub fn standard_policy(&self) -> Result<Policy, LimiterError> {
        with_overrides(
            Policy::standard(),
            self.rate_window_ms,
            self.rate_limit,
            self.rate_message.clone(),
        )
    }

    pub fn auth_policy(&self) -> Result<Policy, LimiterError> {
        with_overrides(
            Policy::auth(),
            self.auth_window_ms,
            self.auth_limit,
            self.auth_message.clone(),
        )
    }

    // Auth prefix as a route path: leading slash, no trailing slash
    pub fn auth_route_prefix(&self) -> Result<String, ConfigError> {
        let raw = self.auth_prefix.trim();
        let invalid = |reason| ConfigError::InvalidAuthPrefix(self.auth_prefix.clone(), reason);

        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        let prefix = raw.trim_end_matches('/');
        if prefix.is_empty() {
            return Err(invalid("must name a path below '/'"));
        }
        if prefix.contains(['{', '}', '*']) {
            return Err(invalid("must not contain route parameters"));
        }
        if RESERVED_PATHS
            .iter()
            .any(|reserved| prefix == *reserved || prefix.starts_with(&format!("{reserved}/")))
        {
            return Err(invalid("clashes with /health or /metrics"));
        }
        Ok(prefix.to_string())
    }

    // Add http:// if the scheme is missing and drop any trailing slash
    pub fn upstream_url(&self) -> String {
        let url = self.upstream.trim().trim_end_matches('/');
        if url.starts_with("http") {
            url.to_string()
        } else {
            format!("http://{}", url)
        }
    }
}

// Unset flags keep the preset's values, the result is validated again
fn with_overrides(
    preset: Policy,
    window_ms: Option<u64>,
    max_requests: Option<u32>,
    message: Option<String>,
) -> Result<Policy, LimiterError> {
    let window_ms = window_ms.unwrap_or(preset.window.as_millis() as u64);
    Policy::new(
        preset.name,
        window_ms,
        max_requests.unwrap_or(preset.max_requests),
        message.or(preset.message),
    )
}
