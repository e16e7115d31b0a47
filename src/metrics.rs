use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounterVec, IntGaugeVec, register_histogram, register_int_counter_vec,
    register_int_gauge_vec,
};


lazy_static! {
    pub static ref ADMITTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_requests_admitted_total",
        "Requests admitted by the rate limiter",
        &["policy"]
    )
    .unwrap();
    pub static ref DENIED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_requests_denied_total",
        "Requests rejected with 429 by the rate limiter",
        &["policy"]
    )
    .unwrap();
    pub static ref SWEPT_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_limiter_swept_total",
        "Expired rate limit entries removed by the sweeper",
        &["policy"]
    )
    .unwrap();
    pub static ref LIMITER_KEYS: IntGaugeVec = register_int_gauge_vec!(
        "gateway_limiter_keys",
        "Rate limit entries tracked after the last sweep",
        &["policy"]
    )
    .unwrap();
    pub static ref UPSTREAM_LATENCY: Histogram = register_histogram!(
        "gateway_upstream_latency_seconds",
        "Upstream request latency in seconds"
    )
    .unwrap();
}
