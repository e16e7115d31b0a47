//! Fixed-window admission control keyed by (client identifier, route).
//!
//! Every key owns one counter that opens on its first request and lives for
//! one policy window. Requests past `max_requests` inside that window are
//! denied until the window ends. The counter table is an explicit
//! [`LimiterStore`] handed to each [`RateLimiter`], so tests and separate
//! policies never share hidden state.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use crate::metrics::{LIMITER_KEYS, SWEPT_TOTAL};

/// Identifier used when the caller's address cannot be resolved.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("invalid rate limit policy: {0}")]
    InvalidPolicy(String),

    #[error("window end for {0} is outside the representable time range")]
    ClockOverflow(DateTime<Utc>),
}

/// Limits applied by one [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct Policy {
    pub name: String,
    pub window: Duration,
    pub max_requests: u32,
    /// Replaces the default denial message when set.
    pub message: Option<String>,
}

impl Policy {
    pub fn new(
        name: impl Into<String>,
        window_ms: u64,
        max_requests: u32,
        message: Option<String>,
    ) -> Result<Self, LimiterError> {
        let name = name.into();
        if window_ms == 0 {
            return Err(LimiterError::InvalidPolicy(format!(
                "{name}: window must be longer than 0ms"
            )));
        }
        if max_requests == 0 {
            return Err(LimiterError::InvalidPolicy(format!(
                "{name}: max_requests must be at least 1"
            )));
        }
        Ok(Self {
            name,
            window: Duration::from_millis(window_ms),
            max_requests,
            message,
        })
    }

    /// General API traffic: 60 requests per minute.
    pub fn standard() -> Self {
        Self {
            name: "standard".to_string(),
            window: Duration::from_secs(60),
            max_requests: 60,
            message: None,
        }
    }

    /// Authentication endpoints: 10 requests per 15 minutes.
    pub fn auth() -> Self {
        Self {
            name: "auth".to_string(),
            window: Duration::from_secs(15 * 60),
            max_requests: 10,
            message: Some(
                "Too many authentication attempts, please try again later.".to_string(),
            ),
        }
    }

    fn denial_message(&self, retry_after: u64) -> String {
        match &self.message {
            Some(message) => message.clone(),
            None => format!("Too many requests, please try again in {retry_after} seconds."),
        }
    }
}

/// One limiting window: a client address on a route.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct RateKey {
    pub identifier: String,
    pub route: String,
}

impl RateKey {
    pub fn new(identifier: &str, route: &str) -> Self {
        let identifier = identifier.trim();
        let identifier = if identifier.is_empty() {
            UNKNOWN_IDENTIFIER
        } else {
            identifier
        };
        Self {
            identifier: identifier.to_string(),
            route: route.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

impl CounterEntry {
    fn open(now: DateTime<Utc>, window: Duration) -> Result<Self, LimiterError> {
        let reset_at = TimeDelta::from_std(window)
            .ok()
            .and_then(|window| now.checked_add_signed(window))
            .ok_or(LimiterError::ClockOverflow(now))?;
        Ok(Self { count: 1, reset_at })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

/// Shared counter table. One store per policy.
#[derive(Debug, Default)]
pub struct LimiterStore {
    entries: DashMap<RateKey, CounterEntry>,
}

impl LimiterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn get(&self, key: &RateKey) -> Option<CounterEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Drops every expired counter and returns how many were removed.
    /// `retain` holds each shard's write lock, so a concurrent `admit` on the
    /// same key either sees the old entry or recreates it afterwards.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}

/// Quota metadata reported to the client after a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Quota),
    Deny {
        quota: Quota,
        /// Whole seconds until the window ends, rounded up.
        retry_after: u64,
        message: String,
    },
}

impl Decision {
    pub fn quota(&self) -> &Quota {
        match self {
            Decision::Allow(quota) => quota,
            Decision::Deny { quota, .. } => quota,
        }
    }

    #[cfg(test)]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

pub struct RateLimiter {
    policy: Policy,
    store: Arc<LimiterStore>,
}

impl RateLimiter {
    pub fn new(policy: Policy, store: Arc<LimiterStore>) -> Self {
        Self { policy, store }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<LimiterStore> {
        &self.store
    }

    /// Counts one request for `(identifier, route)` at `now` and decides
    /// whether it may proceed.
    ///
    /// The expiry check, increment and comparison run while the entry's
    /// shard lock is held, so concurrent callers on one key never lose an
    /// update or both slip in at the boundary.
    pub fn admit(
        &self,
        identifier: &str,
        route: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision, LimiterError> {
        let key = RateKey::new(identifier, route);

        let counter = match self.store.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let counter = occupied.get_mut();
                if counter.is_expired(now) {
                    *counter = CounterEntry::open(now, self.policy.window)?;
                } else {
                    counter.count = counter.count.saturating_add(1);
                }
                *counter
            }
            Entry::Vacant(vacant) => *vacant.insert(CounterEntry::open(now, self.policy.window)?),
        };

        let max = self.policy.max_requests;
        let quota = Quota {
            limit: max,
            remaining: max.saturating_sub(counter.count),
            reset_at: counter.reset_at,
        };

        if counter.count <= max {
            return Ok(Decision::Allow(quota));
        }

        let retry_after = retry_after_secs(counter.reset_at, now);
        Ok(Decision::Deny {
            quota,
            retry_after,
            message: self.policy.denial_message(retry_after),
        })
    }
}

fn retry_after_secs(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

// Periodically drops expired counters so high-cardinality traffic
// doesn't grow the table forever
pub async fn sweeper(limiter: Arc<RateLimiter>, period: Duration) {
    let mut interval = interval(period);
    let policy = limiter.policy().name.clone();

    info!(policy = %policy, ?period, "rate limit sweeper started");

    loop {
        interval.tick().await;

        let removed = limiter.store().sweep(Utc::now());
        let remaining = limiter.store().len();

        SWEPT_TOTAL
            .with_label_values(&[policy.as_str()])
            .inc_by(removed as u64);
        LIMITER_KEYS
            .with_label_values(&[policy.as_str()])
            .set(remaining as i64);

        if removed > 0 {
            debug!(policy = %policy, removed, remaining, "swept expired rate limit entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn limiter(window_ms: u64, max_requests: u32) -> RateLimiter {
        let policy = Policy::new("test", window_ms, max_requests, None).unwrap();
        RateLimiter::new(policy, Arc::new(LimiterStore::new()))
    }

    fn after(now: DateTime<Utc>, millis: i64) -> DateTime<Utc> {
        now + TimeDelta::milliseconds(millis)
    }

    #[test]
    fn test_policy_rejects_empty_window_and_zero_limit() {
        assert!(matches!(
            Policy::new("bad", 0, 10, None),
            Err(LimiterError::InvalidPolicy(_))
        ));
        assert!(matches!(
            Policy::new("bad", 1000, 0, None),
            Err(LimiterError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_predefined_policies() {
        let standard = Policy::standard();
        assert_eq!(standard.window, Duration::from_secs(60));
        assert_eq!(standard.max_requests, 60);

        let auth = Policy::auth();
        assert_eq!(auth.window, Duration::from_secs(900));
        assert_eq!(auth.max_requests, 10);
        assert!(auth.max_requests < standard.max_requests);
    }

    #[test]
    fn test_two_requests_then_denied() {
        let limiter = limiter(60_000, 2);
        let now = start();

        let first = limiter.admit("1.2.3.4", "/x", now).unwrap();
        assert!(first.is_allowed());
        assert_eq!(first.quota().remaining, 1);
        assert_eq!(first.quota().limit, 2);
        assert_eq!(first.quota().reset_at, after(now, 60_000));

        let second = limiter.admit("1.2.3.4", "/x", after(now, 1_000)).unwrap();
        assert!(second.is_allowed());
        assert_eq!(second.quota().remaining, 0);
        // reset_at is fixed when the window opens
        assert_eq!(second.quota().reset_at, after(now, 60_000));

        let third = limiter.admit("1.2.3.4", "/x", after(now, 10_000)).unwrap();
        match third {
            Decision::Deny {
                quota,
                retry_after,
                message,
            } => {
                assert_eq!(quota.remaining, 0);
                assert_eq!(retry_after, 50);
                assert_eq!(message, "Too many requests, please try again in 50 seconds.");
            }
            Decision::Allow(_) => panic!("third request should be denied"),
        }
    }

    #[test]
    fn test_window_expiry_starts_fresh_window() {
        let limiter = limiter(60_000, 2);
        let now = start();

        for offset in [0, 1, 2] {
            limiter.admit("1.2.3.4", "/x", after(now, offset)).unwrap();
        }

        let later = after(now, 60_000);
        let fourth = limiter.admit("1.2.3.4", "/x", later).unwrap();
        assert!(fourth.is_allowed());
        assert_eq!(fourth.quota().remaining, 1);
        assert_eq!(fourth.quota().reset_at, after(later, 60_000));

        let key = RateKey::new("1.2.3.4", "/x");
        assert_eq!(limiter.store().get(&key).unwrap().count, 1);
    }

    #[test]
    fn test_count_keeps_growing_while_denied() {
        let limiter = limiter(60_000, 1);
        let now = start();

        for _ in 0..5 {
            limiter.admit("10.0.0.1", "/login", now).unwrap();
        }

        let key = RateKey::new("10.0.0.1", "/login");
        assert_eq!(limiter.store().get(&key).unwrap().count, 5);
        let decision = limiter.admit("10.0.0.1", "/login", now).unwrap();
        assert_eq!(decision.quota().remaining, 0);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let limiter = limiter(60_000, 1);
        let now = start();
        limiter.admit("a", "/r", now).unwrap();

        match limiter.admit("a", "/r", after(now, 59_001)).unwrap() {
            Decision::Deny { retry_after, .. } => assert_eq!(retry_after, 1),
            Decision::Allow(_) => panic!("expected denial"),
        }
        match limiter.admit("a", "/r", after(now, 500)).unwrap() {
            Decision::Deny { retry_after, .. } => assert_eq!(retry_after, 60),
            Decision::Allow(_) => panic!("expected denial"),
        }
    }

    #[test]
    fn test_custom_message_is_used() {
        let policy = Policy::new("auth", 1000, 1, Some("slow down".to_string())).unwrap();
        let limiter = RateLimiter::new(policy, Arc::new(LimiterStore::new()));
        let now = start();

        limiter.admit("a", "/login", now).unwrap();
        match limiter.admit("a", "/login", now).unwrap() {
            Decision::Deny { message, .. } => assert_eq!(message, "slow down"),
            Decision::Allow(_) => panic!("expected denial"),
        }
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = limiter(60_000, 1);
        let now = start();

        assert!(limiter.admit("1.1.1.1", "/x", now).unwrap().is_allowed());
        assert!(!limiter.admit("1.1.1.1", "/x", now).unwrap().is_allowed());

        // other client, same route
        assert!(limiter.admit("2.2.2.2", "/x", now).unwrap().is_allowed());
        // same client, other route
        assert!(limiter.admit("1.1.1.1", "/y", now).unwrap().is_allowed());
    }

    #[test]
    fn test_blank_identifier_falls_back_to_unknown() {
        let limiter = limiter(60_000, 5);
        let now = start();

        limiter.admit("", "/x", now).unwrap();
        limiter.admit("  ", "/x", now).unwrap();

        let key = RateKey::new(UNKNOWN_IDENTIFIER, "/x");
        assert_eq!(limiter.store().get(&key).unwrap().count, 2);
        assert_eq!(limiter.store().len(), 1);
    }

    #[test]
    fn test_window_overflow_is_an_error() {
        let limiter = limiter(u64::MAX, 1);
        let result = limiter.admit("a", "/x", start());
        assert!(matches!(result, Err(LimiterError::ClockOverflow(_))));
    }

    #[test]
    fn test_sweep_removes_only_expired_entries() {
        let store = Arc::new(LimiterStore::new());
        let short = RateLimiter::new(Policy::new("short", 1_000, 5, None).unwrap(), store.clone());
        let long = RateLimiter::new(Policy::new("long", 60_000, 5, None).unwrap(), store.clone());
        let now = start();

        short.admit("a", "/short", now).unwrap();
        long.admit("a", "/long", now).unwrap();
        assert_eq!(store.len(), 2);

        assert_eq!(store.sweep(after(now, 999)), 0);
        assert_eq!(store.sweep(after(now, 1_000)), 1);
        assert!(store.get(&RateKey::new("a", "/short")).is_none());
        assert!(store.get(&RateKey::new("a", "/long")).is_some());

        assert_eq!(store.sweep(after(now, 60_000)), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_concurrent_boundary_admits_exactly_max() {
        let limiter = Arc::new(limiter(60_000, 50));
        let admitted = Arc::new(AtomicU32::new(0));
        let now = start();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let admitted = Arc::clone(&admitted);
                thread::spawn(move || {
                    for _ in 0..25 {
                        if limiter.admit("9.9.9.9", "/hot", now).unwrap().is_allowed() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 50);
        let key = RateKey::new("9.9.9.9", "/hot");
        assert_eq!(limiter.store().get(&key).unwrap().count, 200);
    }

    #[test]
    fn test_sweep_concurrent_with_admit() {
        let limiter = Arc::new(limiter(1_000, 1_000));
        let now = start();

        let writer = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                for i in 0..500 {
                    let ip = format!("10.0.{}.{}", i / 256, i % 256);
                    limiter.admit(&ip, "/x", now).unwrap();
                }
            })
        };
        let sweeper = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                for _ in 0..50 {
                    // nothing has expired yet
                    assert_eq!(limiter.store().sweep(after(now, 500)), 0);
                }
            })
        };

        writer.join().unwrap();
        sweeper.join().unwrap();
        assert_eq!(limiter.store().len(), 500);
        assert_eq!(limiter.store().sweep(after(now, 1_000)), 500);
    }

    #[test]
    fn test_sweep_count_matches_removals_under_inserts() {
        let limiter = Arc::new(limiter(1_000, 5));
        let now = start();

        let writer = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                for i in 0..2_000 {
                    let ip = format!("10.1.{}.{}", i / 256, i % 256);
                    limiter.admit(&ip, "/x", now).unwrap();
                }
            })
        };
        let sweeper = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                let mut swept = 0;
                for _ in 0..200 {
                    swept += limiter.store().sweep(after(now, 2_000));
                }
                swept
            })
        };

        writer.join().unwrap();
        let mut swept = sweeper.join().unwrap();
        swept += limiter.store().sweep(after(now, 2_000));

        // every key was inserted once and already expired
        assert_eq!(swept, 2_000);
        assert_eq!(limiter.store().len(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_task_clears_expired_entries() {
        let limiter = Arc::new(limiter(10, 5));
        let past = Utc::now() - TimeDelta::seconds(1);
        limiter.admit("a", "/x", past).unwrap();
        assert_eq!(limiter.store().len(), 1);

        let task = tokio::spawn(sweeper(Arc::clone(&limiter), Duration::from_secs(600)));
        // first interval tick fires immediately
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(limiter.store().len(), 0);
        task.abort();
    }
}
