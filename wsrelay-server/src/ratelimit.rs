//! Per-(connection, method) token-bucket rate limiting.

use crate::error::ServerError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Parses a human-readable period like `"10s"`, `"1m"`, `"2h"` or `"1d"`.
pub fn parse_period(period: &str) -> Result<Duration, ServerError> {
    if period.is_empty() {
        return Err(ServerError::InvalidPeriod("empty period".into()));
    }

    let (value, unit) = period.split_at(period.len() - 1);
    let multiplier = match unit {
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86400.0,
        _ => {
            return Err(ServerError::InvalidPeriod(format!(
                "invalid unit in {period:?}: expected one of s, m, h, d (e.g. \"10s\", \"5m\", \"1h\")"
            )))
        }
    };

    let value: f64 = value
        .parse()
        .map_err(|_| ServerError::InvalidPeriod(format!("invalid number in {period:?}")))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(ServerError::InvalidPeriod(format!(
            "period must be positive, got {period:?}"
        )));
    }

    Ok(Duration::from_secs_f64(value * multiplier))
}

/// Rate-limit policy attached to an RPC method.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimit {
    pub limit: u32,
    pub period: Duration,
    pub disconnect_on_exceed: bool,
}

impl RateLimit {
    /// Creates a policy admitting `limit` calls per parsed period.
    pub fn new(limit: u32, period: &str) -> Result<Self, ServerError> {
        Ok(Self {
            limit,
            period: parse_period(period)?,
            disconnect_on_exceed: false,
        })
    }

    /// Closes the connection (policy violation) when the limit is exceeded.
    pub fn disconnect_on_exceed(mut self) -> Self {
        self.disconnect_on_exceed = true;
        self
    }
}

/// One token bucket. Refill is proportional to elapsed monotonic time and
/// capped at the configured limit, so wall-clock jumps neither refill nor
/// starve it.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(limit: u32, now: Instant) -> Self {
        Self {
            tokens: limit as f64,
            last_refill: now,
        }
    }

    fn try_acquire(&mut self, limit: u32, period: Duration, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let refill = limit as f64 * elapsed.as_secs_f64() / period.as_secs_f64();
        self.tokens = (self.tokens + refill).min(limit as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Lazily-created buckets for one connection, keyed by method alias.
/// Dropped together with the connection.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the call is admitted, consuming one token.
    pub fn check(&self, method: &str, policy: &RateLimit) -> bool {
        self.check_at(method, policy, Instant::now())
    }

    fn check_at(&self, method: &str, policy: &RateLimit, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(method.to_string())
            .or_insert_with(|| TokenBucket::full(policy.limit, now));
        bucket.try_acquire(policy.limit, policy.period, now)
    }
}
