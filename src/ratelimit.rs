//! Request rate limiting.
//!
//! Limits are fixed windows keyed by caller IP: each key maps to a
//! counter that expires once the window elapses after its first write.
//! A secondary exponential limiter deters key scanning by locking out
//! callers that accumulate too many not-found responses, for a period
//! that grows each cycle.
//!
//! Trusted server-side applications making requests to bytebin on behalf
//! of other clients can authenticate using an API key and provide the
//! client's IP address using an HTTP header; that IP is then used for
//! rate limiting instead of the connection address.

use axum::http::HeaderMap;
use moka::sync::Cache;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::content::now_millis;
use crate::errors::HttpError;
use crate::metrics::record_rejected_request;

/// Header carrying the end-client IP reported by a trusted proxy.
pub const HEADER_FORWARDED_IP: &str = "bytebin-forwarded-for";

/// Header carrying a trusted-proxy API key.
pub const HEADER_API_KEY: &str = "bytebin-api-key";

/// A keyed rate limit.
pub trait RateLimiter: Send + Sync + 'static {
    /// Whether the key is currently over the limit, without counting a
    /// new action.
    fn check(&self, key: &str) -> bool;

    /// Atomically count an action and return true iff the new count
    /// exceeds the maximum for the current window.
    fn increment_and_check(&self, key: &str) -> bool;

    /// Count an action without checking.
    fn increment(&self, key: &str);
}

// -- Fixed window -------------------------------------------------------------

/// Allows `actions_per_cycle` actions per key within a fixed period.
/// The window starts at the key's first action and resets when the
/// counter entry expires.
pub struct FixedWindowRateLimiter {
    counters: Cache<String, Arc<AtomicU32>>,
    actions_per_cycle: u32,
}

impl FixedWindowRateLimiter {
    pub fn new(period_mins: u64, actions_per_cycle: u32) -> Self {
        Self::with_period(Duration::from_secs(period_mins * 60), actions_per_cycle)
    }

    pub fn with_period(period: Duration, actions_per_cycle: u32) -> Self {
        Self {
            counters: Cache::builder().time_to_live(period).build(),
            actions_per_cycle,
        }
    }

    fn counter(&self, key: &str) -> Arc<AtomicU32> {
        self.counters
            .get_with(key.to_string(), || Arc::new(AtomicU32::new(0)))
    }
}

impl RateLimiter for FixedWindowRateLimiter {
    fn check(&self, key: &str) -> bool {
        self.counter(key).load(Ordering::Relaxed) > self.actions_per_cycle
    }

    fn increment_and_check(&self, key: &str) -> bool {
        self.counter(key).fetch_add(1, Ordering::Relaxed) + 1 > self.actions_per_cycle
    }

    fn increment(&self, key: &str) {
        self.counter(key).fetch_add(1, Ordering::Relaxed);
    }
}

// -- Exponential backoff ------------------------------------------------------

/// Locks a key out once it accumulates `actions_per_cycle` actions; the
/// lockout period multiplies each cycle up to a maximum, and the whole
/// entry resets after sitting idle for the maximum period.
pub struct ExponentialRateLimiter {
    counters: Cache<String, Arc<Mutex<ExponentialCounter>>>,
    base_period_millis: i64,
    max_period_millis: i64,
    multiplier: f64,
    actions_per_cycle: u32,
}

#[derive(Default)]
struct ExponentialCounter {
    count: u32,
    next_period_millis: i64,
    period_end_millis: i64,
}

impl ExponentialRateLimiter {
    pub fn new(
        actions_per_cycle: u32,
        period_mins: u64,
        multiplier: f64,
        reset_period_mins: u64,
    ) -> Self {
        Self::with_periods(
            actions_per_cycle,
            Duration::from_secs(period_mins * 60),
            multiplier,
            Duration::from_secs(reset_period_mins * 60),
        )
    }

    pub fn with_periods(
        actions_per_cycle: u32,
        period: Duration,
        multiplier: f64,
        reset_period: Duration,
    ) -> Self {
        Self {
            counters: Cache::builder().time_to_idle(reset_period).build(),
            base_period_millis: period.as_millis() as i64,
            max_period_millis: reset_period.as_millis() as i64,
            multiplier,
            actions_per_cycle,
        }
    }

    fn counter(&self, key: &str) -> Arc<Mutex<ExponentialCounter>> {
        let base = self.base_period_millis;
        self.counters.get_with(key.to_string(), || {
            Arc::new(Mutex::new(ExponentialCounter {
                next_period_millis: base,
                ..Default::default()
            }))
        })
    }
}

impl RateLimiter for ExponentialRateLimiter {
    fn check(&self, key: &str) -> bool {
        let counter = self.counter(key);
        let counter = counter.lock().expect("counter mutex poisoned");
        counter.period_end_millis != 0 && now_millis() < counter.period_end_millis
    }

    fn increment_and_check(&self, key: &str) -> bool {
        let limited = self.check(key);
        if !limited {
            self.increment(key);
        }
        limited
    }

    fn increment(&self, key: &str) {
        let counter = self.counter(key);
        let mut counter = counter.lock().expect("counter mutex poisoned");
        counter.count += 1;
        if counter.count >= self.actions_per_cycle {
            counter.count = 0;
            counter.period_end_millis = now_millis() + counter.next_period_millis;
            counter.next_period_millis = ((counter.next_period_millis as f64 * self.multiplier)
                as i64)
                .min(self.max_period_millis);
        }
    }
}

// -- Trusted proxy handling ---------------------------------------------------

/// The outcome of the rate-limit check for one request.
#[derive(Debug)]
pub struct RateLimitResult {
    /// The IP the request was attributed to.
    pub ip_address: String,
    /// Whether the caller is a real user, as opposed to a trusted server
    /// reporting only itself.
    pub real_user: bool,
}

impl RateLimitResult {
    /// Metrics and verbose log events are only emitted for real users.
    pub fn count_metrics(&self) -> bool {
        self.real_user
    }
}

/// Resolves the caller IP (honouring trusted proxies) and applies a rate
/// limit to it.
pub struct RateLimitHandler {
    api_keys: HashSet<String>,
}

impl RateLimitHandler {
    pub fn new(api_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            api_keys: api_keys.into_iter().collect(),
        }
    }

    /// Determine the IP address to attribute this request to.
    ///
    /// The connection IP is taken from `x-real-ip` (set by the CDN),
    /// falling back to the socket address. If an API key header is
    /// present it must be in the allowlist; a valid key lets the caller
    /// substitute the forwarded-for header as the effective IP.
    pub fn resolve_ip(
        &self,
        headers: &HeaderMap,
        remote_addr: &str,
    ) -> Result<RateLimitResult, HttpError> {
        let mut ip_address = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(remote_addr)
            .to_string();

        let api_key = headers
            .get(HEADER_API_KEY)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let mut real_user = true;
        if !api_key.is_empty() {
            if !self.api_keys.contains(api_key) {
                return Err(HttpError::unauthorized("API key is invalid"));
            }

            match headers.get(HEADER_FORWARDED_IP).and_then(|v| v.to_str().ok()) {
                Some(forwarded) => ip_address = forwarded.to_string(),
                // a trusted server acting for itself, not an end user
                None => real_user = false,
            }
        }

        Ok(RateLimitResult {
            ip_address,
            real_user,
        })
    }

    /// Resolve the caller IP and count this request against `limiter`,
    /// rejecting with 429 when over the limit.
    pub fn check(
        &self,
        headers: &HeaderMap,
        remote_addr: &str,
        limiter: &dyn RateLimiter,
        method: &str,
    ) -> Result<RateLimitResult, HttpError> {
        let result = self.resolve_ip(headers, remote_addr)?;

        if limiter.increment_and_check(&result.ip_address) {
            record_rejected_request(method, "rate_limited", headers);
            return Err(HttpError::rate_limit_exceeded());
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_fixed_window_allows_up_to_max() {
        let limiter = FixedWindowRateLimiter::new(1, 3);
        assert!(!limiter.increment_and_check("1.2.3.4"));
        assert!(!limiter.increment_and_check("1.2.3.4"));
        assert!(!limiter.increment_and_check("1.2.3.4"));
        assert!(limiter.increment_and_check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
    }

    #[test]
    fn test_fixed_window_keys_are_independent() {
        let limiter = FixedWindowRateLimiter::new(1, 1);
        assert!(!limiter.increment_and_check("1.1.1.1"));
        assert!(limiter.increment_and_check("1.1.1.1"));
        assert!(!limiter.increment_and_check("2.2.2.2"));
    }

    #[test]
    fn test_fixed_window_resets_after_period() {
        let limiter = FixedWindowRateLimiter::with_period(Duration::from_millis(50), 1);
        assert!(!limiter.increment_and_check("ip"));
        assert!(limiter.increment_and_check("ip"));
        std::thread::sleep(Duration::from_millis(80));
        assert!(!limiter.increment_and_check("ip"));
    }

    #[test]
    fn test_exponential_locks_out_after_cycle() {
        let limiter = ExponentialRateLimiter::with_periods(
            2,
            Duration::from_secs(60),
            2.0,
            Duration::from_secs(600),
        );
        assert!(!limiter.check("ip"));
        limiter.increment("ip");
        assert!(!limiter.check("ip"));
        limiter.increment("ip");
        // two actions completed a cycle, the key is now locked out
        assert!(limiter.check("ip"));
        assert!(limiter.increment_and_check("ip"));
    }

    #[test]
    fn test_exponential_lockout_expires() {
        let limiter = ExponentialRateLimiter::with_periods(
            1,
            Duration::from_millis(30),
            2.0,
            Duration::from_secs(600),
        );
        limiter.increment("ip");
        assert!(limiter.check("ip"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(!limiter.check("ip"));
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_resolve_ip_prefers_x_real_ip() {
        let handler = RateLimitHandler::new(Vec::new());
        let result = handler
            .resolve_ip(&headers(&[("x-real-ip", "203.0.113.9")]), "10.0.0.1")
            .unwrap();
        assert_eq!(result.ip_address, "203.0.113.9");
        assert!(result.real_user);
    }

    #[test]
    fn test_resolve_ip_falls_back_to_remote_addr() {
        let handler = RateLimitHandler::new(Vec::new());
        let result = handler.resolve_ip(&HeaderMap::new(), "10.0.0.1").unwrap();
        assert_eq!(result.ip_address, "10.0.0.1");
        assert!(result.real_user);
    }

    #[test]
    fn test_invalid_api_key_is_401() {
        let handler = RateLimitHandler::new(vec!["good-key".to_string()]);
        let err = handler
            .resolve_ip(&headers(&[(HEADER_API_KEY, "bad-key")]), "10.0.0.1")
            .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_valid_api_key_substitutes_forwarded_ip() {
        let handler = RateLimitHandler::new(vec!["good-key".to_string()]);
        let result = handler
            .resolve_ip(
                &headers(&[
                    (HEADER_API_KEY, "good-key"),
                    (HEADER_FORWARDED_IP, "198.51.100.4"),
                ]),
                "10.0.0.1",
            )
            .unwrap();
        assert_eq!(result.ip_address, "198.51.100.4");
        assert!(result.real_user);
    }

    #[test]
    fn test_trusted_server_for_itself_is_not_a_real_user() {
        let handler = RateLimitHandler::new(vec!["good-key".to_string()]);
        let result = handler
            .resolve_ip(&headers(&[(HEADER_API_KEY, "good-key")]), "10.0.0.1")
            .unwrap();
        assert_eq!(result.ip_address, "10.0.0.1");
        assert!(!result.real_user);
        assert!(!result.count_metrics());
    }

    #[test]
    fn test_check_rejects_over_limit_with_429() {
        let handler = RateLimitHandler::new(Vec::new());
        let limiter = FixedWindowRateLimiter::new(1, 1);
        let headers = HeaderMap::new();

        assert!(handler.check(&headers, "10.0.0.1", &limiter, "POST").is_ok());
        let err = handler
            .check(&headers, "10.0.0.1", &limiter, "POST")
            .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.message, "Rate limit exceeded");
    }
}
