//! Adaptive rate limiter for the inference endpoint.
//!
//! Epistemic foundation:
//! - K_i: Hosted endpoints cap concurrent/rate usage and answer 429 when exceeded
//! - K_i: Some endpoints advertise remaining quota in `x-ratelimit-*` headers
//! - I^B: Exact limits are unknowable until a response arrives → adapt per model

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest backoff after repeated 429s.
const MAX_BACKOFF_SECS: f64 = 60.0;

/// Throttle state for one model.
#[derive(Debug, Default)]
pub struct ModelThrottle {
    /// Requests left in the current window, if advertised
    pub remaining_requests: Option<u32>,
    /// When the request window resets
    pub reset_at: Option<Instant>,
    /// Consecutive 429 responses
    pub consecutive_429s: u32,
    /// Do not send before this instant
    pub backoff_until: Option<Instant>,
}

impl ModelThrottle {
    /// Time to wait before the next request may go out.
    pub fn wait_time(&self, now: Instant) -> Duration {
        let mut wait = Duration::ZERO;

        if let Some(until) = self.backoff_until.filter(|&t| t > now) {
            wait = wait.max(until - now);
        }

        if self.remaining_requests == Some(0) {
            if let Some(reset) = self.reset_at.filter(|&t| t > now) {
                wait = wait.max(reset - now);
            }
        }

        wait
    }

    /// Register a 429, honoring `retry-after` when the server sent one.
    pub fn record_429(&mut self, retry_after: Option<f64>) {
        self.consecutive_429s += 1;
        let exponential = 2.0_f64.powi(self.consecutive_429s as i32).min(MAX_BACKOFF_SECS);
        let backoff_secs = retry_after.map_or(exponential, |r| r.max(0.0).min(MAX_BACKOFF_SECS));
        self.backoff_until = Some(Instant::now() + Duration::from_secs_f64(backoff_secs));
        warn!(
            consecutive_429s = self.consecutive_429s,
            backoff_secs, "Rate limited (429), backing off"
        );
    }

    pub fn record_success(&mut self) {
        self.consecutive_429s = 0;
        self.backoff_until = None;
    }

    /// Pick up advertised quota.
    pub fn update_from_headers(&mut self, headers: &HeaderMap) {
        let header = |key: &str| headers.get(key)?.to_str().ok().map(str::to_string);

        if let Some(remaining) = header("x-ratelimit-remaining-requests") {
            self.remaining_requests = remaining.parse().ok();
        }
        if let Some(secs) = header("x-ratelimit-reset-requests").and_then(|s| parse_reset(&s)) {
            self.reset_at = Some(Instant::now() + Duration::from_secs_f64(secs));
        }
    }
}

/// Parse a reset hint: plain seconds (`"1.5"`) or with a unit (`"20s"`, `"150ms"`).
fn parse_reset(value: &str) -> Option<f64> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.parse::<f64>().ok().map(|v| v / 1000.0);
    }
    value.strip_suffix('s').unwrap_or(value).parse().ok()
}

/// Per-model throttling shared by every worker of a client.
#[derive(Debug, Default)]
pub struct RateLimiter {
    states: DashMap<String, ModelThrottle>,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep until `model` may be called again. Returns the time waited.
    pub async fn wait_if_needed(&self, model: &str) -> Duration {
        let wait = self
            .states
            .entry(model.to_string())
            .or_default()
            .wait_time(Instant::now());

        if wait > Duration::ZERO {
            debug!(model, wait_ms = wait.as_millis() as u64, "Waiting for rate limit");
            self.total_wait_ms
                .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Record the status and headers of a response.
    pub fn record_response(&self, model: &str, status: u16, headers: &HeaderMap) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut state = self.states.entry(model.to_string()).or_default();
        state.update_from_headers(headers);

        if status == 429 {
            self.total_429s.fetch_add(1, Ordering::Relaxed);
            let retry_after = headers
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<f64>().ok());
            state.record_429(retry_after);
        } else if status < 400 {
            state.record_success();
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_429s = self.total_429s.load(Ordering::Relaxed);
        RateLimiterStats {
            total_requests,
            total_429s,
            total_wait_secs: self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            rate_limit_ratio: if total_requests > 0 {
                total_429s as f64 / total_requests as f64
            } else {
                0.0
            },
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait_secs: f64,
    pub rate_limit_ratio: f64,
}
