//! Rate limit tracking and backoff.
//!
//! Quota state comes from the gateway's `x-ratelimit-*` response headers
//! and is replaced wholesale on every observed response; there is no
//! client-side decrementing between responses. A local sliding window adds
//! a conservative request-rate cap that protects against bursts before the
//! server has reported anything.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;

/// Quota headers for one resource class (requests or tokens).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaWindow {
    pub limit: Option<u64>,
    pub remaining: Option<i64>,
    /// Unix timestamp (seconds) at which the window resets.
    pub reset_epoch_secs: Option<u64>,
}

impl QuotaWindow {
    fn from_headers(headers: &HeaderMap, resource: &str) -> Self {
        Self {
            limit: header_value(headers, &format!("x-ratelimit-limit-{resource}")),
            remaining: header_value(headers, &format!("x-ratelimit-remaining-{resource}")),
            reset_epoch_secs: header_value(headers, &format!("x-ratelimit-reset-{resource}")),
        }
    }

    fn exhausted(&self) -> bool {
        self.remaining.is_some_and(|r| r <= 0)
    }
}

fn header_value<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Server-reported rate limit snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
    pub requests: QuotaWindow,
    pub tokens: QuotaWindow,
    /// Server `retry-after` in seconds, when present.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitState {
    /// Parse a snapshot from response headers. Absent headers leave the
    /// corresponding field `None`; they never carry over stale values.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            requests: QuotaWindow::from_headers(headers, "requests"),
            tokens: QuotaWindow::from_headers(headers, "tokens"),
            retry_after_secs: header_value(headers, "retry-after"),
        }
    }

    /// True when either resource class reports zero (or negative) remaining.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.requests.exhausted() || self.tokens.exhausted()
    }

    /// How long to wait until the earliest exhausted window resets,
    /// measured against `now_epoch_secs`. Prefers `retry-after` when the
    /// server sent one.
    #[must_use]
    pub fn retry_after(&self, now_epoch_secs: u64) -> Option<Duration> {
        if let Some(secs) = self.retry_after_secs {
            return Some(Duration::from_secs(secs));
        }
        if !self.is_rate_limited() {
            return None;
        }
        let reset = [&self.requests, &self.tokens]
            .into_iter()
            .filter(|w| w.exhausted())
            .filter_map(|w| w.reset_epoch_secs)
            .min()?;
        Some(Duration::from_secs(reset.saturating_sub(now_epoch_secs)))
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Symmetric jitter fraction; 0.25 scales each delay by a uniform
    /// factor in `[0.75, 1.25]`. Zero disables jitter.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter: 0.25,
        }
    }
}

/// Local sliding-window parameters.
#[derive(Debug, Clone, Copy)]
pub struct GovernorConfig {
    pub window: Duration,
    pub max_requests_per_window: usize,
    pub backoff: BackoffConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests_per_window: 20,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Gatekeeper consulted before every outbound request.
///
/// Not a singleton: each client owns (and shares via `Arc<Mutex<_>>`) its
/// own instance, so tests and multiple accounts never interfere.
#[derive(Debug)]
pub struct RateLimitGovernor {
    state: Option<RateLimitState>,
    recent: VecDeque<Instant>,
    config: GovernorConfig,
}

impl Default for RateLimitGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

impl RateLimitGovernor {
    #[must_use]
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            state: None,
            recent: VecDeque::new(),
            config,
        }
    }

    /// Latest server-reported snapshot, if any response has been seen.
    #[must_use]
    pub fn state(&self) -> Option<&RateLimitState> {
        self.state.as_ref()
    }

    /// Replace the tracked state from a response's headers.
    pub fn observe_response(&mut self, headers: &HeaderMap) {
        let state = RateLimitState::from_headers(headers);
        if state.is_rate_limited() {
            tracing::warn!(
                requests_remaining = ?state.requests.remaining,
                tokens_remaining = ?state.tokens.remaining,
                "Rate limit exhausted per server headers"
            );
        }
        self.state = Some(state);
    }

    /// Record an outbound request in the local window.
    pub fn record_request(&mut self, now: Instant) {
        self.recent.push_back(now);
    }

    /// Delay required before the next request may be sent, or `None` when
    /// clear to proceed. Checks the server snapshot first, then the local
    /// sliding window.
    pub fn should_wait_before_request(&mut self, now: Instant) -> Option<Duration> {
        if let Some(state) = &self.state
            && state.is_rate_limited()
        {
            let wait = state.retry_after(unix_now_secs());
            return Some(wait.unwrap_or(self.config.backoff.initial_delay));
        }

        if let Some(horizon) = now.checked_sub(self.config.window) {
            while let Some(front) = self.recent.front() {
                if *front < horizon {
                    self.recent.pop_front();
                } else {
                    break;
                }
            }
        }
        if self.recent.len() >= self.config.max_requests_per_window {
            let oldest = *self.recent.front()?;
            return Some(self.config.window.saturating_sub(now - oldest));
        }
        None
    }

    /// Backoff delay for a retry `attempt` (0-based): exponential growth
    /// capped at `max_delay`, then scaled by symmetric jitter.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let backoff = &self.config.backoff;
        let base = backoff.initial_delay.as_secs_f64()
            * backoff.multiplier.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let capped = base.min(backoff.max_delay.as_secs_f64());
        let jittered = if backoff.jitter > 0.0 {
            // Symmetric jitter: factor in [1 - jitter, 1 + jitter].
            let factor = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * backoff.jitter;
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.backoff.max_attempts
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
