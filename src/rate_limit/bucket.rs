//! Per-bucket rate-limit state.

use std::time::{Duration, Instant};

use crate::api::RateLimitInfo;
use crate::config::GateConfig;

/// EMA weight for response-time tracking.
const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// State for a single rate-limit bucket.
#[derive(Debug, Clone)]
pub struct BucketState {
    /// Declared window capacity, once observed.
    pub limit: Option<u32>,
    /// Requests left in the current window, once observed.
    pub remaining: Option<u32>,
    /// When the current window resets.
    pub reset_at: Option<Instant>,
    /// Exponential moving average of response time, in milliseconds.
    pub avg_response_ms: f64,
    /// Requests dispatched through this bucket.
    pub requests: u64,
    /// Current adaptive inter-request delay.
    pub current_delay: Duration,
    /// Last dispatch time, for pacing.
    pub last_dispatch: Option<Instant>,
}

impl BucketState {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            limit: None,
            remaining: None,
            reset_at: None,
            avg_response_ms: 0.0,
            requests: 0,
            current_delay: base_delay,
            last_dispatch: None,
        }
    }

    /// Time to wait because the bucket's budget is exhausted.
    pub fn window_wait(&self, now: Instant) -> Duration {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset)) if reset > now => reset - now,
            _ => Duration::ZERO,
        }
    }

    /// Time to wait to honor the adaptive inter-request delay.
    pub fn pacing_wait(&self, now: Instant) -> Duration {
        match self.last_dispatch {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                self.current_delay.saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        }
    }

    /// Fold a successful response into the bucket state and recompute
    /// the inter-request delay.
    pub fn observe(&mut self, info: Option<&RateLimitInfo>, response_time: Duration, config: &GateConfig) {
        self.requests += 1;

        let response_ms = response_time.as_secs_f64() * 1_000.0;
        if self.avg_response_ms == 0.0 {
            self.avg_response_ms = response_ms;
        } else {
            self.avg_response_ms =
                self.avg_response_ms * (1.0 - RESPONSE_TIME_ALPHA) + response_ms * RESPONSE_TIME_ALPHA;
        }

        if let Some(info) = info {
            if let Some(limit) = info.limit {
                self.limit = Some(limit);
            }
            if let Some(remaining) = info.remaining {
                self.remaining = Some(remaining);
            }
            if let Some(reset_after) = info.reset_after {
                self.reset_at = Some(Instant::now() + reset_after);
            }
        }

        self.recompute_delay(config);
    }

    /// Spread the remaining budget to the reset boundary: shrink toward
    /// the base delay while capacity is comfortable, grow multiplicatively
    /// as it drains, and never dip below the even-spread pace.
    fn recompute_delay(&mut self, config: &GateConfig) {
        let (limit, remaining) = match (self.limit, self.remaining) {
            (Some(limit), Some(remaining)) if limit > 0 => (limit, remaining),
            _ => return,
        };

        let ratio = remaining as f64 / limit as f64;
        let mut delay = if ratio < 0.2 {
            self.current_delay.mul_f64(2.0)
        } else if ratio < 0.5 {
            self.current_delay.mul_f64(1.5)
        } else {
            self.current_delay.mul_f64(0.9).max(config.base_delay())
        };

        if remaining > 0 {
            if let Some(reset) = self.reset_at {
                let until_reset = reset.saturating_duration_since(Instant::now());
                let even_spread = until_reset / remaining;
                delay = delay.max(even_spread);
            }
        }

        self.current_delay = delay.clamp(config.base_delay(), config.max_delay());
    }
}
