//! Predictive throttling.
//!
//! Watches request timing per bucket and recommends a pre-emptive delay
//! before the gate issues a call, so buckets are slowed down *before*
//! the platform starts returning throttle responses.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::api::RateLimitInfo;
use crate::config::ForecastConfig;
use crate::models::BucketId;

/// Window for "current rate" sampling.
const RATE_WINDOW: Duration = Duration::from_secs(10);
/// Short/long windows for trend detection.
const TREND_SHORT_WINDOW: Duration = Duration::from_secs(5);
const TREND_LONG_WINDOW: Duration = Duration::from_secs(20);

/// One observed request.
#[derive(Debug, Clone)]
struct RequestRecord {
    at: Instant,
    bucket: BucketId,
}

/// Learned traffic pattern for one bucket.
#[derive(Debug, Clone)]
struct BucketPattern {
    /// EMA request rate, requests per second.
    avg_rate: f64,
    /// Decaying peak request rate.
    peak_rate: f64,
    /// EMA response time, milliseconds.
    avg_response_ms: f64,
    /// Inferred window capacity; 0 until the platform reveals it.
    capacity: u32,
    /// Inferred window length.
    window: Duration,
    /// When the current window resets, if known.
    reset_at: Option<Instant>,
    /// Requests observed since the window started.
    requests_in_window: u64,
}

impl Default for BucketPattern {
    fn default() -> Self {
        Self {
            avg_rate: 0.0,
            peak_rate: 0.0,
            avg_response_ms: 0.0,
            capacity: 0,
            window: Duration::from_secs(60),
            reset_at: None,
            requests_in_window: 0,
        }
    }
}

/// Outcome of a limit prediction.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub will_hit_limit: bool,
    /// Time until the bucket runs dry at the current rate; `None` means
    /// no exhaustion in sight.
    pub time_to_limit: Option<Duration>,
    pub recommended_delay: Duration,
    /// 0.0 to 1.0; low-confidence predictions are not acted on.
    pub confidence: f64,
    /// Safety-margined requests left in the window.
    pub remaining_capacity: f64,
}

impl Prediction {
    fn none() -> Self {
        Self {
            will_hit_limit: false,
            time_to_limit: None,
            recommended_delay: Duration::ZERO,
            confidence: 0.0,
            remaining_capacity: f64::INFINITY,
        }
    }
}

#[derive(Default)]
struct ForecastState {
    history: Vec<RequestRecord>,
    patterns: HashMap<BucketId, BucketPattern>,
}

/// Observes per-bucket request history and predicts limit exhaustion.
pub struct Forecaster {
    config: ForecastConfig,
    state: RwLock<ForecastState>,
}

impl Forecaster {
    pub fn new(config: ForecastConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ForecastState::default()),
        }
    }

    /// Record a completed request for analysis.
    pub async fn record_request(
        &self,
        bucket: &BucketId,
        response_time: Duration,
        info: Option<&RateLimitInfo>,
    ) {
        let now = Instant::now();
        let mut state = self.state.write().await;

        state.history.push(RequestRecord {
            at: now,
            bucket: bucket.clone(),
        });
        if state.history.len() > self.config.history_size {
            let excess = state.history.len() - self.config.history_size;
            state.history.drain(0..excess);
        }

        let recent = count_recent(&state.history, bucket, RATE_WINDOW, now);
        let span = recent_span(&state.history, bucket, RATE_WINDOW, now);

        let pattern = state.patterns.entry(bucket.clone()).or_default();

        let response_ms = response_time.as_secs_f64() * 1_000.0;
        pattern.avg_response_ms = pattern.avg_response_ms * 0.9 + response_ms * 0.1;

        if let Some(info) = info {
            if let (Some(remaining), Some(reset_after)) = (info.remaining, info.reset_after) {
                let reset_at = now + reset_after;
                let new_window = pattern
                    .reset_at
                    .map_or(true, |prev| reset_at > prev + Duration::from_millis(50));
                if new_window {
                    pattern.reset_at = Some(reset_at);
                    pattern.requests_in_window = 0;
                }
                let declared = info.limit.unwrap_or(remaining);
                if declared > pattern.capacity {
                    pattern.capacity = declared;
                }
                if reset_after > Duration::ZERO {
                    // The response usually lands partway through the
                    // window; scale up as a rough window-length estimate.
                    let estimated = reset_after.mul_f64(1.5);
                    if estimated > pattern.window {
                        pattern.window = estimated;
                    }
                }
            }
        }

        if recent > 1 && span > Duration::ZERO {
            let rate = recent as f64 / span.as_secs_f64();
            pattern.avg_rate = pattern.avg_rate * 0.7 + rate * 0.3;
            pattern.peak_rate = (pattern.peak_rate * 0.95).max(rate);
        }

        pattern.requests_in_window += 1;
    }

    /// Project the bucket forward: will it run dry before reset?
    pub async fn predict(&self, bucket: &BucketId) -> Prediction {
        let now = Instant::now();
        let state = self.state.read().await;

        let pattern = match state.patterns.get(bucket) {
            Some(p) if p.capacity > 0 => p,
            _ => return Prediction::none(),
        };

        let recent = count_recent(&state.history, bucket, RATE_WINDOW, now);
        let current_rate = recent as f64 / RATE_WINDOW.as_secs_f64();

        let time_until_reset = pattern
            .reset_at
            .map(|r| r.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        let budget = pattern.capacity as f64 * self.config.safety_margin;
        let remaining_capacity = (budget - pattern.requests_in_window as f64).max(0.0);

        let projected = current_rate * time_until_reset.as_secs_f64();
        let will_hit_limit = projected > remaining_capacity;

        let mut time_to_limit = if current_rate > 0.0 {
            Some(Duration::from_secs_f64(remaining_capacity / current_rate))
        } else {
            None
        };

        let mut recommended_delay = Duration::ZERO;
        if will_hit_limit && time_until_reset > Duration::ZERO {
            // Slow to the rate that exactly fits the remaining budget.
            let target_rate = remaining_capacity / time_until_reset.as_secs_f64();
            if target_rate > 0.0 && current_rate > 0.0 {
                let delta = 1_000.0 / target_rate - 1_000.0 / current_rate;
                if delta > 0.0 {
                    recommended_delay = Duration::from_millis(delta as u64);
                }
            } else if current_rate > 0.0 {
                // Budget already gone: wait out the window.
                recommended_delay = time_until_reset;
            }
        }

        let confidence = self.confidence(pattern, recent, now);

        if self.trend_accelerating(&state.history, bucket, now) {
            recommended_delay = recommended_delay.mul_f64(1.2);
            time_to_limit = time_to_limit.map(|t| t.mul_f64(0.8));
        }

        Prediction {
            will_hit_limit,
            time_to_limit,
            recommended_delay,
            confidence,
            remaining_capacity,
        }
    }

    /// Pre-emptive delay recommendation for the gate; zero unless the
    /// prediction is trusted and the limit is inside the lookahead window.
    pub async fn preemptive_delay(&self, bucket: &BucketId) -> Duration {
        let prediction = self.predict(bucket).await;

        let time_to_limit = match prediction.time_to_limit {
            Some(t) if prediction.confidence > self.config.confidence_gate => t,
            _ => return Duration::ZERO,
        };

        let window = self.config.prediction_window();
        if time_to_limit >= window {
            return Duration::ZERO;
        }

        let urgency = 1.0 - time_to_limit.as_secs_f64() / window.as_secs_f64();
        let scaled = prediction.recommended_delay.mul_f64(1.0 + urgency);

        if scaled > Duration::from_millis(100) {
            info!(
                bucket = %bucket,
                delay_ms = scaled.as_millis() as u64,
                remaining = prediction.remaining_capacity as u64,
                time_to_limit_s = time_to_limit.as_secs(),
                "predictive throttling engaged"
            );
        } else if scaled > Duration::ZERO {
            debug!(bucket = %bucket, delay_ms = scaled.as_millis() as u64, "small pre-emptive delay");
        }

        scaled
    }

    /// Drop learned state for one bucket.
    pub async fn clear_bucket(&self, bucket: &BucketId) {
        let mut state = self.state.write().await;
        state.history.retain(|r| &r.bucket != bucket);
        state.patterns.remove(bucket);
    }

    fn confidence(&self, pattern: &BucketPattern, sample_size: usize, now: Instant) -> f64 {
        let mut confidence: f64 = 0.0;

        // More samples, more trust.
        confidence += (sample_size as f64 / 100.0).min(0.3);

        if pattern.capacity > 0 {
            confidence += 0.3;
        }

        // A stable rate predicts better than a spiky one.
        if pattern.avg_rate > 0.0 && pattern.peak_rate > 0.0 {
            confidence += (pattern.avg_rate / pattern.peak_rate) * 0.2;
        }

        // Fresh window data.
        if let Some(reset_at) = pattern.reset_at {
            if reset_at + Duration::from_secs(60) > now {
                confidence += 0.2;
            }
        }

        confidence.min(1.0)
    }

    fn trend_accelerating(&self, history: &[RequestRecord], bucket: &BucketId, now: Instant) -> bool {
        let short = count_recent(history, bucket, TREND_SHORT_WINDOW, now);
        let long = count_recent(history, bucket, TREND_LONG_WINDOW, now);
        if short < 2 || long < 5 {
            return false;
        }

        let short_rate = short as f64 / TREND_SHORT_WINDOW.as_secs_f64();
        let long_rate = long as f64 / TREND_LONG_WINDOW.as_secs_f64();
        short_rate > long_rate * 1.2
    }
}

fn count_recent(history: &[RequestRecord], bucket: &BucketId, window: Duration, now: Instant) -> usize {
    history
        .iter()
        .filter(|r| &r.bucket == bucket && now.saturating_duration_since(r.at) < window)
        .count()
}

fn recent_span(history: &[RequestRecord], bucket: &BucketId, window: Duration, now: Instant) -> Duration {
    let mut first = None;
    let mut last = None;
    for record in history {
        if &record.bucket == bucket && now.saturating_duration_since(record.at) < window {
            if first.is_none() {
                first = Some(record.at);
            }
            last = Some(record.at);
        }
    }
    match (first, last) {
        (Some(first), Some(last)) => last.saturating_duration_since(first),
        _ => Duration::ZERO,
    }
}
