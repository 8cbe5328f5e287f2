//! Batch-size optimizer for bulk deletions.
//!
//! Learns per-channel success rate, processing time, and throttle
//! pressure, and recommends how many messages to put in the next
//! bulk-delete call. Changes are EMA-smoothed so the size converges
//! instead of oscillating.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::info;

use crate::config::BatchConfig;
use crate::models::ChannelId;

/// Throttle-hit ratio above which batches shrink proportionally.
const THROTTLE_PRESSURE_FLOOR: f64 = 0.1;
/// Queue depth where load shedding starts.
const QUEUE_DEPTH_FLOOR: usize = 100;
/// Active-operation count where load shedding starts.
const ACTIVE_OPS_FLOOR: usize = 5;
/// Per-message latency (ms) where load shedding starts.
const LATENCY_FLOOR_MS: f64 = 500.0;

/// Rolling metrics for one channel's batches.
#[derive(Debug, Clone, Default)]
pub struct BatchMetrics {
    pub success_count: u64,
    pub error_count: u64,
    /// EMA batch processing time, milliseconds.
    pub avg_processing_ms: f64,
    pub last_batch_size: usize,
    pub last_batch_at: Option<Instant>,
    pub rate_limit_hits: u64,
    pub total_processed: u64,
}

impl BatchMetrics {
    fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            return 1.0;
        }
        self.success_count as f64 / total as f64
    }
}

/// Process-load inputs folded into sizing decisions.
#[derive(Debug, Clone, Default)]
struct LoadState {
    /// EMA per-message latency, milliseconds.
    latency_per_message_ms: f64,
    queue_depth: usize,
    active_operations: usize,
}

struct TunerState {
    current_batch_size: usize,
    channels: HashMap<ChannelId, BatchMetrics>,
    load: LoadState,
}

/// Recommends bulk-delete batch sizes from live feedback.
pub struct BatchTuner {
    config: BatchConfig,
    state: RwLock<TunerState>,
}

impl BatchTuner {
    pub fn new(config: BatchConfig) -> Self {
        let initial = config
            .initial_batch_size
            .clamp(config.min_batch_size, config.max_batch_size);
        Self {
            config,
            state: RwLock::new(TunerState {
                current_batch_size: initial,
                channels: HashMap::new(),
                load: LoadState::default(),
            }),
        }
    }

    /// Batch size for the next bulk delete in a channel.
    ///
    /// Always within `[min, max]` and never above `pending`.
    pub async fn optimal_batch_size(&self, channel: &ChannelId, pending: Option<usize>) -> usize {
        let mut state = self.state.write().await;
        let metrics = state.channels.get(channel).cloned().unwrap_or_default();
        let current = state.current_batch_size;

        let mut optimal = current as f64;

        // Errors shrink the batch.
        let success_rate = metrics.success_rate();
        if success_rate < self.config.target_success_rate {
            optimal = (optimal * (1.0 - self.config.adjustment_factor))
                .floor()
                .max(self.config.min_batch_size as f64);
        }

        // Fast batches grow it, slow batches shrink it.
        if metrics.avg_processing_ms > 0.0 {
            let time_ratio = self.config.target_batch_time_ms as f64 / metrics.avg_processing_ms;
            if time_ratio > 1.2 {
                optimal = (optimal * (1.0 + self.config.adjustment_factor * (time_ratio - 1.0)))
                    .ceil()
                    .min(self.config.max_batch_size as f64);
            } else if time_ratio < 0.8 {
                optimal = (optimal * time_ratio)
                    .floor()
                    .max(self.config.min_batch_size as f64);
            }
        }

        // Throttle pressure shrinks it proportionally.
        if metrics.rate_limit_hits > 0 {
            let pressure = metrics.rate_limit_hits as f64 / metrics.total_processed.max(1) as f64;
            if pressure > THROTTLE_PRESSURE_FLOOR {
                optimal = (optimal * (1.0 - pressure))
                    .floor()
                    .max(self.config.min_batch_size as f64);
            }
        }

        optimal = self.shed_load(&state.load, optimal);

        if let Some(pending) = pending {
            if pending < optimal as usize {
                optimal = pending as f64;
            }
        }

        // Smooth against the previous size so one bad batch does not
        // crater the next one.
        let smoothed = (current as f64 * (1.0 - self.config.smoothing_factor)
            + optimal * self.config.smoothing_factor)
            .round() as usize;

        let mut size = smoothed.clamp(self.config.min_batch_size, self.config.max_batch_size);
        if let Some(pending) = pending {
            size = size.min(pending);
        }

        if size.abs_diff(current) > 10 {
            info!(
                channel = %channel,
                from = current,
                to = size,
                success_rate = format!("{:.1}%", success_rate * 100.0),
                avg_ms = metrics.avg_processing_ms as u64,
                "batch size adjusted"
            );
        }

        if size >= self.config.min_batch_size {
            state.current_batch_size = size;
        }
        size
    }

    /// Record the outcome of one bulk-delete batch.
    pub async fn record_batch(
        &self,
        channel: &ChannelId,
        batch_size: usize,
        elapsed: Duration,
        success: bool,
        throttled: bool,
    ) {
        let mut state = self.state.write().await;
        let smoothing = self.config.smoothing_factor;
        let metrics = state.channels.entry(channel.clone()).or_default();

        metrics.total_processed += 1;
        if success {
            metrics.success_count += 1;
        } else {
            metrics.error_count += 1;
        }
        if throttled {
            metrics.rate_limit_hits += 1;
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        if metrics.avg_processing_ms == 0.0 {
            metrics.avg_processing_ms = elapsed_ms;
        } else {
            metrics.avg_processing_ms =
                metrics.avg_processing_ms * (1.0 - smoothing) + elapsed_ms * smoothing;
        }

        metrics.last_batch_size = batch_size;
        metrics.last_batch_at = Some(Instant::now());

        // Per-message latency feeds the load model.
        let per_message = elapsed_ms / batch_size.max(1) as f64;
        if state.load.latency_per_message_ms == 0.0 {
            state.load.latency_per_message_ms = per_message;
        } else {
            state.load.latency_per_message_ms =
                state.load.latency_per_message_ms * 0.7 + per_message * 0.3;
        }
    }

    /// Update process-load inputs (gate queue depth, live buckets).
    pub async fn record_load(&self, queue_depth: usize, active_operations: usize) {
        let mut state = self.state.write().await;
        state.load.queue_depth = queue_depth;
        state.load.active_operations = active_operations;
    }

    /// Current global batch size.
    pub async fn current_batch_size(&self) -> usize {
        self.state.read().await.current_batch_size
    }

    /// Metrics for one channel, if any batches ran there.
    pub async fn channel_metrics(&self, channel: &ChannelId) -> Option<BatchMetrics> {
        self.state.read().await.channels.get(channel).cloned()
    }

    /// Forget one channel's history (e.g. its purge restarted).
    pub async fn reset_channel(&self, channel: &ChannelId) {
        self.state.write().await.channels.remove(channel);
    }

    fn shed_load(&self, load: &LoadState, base: f64) -> f64 {
        let mut adjusted = base;

        if load.queue_depth > QUEUE_DEPTH_FLOOR {
            let pressure = (load.queue_depth as f64 / 500.0).min(1.0);
            adjusted = (adjusted * (1.0 - pressure * 0.5)).floor();
        }

        if load.active_operations > ACTIVE_OPS_FLOOR {
            let factor = (load.active_operations as f64 / 10.0).min(1.0);
            adjusted = (adjusted * (1.0 - factor * 0.3)).floor();
        }

        if load.latency_per_message_ms > LATENCY_FLOOR_MS {
            let factor = (load.latency_per_message_ms / 2_000.0).min(1.0);
            adjusted = (adjusted * (1.0 - factor * 0.4)).floor();
        }

        adjusted.max(self.config.min_batch_size as f64)
    }
}
