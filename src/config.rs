//! Configuration for the purge engine.
//!
//! Every heuristic the components use (delays, thresholds, boosts,
//! worker counts) is a field here with the production default, so
//! deployments can tune behavior from a TOML file without code changes.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Platform maximum for one bulk-delete call.
pub const BULK_DELETE_LIMIT: usize = 100;

/// Platform maximum for one history page.
pub const FETCH_LIMIT: usize = 100;

/// Request gate tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Baseline inter-request delay per bucket, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling for the adaptive inter-request delay.
    pub max_delay_ms: u64,
    /// First retry delay when a throttle response carries no retry-after.
    pub retry_base_delay_ms: u64,
    /// Ceiling for the doubling retry backoff.
    pub retry_max_delay_ms: u64,
    /// Retries after the first throttled attempt before giving up.
    pub max_retries: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            max_retries: 3,
        }
    }
}

impl GateConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

/// Forecaster tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Rolling request-history size across all buckets.
    pub history_size: usize,
    /// Lookahead window for limit predictions, in milliseconds.
    pub prediction_window_ms: u64,
    /// Fraction of a bucket's capacity the forecaster budgets against.
    pub safety_margin: f64,
    /// Minimum confidence before a prediction produces a delay.
    pub confidence_gate: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            history_size: 1_000,
            prediction_window_ms: 60_000,
            safety_margin: 0.8,
            confidence_gate: 0.7,
        }
    }
}

impl ForecastConfig {
    pub fn prediction_window(&self) -> Duration {
        Duration::from_millis(self.prediction_window_ms)
    }
}

/// Batch tuner tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub min_batch_size: usize,
    /// Never above the platform bulk-delete limit.
    pub max_batch_size: usize,
    /// Initial batch size before any metrics exist.
    pub initial_batch_size: usize,
    /// Success rate below which batches shrink.
    pub target_success_rate: f64,
    /// Target wall time for one batch, in milliseconds.
    pub target_batch_time_ms: u64,
    /// How aggressively size adjusts toward targets.
    pub adjustment_factor: f64,
    /// EMA weight for smoothing size changes and timing averages.
    pub smoothing_factor: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 10,
            max_batch_size: BULK_DELETE_LIMIT,
            initial_batch_size: 50,
            target_success_rate: 0.95,
            target_batch_time_ms: 1_000,
            adjustment_factor: 0.2,
            smoothing_factor: 0.3,
        }
    }
}

/// Channel worker pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Logical workers draining the channel queue.
    pub max_workers: usize,
    /// Hard ceiling for runtime worker adjustments.
    pub worker_ceiling: usize,
    /// Retries per channel task after the first failure.
    pub max_retries: u32,
    /// Per-channel processing budget, in milliseconds.
    pub task_timeout_ms: u64,
    /// Minimum channel count before the pool beats sequential purging.
    pub parallel_threshold: usize,
    /// Baseline task priority.
    pub priority_base: i32,
    /// Boost for channel kinds expected to purge quickly.
    pub priority_fast_boost: i32,
    /// Priority drop applied on each retry.
    pub retry_demotion: i32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            worker_ceiling: 10,
            max_retries: 2,
            task_timeout_ms: 300_000,
            parallel_threshold: 3,
            priority_base: 100,
            priority_fast_boost: 20,
            retry_demotion: 10,
        }
    }
}

impl PoolConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

/// Message pipeline tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// History page size.
    pub fetch_limit: usize,
    /// Platform age ceiling for batched deletion, in days.
    pub bulk_age_ceiling_days: i64,
    /// Emit a progress event every N individual deletions.
    pub progress_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_limit: FETCH_LIMIT,
            bulk_age_ceiling_days: 14,
            progress_interval: 10,
        }
    }
}

impl PipelineConfig {
    pub fn bulk_age_ceiling(&self) -> chrono::Duration {
        chrono::Duration::days(self.bulk_age_ceiling_days)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeConfig {
    pub gate: GateConfig,
    pub forecast: ForecastConfig,
    pub batch: BatchConfig,
    pub pool: PoolConfig,
    pub pipeline: PipelineConfig,
}

impl PurgeConfig {
    /// Load configuration from a TOML file.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PurgeConfig::default();
        assert_eq!(config.gate.base_delay_ms, 100);
        assert_eq!(config.batch.max_batch_size, BULK_DELETE_LIMIT);
        assert_eq!(config.pool.max_workers, 3);
        assert_eq!(config.pipeline.bulk_age_ceiling_days, 14);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pool]\nmax_workers = 5\n\n[batch]\nmin_batch_size = 20"
        )
        .unwrap();

        let config = PurgeConfig::from_path(file.path()).unwrap();
        assert_eq!(config.pool.max_workers, 5);
        assert_eq!(config.batch.min_batch_size, 20);
        // Untouched sections keep their defaults.
        assert_eq!(config.gate.max_retries, 3);
    }
}
