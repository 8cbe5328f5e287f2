//! Adaptive per-bucket request gate.
//!
//! All platform calls flow through [`RequestGate::execute`]. A single
//! drain task orders queued calls by priority, paces them against each
//! bucket's observed limit/remaining/reset state, honors global
//! throttle windows, and retries throttled calls with server-supplied
//! backoff. The drain task is the only writer of bucket state, so two
//! in-flight calls can never race on the same bucket's bookkeeping.

mod bucket;
pub mod forecast;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use crate::api::{ApiError, ApiResult, RateLimitInfo};
use crate::config::GateConfig;
use crate::models::BucketId;

pub use bucket::BucketState;
pub use forecast::{Forecaster, Prediction};

/// Default priority for history fetches and single deletes.
pub const PRIORITY_NORMAL: u8 = 0;
/// Elevated priority for bulk deletes.
pub const PRIORITY_BULK: u8 = 1;

/// Cumulative gate counters.
#[derive(Debug, Default)]
struct GateCounters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    throttle_hits: AtomicU64,
    queue_depth: AtomicUsize,
}

/// Snapshot of the gate's cumulative metrics.
#[derive(Debug, Clone)]
pub struct GateMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub throttle_hits: u64,
    pub queue_depth: usize,
}

/// Snapshot of one bucket's state.
#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_in: Option<Duration>,
    pub current_delay: Duration,
    pub avg_response_ms: f64,
    pub requests: u64,
}

/// A granted attempt: run the call, then report how it went.
struct Attempt {
    report_tx: oneshot::Sender<AttemptReport>,
}

enum AttemptReport {
    Success {
        elapsed: Duration,
        rate_limit: Option<RateLimitInfo>,
    },
    Throttled {
        retry_after: Option<Duration>,
        global: bool,
    },
    Failed,
}

struct Ticket {
    bucket: BucketId,
    priority: u8,
    seq: u64,
    permit_tx: mpsc::Sender<Attempt>,
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Ticket {}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    // Higher priority first; FIFO within a priority.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Serializes and paces outbound platform calls per logical bucket.
pub struct RequestGate {
    config: GateConfig,
    ticket_tx: mpsc::UnboundedSender<Ticket>,
    buckets: Arc<RwLock<HashMap<BucketId, BucketState>>>,
    counters: Arc<GateCounters>,
    forecaster: Arc<Forecaster>,
    seq: AtomicU64,
}

impl RequestGate {
    /// Create a gate and spawn its drain task.
    pub fn new(config: GateConfig, forecaster: Arc<Forecaster>) -> Self {
        let (ticket_tx, ticket_rx) = mpsc::unbounded_channel();
        let buckets = Arc::new(RwLock::new(HashMap::new()));
        let counters = Arc::new(GateCounters::default());

        let drain = DrainLoop {
            config: config.clone(),
            ticket_rx,
            queue: BinaryHeap::new(),
            buckets: buckets.clone(),
            counters: counters.clone(),
            forecaster: forecaster.clone(),
            global_until: None,
            retry_delay: config.retry_base_delay(),
        };
        tokio::spawn(drain.run());

        Self {
            config,
            ticket_tx,
            buckets,
            counters,
            forecaster,
            seq: AtomicU64::new(0),
        }
    }

    /// Queue a call for its bucket and return its eventual result.
    ///
    /// `call` is invoked once per attempt; throttled attempts are
    /// retried by the drain task up to the configured retry ceiling,
    /// after which the last throttle error is returned.
    pub async fn execute<T, F, Fut>(
        &self,
        bucket: &BucketId,
        priority: u8,
        mut call: F,
    ) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = ApiResult<T>> + Send,
        T: Send,
    {
        let (permit_tx, mut permit_rx) = mpsc::channel(1);
        let ticket = Ticket {
            bucket: bucket.clone(),
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            permit_tx,
        };
        self.counters.requests.fetch_add(1, AtomicOrdering::Relaxed);
        self.counters.queue_depth.fetch_add(1, AtomicOrdering::Relaxed);
        if self.ticket_tx.send(ticket).is_err() {
            self.counters.queue_depth.fetch_sub(1, AtomicOrdering::Relaxed);
            return Err(ApiError::Transport("request gate is shut down".to_string()));
        }

        let mut last_throttle = None;
        while let Some(attempt) = permit_rx.recv().await {
            let started = Instant::now();
            match call().await {
                Ok(response) => {
                    let _ = attempt.report_tx.send(AttemptReport::Success {
                        elapsed: started.elapsed(),
                        rate_limit: response.rate_limit.clone(),
                    });
                    self.counters.successes.fetch_add(1, AtomicOrdering::Relaxed);
                    return Ok(response.value);
                }
                Err(ApiError::RateLimited { retry_after, global }) => {
                    self.counters
                        .throttle_hits
                        .fetch_add(1, AtomicOrdering::Relaxed);
                    last_throttle = Some(ApiError::RateLimited { retry_after, global });
                    let _ = attempt
                        .report_tx
                        .send(AttemptReport::Throttled { retry_after, global });
                }
                Err(err) => {
                    let _ = attempt.report_tx.send(AttemptReport::Failed);
                    self.counters.failures.fetch_add(1, AtomicOrdering::Relaxed);
                    return Err(err);
                }
            }
        }

        // The drain task stopped granting attempts: retries exhausted.
        self.counters.failures.fetch_add(1, AtomicOrdering::Relaxed);
        Err(last_throttle
            .unwrap_or_else(|| ApiError::Transport("request gate is shut down".to_string())))
    }

    /// Cumulative request counters.
    pub fn metrics(&self) -> GateMetrics {
        GateMetrics {
            requests: self.counters.requests.load(AtomicOrdering::Relaxed),
            successes: self.counters.successes.load(AtomicOrdering::Relaxed),
            failures: self.counters.failures.load(AtomicOrdering::Relaxed),
            throttle_hits: self.counters.throttle_hits.load(AtomicOrdering::Relaxed),
            queue_depth: self.counters.queue_depth.load(AtomicOrdering::Relaxed),
        }
    }

    /// Calls queued or in flight right now.
    pub fn queue_depth(&self) -> usize {
        self.counters.queue_depth.load(AtomicOrdering::Relaxed)
    }

    /// Buckets the gate has learned about.
    pub async fn bucket_count(&self) -> usize {
        self.buckets.read().await.len()
    }

    /// Per-bucket state snapshots for observability.
    pub async fn bucket_snapshots(&self) -> HashMap<BucketId, BucketSnapshot> {
        let now = Instant::now();
        let buckets = self.buckets.read().await;
        buckets
            .iter()
            .map(|(id, state)| {
                (
                    id.clone(),
                    BucketSnapshot {
                        limit: state.limit,
                        remaining: state.remaining,
                        reset_in: state.reset_at.map(|r| r.saturating_duration_since(now)),
                        current_delay: state.current_delay,
                        avg_response_ms: state.avg_response_ms,
                        requests: state.requests,
                    },
                )
            })
            .collect()
    }

    /// The forecaster paired with this gate.
    pub fn forecaster(&self) -> &Arc<Forecaster> {
        &self.forecaster
    }

    /// Gate configuration.
    pub fn config(&self) -> &GateConfig {
        &self.config
    }
}

/// The single drain task: pops tickets in priority order and grants
/// attempts one at a time.
struct DrainLoop {
    config: GateConfig,
    ticket_rx: mpsc::UnboundedReceiver<Ticket>,
    queue: BinaryHeap<Ticket>,
    buckets: Arc<RwLock<HashMap<BucketId, BucketState>>>,
    counters: Arc<GateCounters>,
    forecaster: Arc<Forecaster>,
    global_until: Option<Instant>,
    retry_delay: Duration,
}

impl DrainLoop {
    async fn run(mut self) {
        loop {
            while let Ok(ticket) = self.ticket_rx.try_recv() {
                self.queue.push(ticket);
            }
            if self.queue.is_empty() {
                match self.ticket_rx.recv().await {
                    Some(ticket) => {
                        self.queue.push(ticket);
                        continue;
                    }
                    None => break,
                }
            }
            if let Some(ticket) = self.queue.pop() {
                self.process(ticket).await;
                self.counters.queue_depth.fetch_sub(1, AtomicOrdering::Relaxed);
            }
        }
    }

    async fn process(&mut self, ticket: Ticket) {
        let mut throttled_attempts: u32 = 0;

        loop {
            // (a) Global throttle window pauses every bucket.
            if let Some(until) = self.global_until {
                let now = Instant::now();
                if until > now {
                    warn!(wait_ms = (until - now).as_millis() as u64, "global throttle window");
                    tokio::time::sleep(until - now).await;
                }
                self.global_until = None;
            }

            // (b) Bucket budget exhausted: wait for its reset.
            let now = Instant::now();
            let (window_wait, pacing_wait) = {
                let buckets = self.buckets.read().await;
                match buckets.get(&ticket.bucket) {
                    Some(state) => (state.window_wait(now), state.pacing_wait(now)),
                    None => (Duration::ZERO, Duration::ZERO),
                }
            };
            if window_wait > Duration::ZERO {
                debug!(
                    bucket = %ticket.bucket,
                    wait_ms = window_wait.as_millis() as u64,
                    "bucket exhausted, waiting for reset"
                );
                tokio::time::sleep(window_wait).await;
            }

            // (c) Forecaster veto: slow down before the platform does.
            let preemptive = self.forecaster.preemptive_delay(&ticket.bucket).await;
            if preemptive > Duration::ZERO {
                tokio::time::sleep(preemptive).await;
            }

            // (d) Adaptive inter-request pacing.
            if pacing_wait > Duration::ZERO {
                tokio::time::sleep(pacing_wait).await;
            }

            {
                let mut buckets = self.buckets.write().await;
                let state = buckets
                    .entry(ticket.bucket.clone())
                    .or_insert_with(|| BucketState::new(self.config.base_delay()));
                state.last_dispatch = Some(Instant::now());
            }

            let (report_tx, report_rx) = oneshot::channel();
            if ticket.permit_tx.send(Attempt { report_tx }).await.is_err() {
                // Caller gave up (dropped, timed out).
                return;
            }

            match report_rx.await {
                Ok(AttemptReport::Success { elapsed, rate_limit }) => {
                    self.retry_delay = self.config.retry_base_delay();
                    {
                        let mut buckets = self.buckets.write().await;
                        let state = buckets
                            .entry(ticket.bucket.clone())
                            .or_insert_with(|| BucketState::new(self.config.base_delay()));
                        state.observe(rate_limit.as_ref(), elapsed, &self.config);
                    }
                    self.forecaster
                        .record_request(&ticket.bucket, elapsed, rate_limit.as_ref())
                        .await;
                    return;
                }
                Ok(AttemptReport::Throttled { retry_after, global }) => {
                    throttled_attempts += 1;
                    let wait = retry_after.unwrap_or(self.retry_delay);
                    self.retry_delay =
                        (self.retry_delay * 2).min(self.config.retry_max_delay());

                    if global {
                        self.global_until = Some(Instant::now() + wait);
                    }

                    if throttled_attempts > self.config.max_retries {
                        warn!(
                            bucket = %ticket.bucket,
                            attempts = throttled_attempts,
                            "throttle retries exhausted"
                        );
                        // Dropping the permit sender ends the caller's
                        // attempt loop with the last throttle error.
                        return;
                    }

                    warn!(
                        bucket = %ticket.bucket,
                        wait_ms = wait.as_millis() as u64,
                        attempt = throttled_attempts,
                        max = self.config.max_retries,
                        global,
                        "rate limited, retrying"
                    );
                    if !global {
                        tokio::time::sleep(wait).await;
                    }
                }
                Ok(AttemptReport::Failed) | Err(_) => return,
            }
        }
    }
}
