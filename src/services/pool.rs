//! Parallel channel processor.
//!
//! Holds a priority queue of per-channel purge tasks and drains it with
//! a bounded number of logical workers. Each task is processed
//! end-to-end under a timeout; failures are retried with demoted
//! priority until the retry budget runs out, then recorded as
//! permanently failed.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::config::PoolConfig;
use crate::models::{ChannelId, ChannelInfo, ChannelKind, ChannelReport, OperationId, PurgeOptions};

use super::ledger::OperationLedger;

/// Poll interval for an idle worker while siblings may still requeue.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// One unit of pool work: a channel plus everything needed to purge it.
#[derive(Debug, Clone)]
pub struct ChannelTask {
    pub channel: ChannelInfo,
    pub options: PurgeOptions,
    pub operation_id: OperationId,
    pub priority: i32,
    pub retry_count: u32,
    seq: u64,
}

impl PartialEq for ChannelTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ChannelTask {}

impl PartialOrd for ChannelTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelTask {
    // Higher priority first; FIFO within a priority.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Worker notifications emitted while the pool drains.
#[derive(Debug)]
pub enum PoolEvent {
    ChannelComplete {
        worker_id: usize,
        elapsed: Duration,
        report: ChannelReport,
    },
    ChannelFailed {
        worker_id: usize,
        channel_id: ChannelId,
        channel_name: String,
        error: String,
    },
}

#[derive(Debug, Default)]
struct WorkerStatus {
    busy: AtomicBool,
    processed: AtomicUsize,
    errors: AtomicUsize,
}

/// Snapshot of pool progress.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub total_channels: usize,
    pub processed_channels: usize,
    pub failed_channels: usize,
    pub queue_size: usize,
    pub active_workers: usize,
    pub workers: Vec<WorkerSnapshot>,
}

#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub busy: bool,
    pub processed: usize,
    pub errors: usize,
}

/// Bounded-concurrency processor for per-channel purge tasks.
pub struct ChannelWorkerPool {
    config: PoolConfig,
    ledger: Arc<OperationLedger>,
    queue: Mutex<BinaryHeap<ChannelTask>>,
    seq: AtomicU64,
    stopped: AtomicBool,
    max_workers: AtomicUsize,
    total_channels: AtomicUsize,
    processed_channels: AtomicUsize,
    workers: Vec<WorkerStatus>,
    failed: Mutex<HashMap<ChannelId, String>>,
}

impl ChannelWorkerPool {
    pub fn new(config: PoolConfig, ledger: Arc<OperationLedger>) -> Self {
        let ceiling = config.worker_ceiling.max(1);
        let max_workers = config.max_workers.clamp(1, ceiling);
        let workers = (0..ceiling).map(|_| WorkerStatus::default()).collect();
        Self {
            config,
            ledger,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            max_workers: AtomicUsize::new(max_workers),
            total_channels: AtomicUsize::new(0),
            processed_channels: AtomicUsize::new(0),
            workers,
            failed: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue channels for an operation, highest priority first.
    pub async fn add_channels(
        &self,
        channels: Vec<ChannelInfo>,
        options: &PurgeOptions,
        operation_id: &OperationId,
    ) {
        let mut queue = self.queue.lock().await;
        self.total_channels
            .fetch_add(channels.len(), AtomicOrdering::Relaxed);
        for channel in channels {
            let priority = self.priority_for(&channel.kind);
            queue.push(ChannelTask {
                channel,
                options: options.clone(),
                operation_id: operation_id.clone(),
                priority,
                retry_count: 0,
                seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            });
        }
    }

    /// Drain the queue with up to N logical workers, emitting events as
    /// channels finish. Returns once the queue is empty and every
    /// worker is idle.
    pub async fn run<F, Fut>(&self, process: F, events: mpsc::Sender<PoolEvent>) -> PoolMetrics
    where
        F: Fn(ChannelInfo, PurgeOptions, OperationId) -> Fut,
        Fut: Future<Output = anyhow::Result<ChannelReport>>,
    {
        let queued = self.queue.lock().await.len();
        let worker_count = self
            .max_workers
            .load(AtomicOrdering::Relaxed)
            .min(queued.max(1));

        debug!(workers = worker_count, queued, "worker pool starting");

        let loops = (0..worker_count).map(|worker_id| self.worker_loop(worker_id, &process, &events));
        join_all(loops).await;

        self.metrics().await
    }

    /// Abort: drop all queued work. Busy workers finish their current
    /// task and then stop.
    pub async fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::Relaxed);
        self.queue.lock().await.clear();
    }

    /// Adjust the logical worker count for subsequent runs, clamped to
    /// the configured ceiling.
    pub fn set_max_workers(&self, count: usize) {
        let clamped = count.clamp(1, self.config.worker_ceiling.max(1));
        self.max_workers.store(clamped, AtomicOrdering::Relaxed);
    }

    /// Channels that exhausted their retries, with their final errors.
    pub async fn failed_channels(&self) -> HashMap<ChannelId, String> {
        self.failed.lock().await.clone()
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let workers: Vec<WorkerSnapshot> = self
            .workers
            .iter()
            .enumerate()
            .take(self.max_workers.load(AtomicOrdering::Relaxed))
            .map(|(id, status)| WorkerSnapshot {
                id,
                busy: status.busy.load(AtomicOrdering::Relaxed),
                processed: status.processed.load(AtomicOrdering::Relaxed),
                errors: status.errors.load(AtomicOrdering::Relaxed),
            })
            .collect();
        let active_workers = workers.iter().filter(|w| w.busy).count();

        PoolMetrics {
            total_channels: self.total_channels.load(AtomicOrdering::Relaxed),
            processed_channels: self.processed_channels.load(AtomicOrdering::Relaxed),
            failed_channels: self.failed.lock().await.len(),
            queue_size: self.queue.lock().await.len(),
            active_workers,
            workers,
        }
    }

    async fn worker_loop<F, Fut>(
        &self,
        worker_id: usize,
        process: &F,
        events: &mpsc::Sender<PoolEvent>,
    ) where
        F: Fn(ChannelInfo, PurgeOptions, OperationId) -> Fut,
        Fut: Future<Output = anyhow::Result<ChannelReport>>,
    {
        loop {
            if self.stopped.load(AtomicOrdering::Relaxed) {
                return;
            }

            let task = { self.queue.lock().await.pop() };
            let task = match task {
                Some(task) => task,
                None => {
                    // A busy sibling may still requeue a retry.
                    if self.any_worker_busy() {
                        tokio::time::sleep(IDLE_POLL).await;
                        continue;
                    }
                    return;
                }
            };

            // Cancelled operations shed their remaining tasks silently.
            if self.ledger.is_cancelled(&task.operation_id).await {
                debug!(channel = %task.channel.name, "skipping task for cancelled operation");
                continue;
            }

            let status = &self.workers[worker_id];
            status.busy.store(true, AtomicOrdering::Relaxed);
            let started = Instant::now();

            let outcome = match tokio::time::timeout(
                self.config.task_timeout(),
                process(
                    task.channel.clone(),
                    task.options.clone(),
                    task.operation_id.clone(),
                ),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow!(
                    "channel {} processing timed out after {:?}",
                    task.channel.name,
                    self.config.task_timeout()
                )),
            };

            match outcome {
                Ok(report) => {
                    status.processed.fetch_add(1, AtomicOrdering::Relaxed);
                    self.processed_channels.fetch_add(1, AtomicOrdering::Relaxed);
                    let _ = events
                        .send(PoolEvent::ChannelComplete {
                            worker_id,
                            elapsed: started.elapsed(),
                            report,
                        })
                        .await;
                }
                Err(err) => {
                    status.errors.fetch_add(1, AtomicOrdering::Relaxed);
                    self.handle_failure(worker_id, task, err, events).await;
                }
            }

            status.busy.store(false, AtomicOrdering::Relaxed);
        }
    }

    async fn handle_failure(
        &self,
        worker_id: usize,
        mut task: ChannelTask,
        err: anyhow::Error,
        events: &mpsc::Sender<PoolEvent>,
    ) {
        if task.retry_count < self.config.max_retries {
            task.retry_count += 1;
            task.priority -= self.config.retry_demotion;
            warn!(
                worker = worker_id,
                channel = %task.channel.name,
                retry = task.retry_count,
                max = self.config.max_retries,
                error = %err,
                "channel task failed, requeueing"
            );
            self.queue.lock().await.push(task);
            return;
        }

        error!(
            worker = worker_id,
            channel = %task.channel.name,
            retries = task.retry_count,
            error = %err,
            "channel task failed permanently"
        );
        self.failed
            .lock()
            .await
            .insert(task.channel.id.clone(), err.to_string());
        let _ = events
            .send(PoolEvent::ChannelFailed {
                worker_id,
                channel_id: task.channel.id,
                channel_name: task.channel.name,
                error: err.to_string(),
            })
            .await;
    }

    fn any_worker_busy(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.busy.load(AtomicOrdering::Relaxed))
    }

    // Fast-looking channel kinds jump the queue: quick wins first.
    fn priority_for(&self, kind: &ChannelKind) -> i32 {
        let mut priority = self.config.priority_base;
        if matches!(kind, ChannelKind::Announcement) || kind.is_thread() {
            priority += self.config.priority_fast_boost;
        }
        priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GuildId;
    use std::sync::atomic::AtomicU32;

    fn channel(id: &str, name: &str) -> ChannelInfo {
        ChannelInfo {
            id: ChannelId::from(id),
            guild_id: GuildId::from("g"),
            name: name.to_string(),
            kind: ChannelKind::Text,
            parent_id: None,
            archived: false,
            locked: false,
        }
    }

    fn pool_config() -> PoolConfig {
        PoolConfig {
            max_workers: 2,
            max_retries: 2,
            task_timeout_ms: 1_000,
            ..PoolConfig::default()
        }
    }

    async fn begin(ledger: &OperationLedger) -> OperationId {
        ledger.begin(&GuildId::from("g")).await.unwrap()
    }

    #[tokio::test]
    async fn test_failing_channel_lands_in_failed_set() {
        let ledger = Arc::new(OperationLedger::new());
        let op = begin(&ledger).await;
        let pool = ChannelWorkerPool::new(pool_config(), ledger);

        let channels = vec![channel("1", "alpha"), channel("2", "beta"), channel("3", "gamma")];
        pool.add_channels(channels, &PurgeOptions::everyone("g"), &op)
            .await;

        let attempts_on_beta = Arc::new(AtomicU32::new(0));
        let counter = attempts_on_beta.clone();
        let (tx, mut rx) = mpsc::channel(16);

        let metrics = pool
            .run(
                move |channel, _options, _op| {
                    let counter = counter.clone();
                    async move {
                        if channel.name == "beta" {
                            counter.fetch_add(1, AtomicOrdering::SeqCst);
                            Err(anyhow!("permission denied"))
                        } else {
                            Ok(ChannelReport::new(&channel))
                        }
                    }
                },
                tx,
            )
            .await;

        // First attempt plus max_retries retries.
        assert_eq!(attempts_on_beta.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(metrics.processed_channels, 2);
        assert_eq!(metrics.failed_channels, 1);

        let failed = pool.failed_channels().await;
        assert!(failed.contains_key(&ChannelId::from("2")));

        let mut completed = 0;
        let mut failed_events = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                PoolEvent::ChannelComplete { .. } => completed += 1,
                PoolEvent::ChannelFailed { channel_name, .. } => {
                    assert_eq!(channel_name, "beta");
                    failed_events += 1;
                }
            }
        }
        assert_eq!(completed, 2);
        assert_eq!(failed_events, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retryable_failure() {
        let ledger = Arc::new(OperationLedger::new());
        let op = begin(&ledger).await;
        let pool = ChannelWorkerPool::new(
            PoolConfig {
                max_workers: 1,
                max_retries: 1,
                task_timeout_ms: 50,
                ..PoolConfig::default()
            },
            ledger,
        );

        pool.add_channels(vec![channel("1", "slow")], &PurgeOptions::everyone("g"), &op)
            .await;

        let (tx, mut rx) = mpsc::channel(4);
        let metrics = pool
            .run(
                |channel, _options, _op| async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(ChannelReport::new(&channel))
                },
                tx,
            )
            .await;

        assert_eq!(metrics.failed_channels, 1);
        match rx.try_recv().unwrap() {
            PoolEvent::ChannelFailed { error, .. } => {
                assert!(error.contains("timed out"));
            }
            other => panic!("expected failure event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_operation_sheds_queue() {
        let ledger = Arc::new(OperationLedger::new());
        let op = begin(&ledger).await;
        ledger.cancel(&op).await;

        let pool = ChannelWorkerPool::new(pool_config(), ledger);
        pool.add_channels(
            vec![channel("1", "alpha"), channel("2", "beta")],
            &PurgeOptions::everyone("g"),
            &op,
        )
        .await;

        let processed = Arc::new(AtomicU32::new(0));
        let counter = processed.clone();
        let (tx, _rx) = mpsc::channel(4);
        pool.run(
            move |channel, _options, _op| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(ChannelReport::new(&channel))
                }
            },
            tx,
        )
        .await;

        assert_eq!(processed.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_priority_orders_queue() {
        let config = PoolConfig::default();
        let base = config.priority_base;
        let boost = config.priority_fast_boost;

        let ledger = Arc::new(OperationLedger::new());
        let pool = ChannelWorkerPool::new(config, ledger.clone());
        let op = begin(&ledger).await;

        let mut thread = channel("2", "thread");
        thread.kind = ChannelKind::PublicThread;
        pool.add_channels(
            vec![channel("1", "text"), thread],
            &PurgeOptions::everyone("g"),
            &op,
        )
        .await;

        let mut queue = pool.queue.lock().await;
        let first = queue.pop().unwrap();
        assert_eq!(first.channel.name, "thread");
        assert_eq!(first.priority, base + boost);
        assert_eq!(queue.pop().unwrap().priority, base);
    }
}
