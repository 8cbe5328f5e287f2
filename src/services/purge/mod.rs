//! Purge orchestration.
//!
//! [`PurgeEngine`] wires the gate, forecaster, tuner, ledger, and
//! message pipeline together and exposes the single entry point:
//! resolve the target scope to channels, purge them sequentially or
//! through the worker pool, and finalize the operation on every exit
//! path.

mod messages;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{ApiError, Directory, MessageTransport, ThreadSet};
use crate::config::PurgeConfig;
use crate::models::{
    BucketId, ChannelId, ChannelInfo, ChannelKind, ChannelReport, GuildId, OperationId,
    ProgressUpdate, PurgeOptions, PurgeResult,
};
use crate::rate_limit::{Forecaster, RequestGate, PRIORITY_NORMAL};
use crate::services::batch::BatchTuner;
use crate::services::ledger::{LedgerError, OperationLedger};
use crate::services::pool::{ChannelWorkerPool, PoolEvent};

pub use messages::MessageService;

/// Failures that abort a purge before (or instead of) any deletion.
#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("guild {0} already has an active purge operation")]
    GuildBusy(GuildId),

    #[error("target channel or category not found")]
    TargetNotFound,

    #[error("target is not a text channel, category, or thread")]
    InvalidTarget,

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// The purge engine: all components, explicitly constructed and wired.
pub struct PurgeEngine {
    config: PurgeConfig,
    directory: Arc<dyn Directory>,
    gate: Arc<RequestGate>,
    tuner: Arc<BatchTuner>,
    ledger: Arc<OperationLedger>,
    messages: MessageService,
}

impl PurgeEngine {
    /// Build an engine over the given platform capabilities.
    pub fn new(
        directory: Arc<dyn Directory>,
        transport: Arc<dyn MessageTransport>,
        config: PurgeConfig,
    ) -> Self {
        let forecaster = Arc::new(Forecaster::new(config.forecast.clone()));
        let gate = Arc::new(RequestGate::new(config.gate.clone(), forecaster));
        let tuner = Arc::new(BatchTuner::new(config.batch.clone()));
        let ledger = Arc::new(OperationLedger::new());
        let messages = MessageService::new(
            transport,
            directory.clone(),
            gate.clone(),
            tuner.clone(),
            ledger.clone(),
            config.pipeline.clone(),
        );

        Self {
            config,
            directory,
            gate,
            tuner,
            ledger,
            messages,
        }
    }

    /// The operation ledger: the control surface for lock, cancel, and
    /// progress queries.
    pub fn ledger(&self) -> &Arc<OperationLedger> {
        &self.ledger
    }

    /// The request gate, for metrics.
    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }

    /// The batch tuner, for metrics.
    pub fn batch_tuner(&self) -> &BatchTuner {
        &self.tuner
    }

    /// Create an operation for a guild, enforcing one live purge per
    /// guild.
    pub async fn begin(&self, guild: &GuildId) -> Result<OperationId, PurgeError> {
        self.ledger.begin(guild).await.map_err(|err| match err {
            LedgerError::GuildBusy(guild) => PurgeError::GuildBusy(guild),
        })
    }

    /// Run a purge to completion.
    ///
    /// The operation is finalized (removed from the ledger, guild lock
    /// released) on every exit path, including scope-resolution
    /// failures and cancellation.
    pub async fn purge(
        &self,
        guild: &GuildId,
        options: PurgeOptions,
        operation_id: &OperationId,
        progress: mpsc::Sender<ProgressUpdate>,
    ) -> Result<PurgeResult, PurgeError> {
        let started = Instant::now();
        let outcome = self
            .execute_purge(guild, &options, operation_id, &progress)
            .await;
        self.ledger.complete(operation_id).await;

        outcome.map(|mut result| {
            result.duration = started.elapsed();
            result
        })
    }

    async fn execute_purge(
        &self,
        guild: &GuildId,
        options: &PurgeOptions,
        operation_id: &OperationId,
        progress: &mpsc::Sender<ProgressUpdate>,
    ) -> Result<PurgeResult, PurgeError> {
        let (channels, narrow_target) = self.resolve_scope(guild, options).await?;
        let mut result = PurgeResult::empty();

        if channels.is_empty() {
            return Ok(result);
        }

        // Parallelism only pays off across enough channels, and never
        // for a single-channel target.
        let use_pool =
            channels.len() >= self.config.pool.parallel_threshold && !narrow_target;
        debug!(
            channels = channels.len(),
            parallel = use_pool,
            operation = %operation_id,
            "purge scope resolved"
        );

        if use_pool {
            self.purge_parallel(guild, channels, options, operation_id, progress, &mut result)
                .await;
        } else {
            self.purge_sequential(guild, channels, options, operation_id, progress, &mut result)
                .await;
        }

        if self.ledger.is_cancelled(operation_id).await {
            result.success = false;
            result.errors.push("operation was cancelled".to_string());
        }

        result.total_deleted = result.channels.iter().map(|c| c.deleted).sum();
        Ok(result)
    }

    async fn purge_sequential(
        &self,
        guild: &GuildId,
        channels: Vec<ChannelInfo>,
        options: &PurgeOptions,
        operation_id: &OperationId,
        progress: &mpsc::Sender<ProgressUpdate>,
        result: &mut PurgeResult,
    ) {
        for channel in channels {
            if self.ledger.is_cancelled(operation_id).await {
                break;
            }

            match self
                .messages
                .purge_channel(&channel, options, guild, operation_id, progress)
                .await
            {
                Ok(report) => result.channels.push(report),
                Err(err) => {
                    warn!(channel = %channel.name, error = %err, "channel purge failed");
                    result.errors.push(format!("{}: {}", channel.name, err));
                    let mut report = ChannelReport::new(&channel);
                    report.error = Some(err.to_string());
                    result.channels.push(report);
                }
            }
        }
    }

    async fn purge_parallel(
        &self,
        guild: &GuildId,
        channels: Vec<ChannelInfo>,
        options: &PurgeOptions,
        operation_id: &OperationId,
        progress: &mpsc::Sender<ProgressUpdate>,
        result: &mut PurgeResult,
    ) {
        let pool = ChannelWorkerPool::new(self.config.pool.clone(), self.ledger.clone());
        pool.add_channels(channels, options, operation_id).await;

        let (event_tx, mut event_rx) = mpsc::channel(64);

        let messages = self.messages.clone();
        let guild = guild.clone();
        let progress = progress.clone();
        let process = move |channel: ChannelInfo, options: PurgeOptions, op: OperationId| {
            let messages = messages.clone();
            let guild = guild.clone();
            let progress = progress.clone();
            async move {
                messages
                    .purge_channel(&channel, &options, &guild, &op, &progress)
                    .await
            }
        };

        let drain_events = async {
            let mut reports = Vec::new();
            let mut errors = Vec::new();
            while let Some(event) = event_rx.recv().await {
                match event {
                    PoolEvent::ChannelComplete { report, .. } => reports.push(report),
                    PoolEvent::ChannelFailed {
                        channel_id,
                        channel_name,
                        error,
                        ..
                    } => {
                        errors.push(format!("{}: {}", channel_name, error));
                        reports.push(ChannelReport {
                            channel_id,
                            channel_name,
                            deleted: 0,
                            error: Some(error),
                        });
                    }
                }
            }
            (reports, errors)
        };

        let (_metrics, (reports, errors)) = tokio::join!(pool.run(process, event_tx), drain_events);
        result.channels = reports;
        result.errors = errors;
    }

    /// Expand the target id into a concrete channel list.
    ///
    /// Returns the channels plus whether the target was a single
    /// channel (which disables the worker pool).
    async fn resolve_scope(
        &self,
        guild: &GuildId,
        options: &PurgeOptions,
    ) -> Result<(Vec<ChannelInfo>, bool), PurgeError> {
        let skip = &options.skip_channels;
        let mut narrow_target = false;

        let mut channels: Vec<ChannelInfo> = if options.target_id == guild.as_str() {
            self.list_guild_channels(guild)
                .await?
                .into_iter()
                .filter(|c| {
                    c.kind.is_text_capable() && !c.kind.is_thread() && !skip.contains(&c.id)
                })
                .collect()
        } else {
            let target_id = ChannelId::from(options.target_id.as_str());
            let target = match self.fetch_channel(&target_id).await {
                Ok(target) => target,
                Err(ApiError::UnknownChannel) => return Err(PurgeError::TargetNotFound),
                Err(err) => return Err(PurgeError::Api(err)),
            };

            match target.kind {
                ChannelKind::Category => self
                    .list_guild_channels(guild)
                    .await?
                    .into_iter()
                    .filter(|c| {
                        c.parent_id.as_ref() == Some(&target.id)
                            && c.kind.is_text_capable()
                            && !skip.contains(&c.id)
                    })
                    .collect(),
                kind if kind.is_text_capable() => {
                    narrow_target = true;
                    vec![target]
                }
                _ => return Err(PurgeError::InvalidTarget),
            }
        };

        if options.include_threads {
            let threads = self.collect_threads(&channels).await;
            channels.extend(threads);
        }

        Ok((channels, narrow_target))
    }

    /// Active plus archived threads for every thread-capable channel in
    /// the list. Private archives are best-effort: listing them needs a
    /// permission the bot may not hold.
    async fn collect_threads(&self, channels: &[ChannelInfo]) -> Vec<ChannelInfo> {
        let mut threads = Vec::new();

        for channel in channels {
            if !channel.kind.has_threads() {
                continue;
            }

            for set in [
                ThreadSet::Active,
                ThreadSet::ArchivedPublic,
                ThreadSet::ArchivedPrivate,
            ] {
                match self.messages.list_threads(&channel.id, set).await {
                    Ok(found) => threads.extend(found),
                    Err(ApiError::MissingAccess) if set == ThreadSet::ArchivedPrivate => {
                        debug!(
                            channel = %channel.name,
                            "no access to private archived threads"
                        );
                    }
                    Err(err) => {
                        warn!(
                            channel = %channel.name,
                            error = %err,
                            "failed to list threads"
                        );
                    }
                }
            }
        }

        threads
    }

    async fn list_guild_channels(&self, guild: &GuildId) -> Result<Vec<ChannelInfo>, PurgeError> {
        let bucket = BucketId::for_guild(guild);
        let directory = self.directory.clone();
        let guild = guild.clone();
        self.gate
            .execute(&bucket, PRIORITY_NORMAL, move || {
                let directory = directory.clone();
                let guild = guild.clone();
                async move { directory.list_channels(&guild).await }
            })
            .await
            .map_err(PurgeError::Api)
    }

    async fn fetch_channel(&self, channel: &ChannelId) -> Result<ChannelInfo, ApiError> {
        let bucket = BucketId::for_channel(channel);
        let directory = self.directory.clone();
        let channel = channel.clone();
        self.gate
            .execute(&bucket, PRIORITY_NORMAL, move || {
                let directory = directory.clone();
                let channel = channel.clone();
                async move { directory.fetch_channel(&channel).await }
            })
            .await
    }
}
