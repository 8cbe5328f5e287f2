//! Per-channel message discovery and deletion.
//!
//! Pages backward through channel history applying the selection rule
//! and content predicate, then deletes matches: a bulk path for recent
//! messages and a singleton path for old ones and archived threads.
//! Every network call flows through the request gate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{ApiError, Directory, MessageTransport, ThreadSet};
use crate::config::{PipelineConfig, BULK_DELETE_LIMIT};
use crate::models::{
    BucketId, ChannelId, ChannelInfo, ChannelKind, ChannelReport, GuildId, Message, MessageId,
    OperationId, ProgressUpdate, PurgeOptions, SelectionRule, ThreadArchiveState, UserId,
};
use crate::rate_limit::{RequestGate, PRIORITY_BULK, PRIORITY_NORMAL};
use crate::services::batch::BatchTuner;
use crate::services::ledger::OperationLedger;

/// Member-lookup state reused across one channel scan.
#[derive(Default)]
struct RuleContext {
    /// Current guild members, prefetched for the departed-members rule.
    members: Option<HashSet<UserId>>,
    /// Per-author role-membership verdicts for the role rule.
    role_cache: HashMap<UserId, bool>,
}

/// Fetches and deletes messages for one channel at a time.
#[derive(Clone)]
pub struct MessageService {
    transport: Arc<dyn MessageTransport>,
    directory: Arc<dyn Directory>,
    gate: Arc<RequestGate>,
    tuner: Arc<BatchTuner>,
    ledger: Arc<OperationLedger>,
    config: PipelineConfig,
}

impl MessageService {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        directory: Arc<dyn Directory>,
        gate: Arc<RequestGate>,
        tuner: Arc<BatchTuner>,
        ledger: Arc<OperationLedger>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            transport,
            directory,
            gate,
            tuner,
            ledger,
            config,
        }
    }

    /// Purge one channel end-to-end: discover matches, delete them,
    /// report progress. Forum channels expand to their threads.
    pub async fn purge_channel(
        &self,
        channel: &ChannelInfo,
        options: &PurgeOptions,
        guild: &GuildId,
        operation: &OperationId,
        progress: &mpsc::Sender<ProgressUpdate>,
    ) -> anyhow::Result<ChannelReport> {
        let mut report = ChannelReport::new(channel);

        let _ = progress
            .send(ProgressUpdate::ChannelStart {
                channel_name: channel.name.clone(),
            })
            .await;

        let deleted = if channel.kind == ChannelKind::Forum {
            self.purge_forum(channel, options, guild, operation, progress)
                .await?
        } else {
            let matches = self
                .collect_matching(channel, options, guild, operation)
                .await?;
            self.delete_messages(channel, matches, operation, progress)
                .await?
        };

        report.deleted = deleted;
        let _ = progress
            .send(ProgressUpdate::ChannelComplete {
                channel_name: channel.name.clone(),
                deleted,
            })
            .await;

        Ok(report)
    }

    /// A forum is purged thread by thread, active ones first.
    async fn purge_forum(
        &self,
        forum: &ChannelInfo,
        options: &PurgeOptions,
        guild: &GuildId,
        operation: &OperationId,
        progress: &mpsc::Sender<ProgressUpdate>,
    ) -> anyhow::Result<u64> {
        let mut threads = self.list_threads(&forum.id, ThreadSet::Active).await?;
        threads.extend(self.list_threads(&forum.id, ThreadSet::ArchivedPublic).await?);

        let mut total = 0u64;
        for thread in threads {
            if self.ledger.is_cancelled(operation).await {
                break;
            }
            let matches = self
                .collect_matching(&thread, options, guild, operation)
                .await?;
            total += self
                .delete_messages(&thread, matches, operation, progress)
                .await?;
        }
        Ok(total)
    }

    /// Page backward through history collecting messages that match the
    /// selection rule and content predicate. Stops at exhaustion,
    /// cancellation, or the day cutoff.
    pub async fn collect_matching(
        &self,
        channel: &ChannelInfo,
        options: &PurgeOptions,
        guild: &GuildId,
        operation: &OperationId,
    ) -> anyhow::Result<Vec<Message>> {
        let cutoff = options
            .days
            .map(|days| Utc::now() - chrono::Duration::days(days as i64));
        let mut context = self.prepare_rule_context(guild, &options.rule).await?;

        let mut collected = Vec::new();
        let mut before: Option<MessageId> = None;
        let bucket = BucketId::for_fetch(&channel.id);

        loop {
            if self.ledger.is_cancelled(operation).await {
                break;
            }

            let page = {
                let transport = self.transport.clone();
                let channel_id = channel.id.clone();
                let before = before.clone();
                let limit = self.config.fetch_limit;
                self.gate
                    .execute(&bucket, PRIORITY_NORMAL, move || {
                        let transport = transport.clone();
                        let channel_id = channel_id.clone();
                        let before = before.clone();
                        async move { transport.fetch_page(&channel_id, limit, before.as_ref()).await }
                    })
                    .await
                    .with_context(|| format!("fetching history in {}", channel.name))?
            };

            if page.is_empty() {
                break;
            }

            for message in &page {
                if options.exclude_message_id.as_ref() == Some(&message.id) {
                    continue;
                }
                if let Some(cutoff) = cutoff {
                    if message.created_at < cutoff {
                        continue;
                    }
                }
                if !self
                    .rule_matches(guild, &options.rule, message, &mut context)
                    .await
                {
                    continue;
                }
                if let Some(filter) = &options.content_filter {
                    if !filter.matches(message) {
                        continue;
                    }
                }
                collected.push(message.clone());
            }

            // Pages are newest-first; once the oldest entry crosses the
            // cutoff there is nothing further back worth fetching.
            let last = page.last().cloned();
            match last {
                Some(last) => {
                    if let Some(cutoff) = cutoff {
                        if last.created_at < cutoff {
                            break;
                        }
                    }
                    before = Some(last.id);
                }
                None => break,
            }
        }

        debug!(
            channel = %channel.name,
            matched = collected.len(),
            "history scan complete"
        );
        Ok(collected)
    }

    /// Delete a channel's matches: bulk path for recent messages,
    /// singleton path for old ones and archived threads.
    pub async fn delete_messages(
        &self,
        channel: &ChannelInfo,
        messages: Vec<Message>,
        operation: &OperationId,
        progress: &mpsc::Sender<ProgressUpdate>,
    ) -> anyhow::Result<u64> {
        if messages.is_empty() {
            return Ok(0);
        }

        let total = messages.len() as u64;
        let now = Utc::now();
        let ceiling = self.config.bulk_age_ceiling();

        // Archived threads reject bulk deletion outright.
        let (bulk, individual): (Vec<Message>, Vec<Message>) = if channel.is_archived_thread() {
            (Vec::new(), messages)
        } else {
            messages
                .into_iter()
                .partition(|m| m.is_bulk_eligible(now, ceiling))
        };

        let mut deleted = 0u64;

        if !bulk.is_empty() && !self.ledger.is_cancelled(operation).await {
            deleted += self.bulk_delete(channel, &bulk, operation).await?;
        }

        if !individual.is_empty() && !self.ledger.is_cancelled(operation).await {
            deleted += self
                .individual_delete(
                    channel,
                    &individual,
                    operation,
                    Some(ProgressContext {
                        sink: progress,
                        channel_name: &channel.name,
                        offset: deleted,
                        total,
                    }),
                )
                .await?;
        }

        Ok(deleted)
    }

    async fn bulk_delete(
        &self,
        channel: &ChannelInfo,
        messages: &[Message],
        operation: &OperationId,
    ) -> anyhow::Result<u64> {
        // Give the tuner a view of current gate load before sizing.
        self.tuner
            .record_load(self.gate.queue_depth(), self.gate.bucket_count().await)
            .await;

        let bucket = BucketId::for_delete(&channel.id);
        let mut deleted = 0u64;
        let mut index = 0;

        while index < messages.len() {
            if self.ledger.is_cancelled(operation).await {
                debug!(channel = %channel.name, deleted, "bulk delete cancelled");
                break;
            }

            let pending = messages.len() - index;
            let size = self
                .tuner
                .optimal_batch_size(&channel.id, Some(pending))
                .await
                .clamp(1, BULK_DELETE_LIMIT)
                .min(pending);
            let chunk = &messages[index..index + size];
            let ids: Vec<MessageId> = chunk.iter().map(|m| m.id.clone()).collect();

            let started = Instant::now();
            let mut throttled = false;
            let result = {
                let transport = self.transport.clone();
                let channel_id = channel.id.clone();
                let ids = ids.clone();
                self.gate
                    .execute(&bucket, PRIORITY_BULK, move || {
                        let transport = transport.clone();
                        let channel_id = channel_id.clone();
                        let ids = ids.clone();
                        async move { transport.bulk_delete(&channel_id, &ids).await }
                    })
                    .await
            };

            let success = match result {
                Ok(count) => {
                    deleted += count;
                    self.ledger.add_deleted(operation, count).await;
                    true
                }
                Err(err) => {
                    throttled = err.is_throttle();
                    warn!(
                        channel = %channel.name,
                        batch = chunk.len(),
                        error = %err,
                        "bulk delete failed, falling back to individual deletion"
                    );
                    deleted += self.individual_delete(channel, chunk, operation, None).await?;
                    false
                }
            };

            self.tuner
                .record_batch(&channel.id, chunk.len(), started.elapsed(), success, throttled)
                .await;

            index += chunk.len();
        }

        Ok(deleted)
    }

    async fn individual_delete(
        &self,
        channel: &ChannelInfo,
        messages: &[Message],
        operation: &OperationId,
        progress: Option<ProgressContext<'_>>,
    ) -> anyhow::Result<u64> {
        // Archived threads must be woken before their messages can be
        // deleted, and put back afterward.
        let thread_state = if channel.is_archived_thread() {
            let state = ThreadArchiveState::capture(channel);
            self.set_archived(channel, false)
                .await
                .with_context(|| format!("unable to unarchive thread {}", channel.name))?;
            Some(state)
        } else {
            None
        };

        let bucket = BucketId::for_delete(&channel.id);
        let mut deleted = 0u64;

        for (position, message) in messages.iter().enumerate() {
            if self.ledger.is_cancelled(operation).await {
                break;
            }

            let result = {
                let transport = self.transport.clone();
                let channel_id = channel.id.clone();
                let message_id = message.id.clone();
                self.gate
                    .execute(&bucket, PRIORITY_NORMAL, move || {
                        let transport = transport.clone();
                        let channel_id = channel_id.clone();
                        let message_id = message_id.clone();
                        async move { transport.delete_message(&channel_id, &message_id).await }
                    })
                    .await
            };

            match result {
                Ok(()) => {
                    deleted += 1;
                    self.ledger.add_deleted(operation, 1).await;
                    if let Some(ctx) = &progress {
                        if (position as u64 + 1) % self.config.progress_interval.max(1) == 0 {
                            ctx.report(deleted).await;
                        }
                    }
                }
                Err(ApiError::UnknownMessage) => {
                    debug!(message = %message.id, "message already gone");
                }
                Err(ApiError::ThreadArchived) => {
                    warn!(
                        channel = %channel.name,
                        "thread became archived during deletion, stopping"
                    );
                    break;
                }
                Err(err) => {
                    warn!(message = %message.id, error = %err, "failed to delete message");
                }
            }
        }

        if deleted > 0 {
            if let Some(ctx) = &progress {
                ctx.report(deleted).await;
            }
        }

        if let Some(state) = thread_state {
            if state.was_archived {
                if let Err(err) = self.set_archived(channel, true).await {
                    warn!(
                        channel = %channel.name,
                        error = %err,
                        "failed to re-archive thread after purge"
                    );
                }
            }
        }

        Ok(deleted)
    }

    async fn set_archived(&self, channel: &ChannelInfo, archived: bool) -> Result<(), ApiError> {
        let bucket = BucketId::for_channel(&channel.id);
        let transport = self.transport.clone();
        let channel_id = channel.id.clone();
        self.gate
            .execute(&bucket, PRIORITY_NORMAL, move || {
                let transport = transport.clone();
                let channel_id = channel_id.clone();
                async move { transport.set_archived(&channel_id, archived).await }
            })
            .await
    }

    /// Threads of a channel, through the gate.
    pub async fn list_threads(
        &self,
        channel: &ChannelId,
        set: ThreadSet,
    ) -> Result<Vec<ChannelInfo>, ApiError> {
        let bucket = BucketId::for_channel(channel);
        let directory = self.directory.clone();
        let channel = channel.clone();
        self.gate
            .execute(&bucket, PRIORITY_NORMAL, move || {
                let directory = directory.clone();
                let channel = channel.clone();
                async move { directory.list_threads(&channel, set).await }
            })
            .await
    }

    async fn prepare_rule_context(
        &self,
        guild: &GuildId,
        rule: &SelectionRule,
    ) -> anyhow::Result<RuleContext> {
        let mut context = RuleContext::default();

        // The departed-members rule needs the full current roster; an
        // incomplete roster would select messages from live members.
        if matches!(rule, SelectionRule::DepartedMembers) {
            let bucket = BucketId::for_guild(guild);
            let directory = self.directory.clone();
            let guild = guild.clone();
            let members = self
                .gate
                .execute(&bucket, PRIORITY_NORMAL, move || {
                    let directory = directory.clone();
                    let guild = guild.clone();
                    async move { directory.list_members(&guild).await }
                })
                .await
                .context("listing guild members")?;
            context.members = Some(members.into_iter().collect());
        }

        Ok(context)
    }

    async fn rule_matches(
        &self,
        guild: &GuildId,
        rule: &SelectionRule,
        message: &Message,
        context: &mut RuleContext,
    ) -> bool {
        match rule {
            SelectionRule::Author(user) => &message.author_id == user,
            SelectionRule::Everyone => !message.system,
            SelectionRule::Role(role) => {
                if message.system {
                    return false;
                }
                if let Some(&has_role) = context.role_cache.get(&message.author_id) {
                    return has_role;
                }
                let bucket = BucketId::for_guild(guild);
                let directory = self.directory.clone();
                let guild = guild.clone();
                let author = message.author_id.clone();
                let has_role = match self
                    .gate
                    .execute(&bucket, PRIORITY_NORMAL, move || {
                        let directory = directory.clone();
                        let guild = guild.clone();
                        let author = author.clone();
                        async move { directory.member_roles(&guild, &author).await }
                    })
                    .await
                {
                    Ok(roles) => roles.contains(role),
                    Err(err) => {
                        // Departed author or lookup failure: not a
                        // current role holder.
                        debug!(user = %message.author_id, error = %err, "member lookup failed");
                        false
                    }
                };
                context.role_cache.insert(message.author_id.clone(), has_role);
                has_role
            }
            SelectionRule::DepartedMembers => {
                if message.system {
                    return false;
                }
                match &context.members {
                    Some(members) => !members.contains(&message.author_id),
                    None => false,
                }
            }
        }
    }
}

/// Progress reporting state for one channel's individual-delete phase.
struct ProgressContext<'a> {
    sink: &'a mpsc::Sender<ProgressUpdate>,
    channel_name: &'a str,
    /// Messages already deleted through the bulk path.
    offset: u64,
    total: u64,
}

impl ProgressContext<'_> {
    async fn report(&self, deleted: u64) {
        let _ = self
            .sink
            .send(ProgressUpdate::ChannelProgress {
                channel_name: self.channel_name.to_string(),
                current: self.offset + deleted,
                total: self.total,
            })
            .await;
    }
}
