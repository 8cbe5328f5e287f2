//! Purge invocation options, progress events, and terminal results.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::channel::ChannelInfo;
use super::ids::{ChannelId, MessageId, RoleId, UserId};
use super::message::ContentPredicate;

/// Which messages a purge selects.
#[derive(Debug, Clone)]
pub enum SelectionRule {
    /// Messages written by one user.
    Author(UserId),
    /// Messages written by current holders of a role.
    Role(RoleId),
    /// Every message.
    Everyone,
    /// Messages whose author is no longer a guild member.
    DepartedMembers,
}

/// Options for one purge invocation.
#[derive(Clone)]
pub struct PurgeOptions {
    /// Guild id (whole server), category id, or channel/thread id.
    pub target_id: String,
    pub rule: SelectionRule,
    /// Only messages younger than this many days; `None` means all.
    pub days: Option<u32>,
    /// Also purge each channel's active and archived threads.
    pub include_threads: bool,
    /// Channels excluded from scope expansion.
    pub skip_channels: Vec<ChannelId>,
    /// One message never deleted (the caller's own progress message).
    pub exclude_message_id: Option<MessageId>,
    /// Pre-built content filter; `None` matches everything.
    pub content_filter: Option<Arc<dyn ContentPredicate>>,
}

impl PurgeOptions {
    /// Options selecting every message under a target, no filters.
    pub fn everyone(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            rule: SelectionRule::Everyone,
            days: None,
            include_threads: false,
            skip_channels: Vec::new(),
            exclude_message_id: None,
            content_filter: None,
        }
    }

    /// Options selecting one author's messages under a target.
    pub fn by_author(target_id: impl Into<String>, author: UserId) -> Self {
        Self {
            rule: SelectionRule::Author(author),
            ..Self::everyone(target_id)
        }
    }
}

impl fmt::Debug for PurgeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PurgeOptions")
            .field("target_id", &self.target_id)
            .field("rule", &self.rule)
            .field("days", &self.days)
            .field("include_threads", &self.include_threads)
            .field("skip_channels", &self.skip_channels)
            .field("exclude_message_id", &self.exclude_message_id)
            .field("content_filter", &self.content_filter.is_some())
            .finish()
    }
}

/// Progress events delivered to the caller while a purge runs.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    ChannelStart {
        channel_name: String,
    },
    ChannelProgress {
        channel_name: String,
        current: u64,
        total: u64,
    },
    ChannelComplete {
        channel_name: String,
        deleted: u64,
    },
}

/// Per-channel outcome inside a purge result.
#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub deleted: u64,
    pub error: Option<String>,
}

impl ChannelReport {
    pub fn new(channel: &ChannelInfo) -> Self {
        Self {
            channel_id: channel.id.clone(),
            channel_name: channel.name.clone(),
            deleted: 0,
            error: None,
        }
    }
}

/// Terminal summary of a purge, built once at the end.
#[derive(Debug, Clone)]
pub struct PurgeResult {
    pub success: bool,
    pub total_deleted: u64,
    pub duration: Duration,
    pub errors: Vec<String>,
    pub channels: Vec<ChannelReport>,
}

impl PurgeResult {
    pub fn empty() -> Self {
        Self {
            success: true,
            total_deleted: 0,
            duration: Duration::ZERO,
            errors: Vec::new(),
            channels: Vec::new(),
        }
    }
}
