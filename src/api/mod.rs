//! Capability boundary to the chat platform.
//!
//! The engine never talks to the platform directly; it consumes these
//! traits. Production uses the [`crate::rest`] adapter, tests plug in
//! in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ChannelId, ChannelInfo, GuildId, Message, MessageId, RoleId, UserId};

/// Result type for platform calls.
pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

/// Rate-limit metadata carried on a successful response.
///
/// Fields are optional because not every endpoint reports them; the
/// gate only learns what the platform tells it.
#[derive(Debug, Clone, Default)]
pub struct RateLimitInfo {
    /// Declared bucket capacity.
    pub limit: Option<u32>,
    /// Requests left in the current window.
    pub remaining: Option<u32>,
    /// Time until the window resets.
    pub reset_after: Option<Duration>,
}

/// A successful platform response plus any rate-limit metadata.
#[derive(Debug)]
pub struct ApiResponse<T> {
    pub value: T,
    pub rate_limit: Option<RateLimitInfo>,
}

impl<T> ApiResponse<T> {
    /// A response without rate-limit metadata.
    pub fn bare(value: T) -> Self {
        Self {
            value,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(value: T, info: RateLimitInfo) -> Self {
        Self {
            value,
            rate_limit: Some(info),
        }
    }
}

/// Errors from the platform boundary.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Throttling response. `global` pauses every bucket, not just the
    /// one that was hit.
    #[error("rate limited (retry after {retry_after:?}, global: {global})")]
    RateLimited {
        retry_after: Option<Duration>,
        global: bool,
    },

    /// The message is already gone.
    #[error("unknown message")]
    UnknownMessage,

    #[error("unknown channel")]
    UnknownChannel,

    /// Missing permission for the resource.
    #[error("missing access")]
    MissingAccess,

    /// The thread archived underneath an in-flight operation.
    #[error("thread is archived")]
    ThreadArchived,

    /// Connection-level failure (DNS, TLS, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other platform error.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl ApiError {
    pub fn is_throttle(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. })
    }
}

/// Which slice of a channel's threads to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSet {
    Active,
    ArchivedPublic,
    ArchivedPrivate,
}

/// Channel/guild directory lookups.
///
/// Eventually consistent and rate limited; every call is routed through
/// the request gate by the pipeline.
#[async_trait]
pub trait Directory: Send + Sync {
    /// All channels in a guild, categories included.
    async fn list_channels(&self, guild: &GuildId) -> ApiResult<Vec<ChannelInfo>>;

    async fn fetch_channel(&self, channel: &ChannelId) -> ApiResult<ChannelInfo>;

    /// Current member ids of a guild.
    async fn list_members(&self, guild: &GuildId) -> ApiResult<Vec<UserId>>;

    /// Role ids held by a member; `UnknownMessage`-style absence maps to
    /// `MissingAccess` or an empty list depending on the platform.
    async fn member_roles(&self, guild: &GuildId, user: &UserId) -> ApiResult<Vec<RoleId>>;

    /// Threads of a channel, one archived/active slice at a time.
    async fn list_threads(&self, channel: &ChannelId, set: ThreadSet)
        -> ApiResult<Vec<ChannelInfo>>;
}

/// Message history and deletion endpoints.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// One page of history, newest first, strictly before the cursor.
    async fn fetch_page(
        &self,
        channel: &ChannelId,
        limit: usize,
        before: Option<&MessageId>,
    ) -> ApiResult<Vec<Message>>;

    /// Batched delete; returns how many ids were removed.
    async fn bulk_delete(&self, channel: &ChannelId, ids: &[MessageId]) -> ApiResult<u64>;

    async fn delete_message(&self, channel: &ChannelId, id: &MessageId) -> ApiResult<()>;

    /// Archive or unarchive a thread.
    async fn set_archived(&self, thread: &ChannelId, archived: bool) -> ApiResult<()>;
}
