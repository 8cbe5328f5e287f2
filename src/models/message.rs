//! Message records and the injected content predicate.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ChannelId, MessageId, UserId};

/// A message as seen by the purge pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Platform-generated message (join notices, pins, boosts).
    pub system: bool,
}

impl Message {
    /// Whether the message is young enough for the platform's batched
    /// delete endpoint.
    pub fn is_bulk_eligible(&self, now: DateTime<Utc>, age_ceiling: Duration) -> bool {
        now.signed_duration_since(self.created_at) < age_ceiling
    }
}

/// A pre-built content filter injected by the caller.
///
/// Construction (substring/regex/case handling) happens outside the
/// engine; the pipeline only ever asks whether a message matches.
pub trait ContentPredicate: Send + Sync {
    fn matches(&self, message: &Message) -> bool;
}
