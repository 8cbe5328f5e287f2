//! Identifier newtypes for platform snowflakes.
//!
//! Every keyed store in the crate (bucket states, batch metrics, guild
//! locks) is keyed by one of these concrete types rather than a bare
//! string.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

snowflake_id! {
    /// A guild (server) id.
    GuildId
}

snowflake_id! {
    /// A channel or thread id.
    ChannelId
}

snowflake_id! {
    /// A message id.
    MessageId
}

snowflake_id! {
    /// A user id.
    UserId
}

snowflake_id! {
    /// A role id.
    RoleId
}

/// A logical rate-limit bucket id.
///
/// Calls sharing a bucket share one remote rate-limit counter, so the
/// gate serializes them behind a single pacing state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(pub String);

impl BucketId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Bucket for history fetches in a channel.
    pub fn for_fetch(channel: &ChannelId) -> Self {
        Self(format!("fetch_{}", channel))
    }

    /// Bucket for deletions in a channel (bulk and single share it).
    pub fn for_delete(channel: &ChannelId) -> Self {
        Self(format!("delete_{}", channel))
    }

    /// Bucket for guild-level directory lookups.
    pub fn for_guild(guild: &GuildId) -> Self {
        Self(format!("guild_{}", guild))
    }

    /// Bucket for channel-level operations (thread listing, archive
    /// toggles).
    pub fn for_channel(channel: &ChannelId) -> Self {
        Self(format!("channel_{}", channel))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One purge invocation's id: the owning guild plus creation millis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    /// Mint a fresh id for a guild.
    pub fn generate(guild: &GuildId) -> Self {
        Self(format!("{}-{}", guild, Utc::now().timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
