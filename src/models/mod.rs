//! Data models for the purge engine.

mod channel;
mod ids;
mod message;
mod purge;

pub use channel::{ChannelInfo, ChannelKind, ThreadArchiveState};
pub use ids::{BucketId, ChannelId, GuildId, MessageId, OperationId, RoleId, UserId};
pub use message::{ContentPredicate, Message};
pub use purge::{ChannelReport, ProgressUpdate, PurgeOptions, PurgeResult, SelectionRule};
