//! Channel and thread records.

use serde::{Deserialize, Serialize};

use super::ids::{ChannelId, GuildId};

/// Channel kinds the pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    Text,
    Voice,
    Category,
    Announcement,
    Forum,
    AnnouncementThread,
    PublicThread,
    PrivateThread,
}

impl ChannelKind {
    pub fn is_thread(&self) -> bool {
        matches!(
            self,
            ChannelKind::AnnouncementThread | ChannelKind::PublicThread | ChannelKind::PrivateThread
        )
    }

    /// Channels whose history can be purged. Voice channels carry text
    /// chat on this platform; categories do not.
    pub fn is_text_capable(&self) -> bool {
        matches!(
            self,
            ChannelKind::Text
                | ChannelKind::Voice
                | ChannelKind::Announcement
                | ChannelKind::Forum
        ) || self.is_thread()
    }

    /// Kinds that can own threads.
    pub fn has_threads(&self) -> bool {
        matches!(self, ChannelKind::Text | ChannelKind::Announcement)
    }
}

/// A resolved channel or thread handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub name: String,
    pub kind: ChannelKind,
    pub parent_id: Option<ChannelId>,
    /// Thread archive flag; always false for plain channels.
    #[serde(default)]
    pub archived: bool,
    /// Thread lock flag; always false for plain channels.
    #[serde(default)]
    pub locked: bool,
}

impl ChannelInfo {
    pub fn is_archived_thread(&self) -> bool {
        self.kind.is_thread() && self.archived
    }
}

/// Thread archive/lock flags captured before a purge touches an
/// archived thread, so they can be restored afterward.
#[derive(Debug, Clone, Copy)]
pub struct ThreadArchiveState {
    pub was_archived: bool,
    pub was_locked: bool,
}

impl ThreadArchiveState {
    pub fn capture(thread: &ChannelInfo) -> Self {
        Self {
            was_archived: thread.archived,
            was_locked: thread.locked,
        }
    }
}
