//! Wire payloads for the platform API.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::{ChannelId, ChannelInfo, ChannelKind, GuildId, Message, MessageId, UserId};

/// Channel kind discriminants on the wire.
mod kinds {
    pub const TEXT: u8 = 0;
    pub const VOICE: u8 = 2;
    pub const CATEGORY: u8 = 4;
    pub const ANNOUNCEMENT: u8 = 5;
    pub const ANNOUNCEMENT_THREAD: u8 = 10;
    pub const PUBLIC_THREAD: u8 = 11;
    pub const PRIVATE_THREAD: u8 = 12;
    pub const FORUM: u8 = 15;
}

#[derive(Debug, Deserialize)]
pub struct ChannelPayload {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub thread_metadata: Option<ThreadMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct ThreadMetadata {
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub locked: bool,
}

impl ChannelPayload {
    pub fn into_info(self, guild: &GuildId) -> ChannelInfo {
        let kind = match self.kind {
            kinds::TEXT => ChannelKind::Text,
            kinds::VOICE => ChannelKind::Voice,
            kinds::CATEGORY => ChannelKind::Category,
            kinds::ANNOUNCEMENT => ChannelKind::Announcement,
            kinds::ANNOUNCEMENT_THREAD => ChannelKind::AnnouncementThread,
            kinds::PUBLIC_THREAD => ChannelKind::PublicThread,
            kinds::PRIVATE_THREAD => ChannelKind::PrivateThread,
            kinds::FORUM => ChannelKind::Forum,
            // Unknown kinds are treated as plain text channels; the
            // pipeline's filters decide whether to touch them.
            _ => ChannelKind::Text,
        };

        let guild_id = self
            .guild_id
            .map(GuildId::from)
            .unwrap_or_else(|| guild.clone());

        ChannelInfo {
            id: ChannelId::from(self.id),
            guild_id,
            name: self.name.unwrap_or_default(),
            kind,
            parent_id: self.parent_id.map(ChannelId::from),
            archived: self
                .thread_metadata
                .as_ref()
                .map(|m| m.archived)
                .unwrap_or(false),
            locked: self
                .thread_metadata
                .as_ref()
                .map(|m| m.locked)
                .unwrap_or(false),
        }
    }
}

/// Thread listings arrive wrapped, not as a bare array.
#[derive(Debug, Deserialize)]
pub struct ThreadListPayload {
    #[serde(default)]
    pub threads: Vec<ChannelPayload>,
}

#[derive(Debug, Deserialize)]
pub struct MessagePayload {
    pub id: String,
    pub author: AuthorPayload,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: u8,
}

#[derive(Debug, Deserialize)]
pub struct AuthorPayload {
    pub id: String,
}

/// Ordinary (0) and reply (19) messages are user content; everything
/// else is platform-generated.
const USER_MESSAGE_KINDS: [u8; 2] = [0, 19];

impl MessagePayload {
    pub fn into_message(self, channel: &ChannelId) -> Message {
        Message {
            id: MessageId::from(self.id),
            channel_id: channel.clone(),
            author_id: UserId::from(self.author.id),
            content: self.content,
            created_at: self.timestamp,
            system: !USER_MESSAGE_KINDS.contains(&self.kind),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MemberPayload {
    pub user: AuthorPayload,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub code: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub retry_after: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_payload_maps_thread_metadata() {
        let raw = r#"{
            "id": "111",
            "name": "old-thread",
            "type": 11,
            "parent_id": "222",
            "thread_metadata": { "archived": true, "locked": false }
        }"#;
        let payload: ChannelPayload = serde_json::from_str(raw).unwrap();
        let info = payload.into_info(&GuildId::from("g"));

        assert_eq!(info.kind, ChannelKind::PublicThread);
        assert!(info.archived);
        assert!(info.is_archived_thread());
        assert_eq!(info.parent_id, Some(ChannelId::from("222")));
    }

    #[test]
    fn test_message_payload_flags_system_messages() {
        let raw = r#"{
            "id": "1",
            "author": { "id": "2" },
            "content": "",
            "timestamp": "2024-05-01T12:00:00Z",
            "type": 7
        }"#;
        let payload: MessagePayload = serde_json::from_str(raw).unwrap();
        let message = payload.into_message(&ChannelId::from("c"));
        assert!(message.system);
    }
}
