//! End-to-end purge scenarios against an in-memory platform.
//!
//! The mock implements the directory and transport capabilities with
//! call counters, so tests can assert not just outcomes but which
//! calls the engine did (and did not) issue.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;

use purgeling::api::{
    ApiError, ApiResponse, ApiResult, Directory, MessageTransport, ThreadSet,
};
use purgeling::config::{GateConfig, PoolConfig, PurgeConfig};
use purgeling::models::{
    ChannelId, ChannelInfo, ChannelKind, GuildId, Message, MessageId, OperationId, ProgressUpdate,
    PurgeOptions, RoleId, SelectionRule, UserId,
};
use purgeling::services::OperationLedger;
use purgeling::{PurgeEngine, PurgeError};

/// Trips a cancellation after N fetch calls, from inside the mock.
struct CancelHook {
    after_fetches: usize,
    ledger: Arc<OperationLedger>,
    operation: OperationId,
}

#[derive(Default)]
struct MockPlatform {
    channels: Mutex<HashMap<ChannelId, ChannelInfo>>,
    /// Per-channel history, newest first.
    messages: Mutex<HashMap<ChannelId, Vec<Message>>>,
    members: Mutex<HashSet<UserId>>,
    /// Channels whose history fetches fail with a permission error.
    failing_channels: Mutex<HashSet<ChannelId>>,
    fetch_calls: AtomicUsize,
    bulk_calls: AtomicUsize,
    single_calls: AtomicUsize,
    bulk_deleted_ids: Mutex<Vec<MessageId>>,
    archive_calls: Mutex<Vec<(ChannelId, bool)>>,
    cancel_hook: Mutex<Option<CancelHook>>,
}

impl MockPlatform {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add_channel(&self, channel: ChannelInfo) {
        self.channels
            .lock()
            .unwrap()
            .insert(channel.id.clone(), channel);
    }

    fn add_messages(&self, channel: &ChannelId, messages: Vec<Message>) {
        self.messages
            .lock()
            .unwrap()
            .entry(channel.clone())
            .or_default()
            .extend(messages);
    }

    fn fail_channel(&self, channel: &ChannelId) {
        self.failing_channels
            .lock()
            .unwrap()
            .insert(channel.clone());
    }

    fn remaining_messages(&self, channel: &ChannelId) -> usize {
        self.messages
            .lock()
            .unwrap()
            .get(channel)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Directory for MockPlatform {
    async fn list_channels(&self, _guild: &GuildId) -> ApiResult<Vec<ChannelInfo>> {
        let channels = self.channels.lock().unwrap();
        Ok(ApiResponse::bare(channels.values().cloned().collect()))
    }

    async fn fetch_channel(&self, channel: &ChannelId) -> ApiResult<ChannelInfo> {
        let channels = self.channels.lock().unwrap();
        channels
            .get(channel)
            .cloned()
            .map(ApiResponse::bare)
            .ok_or(ApiError::UnknownChannel)
    }

    async fn list_members(&self, _guild: &GuildId) -> ApiResult<Vec<UserId>> {
        let members = self.members.lock().unwrap();
        Ok(ApiResponse::bare(members.iter().cloned().collect()))
    }

    async fn member_roles(&self, _guild: &GuildId, _user: &UserId) -> ApiResult<Vec<RoleId>> {
        Ok(ApiResponse::bare(Vec::new()))
    }

    async fn list_threads(
        &self,
        _channel: &ChannelId,
        _set: ThreadSet,
    ) -> ApiResult<Vec<ChannelInfo>> {
        Ok(ApiResponse::bare(Vec::new()))
    }
}

#[async_trait]
impl MessageTransport for MockPlatform {
    async fn fetch_page(
        &self,
        channel: &ChannelId,
        limit: usize,
        before: Option<&MessageId>,
    ) -> ApiResult<Vec<Message>> {
        let calls = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let hook = {
            let mut slot = self.cancel_hook.lock().unwrap();
            let due = slot
                .as_ref()
                .map_or(false, |hook| calls >= hook.after_fetches);
            if due {
                slot.take()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook.ledger.cancel(&hook.operation).await;
        }

        if self.failing_channels.lock().unwrap().contains(channel) {
            return Err(ApiError::MissingAccess);
        }

        let messages = self.messages.lock().unwrap();
        let history = messages.get(channel).cloned().unwrap_or_default();
        let start = match before {
            Some(before) => history
                .iter()
                .position(|m| &m.id == before)
                .map(|i| i + 1)
                .unwrap_or(history.len()),
            None => 0,
        };
        let page: Vec<Message> = history.iter().skip(start).take(limit).cloned().collect();
        Ok(ApiResponse::bare(page))
    }

    async fn bulk_delete(&self, channel: &ChannelId, ids: &[MessageId]) -> ApiResult<u64> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);

        let mut messages = self.messages.lock().unwrap();
        let history = messages.entry(channel.clone()).or_default();
        let targets: HashSet<&MessageId> = ids.iter().collect();
        let before = history.len();
        history.retain(|m| !targets.contains(&m.id));
        let removed = (before - history.len()) as u64;

        self.bulk_deleted_ids
            .lock()
            .unwrap()
            .extend(ids.iter().cloned());
        Ok(ApiResponse::bare(removed))
    }

    async fn delete_message(&self, channel: &ChannelId, id: &MessageId) -> ApiResult<()> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);

        let mut messages = self.messages.lock().unwrap();
        let history = messages.entry(channel.clone()).or_default();
        let before = history.len();
        history.retain(|m| &m.id != id);
        if history.len() == before {
            return Err(ApiError::UnknownMessage);
        }
        Ok(ApiResponse::bare(()))
    }

    async fn set_archived(&self, thread: &ChannelId, archived: bool) -> ApiResult<()> {
        self.archive_calls
            .lock()
            .unwrap()
            .push((thread.clone(), archived));
        if let Some(info) = self.channels.lock().unwrap().get_mut(thread) {
            info.archived = archived;
        }
        Ok(ApiResponse::bare(()))
    }
}

fn guild() -> GuildId {
    GuildId::from("g1")
}

fn text_channel(id: &str, name: &str, parent: Option<&str>) -> ChannelInfo {
    ChannelInfo {
        id: ChannelId::from(id),
        guild_id: guild(),
        name: name.to_string(),
        kind: ChannelKind::Text,
        parent_id: parent.map(ChannelId::from),
        archived: false,
        locked: false,
    }
}

fn category(id: &str, name: &str) -> ChannelInfo {
    ChannelInfo {
        kind: ChannelKind::Category,
        ..text_channel(id, name, None)
    }
}

/// Messages newest first, minutes apart, all bulk-eligible.
fn young_messages(channel: &str, author: &str, count: usize, id_offset: usize) -> Vec<Message> {
    let now = Utc::now();
    (0..count)
        .map(|i| Message {
            id: MessageId::from(format!("m{}", id_offset + i).as_str()),
            channel_id: ChannelId::from(channel),
            author_id: UserId::from(author),
            content: format!("message {}", id_offset + i),
            created_at: now - ChronoDuration::minutes(i as i64),
            system: false,
        })
        .collect()
}

fn old_message(channel: &str, author: &str, id: &str, age_days: i64) -> Message {
    Message {
        id: MessageId::from(id),
        channel_id: ChannelId::from(channel),
        author_id: UserId::from(author),
        content: "old".to_string(),
        created_at: Utc::now() - ChronoDuration::days(age_days),
        system: false,
    }
}

fn fast_config() -> PurgeConfig {
    PurgeConfig {
        gate: GateConfig {
            base_delay_ms: 1,
            retry_base_delay_ms: 5,
            retry_max_delay_ms: 50,
            ..GateConfig::default()
        },
        ..PurgeConfig::default()
    }
}

fn engine(mock: &Arc<MockPlatform>, config: PurgeConfig) -> PurgeEngine {
    PurgeEngine::new(mock.clone(), mock.clone(), config)
}

fn progress() -> (mpsc::Sender<ProgressUpdate>, mpsc::Receiver<ProgressUpdate>) {
    mpsc::channel(1024)
}

#[tokio::test]
async fn single_channel_author_purge_deletes_all_matches_in_bulk() {
    let mock = MockPlatform::new();
    mock.add_channel(text_channel("c1", "general", None));
    mock.add_messages(&ChannelId::from("c1"), young_messages("c1", "alice", 250, 0));
    mock.add_messages(&ChannelId::from("c1"), young_messages("c1", "bob", 30, 250));

    let engine = engine(&mock, fast_config());
    let op = engine.begin(&guild()).await.unwrap();
    let (tx, mut rx) = progress();

    let options = PurgeOptions::by_author("c1", UserId::from("alice"));
    let result = engine.purge(&guild(), options, &op, tx).await.unwrap();

    assert!(result.success);
    assert_eq!(result.total_deleted, 250);
    assert_eq!(result.channels.len(), 1);
    assert_eq!(result.channels[0].deleted, 250);
    assert!(result.errors.is_empty());

    // Everything went through the bulk path, covering exactly the 250
    // matching ids; bob's messages survive.
    assert_eq!(mock.single_calls.load(Ordering::SeqCst), 0);
    assert!(mock.bulk_calls.load(Ordering::SeqCst) >= 3);
    let bulk_ids = mock.bulk_deleted_ids.lock().unwrap().clone();
    assert_eq!(bulk_ids.len(), 250);
    assert_eq!(mock.remaining_messages(&ChannelId::from("c1")), 30);

    // Progress bookends arrived.
    let mut saw_start = false;
    let mut saw_complete = false;
    while let Ok(update) = rx.try_recv() {
        match update {
            ProgressUpdate::ChannelStart { channel_name } => {
                assert_eq!(channel_name, "general");
                saw_start = true;
            }
            ProgressUpdate::ChannelComplete { deleted, .. } => {
                assert_eq!(deleted, 250);
                saw_complete = true;
            }
            ProgressUpdate::ChannelProgress { .. } => {}
        }
    }
    assert!(saw_start && saw_complete);

    // The guild lock is gone.
    assert!(!engine.ledger().is_guild_locked(&guild()).await);
}

#[tokio::test]
async fn category_purge_survives_one_failing_channel() {
    let mock = MockPlatform::new();
    mock.add_channel(category("cat", "archive"));
    mock.add_channel(text_channel("c1", "alpha", Some("cat")));
    mock.add_channel(text_channel("c2", "bravo", Some("cat")));
    mock.add_channel(text_channel("c3", "charlie", Some("cat")));
    mock.add_messages(&ChannelId::from("c1"), young_messages("c1", "alice", 20, 0));
    mock.add_messages(&ChannelId::from("c3"), young_messages("c3", "alice", 15, 100));
    mock.fail_channel(&ChannelId::from("c2"));

    let mut config = fast_config();
    config.pool = PoolConfig {
        max_workers: 2,
        max_retries: 2,
        ..PoolConfig::default()
    };

    let engine = engine(&mock, config);
    let op = engine.begin(&guild()).await.unwrap();
    let (tx, _rx) = progress();

    let result = engine
        .purge(&guild(), PurgeOptions::everyone("cat"), &op, tx)
        .await
        .unwrap();

    // The failing channel surfaces in the error list after exhausting
    // retries; its siblings still complete.
    assert_eq!(result.channels.len(), 3);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("bravo"));

    let failed: Vec<_> = result
        .channels
        .iter()
        .filter(|c| c.error.is_some())
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].channel_name, "bravo");

    assert_eq!(result.total_deleted, 35);
    assert_eq!(mock.remaining_messages(&ChannelId::from("c1")), 0);
    assert_eq!(mock.remaining_messages(&ChannelId::from("c3")), 0);

    assert!(!engine.ledger().is_guild_locked(&guild()).await);
}

#[tokio::test]
async fn cancellation_stops_transport_calls_at_next_checkpoint() {
    let mock = MockPlatform::new();
    mock.add_channel(text_channel("c1", "general", None));
    mock.add_messages(&ChannelId::from("c1"), young_messages("c1", "alice", 500, 0));

    let engine = engine(&mock, fast_config());
    let op = engine.begin(&guild()).await.unwrap();

    *mock.cancel_hook.lock().unwrap() = Some(CancelHook {
        after_fetches: 2,
        ledger: engine.ledger().clone(),
        operation: op.clone(),
    });

    let (tx, _rx) = progress();
    let result = engine
        .purge(&guild(), PurgeOptions::everyone("c1"), &op, tx)
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.contains("cancelled")));
    assert_eq!(result.total_deleted, 0);

    // The fetch loop observed the flag before its third page, and no
    // deletion was ever issued.
    assert_eq!(mock.fetch_calls.load(Ordering::SeqCst), 2);
    assert_eq!(mock.bulk_calls.load(Ordering::SeqCst), 0);
    assert_eq!(mock.single_calls.load(Ordering::SeqCst), 0);
    assert_eq!(mock.remaining_messages(&ChannelId::from("c1")), 500);

    assert!(!engine.ledger().is_guild_locked(&guild()).await);
}

#[tokio::test]
async fn second_purge_for_same_guild_is_rejected_while_first_is_live() {
    let mock = MockPlatform::new();
    let engine = engine(&mock, fast_config());

    let first = engine.begin(&guild()).await.unwrap();
    match engine.begin(&guild()).await {
        Err(PurgeError::GuildBusy(g)) => assert_eq!(g, guild()),
        other => panic!("expected GuildBusy, got {:?}", other.map(|id| id.to_string())),
    }

    // Another guild is free to start.
    engine.begin(&GuildId::from("g2")).await.unwrap();

    engine.ledger().complete(&first).await;
    engine.begin(&guild()).await.unwrap();
}

#[tokio::test]
async fn scope_resolution_failure_still_releases_the_guild_lock() {
    let mock = MockPlatform::new();
    let engine = engine(&mock, fast_config());
    let op = engine.begin(&guild()).await.unwrap();
    let (tx, _rx) = progress();

    let result = engine
        .purge(&guild(), PurgeOptions::everyone("no-such-channel"), &op, tx)
        .await;

    assert!(matches!(result, Err(PurgeError::TargetNotFound)));
    assert!(!engine.ledger().is_guild_locked(&guild()).await);
}

#[tokio::test]
async fn messages_straddling_age_ceiling_split_between_bulk_and_individual() {
    let mock = MockPlatform::new();
    mock.add_channel(text_channel("c1", "general", None));

    let channel = ChannelId::from("c1");
    mock.add_messages(&channel, young_messages("c1", "alice", 5, 0));
    mock.add_messages(
        &channel,
        vec![
            old_message("c1", "alice", "old1", 20),
            old_message("c1", "alice", "old2", 30),
            old_message("c1", "alice", "old3", 40),
        ],
    );

    let engine = engine(&mock, fast_config());
    let op = engine.begin(&guild()).await.unwrap();
    let (tx, _rx) = progress();

    let result = engine
        .purge(&guild(), PurgeOptions::everyone("c1"), &op, tx)
        .await
        .unwrap();

    assert_eq!(result.total_deleted, 8);

    // The partition at the 14-day ceiling is exact: young ids go to one
    // bulk call, old ids go one by one.
    let bulk_ids = mock.bulk_deleted_ids.lock().unwrap().clone();
    assert_eq!(bulk_ids.len(), 5);
    assert!(bulk_ids.iter().all(|id| id.as_str().starts_with('m')));
    assert_eq!(mock.single_calls.load(Ordering::SeqCst), 3);
    assert_eq!(mock.remaining_messages(&channel), 0);
}

#[tokio::test]
async fn archived_thread_is_unarchived_for_deletion_and_restored() {
    let mock = MockPlatform::new();
    let mut thread = text_channel("t1", "old-thread", Some("c1"));
    thread.kind = ChannelKind::PublicThread;
    thread.archived = true;
    mock.add_channel(thread);
    mock.add_messages(&ChannelId::from("t1"), young_messages("t1", "alice", 4, 0));

    let engine = engine(&mock, fast_config());
    let op = engine.begin(&guild()).await.unwrap();
    let (tx, _rx) = progress();

    let result = engine
        .purge(&guild(), PurgeOptions::everyone("t1"), &op, tx)
        .await
        .unwrap();

    assert_eq!(result.total_deleted, 4);

    // Archived threads take the individual path even for young
    // messages, bracketed by unarchive and re-archive.
    assert_eq!(mock.bulk_calls.load(Ordering::SeqCst), 0);
    assert_eq!(mock.single_calls.load(Ordering::SeqCst), 4);
    let archive_calls = mock.archive_calls.lock().unwrap().clone();
    assert_eq!(
        archive_calls,
        vec![
            (ChannelId::from("t1"), false),
            (ChannelId::from("t1"), true),
        ]
    );
}

#[tokio::test]
async fn day_cutoff_limits_the_scan() {
    let mock = MockPlatform::new();
    mock.add_channel(text_channel("c1", "general", None));

    let channel = ChannelId::from("c1");
    mock.add_messages(&channel, young_messages("c1", "alice", 3, 0));
    mock.add_messages(&channel, vec![old_message("c1", "alice", "old1", 10)]);

    let engine = engine(&mock, fast_config());
    let op = engine.begin(&guild()).await.unwrap();
    let (tx, _rx) = progress();

    let mut options = PurgeOptions::everyone("c1");
    options.days = Some(7);
    let result = engine.purge(&guild(), options, &op, tx).await.unwrap();

    // The 10-day-old message is outside the 7-day window.
    assert_eq!(result.total_deleted, 3);
    assert_eq!(mock.remaining_messages(&channel), 1);
}

#[tokio::test]
async fn departed_members_rule_only_deletes_non_members() {
    let mock = MockPlatform::new();
    mock.add_channel(text_channel("c1", "general", None));
    mock.members.lock().unwrap().insert(UserId::from("alice"));

    let channel = ChannelId::from("c1");
    mock.add_messages(&channel, young_messages("c1", "alice", 5, 0));
    mock.add_messages(&channel, young_messages("c1", "ghost", 4, 100));

    let engine = engine(&mock, fast_config());
    let op = engine.begin(&guild()).await.unwrap();
    let (tx, _rx) = progress();

    let mut options = PurgeOptions::everyone("c1");
    options.rule = SelectionRule::DepartedMembers;
    let result = engine.purge(&guild(), options, &op, tx).await.unwrap();

    // Only the departed author's messages go; alice is still a member.
    assert_eq!(result.total_deleted, 4);
    assert_eq!(mock.remaining_messages(&channel), 5);
}
