//! Operation lifecycle tracking and per-guild locking.
//!
//! The ledger is the single source of truth for "is this purge
//! cancelled", "how many messages has it deleted", and "is this guild
//! already running a purge". One live operation per guild, released on
//! every exit path through [`OperationLedger::complete`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::{GuildId, OperationId};

/// One purge invocation's lifecycle record.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub guild_id: GuildId,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub deleted: u64,
}

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("guild {0} already has an active purge operation")]
    GuildBusy(GuildId),
}

#[derive(Default)]
struct LedgerState {
    operations: HashMap<OperationId, Operation>,
    guild_locks: HashMap<GuildId, OperationId>,
}

/// In-process operation registry. See module docs.
#[derive(Default)]
pub struct OperationLedger {
    state: RwLock<LedgerState>,
}

impl OperationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an operation for a guild, taking the guild lock.
    ///
    /// Fails with [`LedgerError::GuildBusy`] while the guild has a live
    /// (non-cancelled) operation.
    pub async fn begin(&self, guild: &GuildId) -> Result<OperationId, LedgerError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.guild_locks.get(guild) {
            let live = state
                .operations
                .get(existing)
                .map(|op| !op.cancelled)
                .unwrap_or(false);
            if live {
                return Err(LedgerError::GuildBusy(guild.clone()));
            }
        }

        let id = OperationId::generate(guild);
        state.operations.insert(
            id.clone(),
            Operation {
                id: id.clone(),
                guild_id: guild.clone(),
                cancelled: false,
                created_at: Utc::now(),
                deleted: 0,
            },
        );
        state.guild_locks.insert(guild.clone(), id.clone());
        debug!(guild = %guild, operation = %id, "operation started");
        Ok(id)
    }

    /// Whether the guild has a live operation.
    pub async fn is_guild_locked(&self, guild: &GuildId) -> bool {
        let state = self.state.read().await;
        state
            .guild_locks
            .get(guild)
            .and_then(|id| state.operations.get(id))
            .map(|op| !op.cancelled)
            .unwrap_or(false)
    }

    /// Request cancellation. Returns false for an unknown id.
    pub async fn cancel(&self, id: &OperationId) -> bool {
        let mut state = self.state.write().await;
        match state.operations.get_mut(id) {
            Some(op) => {
                op.cancelled = true;
                debug!(operation = %id, "operation cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether the operation is cancelled. Unknown ids read as
    /// cancelled so a stale worker can never keep deleting.
    pub async fn is_cancelled(&self, id: &OperationId) -> bool {
        let state = self.state.read().await;
        state.operations.get(id).map(|op| op.cancelled).unwrap_or(true)
    }

    /// Add `n` freshly deleted messages to the running total and return
    /// the new total. Increment-only, so concurrent channel completions
    /// can never regress the count.
    pub async fn add_deleted(&self, id: &OperationId, n: u64) -> u64 {
        let mut state = self.state.write().await;
        match state.operations.get_mut(id) {
            Some(op) => {
                op.deleted += n;
                op.deleted
            }
            None => 0,
        }
    }

    /// Running deleted total; 0 for an unknown id.
    pub async fn deleted_count(&self, id: &OperationId) -> u64 {
        let state = self.state.read().await;
        state.operations.get(id).map(|op| op.deleted).unwrap_or(0)
    }

    /// Remove the operation and release the guild lock, unconditionally.
    /// Called exactly once per operation, on every exit path.
    pub async fn complete(&self, id: &OperationId) {
        let mut state = self.state.write().await;
        if let Some(op) = state.operations.remove(id) {
            // Only drop the lock if it still points at this operation.
            if state.guild_locks.get(&op.guild_id) == Some(id) {
                state.guild_locks.remove(&op.guild_id);
            }
            debug!(operation = %id, deleted = op.deleted, "operation completed");
        }
    }

    /// The live operation for a guild, if any.
    pub async fn active_operation(&self, guild: &GuildId) -> Option<Operation> {
        let state = self.state.read().await;
        state
            .guild_locks
            .get(guild)
            .and_then(|id| state.operations.get(id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_operation_per_guild() {
        let ledger = OperationLedger::new();
        let guild = GuildId::from("1");

        let first = ledger.begin(&guild).await.unwrap();
        assert!(ledger.is_guild_locked(&guild).await);
        assert!(matches!(
            ledger.begin(&guild).await,
            Err(LedgerError::GuildBusy(_))
        ));

        // A different guild is unaffected.
        ledger.begin(&GuildId::from("2")).await.unwrap();

        ledger.complete(&first).await;
        assert!(!ledger.is_guild_locked(&guild).await);
        ledger.begin(&guild).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_operation_releases_logical_lock() {
        let ledger = OperationLedger::new();
        let guild = GuildId::from("1");

        let id = ledger.begin(&guild).await.unwrap();
        assert!(ledger.cancel(&id).await);
        assert!(ledger.is_cancelled(&id).await);

        // A cancelled operation no longer blocks the guild.
        assert!(!ledger.is_guild_locked(&guild).await);
        ledger.begin(&guild).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_operation_reads_as_cancelled() {
        let ledger = OperationLedger::new();
        let unknown = OperationId("1-0".to_string());
        assert!(ledger.is_cancelled(&unknown).await);
        assert!(!ledger.cancel(&unknown).await);
    }

    #[tokio::test]
    async fn test_deleted_count_is_monotonic() {
        let ledger = OperationLedger::new();
        let guild = GuildId::from("1");
        let id = ledger.begin(&guild).await.unwrap();

        assert_eq!(ledger.add_deleted(&id, 10).await, 10);
        assert_eq!(ledger.add_deleted(&id, 5).await, 15);
        assert_eq!(ledger.deleted_count(&id).await, 15);
    }

    #[tokio::test]
    async fn test_concurrent_increments_all_land() {
        let ledger = std::sync::Arc::new(OperationLedger::new());
        let guild = GuildId::from("1");
        let id = ledger.begin(&guild).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    ledger.add_deleted(&id, 1).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.deleted_count(&id).await, 800);
    }
}
