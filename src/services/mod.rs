//! Service layer for the purge engine.
//!
//! Domain logic separated from any hosting command layer: batch
//! sizing, operation lifecycle, the channel worker pool, and the purge
//! pipeline itself.

pub mod batch;
pub mod ledger;
pub mod pool;
pub mod purge;

pub use batch::{BatchMetrics, BatchTuner};
pub use ledger::{LedgerError, Operation, OperationLedger};
pub use pool::{ChannelWorkerPool, PoolEvent, PoolMetrics};
pub use purge::{MessageService, PurgeEngine, PurgeError};
