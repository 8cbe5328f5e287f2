//! Purgeling - bulk message deletion for rate-limited chat platforms.
//!
//! Given a target scope (a whole guild, a category, or one channel)
//! and a selection rule (by author, by role, by departed membership,
//! or everything), the engine enumerates matching messages and deletes
//! them as fast as the platform's rate limits allow. Purges are
//! cancellable at well-defined checkpoints, isolated per channel, and
//! observable through progress events.
//!
//! The moving parts:
//!
//! - [`rate_limit::RequestGate`] paces every outbound call per
//!   rate-limit bucket and retries throttled calls with backoff.
//! - [`rate_limit::Forecaster`] predicts bucket exhaustion and slows
//!   calls down before the platform has to.
//! - [`services::BatchTuner`] sizes bulk-delete batches from live
//!   success/latency/throttle feedback.
//! - [`services::ChannelWorkerPool`] drains large channel lists with
//!   bounded concurrency, retries, and timeouts.
//! - [`services::OperationLedger`] tracks operation lifecycle: one
//!   live purge per guild, cooperative cancellation, deleted counts.
//! - [`services::PurgeEngine`] ties it all together behind
//!   [`services::PurgeEngine::purge`].

pub mod api;
pub mod config;
pub mod models;
pub mod rate_limit;
pub mod rest;
pub mod services;

pub use config::PurgeConfig;
pub use models::{
    ChannelReport, ProgressUpdate, PurgeOptions, PurgeResult, SelectionRule,
};
pub use services::{OperationLedger, PurgeEngine, PurgeError};
