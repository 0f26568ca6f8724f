//! tagmq – an in-memory, tag-partitioned message queue engine.
//!
//! This crate exports
//!  * `core`     – heartbeat timers, items, channel actors and the dequeue fan-in coordinator
//!  * `config`   – TOML-driven runtime configuration
//!  * `logging`  – tracing subscriber setup
//!  * `metrics`  – process-wide counters
//!  * `shutdown` – signal handling for the daemon
//!
//! Embedders build a [`Coordinator`] over an [`AdmissionService`] and drive
//! it from their own request layer.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;
pub mod shutdown;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config};
pub use crate::core::admission::{AdmissionService, LocalAdmission};
pub use crate::core::coordinator::Coordinator;
pub use crate::core::error::BrokerError;
pub use crate::core::message::{Ack, ChannelInfo, DequeueItem, EnqueueItem, HeartbeatMsg};
pub use crate::core::tags::{KeyValues, TagQuery};
