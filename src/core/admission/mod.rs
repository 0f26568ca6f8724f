//! Client interface to the admission (quota) service.
//!
//! Counters for every tag set live in the service, never inside a channel.
//! Channels only ever talk to it through [`AdmissionService`], so the
//! in-memory [`LocalAdmission`] can be swapped for a remote client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::AdmissionError;
use crate::core::tags::{KeyValues, TagQuery};

mod local;

pub use local::{LocalAdmission, Override, Rule};

/// Limit value meaning "never admit".
pub const LIMIT_BLOCKED: i64 = 0;
/// Limit value meaning "no limit".
pub const LIMIT_UNLIMITED: i64 = -1;

/// Which of the two per-tag-set counters a call refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Items stored in a channel, pending or in flight.
    Enqueued,
    /// Items currently handed to a consumer.
    Running,
}

/// A limit that applies to some tag set, as returned by
/// [`AdmissionService::match_rules`] and [`AdmissionService::match_overrides`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit {
    /// Name of the rule this limit belongs to.
    pub rule: String,
    pub counter: CounterKind,
    /// Counters whose tag set contains every pair of this selection are
    /// aggregated against `limit`.
    pub selection: KeyValues,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub tags: KeyValues,
    pub counter: CounterKind,
    pub value: i64,
}

#[async_trait]
pub trait AdmissionService: Send + Sync {
    /// Adjusts one counter of `tags` by `delta`. A positive delta that would
    /// push any applicable limit over its value fails with
    /// [`AdmissionError::LimitReached`] and changes nothing.
    async fn update_counter(
        &self,
        tags: &KeyValues,
        counter: CounterKind,
        delta: i64,
    ) -> Result<(), AdmissionError>;

    /// Hard-sets both counters of `tags`.
    async fn set_counters(&self, tags: &KeyValues, value: i64) -> Result<(), AdmissionError>;

    async fn match_rules(&self, tags: &KeyValues) -> Result<Vec<Limit>, AdmissionError>;

    async fn match_overrides(&self, tags: &KeyValues) -> Result<Vec<Limit>, AdmissionError>;

    async fn query_counters(
        &self,
        query: &TagQuery,
        counter: CounterKind,
    ) -> Result<Vec<CounterSnapshot>, AdmissionError>;
}
