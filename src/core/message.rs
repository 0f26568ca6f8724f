//! Request and response shapes exchanged with the engine.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::error::BrokerError;
use crate::core::item::{ItemId, ItemPolicy, RetryPosition};
use crate::core::tags::KeyValues;

/// An item as submitted by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueItem {
    pub payload: Bytes,
    pub tags: KeyValues,
    #[serde(default)]
    pub updateable: bool,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default)]
    pub retry_position: RetryPosition,
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
}

impl EnqueueItem {
    pub fn new(payload: impl Into<Bytes>, tags: KeyValues, heartbeat_timeout: Duration) -> Self {
        Self {
            payload: payload.into(),
            tags,
            updateable: false,
            retry_attempts: 0,
            retry_position: RetryPosition::Front,
            heartbeat_timeout,
        }
    }

    pub fn updateable(mut self, updateable: bool) -> Self {
        self.updateable = updateable;
        self
    }

    pub fn retries(mut self, attempts: u32, position: RetryPosition) -> Self {
        self.retry_attempts = attempts;
        self.retry_position = position;
        self
    }

    pub fn validate(&self, min_heartbeat_timeout: Duration) -> Result<(), BrokerError> {
        if self.tags.is_empty() {
            return Err(BrokerError::Invalid("tags must not be empty".into()));
        }
        if self.heartbeat_timeout < min_heartbeat_timeout {
            return Err(BrokerError::Invalid(format!(
                "heartbeat timeout {:?} is below the minimum of {:?}",
                self.heartbeat_timeout, min_heartbeat_timeout
            )));
        }
        Ok(())
    }

    pub fn policy(&self) -> ItemPolicy {
        ItemPolicy {
            updateable: self.updateable,
            max_retry_attempts: self.retry_attempts,
            retry_position: self.retry_position,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }
}

/// An item as handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueItem {
    pub id: ItemId,
    pub tags: KeyValues,
    pub payload: Bytes,
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub item_id: ItemId,
    pub tags: KeyValues,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    pub item_id: ItemId,
    pub tags: KeyValues,
}

/// Introspection view of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub queue: String,
    pub tags: KeyValues,
    pub pending: usize,
    pub in_flight: usize,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
