pub mod admission;
pub mod channel;
pub mod coordinator;
pub mod error;
pub mod heartbeat;
pub mod item;
pub mod merge;
pub mod message;
pub mod tags;
