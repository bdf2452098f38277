//! Shared domain types for the logharbor log streaming gateway.
//!
//! This crate has no I/O of its own: it holds the data model, the
//! subscriber protocol's event encoding, the configuration surface, and the
//! error taxonomy, so that every other crate in the workspace speaks the
//! same vocabulary.

mod config;
mod entry;
mod error;
mod event;

pub use config::{BufferConfig, HubConfig, SharedCacheConfig, StreamConfig, SubscriberConfig};
pub use entry::{EntryKind, LogEntry, MarkerKind, StreamKey, DEFAULT_CONTAINER};
pub use error::GatewayError;
pub use event::{
    AggregateStats, HeartbeatBody, LogBody, Resume, ServerEvent, StatsBody, StatusBody,
    StatusSnapshot, StreamRole, SubscribeOptions,
};
