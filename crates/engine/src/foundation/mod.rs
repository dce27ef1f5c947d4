//! Core types and small concurrency utilities shared across the engine.

pub mod cell;
pub mod quorum;
pub mod types;

pub use cell::AsyncCell;
pub use quorum::{quorum, wait_for_any, ActorCollection};
pub use types::{LogEpoch, LogPushData, LogServerId, StoreType, Tag, TaggedMessage, Version};
