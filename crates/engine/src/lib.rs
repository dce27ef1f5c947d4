//! Tag-partitioned transaction-log coordinator.
//!
//! The durable, ordered commit fabric of a distributed database: a
//! sequencer pushes versioned batches of tagged mutations through this
//! coordinator to a replica set of log servers, storage servers stream them
//! back per tag through lazy cursors, and consumed prefixes are popped
//! away. When an epoch's quorum can no longer be proven live, the epoch-end
//! state machine locks the old cohort, computes the provably-safe end
//! version under the replication policy, and hands a frozen snapshot to the
//! new-epoch constructor.
//!
//! The coordinator owns no transport and no storage: log servers are
//! reached through the [`interface::TLogClient`] seam and persistence of
//! the coordinated state is the caller's job.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core_state;
pub mod cursor;
pub mod error;
pub mod foundation;
pub mod interface;
pub mod system;

pub use {
    config::LogKnobs,
    core_state::{CoreState, LogSystemConfig, LogSystemType, OldTLogConf, OldTLogCoreState},
    cursor::PeekCursor,
    error::{EngineError, LogResult, TransportError},
    foundation::{LogEpoch, LogPushData, LogServerId, StoreType, Tag, TaggedMessage, Version},
    interface::{ServerHandle, TLogClient, TLogHandle, TLogRejoinRequest, WorkerHandle},
    system::{EpochConfig, OldLogData, TagPartitionedLogSystem},
};
