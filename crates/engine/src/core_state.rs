//! The coordinated state record and transport-friendly snapshots.
//!
//! [`CoreState`] is what the caller persists through the coordination
//! layer: server identities and epoch shape, no live interfaces.
//! [`LogSystemConfig`] is the in-memory snapshot handed to the controller
//! and to freshly recruited TLogs; it carries the live handles.

use serde::{Deserialize, Serialize};

use taglog_locality::{LocalityData, ReplicationPolicy};

use crate::error::{EngineError, LogResult};
use crate::foundation::{LogServerId, Version};
use crate::interface::OptionalInterface;

/// Which kind of log system a state record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LogSystemType {
    /// No log system (brand-new database).
    Empty,
    /// The tag-partitioned log system.
    TagPartitioned,
}

impl From<LogSystemType> for u8 {
    fn from(t: LogSystemType) -> u8 {
        match t {
            LogSystemType::Empty => 0,
            LogSystemType::TagPartitioned => 2,
        }
    }
}

impl TryFrom<u8> for LogSystemType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LogSystemType::Empty),
            2 => Ok(LogSystemType::TagPartitioned),
            other => Err(format!("unknown log system type {other}")),
        }
    }
}

/// One frozen prior epoch as persisted in the core state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OldTLogCoreState {
    /// Identities of the epoch's servers.
    pub tlogs: Vec<LogServerId>,
    /// Replication factor the epoch ran with.
    pub replication_factor: usize,
    /// Write anti-quorum the epoch ran with.
    pub write_anti_quorum: usize,
    /// Replication policy the epoch ran with.
    pub policy: ReplicationPolicy,
    /// Server localities, aligned with `tlogs`.
    pub localities: Vec<LocalityData>,
    /// First version not in the epoch.
    pub epoch_end: Version,
}

/// The serialized form of a log system, persisted by the caller through the
/// coordination layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreState {
    /// Kind of log system described.
    pub log_system_type: LogSystemType,
    /// Identities of the current epoch's servers.
    pub tlogs: Vec<LogServerId>,
    /// Current replication factor.
    pub replication_factor: usize,
    /// Current write anti-quorum.
    pub write_anti_quorum: usize,
    /// Current replication policy.
    pub policy: ReplicationPolicy,
    /// Server localities, aligned with `tlogs`.
    pub localities: Vec<LocalityData>,
    /// Frozen prior epochs, newest first.
    pub old_tlog_data: Vec<OldTLogCoreState>,
}

impl CoreState {
    /// Reject impossible records: an empty-type state naming servers.
    pub fn validate(&self) -> LogResult<()> {
        if self.log_system_type == LogSystemType::Empty && !self.tlogs.is_empty() {
            return Err(EngineError::Internal("empty log system type with tlogs"));
        }
        Ok(())
    }
}

impl Default for CoreState {
    fn default() -> Self {
        Self {
            log_system_type: LogSystemType::Empty,
            tlogs: Vec::new(),
            replication_factor: 0,
            write_anti_quorum: 0,
            policy: ReplicationPolicy::One,
            localities: Vec::new(),
            old_tlog_data: Vec::new(),
        }
    }
}

/// One prior epoch inside a [`LogSystemConfig`] snapshot.
#[derive(Debug, Clone)]
pub struct OldTLogConf {
    /// The epoch's servers, with whatever interfaces are currently known.
    pub tlogs: Vec<OptionalInterface>,
    /// Replication factor the epoch ran with.
    pub replication_factor: usize,
    /// Write anti-quorum the epoch ran with.
    pub write_anti_quorum: usize,
    /// Replication policy the epoch ran with.
    pub policy: ReplicationPolicy,
    /// Server localities, aligned with `tlogs`.
    pub localities: Vec<LocalityData>,
    /// First version not in the epoch.
    pub epoch_end: Version,
}

/// Transport-friendly snapshot of a log system, consumed by the controller
/// and by recruited TLogs fetching prior-epoch data.
#[derive(Debug, Clone)]
pub struct LogSystemConfig {
    /// Kind of log system described.
    pub log_system_type: LogSystemType,
    /// Current replication factor.
    pub replication_factor: usize,
    /// Current write anti-quorum.
    pub write_anti_quorum: usize,
    /// Current replication policy.
    pub policy: ReplicationPolicy,
    /// Server localities, aligned with `tlogs`.
    pub localities: Vec<LocalityData>,
    /// The current epoch's servers.
    pub tlogs: Vec<OptionalInterface>,
    /// Frozen prior epochs, newest first. Elided once recovery completion
    /// has been durably recorded.
    pub old_tlogs: Vec<OldTLogConf>,
}

/// One `(identity, address)` pair inside the logs value blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEndpoint {
    /// Server identity.
    pub id: LogServerId,
    /// Last known address, if any.
    pub address: Option<String>,
}

/// The compact `(id, address)` listing published for discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsValue {
    /// Current-epoch servers.
    pub logs: Vec<LogEndpoint>,
    /// Prior-epoch servers, until recovery completion is durable.
    pub old_logs: Vec<LogEndpoint>,
}
