//! Core value types.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A commit version. Versions are allocated externally by the sequencer and
/// increase monotonically across the lifetime of the database.
pub type Version = u64;

/// Epoch counter, bumped on every recovery.
pub type LogEpoch = u64;

/// A logical partition of the message stream. Every message carries one or
/// more tags; peek and pop are always per-tag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Tag(pub u32);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag:{}", self.0)
    }
}

/// Stable identity of a log server process, independent of its current
/// network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogServerId(Uuid);

impl LogServerId {
    /// Generate a fresh id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LogServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is plenty for log lines.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// On-disk store a recruited TLog should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreType {
    /// Volatile in-memory store.
    Memory,
    /// Durable SSD-backed store.
    Ssd,
}

/// One message as served by peek cursors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMessage {
    /// Commit version the message was part of.
    pub version: Version,
    /// Opaque payload.
    pub payload: Bytes,
}

/// Pre-partitioned payload of one push: for each current server, the
/// serialized messages destined for it and the tags they carry. The
/// sequencer fills this using `get_push_locations`.
#[derive(Debug, Clone, Default)]
pub struct LogPushData {
    per_server: Vec<(Bytes, Vec<Tag>)>,
}

impl LogPushData {
    /// Empty payload for `server_count` servers.
    pub fn new(server_count: usize) -> Self {
        Self {
            per_server: vec![(Bytes::new(), Vec::new()); server_count],
        }
    }

    /// Set the messages and tags destined for server `index`.
    pub fn set_server(&mut self, index: usize, messages: Bytes, tags: Vec<Tag>) {
        self.per_server[index] = (messages, tags);
    }

    /// Messages destined for server `index`.
    pub fn messages_for(&self, index: usize) -> Bytes {
        self.per_server[index].0.clone()
    }

    /// Tags destined for server `index`.
    pub fn tags_for(&self, index: usize) -> Vec<Tag> {
        self.per_server[index].1.clone()
    }

    /// Number of servers this payload was partitioned for.
    pub fn server_count(&self) -> usize {
        self.per_server.len()
    }
}
