//! Wire-facing interfaces: the TLog client seam, optional interfaces, and
//! recruitment/rejoin request types.
//!
//! The engine never owns a transport. It talks to log servers through the
//! [`TLogClient`] trait and learns their current addresses through
//! [`OptionalInterface`] cells, so a server's identity stays stable while
//! its interface may be unknown between process restarts.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use taglog_locality::LocalityData;

use crate::core_state::LogSystemConfig;
use crate::error::TransportError;
use crate::foundation::{AsyncCell, LogEpoch, LogServerId, StoreType, Tag, TaggedMessage, Version};

/// Result type for wire operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// One commit fan-out request to a single log server.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    /// Version of the previous commit, for gap detection on the server.
    pub prev_version: Version,
    /// Version being committed.
    pub version: Version,
    /// Lower bound on durably committed versions.
    pub known_committed_version: Version,
    /// Serialized messages destined for this server.
    pub messages: Bytes,
    /// Tags carried by those messages.
    pub tags: Vec<Tag>,
    /// Optional id threading this commit through trace events.
    pub debug_id: Option<Uuid>,
}

/// Per-tag read request.
#[derive(Debug, Clone, Copy)]
pub struct PeekRequest {
    /// Tag to read.
    pub tag: Tag,
    /// First version of interest.
    pub begin: Version,
    /// Exclusive upper bound, if the caller knows one.
    pub end: Option<Version>,
}

/// Reply to a [`PeekRequest`].
///
/// The server holds the request until it has at least one message with
/// version ≥ `begin` for the tag, or until it can prove there will be none
/// (it is locked, or the requested bound is reached). `end` is the first
/// version the reply says nothing about: `end > begin` with no messages
/// means the tag was silent over `[begin, end)` and the cursor should poll
/// again from `end`; `end ≤ begin` means the server has nothing further.
#[derive(Debug, Clone, Default)]
pub struct PeekReply {
    /// Messages for the tag, in increasing version order.
    pub messages: Vec<TaggedMessage>,
    /// First version not covered by this reply.
    pub end: Version,
}

/// Per-tag advance of the durably-popped version.
#[derive(Debug, Clone, Copy)]
pub struct PopRequest {
    /// Tag whose consumer has advanced.
    pub tag: Tag,
    /// Everything strictly below this version may be discarded.
    pub up_to: Version,
}

/// Reply to a lock request: the server stops accepting commits and reports
/// where it stands.
#[derive(Debug, Clone)]
pub struct LockReply {
    /// First version this server will refuse going forward.
    pub end: Version,
    /// The server's known committed version.
    pub known_committed_version: Version,
    /// Tags the server holds data for.
    pub tags: BTreeSet<Tag>,
}

/// Client operations on one log server. Implemented by the transport layer;
/// mocked in tests.
#[async_trait]
pub trait TLogClient: Send + Sync {
    /// Append a versioned batch.
    async fn commit(&self, req: CommitRequest) -> TransportResult<()>;

    /// Read messages for a tag. See [`PeekReply`] for the blocking contract.
    async fn peek(&self, req: PeekRequest) -> TransportResult<PeekReply>;

    /// Advance the durably-popped version for a tag.
    async fn pop(&self, req: PopRequest) -> TransportResult<()>;

    /// Stop accepting commits; report end version, known committed version,
    /// and tag coverage.
    async fn lock(&self) -> TransportResult<LockReply>;

    /// Liveness handshake used by the sequencer before advancing.
    async fn confirm_running(&self, debug_id: Option<Uuid>) -> TransportResult<()>;

    /// Notify the server that recovery has completed.
    async fn recovery_finished(&self) -> TransportResult<()>;

    /// Health probe for the failure tracker. A healthy server answers well
    /// within the configured TLog timeout; no answer means failed.
    async fn ping(&self) -> TransportResult<()>;
}

/// A live handle to one log server: identity, address, locality, and the
/// client used to reach it.
#[derive(Clone)]
pub struct TLogHandle {
    /// Stable server identity.
    pub id: LogServerId,
    /// Current network address, for snapshots and log lines.
    pub address: String,
    /// Where the server runs.
    pub locality: LocalityData,
    client: Arc<dyn TLogClient>,
}

impl TLogHandle {
    /// Bundle an id, address, locality, and client into a handle.
    pub fn new(
        id: LogServerId,
        address: impl Into<String>,
        locality: LocalityData,
        client: Arc<dyn TLogClient>,
    ) -> Self {
        Self {
            id,
            address: address.into(),
            locality,
            client,
        }
    }

    /// The wire client for this server.
    pub fn client(&self) -> &Arc<dyn TLogClient> {
        &self.client
    }
}

impl fmt::Debug for TLogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TLogHandle")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// A server identity whose interface may currently be unknown.
#[derive(Debug, Clone)]
pub struct OptionalInterface {
    id: LogServerId,
    interf: Option<TLogHandle>,
}

impl OptionalInterface {
    /// Identity only; the interface will arrive later via a rejoin.
    pub fn id_only(id: LogServerId) -> Self {
        Self { id, interf: None }
    }

    /// Identity plus a live interface.
    pub fn from_handle(handle: TLogHandle) -> Self {
        Self {
            id: handle.id,
            interf: Some(handle),
        }
    }

    /// The server's stable identity.
    pub fn id(&self) -> LogServerId {
        self.id
    }

    /// Whether a live interface is known.
    pub fn present(&self) -> bool {
        self.interf.is_some()
    }

    /// The live interface, if known.
    pub fn interf(&self) -> Option<&TLogHandle> {
        self.interf.as_ref()
    }
}

/// Observable cell carrying the currently-known interface of one server.
/// Single writer (the rejoin tracker), many readers.
pub type ServerHandle = Arc<AsyncCell<OptionalInterface>>;

/// Build a fresh handle around an optional interface.
pub fn server_handle(interf: OptionalInterface) -> ServerHandle {
    Arc::new(AsyncCell::new(interf))
}

/// A log server announcing itself to the recovering coordinator. Replying
/// `true` tells the server it is stale; dropping the reply channel means the
/// same.
#[derive(Debug)]
pub struct TLogRejoinRequest {
    /// The server's current interface.
    pub interface: TLogHandle,
    /// Reply channel; `true` = "you are stale".
    pub reply: oneshot::Sender<bool>,
}

/// Recruitment request sent to a candidate worker during new-epoch
/// construction.
#[derive(Clone)]
pub struct InitializeTLogRequest {
    /// Identifies this recruitment round.
    pub recruitment_id: Uuid,
    /// Store type the new TLog should run.
    pub store_type: StoreType,
    /// The frozen prior log system, for fetching old-epoch data.
    pub recover_from: LogSystemConfig,
    /// Version recovery stops at.
    pub recover_at: Version,
    /// Known committed version at recovery time.
    pub known_committed_version: Version,
    /// Epoch counter of the new epoch.
    pub epoch: LogEpoch,
    /// Tags whose prior-epoch data this worker must fetch and serve.
    pub recover_tags: Vec<Tag>,
}

impl fmt::Debug for InitializeTLogRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitializeTLogRequest")
            .field("recruitment_id", &self.recruitment_id)
            .field("store_type", &self.store_type)
            .field("recover_at", &self.recover_at)
            .field("known_committed_version", &self.known_committed_version)
            .field("epoch", &self.epoch)
            .field("recover_tags", &self.recover_tags)
            .finish_non_exhaustive()
    }
}

/// Client operations on a candidate worker process.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Stand up a TLog on this worker; the reply is its live interface.
    async fn initialize_tlog(&self, req: InitializeTLogRequest) -> TransportResult<TLogHandle>;
}

/// A worker available for TLog recruitment.
#[derive(Clone)]
pub struct WorkerHandle {
    /// Where the worker runs.
    pub locality: LocalityData,
    client: Arc<dyn WorkerClient>,
}

impl WorkerHandle {
    /// Bundle a locality and client into a worker handle.
    pub fn new(locality: LocalityData, client: Arc<dyn WorkerClient>) -> Self {
        Self { locality, client }
    }

    /// The recruitment client for this worker.
    pub fn client(&self) -> &Arc<dyn WorkerClient> {
        &self.client
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("locality", &self.locality)
            .finish_non_exhaustive()
    }
}
