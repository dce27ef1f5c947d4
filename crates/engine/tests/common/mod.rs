//! In-memory log-server cohort for integration tests.
//!
//! `MockTLog` implements the full wire client against an in-memory message
//! store, with switches for the failure modes the coordinator must handle:
//! held or failing commits, failing pops, held confirmations, preset lock
//! replies, and health-probe silence.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use uuid::Uuid;

use taglog_engine::config::LogKnobs;
use taglog_engine::core_state::{CoreState, LogSystemConfig, LogSystemType, OldTLogConf};
use taglog_engine::error::TransportError;
use taglog_engine::interface::{
    CommitRequest, InitializeTLogRequest, LockReply, OptionalInterface, PeekReply, PeekRequest,
    PopRequest, TLogClient, TLogHandle, WorkerClient, WorkerHandle,
};
use taglog_engine::{LogServerId, Tag, TaggedMessage, Version};
use taglog_locality::{keys, LocalityData, ReplicationPolicy};

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Default)]
struct TLogState {
    messages: BTreeMap<Tag, Vec<TaggedMessage>>,
    head: Version,
    locked: bool,
    commits: Vec<CommitRequest>,
    pops: BTreeMap<Tag, Vec<Version>>,
}

/// One in-memory log server.
pub struct MockTLog {
    pub id: LogServerId,
    state: StdMutex<TLogState>,
    data: watch::Sender<u64>,
    commit_gate: watch::Sender<bool>,
    confirm_gate: watch::Sender<bool>,
    recovery_gate: watch::Sender<bool>,
    healthy: watch::Sender<bool>,
    commit_fail: StdMutex<Option<TransportError>>,
    pop_fail: StdMutex<Option<TransportError>>,
    lock_reply: StdMutex<Option<LockReply>>,
}

impl MockTLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: LogServerId::random(),
            state: StdMutex::new(TLogState::default()),
            data: watch::channel(0).0,
            commit_gate: watch::channel(true).0,
            confirm_gate: watch::channel(true).0,
            recovery_gate: watch::channel(true).0,
            healthy: watch::channel(true).0,
            commit_fail: StdMutex::new(None),
            pop_fail: StdMutex::new(None),
            lock_reply: StdMutex::new(None),
        })
    }

    pub fn handle(self: &Arc<Self>, address: impl Into<String>, locality: LocalityData) -> TLogHandle {
        TLogHandle::new(self.id, address, locality, self.clone() as Arc<dyn TLogClient>)
    }

    /// Store a message directly, as if it had been committed.
    pub fn append(&self, tag: Tag, version: Version, payload: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.messages.entry(tag).or_default().push(TaggedMessage {
            version,
            payload: Bytes::copy_from_slice(payload),
        });
        state.head = state.head.max(version + 1);
        drop(state);
        self.bump();
    }

    /// Advance the durable head without storing messages (silent versions).
    pub fn set_head(&self, head: Version) {
        self.state.lock().unwrap().head = head;
        self.bump();
    }

    pub fn lock_now(&self) {
        self.state.lock().unwrap().locked = true;
        self.bump();
    }

    pub fn hold_commits(&self) {
        self.commit_gate.send_replace(false);
    }

    pub fn release_commits(&self) {
        self.commit_gate.send_replace(true);
    }

    pub fn fail_commits(&self, error: TransportError) {
        *self.commit_fail.lock().unwrap() = Some(error);
    }

    pub fn hold_confirm(&self) {
        self.confirm_gate.send_replace(false);
    }

    pub fn hold_recovery_finished(&self) {
        self.recovery_gate.send_replace(false);
    }

    pub fn release_recovery_finished(&self) {
        self.recovery_gate.send_replace(true);
    }

    pub fn fail_pops(&self, error: TransportError) {
        *self.pop_fail.lock().unwrap() = Some(error);
    }

    pub fn clear_pop_failure(&self) {
        *self.pop_fail.lock().unwrap() = None;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.send_replace(healthy);
    }

    /// Preset the reply the next lock request returns.
    pub fn set_lock_reply(&self, reply: LockReply) {
        *self.lock_reply.lock().unwrap() = Some(reply);
    }

    pub fn commits_received(&self) -> Vec<CommitRequest> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn pops_received(&self, tag: Tag) -> Vec<Version> {
        self.state
            .lock()
            .unwrap()
            .pops
            .get(&tag)
            .cloned()
            .unwrap_or_default()
    }

    fn bump(&self) {
        self.data.send_modify(|v| *v += 1);
    }

    async fn wait_gate(gate: &watch::Sender<bool>) -> TransportResult<()> {
        let mut rx = gate.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::BrokenPromise);
            }
        }
    }
}

#[async_trait]
impl TLogClient for MockTLog {
    async fn commit(&self, req: CommitRequest) -> TransportResult<()> {
        if let Some(error) = self.commit_fail.lock().unwrap().clone() {
            return Err(error);
        }
        Self::wait_gate(&self.commit_gate).await?;
        let mut state = self.state.lock().unwrap();
        if state.locked {
            return Err(TransportError::Stopped);
        }
        state.head = state.head.max(req.version + 1);
        state.commits.push(req);
        drop(state);
        self.bump();
        Ok(())
    }

    async fn peek(&self, req: PeekRequest) -> TransportResult<PeekReply> {
        let mut rx = self.data.subscribe();
        loop {
            rx.borrow_and_update();
            {
                let state = self.state.lock().unwrap();
                let messages: Vec<TaggedMessage> = state
                    .messages
                    .get(&req.tag)
                    .map(|all| {
                        all.iter()
                            .filter(|m| {
                                m.version >= req.begin
                                    && req.end.is_none_or(|end| m.version < end)
                            })
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                let end = match req.end {
                    Some(end) => state.head.min(end),
                    None => state.head,
                };
                if !messages.is_empty() || state.locked || end > req.begin {
                    return Ok(PeekReply { messages, end });
                }
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::BrokenPromise);
            }
        }
    }

    async fn pop(&self, req: PopRequest) -> TransportResult<()> {
        if let Some(error) = self.pop_fail.lock().unwrap().clone() {
            return Err(error);
        }
        self.state
            .lock()
            .unwrap()
            .pops
            .entry(req.tag)
            .or_default()
            .push(req.up_to);
        Ok(())
    }

    async fn lock(&self) -> TransportResult<LockReply> {
        let preset = self.lock_reply.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();
        state.locked = true;
        let reply = preset.unwrap_or_else(|| LockReply {
            end: state.head,
            known_committed_version: 0,
            tags: state.messages.keys().copied().collect(),
        });
        drop(state);
        self.bump();
        Ok(reply)
    }

    async fn confirm_running(&self, _debug_id: Option<Uuid>) -> TransportResult<()> {
        Self::wait_gate(&self.confirm_gate).await
    }

    async fn recovery_finished(&self) -> TransportResult<()> {
        Self::wait_gate(&self.recovery_gate).await
    }

    async fn ping(&self) -> TransportResult<()> {
        let mut rx = self.healthy.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::BrokenPromise);
            }
        }
    }
}

/// One recruitable worker standing in front of a mock TLog.
pub struct MockWorker {
    pub locality: LocalityData,
    pub tlog: Arc<MockTLog>,
    address: String,
    requests: StdMutex<Vec<InitializeTLogRequest>>,
    fail: StdMutex<bool>,
}

impl MockWorker {
    pub fn new(index: usize) -> Arc<Self> {
        Arc::new(Self {
            locality: zone(index),
            tlog: MockTLog::new(),
            address: format!("worker-{index}:4100"),
            requests: StdMutex::new(Vec::new()),
            fail: StdMutex::new(false),
        })
    }

    pub fn fail_initialization(&self) {
        *self.fail.lock().unwrap() = true;
    }

    pub fn requests_received(&self) -> Vec<InitializeTLogRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn worker_handle(self: &Arc<Self>) -> WorkerHandle {
        WorkerHandle::new(self.locality.clone(), self.clone() as Arc<dyn WorkerClient>)
    }
}

#[async_trait]
impl WorkerClient for MockWorker {
    async fn initialize_tlog(&self, req: InitializeTLogRequest) -> TransportResult<TLogHandle> {
        self.requests.lock().unwrap().push(req);
        if *self.fail.lock().unwrap() {
            return Err(TransportError::Connection("connection refused".into()));
        }
        Ok(self.tlog.handle(self.address.clone(), self.locality.clone()))
    }
}

/// Locality with a distinct zone per index.
pub fn zone(index: usize) -> LocalityData {
    LocalityData::new().with(keys::ZONE_ID, format!("z{index}"))
}

/// Knobs scaled down to test timescales.
pub fn test_knobs() -> Arc<LogKnobs> {
    Arc::new(LogKnobs {
        tlog_timeout: Duration::from_millis(100),
        pop_retry_delay: Duration::from_millis(50),
        versions_per_second: 1_000_000,
        max_read_transaction_life_versions: 5_000_000,
        recovery_failure_slope: 0.5,
    })
}

/// A cohort of `n` mock TLogs with one zone each.
pub fn cohort(n: usize) -> Vec<Arc<MockTLog>> {
    (0..n).map(|_| MockTLog::new()).collect()
}

/// Snapshot describing `tlogs` as a live current epoch.
pub fn live_config(
    tlogs: &[Arc<MockTLog>],
    replication_factor: usize,
    write_anti_quorum: usize,
    policy: ReplicationPolicy,
    old_tlogs: Vec<OldTLogConf>,
) -> LogSystemConfig {
    LogSystemConfig {
        log_system_type: LogSystemType::TagPartitioned,
        replication_factor,
        write_anti_quorum,
        policy,
        localities: (0..tlogs.len()).map(zone).collect(),
        tlogs: tlogs
            .iter()
            .enumerate()
            .map(|(i, t)| {
                OptionalInterface::from_handle(t.handle(format!("tlog-{i}:4000"), zone(i)))
            })
            .collect(),
        old_tlogs,
    }
}

/// One prior epoch over `tlogs` ending at `epoch_end`.
pub fn old_conf(
    tlogs: &[Arc<MockTLog>],
    replication_factor: usize,
    epoch_end: Version,
) -> OldTLogConf {
    OldTLogConf {
        tlogs: tlogs
            .iter()
            .enumerate()
            .map(|(i, t)| {
                OptionalInterface::from_handle(t.handle(format!("old-tlog-{i}:4000"), zone(i)))
            })
            .collect(),
        replication_factor,
        write_anti_quorum: 0,
        policy: ReplicationPolicy::across(keys::ZONE_ID, replication_factor),
        localities: (0..tlogs.len()).map(zone).collect(),
        epoch_end,
    }
}

/// Core state naming `tlogs` as the previous epoch.
pub fn prev_core_state(
    tlogs: &[Arc<MockTLog>],
    replication_factor: usize,
    write_anti_quorum: usize,
) -> CoreState {
    CoreState {
        log_system_type: LogSystemType::TagPartitioned,
        tlogs: tlogs.iter().map(|t| t.id).collect(),
        replication_factor,
        write_anti_quorum,
        policy: ReplicationPolicy::across(keys::ZONE_ID, replication_factor),
        localities: (0..tlogs.len()).map(zone).collect(),
        old_tlog_data: Vec::new(),
    }
}

/// A live system over a fresh cohort, zone-spread policy matching `f`.
pub fn live_system(
    n: usize,
    replication_factor: usize,
    write_anti_quorum: usize,
) -> (
    Arc<taglog_engine::TagPartitionedLogSystem>,
    Vec<Arc<MockTLog>>,
) {
    let tlogs = cohort(n);
    let conf = live_config(
        &tlogs,
        replication_factor,
        write_anti_quorum,
        ReplicationPolicy::across(keys::ZONE_ID, replication_factor),
        Vec::new(),
    );
    let system = taglog_engine::TagPartitionedLogSystem::from_log_system_config(
        Uuid::new_v4(),
        LocalityData::new(),
        test_knobs(),
        &conf,
    )
    .expect("valid config")
    .expect("tag-partitioned config");
    (system, tlogs)
}

/// One push payload carrying `payload` for every server under `tag`.
pub fn push_data(server_count: usize, tag: Tag, payload: &[u8]) -> taglog_engine::LogPushData {
    let mut data = taglog_engine::LogPushData::new(server_count);
    for i in 0..server_count {
        data.set_server(i, Bytes::copy_from_slice(payload), vec![tag]);
    }
    data
}

/// Drain a cursor to completion.
pub async fn collect_versions(
    cursor: &mut Box<dyn taglog_engine::PeekCursor>,
) -> Vec<Version> {
    let mut versions = Vec::new();
    while let Some(message) = cursor.next().await.expect("cursor error") {
        versions.push(message.version);
    }
    versions
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("taglog_engine=debug")
        .with_test_writer()
        .try_init();
}
