//! The tag-partitioned log system coordinator.
//!
//! One [`TagPartitionedLogSystem`] binds an epoch's replica set together:
//! quorum push, per-tag peek and pop, the liveness handshake, and
//! serialization to and from the coordinated state record. Frozen systems
//! are produced by the epoch-end state machine in [`recovery`]; fresh
//! epochs by [`epoch`].

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio_util::task::AbortOnDropHandle;
use tracing::error;
use uuid::Uuid;

use taglog_locality::{LocalityData, LocalitySet, ReplicationPolicy};

use crate::config::LogKnobs;
use crate::core_state::{
    CoreState, LogEndpoint, LogSystemConfig, LogSystemType, LogsValue, OldTLogConf,
    OldTLogCoreState,
};
use crate::cursor::{MergedPeekCursor, MultiCursor, PeekCursor, ServerPeekCursor};
use crate::error::{EngineError, LogResult, TransportError};
use crate::foundation::{
    quorum, wait_for_any, ActorCollection, LogEpoch, LogPushData, Tag, Version,
};
use crate::interface::{
    server_handle, CommitRequest, OptionalInterface, ServerHandle, TLogClient, TLogRejoinRequest,
    WorkerHandle,
};

pub mod epoch;
mod failure;
mod pop;
mod recovery;
mod rejoin;

pub use epoch::EpochConfig;

pub(crate) use failure::wait_failure_client;

/// One frozen prior epoch held in memory: its servers (with live handles
/// where known) and the configuration it ran under.
#[derive(Debug, Clone)]
pub struct OldLogData {
    /// The epoch's server handles.
    pub log_servers: Vec<ServerHandle>,
    /// Replication factor the epoch ran with.
    pub replication_factor: usize,
    /// Write anti-quorum the epoch ran with.
    pub write_anti_quorum: usize,
    /// Replication policy the epoch ran with.
    pub policy: ReplicationPolicy,
    /// Server localities, aligned with `log_servers`.
    pub localities: Vec<LocalityData>,
    /// First version not in the epoch.
    pub epoch_end: Version,
}

/// Aggregate recovery-finished signal for a freshly built epoch.
pub(crate) struct RecoveryHandle {
    pub(crate) status: watch::Receiver<Option<LogResult<()>>>,
    pub(crate) _task: AbortOnDropHandle<()>,
}

/// The log-system coordinator for one epoch.
///
/// Shared between the sequencer, its child tasks, and external callers via
/// `Arc`. Child tasks hold weak references so teardown stays structural:
/// dropping the last strong reference cancels every background actor.
pub struct TagPartitionedLogSystem {
    pub(crate) dbgid: Uuid,
    pub(crate) locality: LocalityData,
    pub(crate) knobs: Arc<LogKnobs>,

    pub(crate) log_system_type: LogSystemType,
    pub(crate) log_servers: Vec<ServerHandle>,
    pub(crate) localities: Vec<LocalityData>,
    pub(crate) replication_factor: usize,
    pub(crate) write_anti_quorum: usize,
    pub(crate) policy: ReplicationPolicy,
    pub(crate) old_log_data: Vec<OldLogData>,

    pub(crate) epoch_end_version: Option<Version>,
    pub(crate) known_committed_version: Version,
    pub(crate) epoch_end_tags: BTreeSet<Tag>,

    pub(crate) outstanding_pops: DashMap<(usize, Tag), pop::OutstandingPop>,
    pub(crate) actors: ActorCollection,
    pub(crate) rejoins: StdMutex<Option<Arc<AbortOnDropHandle<()>>>>,
    pub(crate) recovery: StdMutex<Option<RecoveryHandle>>,
    pub(crate) recovery_written: AtomicBool,
}

impl TagPartitionedLogSystem {
    /// A blank system; construction sites fill the fields they need.
    pub(crate) fn base(dbgid: Uuid, locality: LocalityData, knobs: Arc<LogKnobs>) -> Self {
        Self {
            dbgid,
            locality,
            knobs,
            log_system_type: LogSystemType::Empty,
            log_servers: Vec::new(),
            localities: Vec::new(),
            replication_factor: 0,
            write_anti_quorum: 0,
            policy: ReplicationPolicy::One,
            old_log_data: Vec::new(),
            epoch_end_version: None,
            known_committed_version: 0,
            epoch_end_tags: BTreeSet::new(),
            outstanding_pops: DashMap::new(),
            actors: ActorCollection::new(),
            rejoins: StdMutex::new(None),
            recovery: StdMutex::new(None),
            recovery_written: AtomicBool::new(false),
        }
    }

    /// Rebuild a log system from a controller snapshot.
    ///
    /// Returns `Ok(None)` for an empty-type snapshot; an empty type naming
    /// servers is an impossible configuration.
    pub fn from_log_system_config(
        dbgid: Uuid,
        locality: LocalityData,
        knobs: Arc<LogKnobs>,
        conf: &LogSystemConfig,
    ) -> LogResult<Option<Arc<Self>>> {
        if conf.log_system_type == LogSystemType::Empty {
            if !conf.tlogs.is_empty() {
                return Err(EngineError::Internal("empty log system type with tlogs"));
            }
            return Ok(None);
        }

        let mut system = Self::base(dbgid, locality, knobs);
        system.log_system_type = conf.log_system_type;
        system.log_servers = conf
            .tlogs
            .iter()
            .map(|interf| server_handle(interf.clone()))
            .collect();
        system.localities = conf.localities.clone();
        system.replication_factor = conf.replication_factor;
        system.write_anti_quorum = conf.write_anti_quorum;
        system.policy = conf.policy.clone();
        system.old_log_data = conf.old_tlogs.iter().map(OldLogData::from_conf).collect();
        Ok(Some(Arc::new(system)))
    }

    /// Rebuild a read-only log system whose current set is the snapshot's
    /// most recent prior epoch. Recruited TLogs use this to peek the data
    /// they must recover.
    pub fn from_old_log_system_config(
        dbgid: Uuid,
        locality: LocalityData,
        knobs: Arc<LogKnobs>,
        conf: &LogSystemConfig,
    ) -> LogResult<Option<Arc<Self>>> {
        if conf.log_system_type == LogSystemType::Empty {
            if !conf.tlogs.is_empty() {
                return Err(EngineError::Internal("empty log system type with tlogs"));
            }
            return Ok(None);
        }

        let mut system = Self::base(dbgid, locality, knobs);
        system.log_system_type = conf.log_system_type;
        if let Some(newest) = conf.old_tlogs.first() {
            system.log_servers = newest
                .tlogs
                .iter()
                .map(|interf| server_handle(interf.clone()))
                .collect();
            system.localities = newest.localities.clone();
            system.replication_factor = newest.replication_factor;
            system.write_anti_quorum = newest.write_anti_quorum;
            system.policy = newest.policy.clone();
            system.old_log_data = conf.old_tlogs[1..]
                .iter()
                .map(OldLogData::from_conf)
                .collect();
        }
        Ok(Some(Arc::new(system)))
    }

    /// Run epoch-end recovery against `prev_state`, continuously publishing
    /// the best-known frozen log system to `out`. Never returns normally.
    pub fn recover_and_end_epoch(
        out: watch::Sender<Option<Arc<Self>>>,
        dbgid: Uuid,
        knobs: Arc<LogKnobs>,
        prev_state: CoreState,
        rejoin_requests: mpsc::Receiver<TLogRejoinRequest>,
        locality: LocalityData,
    ) -> impl Future<Output = LogResult<()>> + Send + 'static {
        recovery::epoch_end(out, dbgid, knobs, prev_state, rejoin_requests, locality)
    }

    /// Recruit a fresh TLog cohort seeded with this (frozen) system's
    /// snapshot and tag coverage. The result is provisional until the
    /// caller durably records its serialized form; pushing to a provisional
    /// system is forbidden.
    pub async fn new_epoch(
        self: &Arc<Self>,
        workers: Vec<WorkerHandle>,
        config: EpochConfig,
        recovery_count: LogEpoch,
    ) -> LogResult<Arc<Self>> {
        epoch::new_epoch(self, workers, config, recovery_count).await
    }

    /// Fan a commit out to every current server; resolves once the write
    /// quorum (`|servers| − W`) has acknowledged. Stragglers' errors still
    /// surface through [`Self::on_error`] via the background collection.
    pub fn push(
        &self,
        prev_version: Version,
        version: Version,
        known_committed_version: Version,
        data: &LogPushData,
        debug_id: Option<Uuid>,
    ) -> impl Future<Output = LogResult<()>> + Send + 'static {
        let mut commits: Vec<BoxFuture<'static, LogResult<()>>> = Vec::new();
        for (loc, handle) in self.log_servers.iter().enumerate() {
            let request = CommitRequest {
                prev_version,
                version,
                known_committed_version,
                messages: data.messages_for(loc),
                tags: data.tags_for(loc),
                debug_id,
            };
            let client = handle.get().interf().map(|t| t.client().clone());
            let commit = report_tlog_commit_errors(client, request, self.dbgid)
                .boxed()
                .shared();
            self.actors.add(commit.clone());
            commits.push(commit.boxed());
        }
        let required = commits.len().saturating_sub(self.write_anti_quorum);
        quorum(commits, required)
    }

    /// Construct a merged cursor for `tag` from `begin`, stitching in
    /// prior-epoch cursors when `begin` predates the current epoch.
    pub fn peek(&self, begin: Version, tag: Tag, parallel_get_more: bool) -> Box<dyn PeekCursor> {
        let peek_end = self.peek_end();
        match self.old_log_data.first() {
            None => Box::new(self.merged_current(tag, begin, peek_end, parallel_get_more)),
            Some(newest) if begin >= newest.epoch_end => {
                Box::new(self.merged_current(tag, begin, peek_end, parallel_get_more))
            }
            Some(newest) => {
                let mut cursors = self.prior_cursors(begin, tag, parallel_get_more);
                cursors.push(Box::new(self.merged_current(
                    tag,
                    newest.epoch_end,
                    peek_end,
                    parallel_get_more,
                )));
                Box::new(MultiCursor::new(cursors))
            }
        }
    }

    /// Like [`Self::peek`], but the current epoch is read from the tag's
    /// best location alone. Used on recovery's hot catch-up path to stay
    /// off the cross-replica merge; prior epochs still merge.
    pub fn peek_single(&self, begin: Version, tag: Tag) -> Box<dyn PeekCursor> {
        let peek_end = self.peek_end();
        let best = best_location(tag, self.log_servers.len());
        let current_server = best.map(|b| self.log_servers[b].clone());
        match self.old_log_data.first() {
            None => Box::new(ServerPeekCursor::new(current_server, tag, begin, peek_end)),
            Some(newest) if begin >= newest.epoch_end => {
                Box::new(ServerPeekCursor::new(current_server, tag, begin, peek_end))
            }
            Some(newest) => {
                let mut cursors = self.prior_cursors(begin, tag, false);
                cursors.push(Box::new(ServerPeekCursor::new(
                    current_server,
                    tag,
                    newest.epoch_end,
                    peek_end,
                )));
                Box::new(MultiCursor::new(cursors))
            }
        }
    }

    /// Merged cursors over the prior epochs covering `[begin, prior[0].epoch_end)`,
    /// ordered oldest epoch first.
    fn prior_cursors(
        &self,
        begin: Version,
        tag: Tag,
        parallel_get_more: bool,
    ) -> Vec<Box<dyn PeekCursor>> {
        let mut cursors: Vec<Box<dyn PeekCursor>> = Vec::new();
        for (i, old) in self.old_log_data.iter().enumerate() {
            if begin >= old.epoch_end {
                break;
            }
            let old_begin = match self.old_log_data.get(i + 1) {
                Some(older) => older.epoch_end.max(begin),
                None => begin,
            };
            cursors.push(Box::new(MergedPeekCursor::new(
                &old.log_servers,
                best_location(tag, old.log_servers.len()),
                tag,
                old_begin,
                old.epoch_end,
                parallel_get_more,
                &old.localities,
                &old.policy,
                old.replication_factor,
            )));
        }
        cursors.reverse();
        cursors
    }

    fn merged_current(
        &self,
        tag: Tag,
        begin: Version,
        end: Version,
        parallel_get_more: bool,
    ) -> MergedPeekCursor {
        MergedPeekCursor::new(
            &self.log_servers,
            best_location(tag, self.log_servers.len()),
            tag,
            begin,
            end,
            parallel_get_more,
            &self.localities,
            &self.policy,
            self.replication_factor,
        )
    }

    /// Liveness handshake: resolves once `|servers| − W` TLogs confirm they
    /// are still accepting commits. The caller supplies its own deadline.
    pub fn confirm_epoch_live(
        &self,
        debug_id: Option<Uuid>,
    ) -> impl Future<Output = LogResult<()>> + Send + 'static {
        let mut alive: Vec<BoxFuture<'static, LogResult<()>>> = Vec::new();
        for handle in &self.log_servers {
            match handle.get().interf() {
                Some(interf) => {
                    let client = interf.client().clone();
                    alive.push(
                        async move {
                            match client.confirm_running(debug_id).await {
                                Ok(()) => Ok(()),
                                // A vanished endpoint is indistinguishable
                                // from a slow one here; let the quorum decide.
                                Err(TransportError::BrokenPromise) => {
                                    std::future::pending().await
                                }
                                Err(e) => Err(e.into()),
                            }
                        }
                        .boxed(),
                    );
                }
                None => alive.push(std::future::pending().boxed()),
            }
        }
        let required = alive.len().saturating_sub(self.write_anti_quorum);
        quorum(alive, required)
    }

    /// Resolves with the fatal error once the epoch stops working: a
    /// current TLog failed past the configured timeout, or a background
    /// actor surfaced an error.
    pub async fn on_error(&self) -> EngineError {
        if self.log_servers.is_empty() {
            return std::future::pending().await;
        }
        let mut failed: Vec<BoxFuture<'static, LogResult<()>>> = Vec::new();
        for handle in &self.log_servers {
            if let Some(interf) = handle.get().interf() {
                let client = interf.client().clone();
                let timeout = self.knobs.tlog_timeout;
                failed.push(
                    async move {
                        wait_failure_client(client, timeout).await;
                        Ok(())
                    }
                    .boxed(),
                );
            }
        }
        if failed.is_empty() {
            return EngineError::Internal("no live tlogs to monitor");
        }
        tokio::select! {
            _ = quorum(failed, 1) => EngineError::MasterTLogFailed,
            e = self.actors.first_error() => e,
        }
    }

    /// Serialize this system into a coordinated state record. Prior epochs
    /// are elided once recovery completion is known (or durably recorded).
    pub fn to_core_state(&self) -> LogResult<CoreState> {
        let recovery_status = {
            let guard = self.recovery.lock().expect("recovery lock");
            guard.as_ref().map(|h| h.status.borrow().clone())
        };
        if let Some(Some(Err(e))) = &recovery_status {
            return Err(e.clone());
        }
        let recovery_ready = matches!(recovery_status, Some(Some(Ok(()))));

        let localities: Vec<LocalityData> = self
            .log_servers
            .iter()
            .enumerate()
            .map(|(i, handle)| match handle.get().interf() {
                Some(t) => t.locality.clone(),
                None => self.localities.get(i).cloned().unwrap_or_default(),
            })
            .collect();

        let old_tlog_data = if recovery_ready || self.recovery_written.load(Ordering::Acquire) {
            Vec::new()
        } else {
            self.old_log_data
                .iter()
                .map(|old| OldTLogCoreState {
                    tlogs: old.log_servers.iter().map(|h| h.get().id()).collect(),
                    replication_factor: old.replication_factor,
                    write_anti_quorum: old.write_anti_quorum,
                    policy: old.policy.clone(),
                    localities: old.localities.clone(),
                    epoch_end: old.epoch_end,
                })
                .collect()
        };

        Ok(CoreState {
            log_system_type: self.log_system_type,
            tlogs: self.log_servers.iter().map(|h| h.get().id()).collect(),
            replication_factor: self.replication_factor,
            write_anti_quorum: self.write_anti_quorum,
            policy: self.policy.clone(),
            localities,
            old_tlog_data,
        })
    }

    /// Fires exactly when the aggregate recovery-finished signal completes,
    /// telling the caller to re-persist a trimmed state. Pends forever if
    /// it already fired.
    pub async fn on_core_state_changed(&self) -> LogResult<()> {
        let rx = {
            let guard = self.recovery.lock().expect("recovery lock");
            guard.as_ref().map(|h| h.status.clone())
        };
        let Some(mut rx) = rx else {
            return Err(EngineError::Internal(
                "on_core_state_changed without recovery in progress",
            ));
        };
        if rx.borrow().is_some() {
            return std::future::pending().await;
        }
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Note that the caller durably persisted `state`. Once a state with no
    /// prior epochs is durable, later snapshots may drop them too.
    pub fn core_state_written(&self, state: &CoreState) {
        if state.old_tlog_data.is_empty() {
            self.recovery_written.store(true, Ordering::Release);
        }
    }

    /// Transport-friendly snapshot for the controller.
    pub fn get_log_system_config(&self) -> LogSystemConfig {
        let old_tlogs = if self.recovery_written.load(Ordering::Acquire) {
            Vec::new()
        } else {
            self.old_log_data
                .iter()
                .map(|old| OldTLogConf {
                    tlogs: old.log_servers.iter().map(|h| h.get()).collect(),
                    replication_factor: old.replication_factor,
                    write_anti_quorum: old.write_anti_quorum,
                    policy: old.policy.clone(),
                    localities: old.localities.clone(),
                    epoch_end: old.epoch_end,
                })
                .collect()
        };
        LogSystemConfig {
            log_system_type: self.log_system_type,
            replication_factor: self.replication_factor,
            write_anti_quorum: self.write_anti_quorum,
            policy: self.policy.clone(),
            localities: self.localities.clone(),
            tlogs: self.log_servers.iter().map(|h| h.get()).collect(),
            old_tlogs,
        }
    }

    /// Compact `(id, address)` listing for discovery.
    pub fn logs_value(&self) -> LogResult<Bytes> {
        let endpoint = |interf: OptionalInterface| LogEndpoint {
            id: interf.id(),
            address: interf.interf().map(|t| t.address.clone()),
        };
        let value = LogsValue {
            logs: self.log_servers.iter().map(|h| endpoint(h.get())).collect(),
            old_logs: if self.recovery_written.load(Ordering::Acquire) {
                Vec::new()
            } else {
                self.old_log_data
                    .iter()
                    .flat_map(|old| old.log_servers.iter().map(|h| endpoint(h.get())))
                    .collect()
            },
        };
        serde_json::to_vec(&value)
            .map(Bytes::from)
            .map_err(|_| EngineError::Internal("logs value serialization"))
    }

    /// Fires when any server handle (current or prior epoch) changes.
    pub fn on_log_system_config_change(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut changes: Vec<BoxFuture<'static, ()>> = Vec::new();
        for handle in &self.log_servers {
            changes.push(handle.on_change().boxed());
        }
        for old in &self.old_log_data {
            for handle in &old.log_servers {
                changes.push(handle.on_change().boxed());
            }
        }
        wait_for_any(changes)
    }

    /// For each tag, its best location plus policy-selected replicas,
    /// deduplicated. Fails with an internal error if the policy cannot be
    /// satisfied, which is an impossible configuration.
    pub fn get_push_locations(&self, tags: &[Tag], locations: &mut Vec<usize>) -> LogResult<()> {
        select_push_locations(
            &self.localities,
            &self.policy,
            self.log_servers.len(),
            tags,
            locations,
        )
    }

    /// `tag mod |servers|`, the replica that always carries the tag.
    pub fn best_location_for(&self, tag: Tag) -> Option<usize> {
        best_location(tag, self.log_servers.len())
    }

    /// First version of the epoch after this (frozen) one.
    pub fn end_version(&self) -> LogResult<Version> {
        match self.epoch_end_version {
            Some(end) => Ok(end + 1),
            None => Err(EngineError::Internal("end_version of an unfrozen epoch")),
        }
    }

    /// Exclusive upper bound for peeks: just past the frozen end, or
    /// unbounded while the epoch is live.
    pub fn peek_end(&self) -> Version {
        match self.epoch_end_version {
            Some(end) => end + 1,
            None => Version::MAX,
        }
    }

    /// The frozen end version, if the epoch-end machine set one.
    pub fn epoch_end_version(&self) -> Option<Version> {
        self.epoch_end_version
    }

    /// Lower bound on durably committed versions.
    pub fn known_committed_version(&self) -> Version {
        self.known_committed_version
    }

    /// Tags recovered from lock replies at epoch end.
    pub fn epoch_end_tags(&self) -> &BTreeSet<Tag> {
        &self.epoch_end_tags
    }

    /// Number of current-epoch servers.
    pub fn log_server_count(&self) -> usize {
        self.log_servers.len()
    }

    /// Drop this system's reference to the rejoin tracker.
    pub fn stop_rejoins(&self) {
        *self.rejoins.lock().expect("rejoins lock") = None;
    }

    /// Debug id of this system.
    pub fn debug_id(&self) -> Uuid {
        self.dbgid
    }
}

impl fmt::Debug for TagPartitionedLogSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagPartitionedLogSystem")
            .field("dbgid", &self.dbgid)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TagPartitionedLogSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, handle) in self.log_servers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", handle.get().id())?;
        }
        Ok(())
    }
}

impl OldLogData {
    fn from_conf(conf: &OldTLogConf) -> Self {
        Self {
            log_servers: conf
                .tlogs
                .iter()
                .map(|interf| server_handle(interf.clone()))
                .collect(),
            replication_factor: conf.replication_factor,
            write_anti_quorum: conf.write_anti_quorum,
            policy: conf.policy.clone(),
            localities: conf.localities.clone(),
            epoch_end: conf.epoch_end,
        }
    }
}

/// `tag mod n`, or `None` with no servers.
pub(crate) fn best_location(tag: Tag, server_count: usize) -> Option<usize> {
    if server_count == 0 {
        None
    } else {
        Some(tag.0 as usize % server_count)
    }
}

/// Best locations for `tags`, deduplicated, extended by the policy
/// evaluator until the set satisfies `policy`.
pub(crate) fn select_push_locations(
    localities: &[LocalityData],
    policy: &ReplicationPolicy,
    server_count: usize,
    tags: &[Tag],
    locations: &mut Vec<usize>,
) -> LogResult<()> {
    for tag in tags {
        if let Some(best) = best_location(*tag, server_count) {
            locations.push(best);
        }
    }
    locations.sort_unstable();
    locations.dedup();

    let set = LocalitySet::from_localities(localities);
    let mut additional = Vec::new();
    if !set.select_replicas(policy, locations, &mut additional) {
        return Err(EngineError::Internal(
            "push locations cannot satisfy replication policy",
        ));
    }
    locations.extend(additional);
    Ok(())
}

/// Wrap one commit so its failure modes map the way the epoch expects: a
/// vanished endpoint means the epoch's write quorum is in doubt; a stopped
/// TLog is quiet; anything else is logged and re-thrown.
async fn report_tlog_commit_errors(
    client: Option<Arc<dyn TLogClient>>,
    request: CommitRequest,
    dbgid: Uuid,
) -> LogResult<()> {
    let debug_id = request.debug_id;
    let result = match client {
        Some(client) => client.commit(request).await,
        None => Err(TransportError::BrokenPromise),
    };
    match result {
        Ok(()) => Ok(()),
        Err(TransportError::BrokenPromise) => Err(EngineError::MasterTLogFailed),
        // Classified as silent by is_cancellation: the quorum still sees
        // the failure, but the background collection never reports it.
        Err(TransportError::Stopped) => Err(TransportError::Stopped.into()),
        Err(e) => {
            error!(dbgid = %dbgid, ?debug_id, error = %e, "tlog commit request error");
            Err(e.into())
        }
    }
}
