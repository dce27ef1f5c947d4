//! New-epoch construction: recruiting a fresh TLog cohort seeded with the
//! recovered prior epoch.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::task::AbortOnDropHandle;
use tracing::{info, warn};
use uuid::Uuid;

use taglog_locality::ReplicationPolicy;

use crate::core_state::LogSystemType;
use crate::error::{EngineError, LogResult};
use crate::foundation::{LogEpoch, StoreType, Tag};
use crate::interface::{
    server_handle, InitializeTLogRequest, OptionalInterface, TLogHandle, WorkerHandle,
};
use crate::system::{select_push_locations, OldLogData, RecoveryHandle, TagPartitionedLogSystem};

/// Configuration for the epoch being constructed.
#[derive(Debug, Clone)]
pub struct EpochConfig {
    /// Replication factor for the new epoch.
    pub replication_factor: usize,
    /// Write anti-quorum for the new epoch.
    pub write_anti_quorum: usize,
    /// Replication policy for the new epoch.
    pub policy: ReplicationPolicy,
    /// Store type recruited TLogs should run.
    pub store_type: StoreType,
}

/// Build the epoch immediately following `old`, which must be frozen. The
/// result is provisional until the caller persists its core state.
pub(crate) async fn new_epoch(
    old: &Arc<TagPartitionedLogSystem>,
    workers: Vec<WorkerHandle>,
    config: EpochConfig,
    recovery_count: LogEpoch,
) -> LogResult<Arc<TagPartitionedLogSystem>> {
    let Some(recover_at) = old.epoch_end_version else {
        return Err(EngineError::Internal("new epoch from an unfrozen system"));
    };
    let recruitment_id = Uuid::new_v4();

    let mut system =
        TagPartitionedLogSystem::base(old.dbgid, old.locality.clone(), old.knobs.clone());
    system.log_system_type = LogSystemType::TagPartitioned;
    system.replication_factor = config.replication_factor;
    system.write_anti_quorum = config.write_anti_quorum;
    system.policy = config.policy.clone();

    // The recovered epoch becomes prior[0], readable up to the version
    // after its known committed version; older epochs ride along behind it.
    if !old.log_servers.is_empty() {
        system.old_log_data.push(OldLogData {
            log_servers: old.log_servers.clone(),
            replication_factor: old.replication_factor,
            write_anti_quorum: old.write_anti_quorum,
            policy: old.policy.clone(),
            localities: old.localities.clone(),
            epoch_end: old.known_committed_version + 1,
        });
    }
    system.old_log_data.extend(old.old_log_data.iter().cloned());

    system.localities = workers.iter().map(|w| w.locality.clone()).collect();

    // Route every recovered tag to the worker slots that must be able to
    // serve it under the new policy.
    let mut recover_tags: Vec<Vec<Tag>> = vec![Vec::new(); workers.len()];
    for &tag in &old.epoch_end_tags {
        let mut locations = Vec::new();
        select_push_locations(
            &system.localities,
            &config.policy,
            workers.len(),
            &[tag],
            &mut locations,
        )?;
        for location in locations {
            recover_tags[location].push(tag);
        }
    }

    let recover_from = old.get_log_system_config();
    let request_timeout = old.knobs.recovery_request_timeout();

    info!(
        dbgid = %old.dbgid,
        recruitment_id = %recruitment_id,
        workers = workers.len(),
        recover_at,
        known_committed_version = old.known_committed_version,
        epoch = recovery_count,
        "initializing tlog cohort"
    );

    let replies = join_all(workers.iter().enumerate().map(|(i, worker)| {
        let request = InitializeTLogRequest {
            recruitment_id,
            store_type: config.store_type,
            recover_from: recover_from.clone(),
            recover_at,
            known_committed_version: old.known_committed_version,
            epoch: recovery_count,
            recover_tags: recover_tags[i].clone(),
        };
        let client = worker.client().clone();
        let dbgid = old.dbgid;
        async move {
            match tokio::time::timeout(request_timeout, client.initialize_tlog(request)).await {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(e)) => {
                    warn!(dbgid = %dbgid, worker = i, error = %e, "tlog initialization failed");
                    Err(EngineError::MasterRecoveryFailed)
                }
                Err(_) => {
                    warn!(dbgid = %dbgid, worker = i, "tlog initialization timed out");
                    Err(EngineError::MasterRecoveryFailed)
                }
            }
        }
    }))
    .await;

    let mut handles: Vec<TLogHandle> = Vec::with_capacity(replies.len());
    for reply in replies {
        handles.push(reply?);
    }

    system.log_servers = handles
        .iter()
        .map(|handle| server_handle(OptionalInterface::from_handle(handle.clone())))
        .collect();

    // The aggregate of the recovery-finished replies becomes the system's
    // recovery-complete signal, consumed through on_core_state_changed.
    let (status_tx, status_rx) = watch::channel(None);
    let finishes: Vec<_> = handles
        .iter()
        .map(|handle| {
            let client = handle.client().clone();
            async move {
                match tokio::time::timeout(request_timeout, client.recovery_finished()).await {
                    Ok(Ok(())) => Ok(()),
                    _ => Err(EngineError::MasterRecoveryFailed),
                }
            }
        })
        .collect();
    let task = AbortOnDropHandle::new(tokio::spawn(async move {
        let result = futures::future::try_join_all(finishes).await.map(|_| ());
        let _ = status_tx.send(Some(result));
    }));
    *system.recovery.lock().expect("recovery lock") = Some(RecoveryHandle {
        status: status_rx,
        _task: task,
    });

    Ok(Arc::new(system))
}
