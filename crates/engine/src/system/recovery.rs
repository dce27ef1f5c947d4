//! The epoch-end recovery state machine.
//!
//! Locks a co-quorum of the previous epoch's TLogs so no further versions
//! can be committed, computes the highest version provably committed by the
//! old write quorum, and publishes a frozen log system for every safe point
//! it finds. Publication can move *backwards* (to an earlier safe point)
//! when responders fail after a higher end was advertised; it never needs
//! to move forward, because a higher end proves nothing new.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taglog_locality::{
    describe_values, keys, validate_all_combinations, LocalityData, LocalityEntry, LocalitySet,
};

use crate::config::LogKnobs;
use crate::core_state::CoreState;
use crate::error::{EngineError, LogResult, TransportError};
use crate::foundation::{wait_for_any, AsyncCell, Tag, Version};
use crate::interface::{
    server_handle, LockReply, OptionalInterface, ServerHandle, TLogRejoinRequest, TransportResult,
};
use crate::system::failure::monitor_log;
use crate::system::rejoin::track_rejoins;
use crate::system::{OldLogData, TagPartitionedLogSystem};

/// Lock the previous epoch and continuously publish the best-known frozen
/// log system to `out`. Never returns normally.
pub(crate) async fn epoch_end(
    out: watch::Sender<Option<Arc<TagPartitionedLogSystem>>>,
    dbgid: Uuid,
    knobs: Arc<LogKnobs>,
    prev_state: CoreState,
    rejoin_requests: mpsc::Receiver<TLogRejoinRequest>,
    locality: LocalityData,
) -> LogResult<()> {
    prev_state.validate()?;

    if prev_state.tlogs.is_empty() {
        // Brand new database: publish an empty frozen system and block.
        let mut system = TagPartitionedLogSystem::base(dbgid, locality, knobs);
        system.log_system_type = prev_state.log_system_type;
        system.replication_factor = prev_state.replication_factor;
        system.write_anti_quorum = prev_state.write_anti_quorum;
        system.policy = prev_state.policy.clone();
        system.localities = prev_state.localities.clone();
        system.epoch_end_version = Some(0);
        system.known_committed_version = 0;
        let _ = out.send(Some(Arc::new(system)));
        std::future::pending::<()>().await;
        return Err(EngineError::Internal("epoch end resumed after never"));
    }

    let n = prev_state.tlogs.len();
    let f = prev_state.replication_factor;
    let w = prev_state.write_anti_quorum;

    // To exclude a replica set consisting entirely of servers that missed
    // the write quorum or are unavailable, the absent count plus W must be
    // strictly less than F: (N − locked) + W < F, so R = N + 1 − F + W.
    if !(1..=n).contains(&f) || w >= n {
        return Err(EngineError::Internal("impossible prior epoch configuration"));
    }
    let required = n + 1 - f + w;
    if !(1..=n).contains(&required) {
        return Err(EngineError::Internal("impossible required lock count"));
    }

    let locality_of = |i: usize| prev_state.localities.get(i).cloned().unwrap_or_default();

    let log_servers: Vec<ServerHandle> = prev_state
        .tlogs
        .iter()
        .map(|&id| server_handle(OptionalInterface::id_only(id)))
        .collect();
    let mut all_servers = log_servers.clone();
    let old_log_data: Vec<OldLogData> = prev_state
        .old_tlog_data
        .iter()
        .map(|old| {
            let servers: Vec<ServerHandle> = old
                .tlogs
                .iter()
                .map(|&id| server_handle(OptionalInterface::id_only(id)))
                .collect();
            all_servers.extend(servers.iter().cloned());
            OldLogData {
                log_servers: servers,
                replication_factor: old.replication_factor,
                write_anti_quorum: old.write_anti_quorum,
                policy: old.policy.clone(),
                localities: old.localities.clone(),
                epoch_end: old.epoch_end,
            }
        })
        .collect();

    let log_failed: Vec<Arc<AsyncCell<bool>>> =
        (0..n).map(|_| Arc::new(AsyncCell::new(false))).collect();
    let _failure_trackers: Vec<AbortOnDropHandle<()>> = log_servers
        .iter()
        .zip(&log_failed)
        .map(|(server, failed)| {
            AbortOnDropHandle::new(tokio::spawn(monitor_log(
                server.clone(),
                failed.clone(),
                knobs.clone(),
            )))
        })
        .collect();

    let rejoins = Arc::new(AbortOnDropHandle::new(tokio::spawn(track_rejoins(
        dbgid,
        all_servers,
        rejoin_requests,
    ))));

    // lock_tx must outlive the loop so the reply channel never closes.
    let (lock_tx, mut lock_rx) = mpsc::unbounded_channel::<(usize, TransportResult<LockReply>)>();
    let _lock_tasks: Vec<AbortOnDropHandle<()>> = log_servers
        .iter()
        .enumerate()
        .map(|(i, server)| {
            let tx = lock_tx.clone();
            let server = server.clone();
            AbortOnDropHandle::new(tokio::spawn(async move {
                let result = lock_tlog(dbgid, server).await;
                let _ = tx.send((i, result));
            }))
        })
        .collect();

    let mut lock_replies: Vec<Option<TransportResult<LockReply>>> = vec![None; n];
    let mut epoch_end_tags: BTreeSet<Tag> = BTreeSet::new();
    let mut last_end: Option<Version> = None;
    let mut cycles = 0u64;

    loop {
        cycles += 1;

        // Subscribe before reading state so a mutation landing between the
        // two cannot be missed.
        let mut changes: Vec<BoxFuture<'static, ()>> = Vec::new();
        for i in 0..n {
            if lock_replies[i].is_some() {
                changes.push(log_servers[i].on_change().boxed());
                changes.push(log_failed[i].on_change().boxed());
            }
        }

        let mut ready: Vec<LockReply> = Vec::new();
        let mut available: Vec<LocalityEntry> = Vec::new();
        let mut unresponsive = LocalitySet::new();
        for i in 0..n {
            match &lock_replies[i] {
                Some(Ok(reply)) if !log_failed[i].get() => {
                    ready.push(reply.clone());
                    available.push(LocalityEntry {
                        key: i,
                        locality: locality_of(i),
                    });
                }
                _ => unresponsive.add(i, locality_of(i)),
            }
        }

        let mut too_many_failures = ready.len() <= w
            || (unresponsive.len() >= f && unresponsive.validate(&prev_state.policy));

        if !too_many_failures && w > 0 {
            let mut offending = Vec::new();
            if !validate_all_combinations(
                &mut offending,
                &unresponsive,
                &prev_state.policy,
                &available,
                w,
                false,
            ) {
                warn!(
                    dbgid = %dbgid,
                    cycles,
                    present = ready.len(),
                    absent = n - ready.len(),
                    anti_quorum = w,
                    ?offending,
                    "epoch end: bad anti-quorum combination"
                );
                too_many_failures = true;
            }
        }

        if !too_many_failures {
            ready.sort_by_key(|reply| reply.end);
            let new_safe_begin = w.min(ready.len() - 1);
            let end = ready[new_safe_begin].end;
            let mut known_committed_version =
                end.saturating_sub(knobs.max_read_transaction_life_versions);
            for reply in &ready {
                known_committed_version = known_committed_version.max(reply.known_committed_version);
            }

            // Publish on the first safe point, and again whenever the safe
            // point retreats because the responder set shrank.
            if last_end.is_none_or(|last| end < last) {
                info!(
                    dbgid = %dbgid,
                    cycles,
                    total_servers = n,
                    present = ready.len(),
                    absent = n - ready.len(),
                    replication_factor = f,
                    anti_quorum = w,
                    policy = %prev_state.policy,
                    last_end = ?last_end,
                    end_version = end,
                    known_committed_version,
                    "log system recovery"
                );
                last_end = Some(end);

                let mut system =
                    TagPartitionedLogSystem::base(dbgid, locality.clone(), knobs.clone());
                system.log_system_type = prev_state.log_system_type;
                system.log_servers = log_servers.clone();
                system.old_log_data = old_log_data.clone();
                system.replication_factor = f;
                system.write_anti_quorum = w;
                system.policy = prev_state.policy.clone();
                system.localities = prev_state.localities.clone();
                system.epoch_end_version = Some(end);
                system.known_committed_version = known_committed_version;
                system.epoch_end_tags = epoch_end_tags.clone();
                *system.rejoins.lock().expect("rejoins lock") = Some(rejoins.clone());
                let _ = out.send(Some(Arc::new(system)));
            } else {
                debug!(
                    dbgid = %dbgid,
                    cycles,
                    end_version = end,
                    last_end = ?last_end,
                    "log system recovery unchanged"
                );
            }
        } else {
            info!(
                dbgid = %dbgid,
                cycles,
                total_servers = n,
                present = ready.len(),
                absent = n - ready.len(),
                replication_factor = f,
                anti_quorum = w,
                log_zones = %describe_values(prev_state.localities.iter(), keys::ZONE_ID),
                "log system waiting for recovery"
            );
        }

        tokio::select! {
            Some((i, result)) = lock_rx.recv() => {
                if let Ok(reply) = &result {
                    // Tag coverage is the union over every reply collected,
                    // so it only grows even as responders come and go.
                    epoch_end_tags.extend(reply.tags.iter().copied());
                }
                lock_replies[i] = Some(result);
            }
            () = wait_for_any(changes) => {}
        }
    }
}

/// Lock one TLog: send the lock request, retrying across handle changes. A
/// vanished endpoint just waits for the handle to change again; any other
/// transport error surrenders the slot.
pub(crate) async fn lock_tlog(dbgid: Uuid, server: ServerHandle) -> TransportResult<LockReply> {
    info!(dbgid = %dbgid, tlog = %server.get().id(), "tlog lock started");
    loop {
        let current = server.get();
        match current.interf() {
            Some(handle) => {
                let client = handle.client().clone();
                tokio::select! {
                    result = client.lock() => match result {
                        Ok(reply) => {
                            info!(dbgid = %dbgid, tlog = %current.id(), end = reply.end, "tlog locked");
                            return Ok(reply);
                        }
                        Err(TransportError::BrokenPromise) => server.on_change().await,
                        Err(e) => return Err(e),
                    },
                    () = server.on_change() => {}
                }
            }
            None => server.on_change().await,
        }
    }
}
