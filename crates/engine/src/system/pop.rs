//! The pop coordinator: per-(server, tag) background advancement of the
//! durably-popped version.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use tracing::{error, info};

use crate::error::{LogResult, TransportError};
use crate::foundation::{Tag, Version};
use crate::interface::PopRequest;
use crate::system::TagPartitionedLogSystem;

/// One outstanding-pop entry: the highest version any caller has requested,
/// and whether the background task for the pair is still running. An entry
/// with a dead task means a transport error stopped traffic to that server;
/// the next pop call revives it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OutstandingPop {
    pub(crate) version: Version,
    pub(crate) task_alive: bool,
}

impl TagPartitionedLogSystem {
    /// Record that everything below `up_to` for `tag` may be discarded, on
    /// every current server. Fire-and-forget: the per-pair background task
    /// coalesces bursts of calls into single monotone pop requests.
    pub fn pop(self: &Arc<Self>, up_to: Version, tag: Tag) {
        if self.log_servers.is_empty() || up_to == 0 {
            return;
        }
        for log in 0..self.log_servers.len() {
            let mut spawn = false;
            match self.outstanding_pops.entry((log, tag)) {
                Entry::Occupied(mut entry) => {
                    let outstanding = entry.get_mut();
                    if outstanding.version < up_to {
                        outstanding.version = up_to;
                    }
                    if !outstanding.task_alive {
                        outstanding.task_alive = true;
                        spawn = true;
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(OutstandingPop {
                        version: up_to,
                        task_alive: true,
                    });
                    spawn = true;
                }
            }
            if spawn {
                self.actors
                    .add(pop_from_log(Arc::downgrade(self), log, tag));
            }
        }
    }
}

/// One (server, tag) pop task.
///
/// Each tick it re-reads the outstanding target, exiting (and erasing the
/// entry) once no progress remains; a later `pop` call respawns it. On a
/// transport error the task exits but the entry stays with its task marked
/// dead, which stops further pop traffic to that TLog until the next pop
/// call. Holds only a weak reference to the system so long-lived pop loops
/// cannot keep a torn-down epoch alive.
pub(crate) async fn pop_from_log(
    weak: Weak<TagPartitionedLogSystem>,
    log: usize,
    tag: Tag,
) -> LogResult<()> {
    let mut last_sent: Version = 0;
    loop {
        let delay = match weak.upgrade() {
            Some(system) => system.knobs.pop_retry_delay,
            None => return Ok(()),
        };
        tokio::time::sleep(delay).await;

        let Some(system) = weak.upgrade() else {
            return Ok(());
        };

        let Some(to) = system
            .outstanding_pops
            .get(&(log, tag))
            .map(|entry| entry.version)
        else {
            return Ok(());
        };
        if to <= last_sent {
            system
                .outstanding_pops
                .remove_if(&(log, tag), |_, entry| entry.version <= last_sent);
            // A concurrent pop may have raised the target between the read
            // and the removal; if so, keep going.
            if system.outstanding_pops.contains_key(&(log, tag)) {
                continue;
            }
            return Ok(());
        }

        let interf = system.log_servers[log].get();
        let Some(handle) = interf.interf().cloned() else {
            mark_task_dead(&system, log, tag);
            return Ok(());
        };
        let dbgid = system.dbgid;
        drop(system);

        match handle.client().pop(PopRequest { tag, up_to: to }).await {
            Ok(()) => last_sent = to,
            Err(e) => {
                // The entry stays behind on purpose: no more pop traffic to
                // this server until the next pop call revives the task.
                if matches!(e, TransportError::BrokenPromise) {
                    info!(dbgid = %dbgid, tlog = %interf.id(), %tag, error = %e, "log pop error");
                } else {
                    error!(dbgid = %dbgid, tlog = %interf.id(), %tag, error = %e, "log pop error");
                }
                if let Some(system) = weak.upgrade() {
                    mark_task_dead(&system, log, tag);
                }
                return Ok(());
            }
        }
    }
}

fn mark_task_dead(system: &TagPartitionedLogSystem, log: usize, tag: Tag) {
    if let Some(mut entry) = system.outstanding_pops.get_mut(&(log, tag)) {
        entry.task_alive = false;
    }
}
