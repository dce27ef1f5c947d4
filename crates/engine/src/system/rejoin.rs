//! The rejoin tracker: log servers from prior and current epochs announce
//! their interfaces here after the coordinator restarts.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::foundation::LogServerId;
use crate::interface::{OptionalInterface, ServerHandle, TLogRejoinRequest};

/// Match rejoin requests to the handle list by server identity and keep the
/// handles current. The most recent reply promise per server is retained; a
/// superseding rejoin tells the prior one it is stale, and shutdown tells
/// every retained one the same.
pub(crate) async fn track_rejoins(
    dbgid: Uuid,
    servers: Vec<ServerHandle>,
    mut requests: mpsc::Receiver<TLogRejoinRequest>,
) {
    let mut last_reply: HashMap<LogServerId, oneshot::Sender<bool>> = HashMap::new();

    while let Some(request) = requests.recv().await {
        let id = request.interface.id;
        match servers.iter().find(|handle| handle.get().id() == id) {
            Some(handle) => {
                info!(dbgid = %dbgid, tlog = %id, address = %request.interface.address, "tlog joined me");
                let current = handle.get();
                let endpoint_changed = match current.interf() {
                    None => true,
                    Some(known) => known.address != request.interface.address,
                };
                if endpoint_changed {
                    // Unconditional so subscribers see a change event even
                    // when the interfaces compare equal.
                    handle.set_unconditional(OptionalInterface::from_handle(
                        request.interface.clone(),
                    ));
                }
                if let Some(previous) = last_reply.insert(id, request.reply) {
                    let _ = previous.send(true);
                }
            }
            None => {
                warn!(dbgid = %dbgid, tlog = %id, "tlog joined me, unknown");
                let _ = request.reply.send(true);
            }
        }
    }

    for (_, reply) in last_reply {
        let _ = reply.send(true);
    }
}
