//! Failure tracking: turning health probes into observable boolean cells.

use std::sync::Arc;
use std::time::Duration;

use crate::config::LogKnobs;
use crate::foundation::AsyncCell;
use crate::interface::{ServerHandle, TLogClient};

/// Drive `failed` from one server's health probe. When the handle is
/// absent, `failed` is forced true; whenever the handle changes, the probe
/// restarts against the new interface. Never returns.
pub(crate) async fn monitor_log(
    server: ServerHandle,
    failed: Arc<AsyncCell<bool>>,
    knobs: Arc<LogKnobs>,
) {
    loop {
        let current = server.get();
        match current.interf() {
            Some(handle) => {
                let client = handle.client().clone();
                tokio::select! {
                    () = server.on_change() => {}
                    () = failure_probe(client, failed.clone(), knobs.tlog_timeout) => {}
                }
            }
            None => {
                failed.set(true);
                server.on_change().await;
            }
        }
    }
}

/// Ping forever, mirroring health into the cell.
async fn failure_probe(client: Arc<dyn TLogClient>, failed: Arc<AsyncCell<bool>>, timeout: Duration) {
    loop {
        match tokio::time::timeout(timeout, client.ping()).await {
            Ok(Ok(())) => failed.set(false),
            _ => failed.set(true),
        }
        tokio::time::sleep(timeout).await;
    }
}

/// Resolves once the server goes unresponsive past `timeout`. Used by
/// `on_error` to watch the current cohort.
pub(crate) async fn wait_failure_client(client: Arc<dyn TLogClient>, timeout: Duration) {
    loop {
        match tokio::time::timeout(timeout, client.ping()).await {
            Ok(Ok(())) => tokio::time::sleep(timeout).await,
            _ => return,
        }
    }
}
