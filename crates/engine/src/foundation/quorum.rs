//! Quorum waits and the background actor collection.

use std::future::Future;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, LogResult};

/// Resolve once `required` of the given futures have succeeded.
///
/// Fails early with the most recent error as soon as success becomes
/// impossible (more than `len - required` failures).
pub async fn quorum(futures: Vec<BoxFuture<'static, LogResult<()>>>, required: usize) -> LogResult<()> {
    if required == 0 {
        return Ok(());
    }
    let total = futures.len();
    if required > total {
        return Err(EngineError::Internal("quorum larger than participant count"));
    }

    let mut pending: FuturesUnordered<_> = futures.into_iter().collect();
    let mut successes = 0usize;
    let mut failures = 0usize;
    let mut last_error = None;
    while let Some(result) = pending.next().await {
        match result {
            Ok(()) => {
                successes += 1;
                if successes >= required {
                    return Ok(());
                }
            }
            Err(e) => {
                failures += 1;
                if failures > total - required {
                    return Err(e);
                }
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(EngineError::Internal("quorum participants vanished")))
}

/// Resolve when any of the given futures resolves. With no futures, pends
/// forever.
pub async fn wait_for_any(futures: Vec<BoxFuture<'static, ()>>) {
    if futures.is_empty() {
        return std::future::pending().await;
    }
    let _ = futures::future::select_all(futures).await;
}

/// A task group that never blocks completion but surfaces the first failure.
///
/// Members are detached from their spawner: their errors flow into the
/// collection's error channel even after the handle that created them is
/// gone. Dropping the collection cancels every member, which makes
/// log-system teardown structural.
#[derive(Debug)]
pub struct ActorCollection {
    errors_tx: mpsc::UnboundedSender<EngineError>,
    errors_rx: Mutex<mpsc::UnboundedReceiver<EngineError>>,
    cancel: CancellationToken,
}

impl ActorCollection {
    /// An empty collection.
    pub fn new() -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            errors_tx,
            errors_rx: Mutex::new(errors_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn `task` into the collection. Cancellation errors are swallowed;
    /// anything else is reported through [`ActorCollection::first_error`].
    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = LogResult<()>> + Send + 'static,
    {
        let errors = self.errors_tx.clone();
        let token = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                result = task => {
                    if let Err(e) = result {
                        if !e.is_cancellation() {
                            let _ = errors.send(e);
                        }
                    }
                }
            }
        });
    }

    /// Resolves with the first error produced by any member; pends forever
    /// if none ever fails.
    pub async fn first_error(&self) -> EngineError {
        let mut rx = self.errors_rx.lock().await;
        match rx.recv().await {
            Some(e) => e,
            // All senders gone means the collection itself is going away.
            None => std::future::pending().await,
        }
    }
}

impl Default for ActorCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActorCollection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    #[tokio::test]
    async fn quorum_fires_at_required_count() {
        let futures: Vec<BoxFuture<'static, LogResult<()>>> = vec![
            async { Ok(()) }.boxed(),
            async { Ok(()) }.boxed(),
            std::future::pending().boxed(),
        ];
        tokio::time::timeout(Duration::from_secs(1), quorum(futures, 2))
            .await
            .expect("quorum should not need the pending participant")
            .unwrap();
    }

    #[tokio::test]
    async fn quorum_fails_when_impossible() {
        let futures: Vec<BoxFuture<'static, LogResult<()>>> = vec![
            async { Err(EngineError::MasterTLogFailed) }.boxed(),
            async { Err(EngineError::MasterTLogFailed) }.boxed(),
            async { Ok(()) }.boxed(),
        ];
        let err = quorum(futures, 3).await.unwrap_err();
        assert_eq!(err, EngineError::MasterTLogFailed);
    }

    #[tokio::test]
    async fn actor_collection_surfaces_first_error() {
        let actors = ActorCollection::new();
        actors.add(async { Ok(()) });
        actors.add(async { Err(EngineError::MasterTLogFailed) });
        let err = tokio::time::timeout(Duration::from_secs(1), actors.first_error())
            .await
            .unwrap();
        assert_eq!(err, EngineError::MasterTLogFailed);
    }

    #[tokio::test]
    async fn cancellation_is_silent() {
        let actors = ActorCollection::new();
        actors.add(async { Err(EngineError::Cancelled) });
        let fired = tokio::time::timeout(Duration::from_millis(50), actors.first_error())
            .await
            .is_ok();
        assert!(!fired);
    }
}
