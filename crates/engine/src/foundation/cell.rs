//! Observable value cells.

use std::future::Future;

use tokio::sync::watch;

/// A value plus a change-broadcast channel.
///
/// Many readers observe the cell; mutation wakes every subscriber that
/// registered before the mutation. Built on `tokio::sync::watch`, whose
/// receivers see any change made after they subscribe, which is exactly the
/// at-least-once guarantee the handle protocol needs.
#[derive(Debug)]
pub struct AsyncCell<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> AsyncCell<T> {
    /// A cell holding `initial`.
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value and wake subscribers even if the new value is
    /// logically equal to the old one.
    pub fn set_unconditional(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Resolves on the next mutation after this call.
    pub fn on_change(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            // An Err means the cell was dropped, which is a change too.
            let _ = rx.changed().await;
        }
    }

    /// A long-lived subscription for loops that wait repeatedly.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + Send + Sync + PartialEq + 'static> AsyncCell<T> {
    /// Replace the value, waking subscribers only if it actually changed.
    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }
}
