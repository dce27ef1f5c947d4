//! Lazy per-tag message streams.
//!
//! Three cursor kinds sit behind one contract: [`ServerPeekCursor`] streams
//! from a single log server, [`MergedPeekCursor`] merges a read quorum of
//! replicas within one epoch, and [`MultiCursor`] stitches cursors across
//! epoch boundaries. The variants are closed, so the hierarchy is a trait
//! over three concrete types rather than an open inheritance scheme.

use async_trait::async_trait;

use crate::error::LogResult;
use crate::foundation::{TaggedMessage, Version};

mod merged;
mod multi;
mod server;

pub use merged::MergedPeekCursor;
pub use multi::MultiCursor;
pub use server::ServerPeekCursor;

/// A lazy stream of one tag's messages in strictly increasing version
/// order.
#[async_trait]
pub trait PeekCursor: Send {
    /// The next message, or `None` once the cursor's bound is reached.
    /// Transport errors surface to the consumer without retry at this
    /// layer; retrying is the consumer's call, at epoch granularity.
    async fn next(&mut self) -> LogResult<Option<TaggedMessage>>;

    /// The lowest version this cursor may still yield.
    fn version(&self) -> Version;
}
