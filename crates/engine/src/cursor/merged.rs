//! Cross-replica merged cursor.

use async_trait::async_trait;
use futures::future::join_all;

use taglog_locality::{LocalityData, LocalitySet, ReplicationPolicy};

use crate::cursor::{PeekCursor, ServerPeekCursor};
use crate::error::LogResult;
use crate::foundation::{Tag, TaggedMessage, Version};
use crate::interface::ServerHandle;

/// Merges one epoch's replicas into a single per-tag stream.
///
/// Polls the smallest replica set whose agreement constitutes a read quorum
/// (`|servers| + 1 − F` members): the tag's best location as primary plus
/// policy-satisfying replicas for cross-check. Output is merged by version;
/// duplicates of the same version are resolved to one message.
pub struct MergedPeekCursor {
    cursors: Vec<ServerPeekCursor>,
    parallel_get_more: bool,
    version: Version,
}

impl MergedPeekCursor {
    /// Cursor over `[begin, end)` for `tag` across `servers`.
    ///
    /// `best` is the tag's preferred location (`None` only when the server
    /// list is empty). `parallel_get_more` issues look-ahead fetches to all
    /// polled replicas at once instead of one at a time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        servers: &[ServerHandle],
        best: Option<usize>,
        tag: Tag,
        begin: Version,
        end: Version,
        parallel_get_more: bool,
        localities: &[LocalityData],
        policy: &ReplicationPolicy,
        replication_factor: usize,
    ) -> Self {
        let members = Self::polled_members(servers.len(), best, localities, policy, replication_factor);
        let cursors = members
            .into_iter()
            .map(|i| ServerPeekCursor::new(Some(servers[i].clone()), tag, begin, end))
            .collect();
        Self {
            cursors,
            parallel_get_more,
            version: begin,
        }
    }

    /// Pick the replica indices to poll: best location first, then replicas
    /// chosen by the policy evaluator, padded in index order up to the read
    /// quorum size.
    fn polled_members(
        server_count: usize,
        best: Option<usize>,
        localities: &[LocalityData],
        policy: &ReplicationPolicy,
        replication_factor: usize,
    ) -> Vec<usize> {
        if server_count == 0 {
            return Vec::new();
        }
        let read_quorum = server_count + 1 - replication_factor.min(server_count);

        let mut members = Vec::new();
        if let Some(best) = best {
            members.push(best);
        }
        let set = LocalitySet::from_localities(localities);
        let mut additional = Vec::new();
        if set.select_replicas(policy, &members, &mut additional) {
            members.extend(additional);
        }
        for i in 0..server_count {
            if members.len() >= read_quorum {
                break;
            }
            if !members.contains(&i) {
                members.push(i);
            }
        }
        members
    }

    /// Every polled replica must have reported a head (or proven itself
    /// exhausted) before a version can be served; agreement of the polled
    /// set is what makes the minimum version globally minimal.
    async fn fill_heads(&mut self) -> LogResult<()> {
        if self.parallel_get_more {
            let fetches = self
                .cursors
                .iter_mut()
                .filter(|c| c.head().is_none() && !c.is_done())
                .map(|c| c.fill());
            for result in join_all(fetches).await {
                result?;
            }
        } else {
            for cursor in &mut self.cursors {
                if cursor.head().is_none() && !cursor.is_done() {
                    cursor.fill().await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PeekCursor for MergedPeekCursor {
    async fn next(&mut self) -> LogResult<Option<TaggedMessage>> {
        self.fill_heads().await?;

        let lowest = self
            .cursors
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.head().map(|m| (i, m.version)))
            .min_by_key(|&(_, v)| v);
        let Some((index, version)) = lowest else {
            return Ok(None);
        };

        let Some(message) = self.cursors[index].pop_head() else {
            return Err(crate::error::EngineError::Internal(
                "merged cursor head vanished",
            ));
        };
        for (i, cursor) in self.cursors.iter_mut().enumerate() {
            if i != index {
                cursor.discard_through(version);
            }
        }
        self.version = version + 1;
        Ok(Some(message))
    }

    fn version(&self) -> Version {
        self.cursors
            .iter()
            .filter(|c| !c.is_done())
            .map(|c| c.version())
            .min()
            .unwrap_or(self.version)
            .max(self.version)
    }
}
