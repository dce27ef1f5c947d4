//! Single-server peek cursor.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::cursor::PeekCursor;
use crate::error::LogResult;
use crate::foundation::{Tag, TaggedMessage, Version};
use crate::interface::{PeekRequest, ServerHandle};

/// Streams one tag from one log server, catching up while behind the
/// server's durable head and tailing once level with it.
pub struct ServerPeekCursor {
    server: Option<ServerHandle>,
    tag: Tag,
    next_version: Version,
    end: Version,
    buffer: VecDeque<TaggedMessage>,
    done: bool,
}

impl ServerPeekCursor {
    /// Cursor over `[begin, end)` for `tag`. With no server the cursor is
    /// empty.
    pub fn new(server: Option<ServerHandle>, tag: Tag, begin: Version, end: Version) -> Self {
        Self {
            server,
            tag,
            next_version: begin,
            end,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Fetch until at least one message is buffered or the cursor is
    /// exhausted. Waits out interface absence; transport errors propagate.
    pub(crate) async fn fill(&mut self) -> LogResult<()> {
        while self.buffer.is_empty() && !self.done {
            if self.next_version >= self.end {
                self.done = true;
                break;
            }
            let Some(server) = self.server.clone() else {
                self.done = true;
                break;
            };
            let current = server.get();
            let Some(handle) = current.interf().cloned() else {
                server.on_change().await;
                continue;
            };
            let reply = handle
                .client()
                .peek(PeekRequest {
                    tag: self.tag,
                    begin: self.next_version,
                    end: Some(self.end),
                })
                .await?;
            for message in reply.messages {
                if message.version >= self.next_version && message.version < self.end {
                    self.buffer.push_back(message);
                }
            }
            if self.buffer.is_empty() {
                if reply.end > self.next_version {
                    // The tag was silent over [next_version, reply.end).
                    self.next_version = reply.end.min(self.end);
                } else {
                    // The server can prove it has nothing further.
                    self.done = true;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn head(&self) -> Option<&TaggedMessage> {
        self.buffer.front()
    }

    pub(crate) fn pop_head(&mut self) -> Option<TaggedMessage> {
        let message = self.buffer.pop_front();
        if let Some(m) = &message {
            self.next_version = m.version + 1;
        }
        message
    }

    /// Drop everything at or below `version`, buffered or not. Used by the
    /// merged cursor to resolve cross-replica duplicates.
    pub(crate) fn discard_through(&mut self, version: Version) {
        while self
            .buffer
            .front()
            .is_some_and(|m| m.version <= version)
        {
            self.buffer.pop_front();
        }
        if self.next_version <= version {
            self.next_version = version + 1;
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done && self.buffer.is_empty()
    }
}

#[async_trait]
impl PeekCursor for ServerPeekCursor {
    async fn next(&mut self) -> LogResult<Option<TaggedMessage>> {
        self.fill().await?;
        Ok(self.pop_head())
    }

    fn version(&self) -> Version {
        match self.head() {
            Some(m) => m.version,
            None => self.next_version,
        }
    }
}
