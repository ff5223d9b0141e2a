//! Client-side batching of message acknowledgments.
//!
//! Acknowledging every message individually costs a server round trip each.
//! The buffer accumulates read-but-unacknowledged ids and sends them in one
//! batch once a configured threshold is reached, or when the owner flushes
//! explicitly.
//!
//! A failed flush leaves the buffer untouched: acknowledgment is idempotent at
//! the server, so retrying the same batch is always safe, while clearing it on
//! failure could silently lose acknowledgments.

use tracing::debug;

use crate::backend::RemoteLog;
use crate::error::Result;
use crate::id::MessageId;

/// Buffer of acknowledgments waiting to be sent to the server.
///
/// Owned exclusively by one stream handle; not internally synchronized.
#[derive(Debug)]
pub struct AckBuffer {
    ids: Vec<MessageId>,
    max_pending: usize,
    flush_count: u64,
}

impl AckBuffer {
    /// Create a buffer that auto-flushes once `max_pending` ids accumulate.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            ids: Vec::new(),
            max_pending: max_pending.max(1),
            flush_count: 0,
        }
    }

    /// Queue an acknowledgment. When the buffer reaches its threshold this
    /// flushes synchronously before returning, so the buffer is always below
    /// the threshold afterwards.
    pub async fn add(
        &mut self,
        backend: &dyn RemoteLog,
        stream: &str,
        group: &str,
        id: MessageId,
    ) -> Result<()> {
        self.ids.push(id);
        if self.ids.len() >= self.max_pending {
            self.flush(backend, stream, group).await?;
        }
        Ok(())
    }

    /// Send the whole buffer in one batch-acknowledge call.
    ///
    /// Returns the count the server reports as acknowledged, which can be
    /// lower than the batch size when an id was already acknowledged. The
    /// buffer is cleared only after the server confirms the batch.
    pub async fn flush(
        &mut self,
        backend: &dyn RemoteLog,
        stream: &str,
        group: &str,
    ) -> Result<i64> {
        if self.ids.is_empty() {
            return Ok(0);
        }
        let acknowledged = backend.acknowledge(stream, group, &self.ids).await?;
        debug!(
            stream,
            group,
            batch = self.ids.len(),
            acknowledged,
            "flushed pending acknowledgments"
        );
        self.ids.clear();
        self.flush_count += 1;
        Ok(acknowledged)
    }

    /// Number of acknowledgments waiting to be sent.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// How many non-empty flushes have completed.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    /// Reset the flush statistic.
    pub fn reset_statistics(&mut self) {
        self.flush_count = 0;
    }
}
