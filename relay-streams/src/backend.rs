//! The abstract remote-log surface the coordination layer is written against.
//!
//! Semantics match Redis Streams: `append` is XADD, `group_read` is
//! XREADGROUP, `auto_claim` is XAUTOCLAIM, and so on. The production
//! implementation is [`crate::redis_log::RedisLog`]; tests and development use
//! [`crate::memory::InMemoryLog`]. All cross-consumer coordination relies on
//! the atomicity of these primitives — the layer adds no locking of its own.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::id::MessageId;

/// One entry in a stream: its id plus an ordered list of field/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: MessageId,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Look up a field value by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Snapshot of one registered consumer within a group.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    /// The consumer name (the textual application id).
    pub name: String,
    /// Entries delivered to this consumer and not yet acknowledged.
    pub pending_count: i64,
    /// Time since the consumer last interacted with the server.
    pub idle: Duration,
}

/// Snapshot of one consumer group's delivery state on a stream.
///
/// `last_delivered_id` is kept in its wire form; the vitals computation parses
/// it so a malformed id surfaces as a format error rather than being skipped.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub last_delivered_id: String,
    pub pending_count: i64,
    pub consumer_count: i64,
}

/// Metadata about a stream key.
#[derive(Debug, Clone)]
pub struct StreamMetadata {
    /// Number of entries currently stored.
    pub length: i64,
    /// The oldest stored entry, if any.
    pub first_entry: Option<StreamEntry>,
    /// The greatest id the server has generated for this stream.
    pub last_generated_id: MessageId,
}

/// One page of claimed entries plus the cursor for the next page.
#[derive(Debug, Clone)]
pub struct ClaimPage {
    /// Entries whose ownership was reassigned to the claiming consumer.
    pub entries: Vec<StreamEntry>,
    /// Where the next claim scan should resume. [`MessageId::BEGINNING`] means
    /// the whole pending list was examined.
    pub next_cursor: MessageId,
}

impl ClaimPage {
    /// True when eligible entries may remain beyond this page.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.next_cursor != MessageId::BEGINNING
    }
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupReadStart {
    /// Messages never delivered to any consumer in the group.
    New,
    /// Redeliver this consumer's own pending entries with ids greater than
    /// the marker.
    Pending(MessageId),
}

/// Abstract operations consumed from the remote log service.
///
/// Implementations must treat "already exists" responses from the idempotent
/// setup calls (`group_create`, `consumer_create`) as success. No method
/// retries; timeout and reconnect policy belong to the implementation.
#[async_trait]
pub trait RemoteLog: Send + Sync {
    /// Append one entry; the server assigns and returns its id.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<MessageId>;

    /// Simple (non-group) read of up to `count` entries with ids greater than
    /// `after`.
    async fn read_range(
        &self,
        stream: &str,
        after: MessageId,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Create a consumer group reading from `start`. Succeeds if the group
    /// already exists.
    async fn group_create(&self, stream: &str, group: &str, start: MessageId) -> Result<()>;

    /// Group read for `consumer`, up to `count` entries. With `auto_ack` the
    /// server acknowledges on delivery and nothing enters the pending list.
    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: GroupReadStart,
        count: usize,
        auto_ack: bool,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge the given ids for the group; returns how many the server
    /// actually removed from the pending list.
    async fn acknowledge(&self, stream: &str, group: &str, ids: &[MessageId]) -> Result<i64>;

    /// Atomically reassign up to `count` pending entries idle for at least
    /// `min_idle` to `consumer`, scanning from `cursor`.
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: MessageId,
        count: usize,
    ) -> Result<ClaimPage>;

    /// Register a consumer name in the group. Returns true when the record was
    /// newly created, false when the name already existed.
    async fn consumer_create(&self, stream: &str, group: &str, consumer: &str) -> Result<bool>;

    /// Delete a consumer record. Without `force` the deletion is refused
    /// (returns false) while the consumer still has pending entries; with
    /// `force` those entries are discarded.
    async fn consumer_delete(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        force: bool,
    ) -> Result<bool>;

    /// List the consumers registered in a group.
    async fn consumer_list(&self, stream: &str, group: &str) -> Result<Vec<ConsumerRecord>>;

    /// List every consumer group on the stream.
    async fn group_list(&self, stream: &str) -> Result<Vec<GroupInfo>>;

    /// Stream metadata, or `None` if the key does not exist.
    async fn stream_info(&self, stream: &str) -> Result<Option<StreamMetadata>>;

    /// Whether the stream key exists.
    async fn key_exists(&self, stream: &str) -> Result<bool>;

    /// Delete the stream key entirely, entries and groups alike. Returns
    /// whether the key existed.
    async fn key_delete(&self, stream: &str) -> Result<bool>;

    /// Remove entries with ids strictly below `min_id`. With `approximate` the
    /// server may keep a few extra entries for efficiency. Returns the number
    /// removed.
    async fn trim(&self, stream: &str, min_id: MessageId, approximate: bool) -> Result<i64>;

    /// Delete specific entries. Returns the number actually removed.
    async fn delete(&self, stream: &str, ids: &[MessageId]) -> Result<i64>;

    /// Approximate memory footprint of the stream key in bytes.
    async fn memory_usage(&self, stream: &str) -> Result<i64>;
}
