//! In-memory RemoteLog implementation for testing and development.
//!
//! Models the server-side consumer-group machinery the coordination layer
//! depends on: per-group delivery cursors, pending-entry lists with delivery
//! timestamps, auto-claim scanning with cursor paging, and trim/delete. State
//! lives behind a single async mutex, so every operation is atomic the way the
//! real server's commands are.
//!
//! The log also counts remote calls, which lets tests assert that
//! capability-gated operations fail before touching the backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::backend::{
    ClaimPage, ConsumerRecord, GroupInfo, GroupReadStart, RemoteLog, StreamEntry, StreamMetadata,
};
use crate::error::{Error, Result};
use crate::id::MessageId;

/// In-memory implementation of [`RemoteLog`].
pub struct InMemoryLog {
    inner: Mutex<State>,
    calls: AtomicU64,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    last_generated: MessageId,
    groups: HashMap<String, GroupState>,
}

struct GroupState {
    last_delivered: MessageId,
    consumers: HashMap<String, ()>,
    pending: BTreeMap<MessageId, PendingEntry>,
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

impl StreamState {
    fn entry(&self, id: MessageId) -> Option<&StreamEntry> {
        self.entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|i| &self.entries[i])
    }
}

fn no_group(stream: &str, group: &str) -> Error {
    Error::Capability(format!(
        "no consumer group '{group}' exists on stream '{stream}'"
    ))
}

impl InMemoryLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(State::default()),
            calls: AtomicU64::new(0),
        }
    }

    /// Total number of remote operations performed against this log.
    pub fn remote_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Append an entry with an explicit id, like XADD with a caller-supplied
    /// id. The id must be greater than the last generated one.
    pub async fn append_with_id(
        &self,
        stream: &str,
        id: MessageId,
        fields: Vec<(String, String)>,
    ) -> Result<()> {
        let mut state = self.inner.lock().await;
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        if id <= stream_state.last_generated && !stream_state.entries.is_empty() {
            return Err(Error::Configuration(format!(
                "id {id} is not greater than the stream's last generated id"
            )));
        }
        stream_state.entries.push(StreamEntry { id, fields });
        stream_state.last_generated = id;
        Ok(())
    }

    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn next_id(stream_state: &StreamState) -> MessageId {
        let now_ms = Utc::now().timestamp_millis();
        let last = stream_state.last_generated;
        if now_ms > last.ms {
            MessageId::new(now_ms, 0)
        } else {
            MessageId::new(last.ms, last.seq + 1)
        }
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteLog for InMemoryLog {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<MessageId> {
        self.tick();
        let mut state = self.inner.lock().await;
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        let id = Self::next_id(stream_state);
        stream_state.entries.push(StreamEntry {
            id,
            fields: fields.to_vec(),
        });
        stream_state.last_generated = id;
        Ok(id)
    }

    async fn read_range(
        &self,
        stream: &str,
        after: MessageId,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.tick();
        let state = self.inner.lock().await;
        let Some(stream_state) = state.streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(stream_state
            .entries
            .iter()
            .filter(|e| e.id > after)
            .take(count)
            .cloned()
            .collect())
    }

    async fn group_create(&self, stream: &str, group: &str, start: MessageId) -> Result<()> {
        self.tick();
        let mut state = self.inner.lock().await;
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Err(Error::Capability(format!(
                "stream '{stream}' does not exist"
            )));
        };
        stream_state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: start,
                consumers: HashMap::new(),
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: GroupReadStart,
        count: usize,
        auto_ack: bool,
    ) -> Result<Vec<StreamEntry>> {
        self.tick();
        let mut state = self.inner.lock().await;
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Err(no_group(stream, group));
        };
        // Split borrows: deliveries need the entry list and the group state.
        let entries = &stream_state.entries;
        let Some(group_state) = stream_state.groups.get_mut(group) else {
            return Err(no_group(stream, group));
        };
        // The server creates the consumer implicitly on first read.
        group_state.consumers.entry(consumer.to_string()).or_default();

        match start {
            GroupReadStart::New => {
                let delivered: Vec<StreamEntry> = entries
                    .iter()
                    .filter(|e| e.id > group_state.last_delivered)
                    .take(count)
                    .cloned()
                    .collect();
                for entry in &delivered {
                    group_state.last_delivered = entry.id;
                    if !auto_ack {
                        group_state.pending.insert(
                            entry.id,
                            PendingEntry {
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                                delivery_count: 1,
                            },
                        );
                    }
                }
                Ok(delivered)
            }
            GroupReadStart::Pending(marker) => {
                let own: Vec<MessageId> = group_state
                    .pending
                    .range((
                        std::ops::Bound::Excluded(marker),
                        std::ops::Bound::Unbounded,
                    ))
                    .filter(|(_, p)| p.consumer == consumer)
                    .map(|(id, _)| *id)
                    .take(count)
                    .collect();
                let mut delivered = Vec::with_capacity(own.len());
                for id in own {
                    if let Some(pending) = group_state.pending.get_mut(&id) {
                        pending.delivered_at = Instant::now();
                        pending.delivery_count += 1;
                    }
                    if let Ok(pos) = entries.binary_search_by_key(&id, |e| e.id) {
                        delivered.push(entries[pos].clone());
                    }
                }
                Ok(delivered)
            }
        }
    }

    async fn acknowledge(&self, stream: &str, group: &str, ids: &[MessageId]) -> Result<i64> {
        self.tick();
        let mut state = self.inner.lock().await;
        let group_state = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        let mut removed = 0;
        for id in ids {
            if group_state.pending.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: MessageId,
        count: usize,
    ) -> Result<ClaimPage> {
        self.tick();
        let mut state = self.inner.lock().await;
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Err(no_group(stream, group));
        };
        let entries = &stream_state.entries;
        let Some(group_state) = stream_state.groups.get_mut(group) else {
            return Err(no_group(stream, group));
        };

        let candidates: Vec<MessageId> = group_state
            .pending
            .range(cursor..)
            .map(|(id, _)| *id)
            .collect();

        let mut claimed = Vec::new();
        let mut next_cursor = MessageId::BEGINNING;
        for id in candidates {
            if claimed.len() >= count {
                next_cursor = id;
                break;
            }
            let eligible = group_state
                .pending
                .get(&id)
                .is_some_and(|p| p.delivered_at.elapsed() >= min_idle);
            if !eligible {
                continue;
            }
            match entries.binary_search_by_key(&id, |e| e.id) {
                Ok(found) => {
                    if let Some(pending) = group_state.pending.get_mut(&id) {
                        pending.consumer = consumer.to_string();
                        pending.delivered_at = Instant::now();
                        pending.delivery_count += 1;
                    }
                    claimed.push(entries[found].clone());
                }
                // The entry was trimmed or deleted; the server drops the
                // dangling pending reference during the claim scan.
                Err(_) => {
                    group_state.pending.remove(&id);
                }
            }
        }

        group_state.consumers.entry(consumer.to_string()).or_default();
        Ok(ClaimPage {
            entries: claimed,
            next_cursor,
        })
    }

    async fn consumer_create(&self, stream: &str, group: &str, consumer: &str) -> Result<bool> {
        self.tick();
        let mut state = self.inner.lock().await;
        let group_state = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        Ok(group_state
            .consumers
            .insert(consumer.to_string(), ())
            .is_none())
    }

    async fn consumer_delete(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        force: bool,
    ) -> Result<bool> {
        self.tick();
        let mut state = self.inner.lock().await;
        let group_state = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        let pending: Vec<MessageId> = group_state
            .pending
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .map(|(id, _)| *id)
            .collect();
        if !force && !pending.is_empty() {
            return Ok(false);
        }
        for id in pending {
            group_state.pending.remove(&id);
        }
        group_state.consumers.remove(consumer);
        Ok(true)
    }

    async fn consumer_list(&self, stream: &str, group: &str) -> Result<Vec<ConsumerRecord>> {
        self.tick();
        let state = self.inner.lock().await;
        let group_state = state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        let mut records: Vec<ConsumerRecord> = group_state
            .consumers
            .keys()
            .map(|name| {
                let pending_count = group_state
                    .pending
                    .values()
                    .filter(|p| p.consumer == *name)
                    .count() as i64;
                let idle = group_state
                    .pending
                    .values()
                    .filter(|p| p.consumer == *name)
                    .map(|p| p.delivered_at.elapsed())
                    .min()
                    .unwrap_or(Duration::ZERO);
                ConsumerRecord {
                    name: name.clone(),
                    pending_count,
                    idle,
                }
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn group_list(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        self.tick();
        let state = self.inner.lock().await;
        let Some(stream_state) = state.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let mut groups: Vec<GroupInfo> = stream_state
            .groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                last_delivered_id: g.last_delivered.to_string(),
                pending_count: g.pending.len() as i64,
                consumer_count: g.consumers.len() as i64,
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn stream_info(&self, stream: &str) -> Result<Option<StreamMetadata>> {
        self.tick();
        let state = self.inner.lock().await;
        let Some(stream_state) = state.streams.get(stream) else {
            return Ok(None);
        };
        Ok(Some(StreamMetadata {
            length: stream_state.entries.len() as i64,
            first_entry: stream_state.entries.first().cloned(),
            last_generated_id: stream_state.last_generated,
        }))
    }

    async fn key_exists(&self, stream: &str) -> Result<bool> {
        self.tick();
        let state = self.inner.lock().await;
        Ok(state.streams.contains_key(stream))
    }

    async fn key_delete(&self, stream: &str) -> Result<bool> {
        self.tick();
        let mut state = self.inner.lock().await;
        Ok(state.streams.remove(stream).is_some())
    }

    async fn trim(&self, stream: &str, min_id: MessageId, _approximate: bool) -> Result<i64> {
        self.tick();
        let mut state = self.inner.lock().await;
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let before = stream_state.entries.len();
        stream_state.entries.retain(|e| e.id >= min_id);
        Ok((before - stream_state.entries.len()) as i64)
    }

    async fn delete(&self, stream: &str, ids: &[MessageId]) -> Result<i64> {
        self.tick();
        let mut state = self.inner.lock().await;
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let before = stream_state.entries.len();
        stream_state.entries.retain(|e| !ids.contains(&e.id));
        Ok((before - stream_state.entries.len()) as i64)
    }

    async fn memory_usage(&self, stream: &str) -> Result<i64> {
        self.tick();
        let state = self.inner.lock().await;
        let Some(stream_state) = state.streams.get(stream) else {
            return Ok(0);
        };
        let bytes: usize = stream_state
            .entries
            .iter()
            .map(|e| {
                16 + e
                    .fields
                    .iter()
                    .map(|(k, v)| k.len() + v.len())
                    .sum::<usize>()
            })
            .sum();
        Ok(bytes as i64)
    }
}
