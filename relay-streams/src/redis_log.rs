//! Redis Streams implementation of [`RemoteLog`].
//!
//! Commands are issued through a [`ConnectionManager`], which multiplexes one
//! connection and reconnects on failure; cloning it is cheap and every call
//! works on its own clone. Replies with nested shapes (XREADGROUP, XAUTOCLAIM,
//! XINFO) are parsed from [`redis::Value`] by hand — the shapes differ between
//! RESP2 and RESP3 and the helpers below accept both.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Value};
use tracing::{debug, instrument};

use crate::backend::{
    ClaimPage, ConsumerRecord, GroupInfo, GroupReadStart, RemoteLog, StreamEntry, StreamMetadata,
};
use crate::error::{Error, Result};
use crate::id::MessageId;

/// Redis-backed remote log.
#[derive(Clone)]
pub struct RedisLog {
    conn: ConnectionManager,
}

impl RedisLog {
    /// Connect to a Redis server, e.g. `redis://127.0.0.1:6379/`.
    #[instrument(skip(url))]
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!("connected to redis");
        Ok(Self { conn })
    }

    /// Wrap an existing managed connection.
    #[must_use]
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// Translate a group-scoped command failure: a missing group is a capability
/// problem of this client, not a transport fault.
fn map_group_error(err: RedisError, stream: &str, group: &str) -> Error {
    if err.code() == Some("NOGROUP") {
        Error::Capability(format!(
            "consumer group '{group}' does not exist on stream '{stream}'"
        ))
    } else {
        Error::Transport(err)
    }
}

fn unexpected(context: &'static str) -> Error {
    Error::Transport(RedisError::from((
        ErrorKind::TypeError,
        "unexpected reply shape",
        context.to_string(),
    )))
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().ok(),
        Value::SimpleString(s) => s.parse().ok(),
        _ => None,
    }
}

/// Flatten an info-style reply (RESP2 flat key/value array or RESP3 map) into
/// key/value pairs.
fn kv_pairs(value: &Value) -> Result<Vec<(String, Value)>> {
    match value {
        Value::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| {
                as_string(k)
                    .map(|k| (k, v.clone()))
                    .ok_or_else(|| unexpected("map key"))
            })
            .collect(),
        Value::Array(items) => items
            .chunks_exact(2)
            .map(|pair| {
                as_string(&pair[0])
                    .map(|k| (k, pair[1].clone()))
                    .ok_or_else(|| unexpected("array key"))
            })
            .collect(),
        _ => Err(unexpected("key/value reply")),
    }
}

fn lookup<'a>(pairs: &'a [(String, Value)], key: &str) -> Option<&'a Value> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// One stream entry: `[id, [field, value, ...]]`.
fn parse_entry(value: &Value) -> Result<StreamEntry> {
    let Value::Array(parts) = value else {
        return Err(unexpected("stream entry"));
    };
    let id_text = parts
        .first()
        .and_then(as_string)
        .ok_or_else(|| unexpected("entry id"))?;
    let id: MessageId = id_text.parse()?;

    let fields = match parts.get(1) {
        Some(Value::Array(raw)) => raw
            .chunks_exact(2)
            .map(|pair| {
                match (as_string(&pair[0]), as_string(&pair[1])) {
                    (Some(k), Some(v)) => Ok((k, v)),
                    _ => Err(unexpected("entry field")),
                }
            })
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Map(raw)) => raw
            .iter()
            .map(|(k, v)| match (as_string(k), as_string(v)) {
                (Some(k), Some(v)) => Ok((k, v)),
                _ => Err(unexpected("entry field")),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Nil) | None => Vec::new(),
        Some(_) => return Err(unexpected("entry fields")),
    };

    Ok(StreamEntry { id, fields })
}

/// An array of entries. Nil placeholders (trimmed entries still referenced by
/// a pending list) are skipped.
fn parse_entries(value: &Value) -> Result<Vec<StreamEntry>> {
    let Value::Array(items) = value else {
        return Err(unexpected("entry list"));
    };
    items
        .iter()
        .filter(|item| !matches!(item, Value::Nil))
        .map(parse_entry)
        .collect()
}

/// XREAD/XREADGROUP reply: per-stream `[name, entries]` records (or a map in
/// RESP3). We only ever ask for one stream, so the first record's entries are
/// the result. Nil means nothing was available.
fn parse_read_reply(value: &Value) -> Result<Vec<StreamEntry>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Array(streams) => match streams.first() {
            None => Ok(Vec::new()),
            Some(Value::Array(record)) => {
                let entries = record.get(1).ok_or_else(|| unexpected("stream record"))?;
                parse_entries(entries)
            }
            Some(_) => Err(unexpected("stream record")),
        },
        Value::Map(streams) => match streams.first() {
            None => Ok(Vec::new()),
            Some((_, entries)) => parse_entries(entries),
        },
        _ => Err(unexpected("read reply")),
    }
}

/// XAUTOCLAIM reply: `[next-cursor, entries, deleted-ids]` (the third element
/// appeared in Redis 7 and is ignored — the referenced entries are gone).
fn parse_autoclaim_reply(value: &Value) -> Result<ClaimPage> {
    let Value::Array(parts) = value else {
        return Err(unexpected("autoclaim reply"));
    };
    let cursor_text = parts
        .first()
        .and_then(as_string)
        .ok_or_else(|| unexpected("autoclaim cursor"))?;
    let next_cursor: MessageId = cursor_text.parse()?;
    let entries = parts
        .get(1)
        .map(parse_entries)
        .transpose()?
        .unwrap_or_default();
    Ok(ClaimPage {
        entries,
        next_cursor,
    })
}

/// XINFO CONSUMERS reply: one key/value record per consumer.
fn parse_consumers_reply(value: &Value) -> Result<Vec<ConsumerRecord>> {
    let Value::Array(items) = value else {
        return Err(unexpected("consumers reply"));
    };
    items
        .iter()
        .map(|item| {
            let pairs = kv_pairs(item)?;
            let name = lookup(&pairs, "name")
                .and_then(as_string)
                .ok_or_else(|| unexpected("consumer name"))?;
            let pending_count = lookup(&pairs, "pending").and_then(as_i64).unwrap_or(0);
            let idle_ms = lookup(&pairs, "idle").and_then(as_i64).unwrap_or(0);
            Ok(ConsumerRecord {
                name,
                pending_count,
                idle: Duration::from_millis(idle_ms.max(0) as u64),
            })
        })
        .collect()
}

/// XINFO GROUPS reply: one key/value record per group.
fn parse_groups_reply(value: &Value) -> Result<Vec<GroupInfo>> {
    let Value::Array(items) = value else {
        return Err(unexpected("groups reply"));
    };
    items
        .iter()
        .map(|item| {
            let pairs = kv_pairs(item)?;
            let name = lookup(&pairs, "name")
                .and_then(as_string)
                .ok_or_else(|| unexpected("group name"))?;
            let last_delivered_id = lookup(&pairs, "last-delivered-id")
                .and_then(as_string)
                .ok_or_else(|| unexpected("group last-delivered-id"))?;
            Ok(GroupInfo {
                name,
                last_delivered_id,
                pending_count: lookup(&pairs, "pending").and_then(as_i64).unwrap_or(0),
                consumer_count: lookup(&pairs, "consumers").and_then(as_i64).unwrap_or(0),
            })
        })
        .collect()
}

/// XINFO STREAM reply.
fn parse_stream_info_reply(value: &Value) -> Result<StreamMetadata> {
    let pairs = kv_pairs(value)?;
    let length = lookup(&pairs, "length").and_then(as_i64).unwrap_or(0);
    let last_generated_id = lookup(&pairs, "last-generated-id")
        .and_then(as_string)
        .ok_or_else(|| unexpected("last-generated-id"))?
        .parse()?;
    let first_entry = match lookup(&pairs, "first-entry") {
        None | Some(Value::Nil) => None,
        Some(entry) => Some(parse_entry(entry)?),
    };
    Ok(StreamMetadata {
        length,
        first_entry,
        last_generated_id,
    })
}

#[async_trait]
impl RemoteLog for RedisLog {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<MessageId> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id.parse()?)
    }

    async fn read_range(
        &self,
        stream: &str,
        after: MessageId,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.connection();
        let reply: Value = redis::cmd("XRANGE")
            .arg(stream)
            .arg(format!("({after}"))
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        parse_entries(&reply)
    }

    async fn group_create(&self, stream: &str, group: &str, start: MessageId) -> Result<()> {
        let mut conn = self.connection();
        let result: std::result::Result<Value, RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start.to_string())
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            // The group already exists; that is what we wanted.
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(Error::Transport(err)),
        }
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
        let mut conn = self.connection();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer);
        if auto_ack {
            cmd.arg("NOACK");
        }
        cmd.arg("COUNT").arg(count).arg("STREAMS").arg(stream);
        match start {
            GroupReadStart::New => cmd.arg(">"),
            GroupReadStart::Pending(marker) => cmd.arg(marker.to_string()),
        };
        let reply: Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| map_group_error(err, stream, group))?;
        parse_read_reply(&reply)
    }

    async fn acknowledge(&self, stream: &str, group: &str, ids: &[MessageId]) -> Result<i64> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.to_string());
        }
        let acknowledged: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| map_group_error(err, stream, group))?;
        Ok(acknowledged)
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
        let mut conn = self.connection();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as i64)
            .arg(cursor.to_string())
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_group_error(err, stream, group))?;
        parse_autoclaim_reply(&reply)
    }

    async fn consumer_create(&self, stream: &str, group: &str, consumer: &str) -> Result<bool> {
        let mut conn = self.connection();
        let created: i64 = redis::cmd("XGROUP")
            .arg("CREATECONSUMER")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_group_error(err, stream, group))?;
        Ok(created == 1)
    }

    async fn consumer_delete(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        force: bool,
    ) -> Result<bool> {
        // DELCONSUMER always discards the consumer's pending entries, so the
        // non-forced path has to check for them first.
        if !force {
            let consumers = self.consumer_list(stream, group).await?;
            let has_pending = consumers
                .iter()
                .any(|c| c.name == consumer && c.pending_count > 0);
            if has_pending {
                return Ok(false);
            }
        }
        let mut conn = self.connection();
        let _discarded: i64 = redis::cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_group_error(err, stream, group))?;
        Ok(true)
    }

    async fn consumer_list(&self, stream: &str, group: &str) -> Result<Vec<ConsumerRecord>> {
        let mut conn = self.connection();
        let reply: Value = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_group_error(err, stream, group))?;
        parse_consumers_reply(&reply)
    }

    async fn group_list(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let mut conn = self.connection();
        let reply: Value = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await?;
        parse_groups_reply(&reply)
    }

    async fn stream_info(&self, stream: &str) -> Result<Option<StreamMetadata>> {
        let mut conn = self.connection();
        let result: std::result::Result<Value, RedisError> = redis::cmd("XINFO")
            .arg("STREAM")
            .arg(stream)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(reply) => Ok(Some(parse_stream_info_reply(&reply)?)),
            Err(err)
                if err.kind() == ErrorKind::ResponseError
                    && err.to_string().contains("no such key") =>
            {
                Ok(None)
            }
            Err(err) => Err(Error::Transport(err)),
        }
    }

    async fn key_exists(&self, stream: &str) -> Result<bool> {
        let mut conn = self.connection();
        let found: i64 = redis::cmd("EXISTS")
            .arg(stream)
            .query_async(&mut conn)
            .await?;
        Ok(found > 0)
    }

    async fn key_delete(&self, stream: &str) -> Result<bool> {
        let mut conn = self.connection();
        let removed: i64 = redis::cmd("DEL")
            .arg(stream)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn trim(&self, stream: &str, min_id: MessageId, approximate: bool) -> Result<i64> {
        let mut conn = self.connection();
        let removed: i64 = redis::cmd("XTRIM")
            .arg(stream)
            .arg("MINID")
            .arg(if approximate { "~" } else { "=" })
            .arg(min_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn delete(&self, stream: &str, ids: &[MessageId]) -> Result<i64> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("XDEL");
        cmd.arg(stream);
        for id in ids {
            cmd.arg(id.to_string());
        }
        let removed: i64 = cmd.query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn memory_usage(&self, stream: &str) -> Result<i64> {
        let mut conn = self.connection();
        let bytes: Option<i64> = redis::cmd("MEMORY")
            .arg("USAGE")
            .arg(stream)
            .query_async(&mut conn)
            .await?;
        Ok(bytes.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(text: &str) -> Value {
        Value::BulkString(text.as_bytes().to_vec())
    }

    fn entry_value(id: &str, fields: &[(&str, &str)]) -> Value {
        let mut raw = Vec::new();
        for (k, v) in fields {
            raw.push(bulk(k));
            raw.push(bulk(v));
        }
        Value::Array(vec![bulk(id), Value::Array(raw)])
    }

    #[test]
    fn entry_parsing_reads_id_and_fields() {
        let value = entry_value("7-3", &[("kind", "order"), ("qty", "2")]);
        let entry = parse_entry(&value).unwrap();

        assert_eq!(entry.id, MessageId::new(7, 3));
        assert_eq!(entry.field("kind"), Some("order"));
        assert_eq!(entry.field("qty"), Some("2"));
        assert_eq!(entry.field("missing"), None);
    }

    #[test]
    fn malformed_entry_id_is_a_format_error() {
        let value = entry_value("garbage", &[("k", "v")]);
        assert!(matches!(parse_entry(&value), Err(Error::Format(_))));
    }

    #[test]
    fn nil_placeholders_in_entry_lists_are_skipped() {
        let value = Value::Array(vec![
            entry_value("1-0", &[("k", "a")]),
            Value::Nil,
            entry_value("2-0", &[("k", "b")]),
        ]);
        let entries = parse_entries(&value).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].id, MessageId::new(2, 0));
    }

    #[test]
    fn nil_read_reply_means_no_messages() {
        assert!(parse_read_reply(&Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn read_reply_unwraps_the_single_stream_record() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("orders"),
            Value::Array(vec![entry_value("5-1", &[("k", "v")])]),
        ])]);
        let entries = parse_read_reply(&reply).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, MessageId::new(5, 1));
    }

    #[test]
    fn resp3_read_reply_is_accepted() {
        let reply = Value::Map(vec![(
            bulk("orders"),
            Value::Array(vec![entry_value("5-1", &[("k", "v")])]),
        )]);
        assert_eq!(parse_read_reply(&reply).unwrap().len(), 1);
    }

    #[test]
    fn autoclaim_reply_carries_cursor_and_entries() {
        let reply = Value::Array(vec![
            bulk("9-0"),
            Value::Array(vec![
                entry_value("3-0", &[("k", "v")]),
                entry_value("4-0", &[("k", "v")]),
            ]),
            Value::Array(vec![]),
        ]);
        let page = parse_autoclaim_reply(&reply).unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.next_cursor, MessageId::new(9, 0));
        assert!(page.has_more());
    }

    #[test]
    fn autoclaim_zero_cursor_means_scan_complete() {
        let reply = Value::Array(vec![bulk("0-0"), Value::Array(vec![])]);
        let page = parse_autoclaim_reply(&reply).unwrap();
        assert!(page.entries.is_empty());
        assert!(!page.has_more());
    }

    #[test]
    fn consumers_reply_parses_records() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("name"),
            bulk("3"),
            bulk("pending"),
            Value::Int(4),
            bulk("idle"),
            Value::Int(1500),
        ])]);
        let consumers = parse_consumers_reply(&reply).unwrap();
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].name, "3");
        assert_eq!(consumers[0].pending_count, 4);
        assert_eq!(consumers[0].idle, Duration::from_millis(1500));
    }

    #[test]
    fn groups_reply_keeps_last_delivered_id_as_text() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("name"),
            bulk("billing"),
            bulk("consumers"),
            Value::Int(2),
            bulk("pending"),
            Value::Int(7),
            bulk("last-delivered-id"),
            bulk("12-4"),
        ])]);
        let groups = parse_groups_reply(&reply).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "billing");
        assert_eq!(groups[0].last_delivered_id, "12-4");
        assert_eq!(groups[0].pending_count, 7);
        assert_eq!(groups[0].consumer_count, 2);
    }

    #[test]
    fn stream_info_reply_parses_metadata() {
        let reply = Value::Array(vec![
            bulk("length"),
            Value::Int(12),
            bulk("last-generated-id"),
            bulk("42-1"),
            bulk("first-entry"),
            entry_value("1-0", &[("k", "v")]),
        ]);
        let metadata = parse_stream_info_reply(&reply).unwrap();
        assert_eq!(metadata.length, 12);
        assert_eq!(metadata.last_generated_id, MessageId::new(42, 1));
        assert_eq!(metadata.first_entry.unwrap().id, MessageId::new(1, 0));
    }

    #[test]
    fn stream_info_with_nil_first_entry() {
        let reply = Value::Map(vec![
            (bulk("length"), Value::Int(0)),
            (bulk("last-generated-id"), bulk("42-1")),
            (bulk("first-entry"), Value::Nil),
        ]);
        let metadata = parse_stream_info_reply(&reply).unwrap();
        assert_eq!(metadata.length, 0);
        assert!(metadata.first_entry.is_none());
    }
}
