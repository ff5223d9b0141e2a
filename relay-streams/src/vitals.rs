//! Stream-level statistics and the cross-group watermark.
//!
//! The watermark — the first fully unprocessed id — is the oldest message not
//! yet delivered to every consumer group on the stream. It is the safe lower
//! bound for trimming: everything strictly below it has been delivered to all
//! groups. The group with the smallest last-delivered id is the bottleneck,
//! and a group that has never read anything pins the watermark at the very
//! start. That is deliberate: a silent group blocks trimming rather than
//! having its messages removed out from under it.

use chrono::{DateTime, Utc};

use crate::backend::{GroupInfo, RemoteLog};
use crate::error::Result;
use crate::id::MessageId;

/// A point-in-time snapshot of a stream's state.
///
/// Recomputed in full on every request; treat it as stale the instant it is
/// returned.
#[derive(Debug, Clone)]
pub struct StreamVitals {
    /// Whether the stream key exists on the server.
    pub exists: bool,
    /// Number of entries currently stored.
    pub message_count: i64,
    /// Id of the oldest stored entry, or the beginning sentinel.
    pub oldest_message_id: MessageId,
    /// Wall-clock time of the oldest stored entry.
    pub oldest_message_time: DateTime<Utc>,
    /// Delivery state of every consumer group on the stream.
    pub groups: Vec<GroupInfo>,
    /// The watermark: oldest id not yet delivered to every group.
    pub first_fully_unprocessed_id: MessageId,
    /// Wall-clock time encoded in the watermark.
    pub first_fully_unprocessed_time: DateTime<Utc>,
    /// Approximate memory footprint of the stream key.
    pub size_bytes: i64,
    /// When this snapshot was computed.
    pub computed_at: DateTime<Utc>,
}

impl StreamVitals {
    /// Delivery state for one group, by name.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&GroupInfo> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Whether the named group is registered on the stream.
    #[must_use]
    pub fn has_group(&self, name: &str) -> bool {
        self.group(name).is_some()
    }

    /// Number of consumer groups on the stream.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// The minimum last-delivered id across the groups.
///
/// With no groups at all nothing constrains trimming, so the result is
/// [`MessageId::MAX`]. A malformed last-delivered id is an error, never
/// skipped — a skipped group would make the watermark unsafe for trimming.
fn watermark(groups: &[GroupInfo]) -> Result<MessageId> {
    let mut lowest = MessageId::MAX;
    for group in groups {
        let last_delivered: MessageId = group.last_delivered_id.parse()?;
        lowest = lowest.min(last_delivered);
    }
    Ok(lowest)
}

/// Compute a full vitals snapshot for `stream`.
pub async fn compute(backend: &dyn RemoteLog, stream: &str) -> Result<StreamVitals> {
    let computed_at = Utc::now();

    let Some(metadata) = backend.stream_info(stream).await? else {
        return Ok(StreamVitals {
            exists: false,
            message_count: 0,
            oldest_message_id: MessageId::BEGINNING,
            oldest_message_time: computed_at,
            groups: Vec::new(),
            first_fully_unprocessed_id: MessageId::BEGINNING,
            first_fully_unprocessed_time: computed_at,
            size_bytes: 0,
            computed_at,
        });
    };

    let groups = backend.group_list(stream).await?;
    let size_bytes = backend.memory_usage(stream).await?;

    // A stream whose entries have all been trimmed or deleted still exists and
    // may still carry groups; there is nothing left to anchor the watermark.
    let Some(first_entry) = metadata.first_entry else {
        return Ok(StreamVitals {
            exists: true,
            message_count: 0,
            oldest_message_id: MessageId::BEGINNING,
            oldest_message_time: computed_at,
            groups,
            first_fully_unprocessed_id: MessageId::BEGINNING,
            first_fully_unprocessed_time: computed_at,
            size_bytes,
            computed_at,
        });
    };

    let oldest_message_id = first_entry.id;
    let first_fully_unprocessed_id = watermark(&groups)?;

    Ok(StreamVitals {
        exists: true,
        message_count: metadata.length,
        oldest_message_id,
        oldest_message_time: oldest_message_id.time().unwrap_or(computed_at),
        groups,
        first_fully_unprocessed_id,
        first_fully_unprocessed_time: first_fully_unprocessed_id.time().unwrap_or(computed_at),
        size_bytes,
        computed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::memory::InMemoryLog;

    fn group(name: &str, last_delivered: &str) -> GroupInfo {
        GroupInfo {
            name: name.to_string(),
            last_delivered_id: last_delivered.to_string(),
            pending_count: 0,
            consumer_count: 1,
        }
    }

    #[test]
    fn watermark_is_the_minimum_last_delivered_id() {
        let groups = vec![group("a", "5-0"), group("b", "3-2"), group("c", "3-5")];
        assert_eq!(watermark(&groups).unwrap(), MessageId::new(3, 2));
    }

    #[test]
    fn never_reading_group_pins_the_watermark_at_the_start() {
        let groups = vec![group("a", "5-0"), group("silent", "0-0")];
        assert_eq!(watermark(&groups).unwrap(), MessageId::BEGINNING);
    }

    #[test]
    fn no_groups_leaves_trimming_unconstrained() {
        assert_eq!(watermark(&[]).unwrap(), MessageId::MAX);
    }

    #[test]
    fn malformed_last_delivered_id_is_an_error_not_a_skip() {
        let groups = vec![group("a", "5-0"), group("b", "garbage")];
        assert!(matches!(watermark(&groups), Err(Error::Format(_))));
    }

    #[tokio::test]
    async fn missing_stream_reports_not_existing() {
        let log = InMemoryLog::new();
        let vitals = compute(&log, "nope").await.unwrap();

        assert!(!vitals.exists);
        assert_eq!(vitals.message_count, 0);
        assert_eq!(vitals.oldest_message_id, MessageId::BEGINNING);
        assert_eq!(vitals.first_fully_unprocessed_id, MessageId::BEGINNING);
    }

    #[tokio::test]
    async fn empty_stream_with_groups_returns_sentinels() {
        let log = InMemoryLog::new();
        let id = log
            .append("s", &[("k".to_string(), "v".to_string())])
            .await
            .unwrap();
        log.group_create("s", "g", MessageId::BEGINNING).await.unwrap();
        log.delete("s", &[id]).await.unwrap();

        let vitals = compute(&log, "s").await.unwrap();
        assert!(vitals.exists);
        assert_eq!(vitals.message_count, 0);
        assert_eq!(vitals.oldest_message_id, MessageId::BEGINNING);
        assert_eq!(vitals.first_fully_unprocessed_id, MessageId::BEGINNING);
        assert_eq!(vitals.group_count(), 1);
    }

    #[tokio::test]
    async fn watermark_across_groups_via_backend() {
        let log = InMemoryLog::new();
        for (ms, seq) in [(1, 0), (3, 2), (3, 5), (5, 0), (6, 0)] {
            log.append_with_id(
                "s",
                MessageId::new(ms, seq),
                vec![("k".to_string(), "v".to_string())],
            )
            .await
            .unwrap();
        }
        log.group_create("s", "a", MessageId::new(5, 0)).await.unwrap();
        log.group_create("s", "b", MessageId::new(3, 2)).await.unwrap();
        log.group_create("s", "c", MessageId::new(3, 5)).await.unwrap();

        let vitals = compute(&log, "s").await.unwrap();
        assert_eq!(vitals.first_fully_unprocessed_id, MessageId::new(3, 2));
        assert_eq!(vitals.oldest_message_id, MessageId::new(1, 0));
        assert_eq!(vitals.message_count, 5);
        assert!(vitals.has_group("b"));
        assert!(!vitals.has_group("zzz"));
        assert!(vitals.size_bytes > 0);
    }
}
