//! Consumer identity allocation.
//!
//! Every member of a consumer group needs a name that is unique within the
//! group. Identities are small integers: the allocator lists the names already
//! registered, scans upward from 1 for the first free value, and registers it
//! remotely. Registration is create-if-absent, so two allocators racing to the
//! same candidate cannot both win — the loser re-fetches the list and scans
//! again.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::backend::RemoteLog;
use crate::error::{Error, Result};

/// Upper bound (exclusive) of the identity scan.
const SCAN_BOUND: u32 = 1000;

/// How many lost registration races to tolerate before giving up.
const REGISTER_ATTEMPTS: u32 = 8;

/// Allocate and register a unique consumer id within `group` on `stream`.
///
/// The group must already exist. Fails with
/// [`Error::AllocationExhausted`] when all candidate ids up to the bound are
/// taken, and with [`Error::Registration`] when every attempt loses the
/// registration race.
pub async fn allocate(backend: &dyn RemoteLog, stream: &str, group: &str) -> Result<u32> {
    for attempt in 1..=REGISTER_ATTEMPTS {
        let consumers = backend.consumer_list(stream, group).await?;
        let taken: HashSet<String> = consumers.into_iter().map(|c| c.name).collect();

        let candidate = (1..SCAN_BOUND)
            .find(|i| !taken.contains(&i.to_string()))
            .ok_or_else(|| Error::AllocationExhausted {
                stream: stream.to_string(),
                group: group.to_string(),
                bound: SCAN_BOUND,
            })?;

        if backend
            .consumer_create(stream, group, &candidate.to_string())
            .await?
        {
            debug!(stream, group, consumer_id = candidate, "allocated consumer id");
            return Ok(candidate);
        }

        warn!(
            stream,
            group,
            consumer_id = candidate,
            attempt,
            "consumer id was registered concurrently, rescanning"
        );
    }

    Err(Error::Registration {
        stream: stream.to_string(),
        group: group.to_string(),
        consumer: "<exhausted retries>".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MessageId;
    use crate::memory::InMemoryLog;

    async fn stream_with_group(log: &InMemoryLog) {
        log.append("s", &[("k".to_string(), "v".to_string())])
            .await
            .unwrap();
        log.group_create("s", "g", MessageId::BEGINNING).await.unwrap();
    }

    #[tokio::test]
    async fn first_member_of_an_empty_group_gets_one() {
        let log = InMemoryLog::new();
        stream_with_group(&log).await;

        assert_eq!(allocate(&log, "s", "g").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn allocation_fills_the_first_gap() {
        let log = InMemoryLog::new();
        stream_with_group(&log).await;
        for name in ["1", "2", "4"] {
            log.consumer_create("s", "g", name).await.unwrap();
        }

        assert_eq!(allocate(&log, "s", "g").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn successive_allocations_are_distinct() {
        let log = InMemoryLog::new();
        stream_with_group(&log).await;

        assert_eq!(allocate(&log, "s", "g").await.unwrap(), 1);
        assert_eq!(allocate(&log, "s", "g").await.unwrap(), 2);
        assert_eq!(allocate(&log, "s", "g").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn exhausted_scan_fails() {
        let log = InMemoryLog::new();
        stream_with_group(&log).await;
        for i in 1..SCAN_BOUND {
            log.consumer_create("s", "g", &i.to_string()).await.unwrap();
        }

        let result = allocate(&log, "s", "g").await;
        assert!(matches!(result, Err(Error::AllocationExhausted { .. })));
    }

    #[tokio::test]
    async fn allocation_requires_an_existing_group() {
        let log = InMemoryLog::new();
        log.append("s", &[("k".to_string(), "v".to_string())])
            .await
            .unwrap();

        let result = allocate(&log, "s", "missing").await;
        assert!(matches!(result, Err(Error::Capability(_))));
    }
}
