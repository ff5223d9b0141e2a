//! Reclaiming messages from failed or slow consumers.
//!
//! A message delivered to a consumer that never acknowledges it stays on the
//! group's pending list forever. Claiming reassigns ownership of such entries
//! to a live consumer once they have been idle past a threshold, using the
//! server's atomic auto-claim primitive. Claimed entries are NOT acknowledged
//! automatically — until the new owner acknowledges them they become claimable
//! again once they exceed the threshold.

use std::time::Duration;

use tracing::debug;

use crate::backend::{ClaimPage, RemoteLog};
use crate::error::Result;
use crate::id::MessageId;

/// Claim up to `max` pending entries idle for at least `older_than`,
/// scanning the group's pending list from `cursor`.
///
/// A returned cursor other than [`MessageId::BEGINNING`] means more claimable
/// entries may exist beyond this page; pass it to the next call to continue.
pub async fn claim_page(
    backend: &dyn RemoteLog,
    stream: &str,
    group: &str,
    consumer: &str,
    older_than: Duration,
    max: usize,
    cursor: MessageId,
) -> Result<ClaimPage> {
    let page = backend
        .auto_claim(stream, group, consumer, older_than, cursor, max)
        .await?;
    debug!(
        stream,
        group,
        consumer,
        claimed = page.entries.len(),
        next_cursor = %page.next_cursor,
        "claimed pending entries"
    );
    Ok(page)
}

/// Total pending entries across every consumer in the group.
///
/// Counts everything delivered but not yet acknowledged, regardless of idle
/// time — a superset of what is currently claimable. Fails with a capability
/// error when the group does not exist.
pub async fn group_pending_count(
    backend: &dyn RemoteLog,
    stream: &str,
    group: &str,
) -> Result<i64> {
    let consumers = backend.consumer_list(stream, group).await?;
    Ok(consumers.iter().map(|c| c.pending_count).sum())
}
