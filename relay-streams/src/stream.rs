//! The per-stream handle tying coordination together.
//!
//! A [`StreamHandle`] represents one application's connection to one stream:
//! its capability flags, its session read cursor, and — for consumer-group
//! members — its registered consumer identity, pending-acknowledgment buffer,
//! and claim policy. Handles are built by [`crate::engine::StreamEngine`] and
//! are intended for single-task ownership; nothing inside is synchronized.
//!
//! Group membership is a tagged extension rather than a subclass: a handle
//! either carries a [`GroupMembership`] or it does not, and every
//! group-flavored operation checks for it before touching the server.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ack::AckBuffer;
use crate::backend::{ClaimPage, GroupReadStart, RemoteLog, StreamEntry};
use crate::claim;
use crate::config::{StartPosition, StreamConfig, StreamRole};
use crate::engine::Registry;
use crate::error::{Error, Result};
use crate::id::MessageId;
use crate::identity;
use crate::vitals::{self, StreamVitals};

/// Immutable identity of a configured handle: the stream, the application
/// (group) name, and the consumer id within the group (0 for non-members).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamIdentity {
    pub stream_name: String,
    pub application_name: String,
    pub application_id: u32,
}

impl StreamIdentity {
    /// `<application>.<id>` — the globally readable consumer name.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.application_name, self.application_id)
    }

    pub(crate) fn registry_key(&self) -> String {
        format!("{}::{}", self.stream_name, self.full_name())
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream_name, self.full_name())
    }
}

/// Group-member state carried only by consumer-group handles.
struct GroupMembership {
    /// The registered consumer name (textual application id).
    consumer_name: String,
    acks: AckBuffer,
    claim_older_than: Duration,
    auto_ack: bool,
}

/// A configured, active connection to one stream.
pub struct StreamHandle {
    backend: Arc<dyn RemoteLog>,
    registry: Arc<Registry>,
    identity: StreamIdentity,
    role: StreamRole,
    closed: bool,
    /// Session-local cursor for simple (non-group) reads.
    last_read_id: MessageId,
    group: Option<GroupMembership>,
    messages_sent: u64,
    messages_received: u64,
}

impl StreamHandle {
    /// Configure a new handle. Called by the engine; a handle is never
    /// observable in a partially configured state — any failure here
    /// propagates and no handle exists.
    pub(crate) async fn configure(
        backend: Arc<dyn RemoteLog>,
        registry: Arc<Registry>,
        config: StreamConfig,
    ) -> Result<Self> {
        let role = config.role;

        // Fail fast on bad configuration before any remote call.
        if config.stream_name.is_empty() {
            return Err(Error::Configuration("stream name must not be empty".to_string()));
        }
        if config.application_name.is_empty() && role.is_group() {
            return Err(Error::Configuration(format!(
                "a consumer-group stream needs an application name (stream '{}')",
                config.stream_name
            )));
        }
        if role.can_consume()
            && config.start == StartPosition::Specified
            && config.start_id.is_none()
        {
            return Err(Error::Configuration(format!(
                "start position for stream '{}' is Specified but no start id was provided",
                config.stream_name
            )));
        }

        // Groups can only be created on an existing key, so bootstrap the
        // stream with an initial entry when it is missing. This deliberately
        // bypasses the produce capability: consumers need the key too.
        if !backend.key_exists(&config.stream_name).await? {
            backend
                .append(
                    &config.stream_name,
                    &[("message".to_string(), "create stream".to_string())],
                )
                .await?;
            debug!(stream = %config.stream_name, "bootstrapped missing stream key");
        }

        let last_read_id = if role.can_consume() {
            match config.start {
                StartPosition::Beginning => MessageId::BEGINNING,
                StartPosition::LastConsumedForGroup => {
                    warn!(
                        stream = %config.stream_name,
                        "start mode LastConsumedForGroup is not tracked; reading from the beginning"
                    );
                    MessageId::BEGINNING
                }
                StartPosition::Specified => config.start_id.unwrap_or(MessageId::BEGINNING),
                StartPosition::Now => match backend.stream_info(&config.stream_name).await? {
                    Some(metadata) => metadata.last_generated_id,
                    None => MessageId::BEGINNING,
                },
            }
        } else {
            MessageId::BEGINNING
        };

        let group = if role.is_group() {
            backend
                .group_create(
                    &config.stream_name,
                    &config.application_name,
                    MessageId::BEGINNING,
                )
                .await?;
            let consumer_id = identity::allocate(
                backend.as_ref(),
                &config.stream_name,
                &config.application_name,
            )
            .await?;
            Some((
                consumer_id,
                GroupMembership {
                    consumer_name: consumer_id.to_string(),
                    acks: AckBuffer::new(config.max_pending_acks),
                    claim_older_than: config.claim_older_than,
                    auto_ack: config.auto_ack_on_delivery,
                },
            ))
        } else {
            None
        };

        let (application_id, membership) = match group {
            Some((id, membership)) => (id, Some(membership)),
            None => (0, None),
        };

        let identity = StreamIdentity {
            stream_name: config.stream_name,
            application_name: config.application_name,
            application_id,
        };
        registry.insert(&identity).await;
        info!(identity = %identity, ?role, "configured stream handle");

        Ok(Self {
            backend,
            registry,
            identity,
            role,
            closed: false,
            last_read_id,
            group: membership,
            messages_sent: 0,
            messages_received: 0,
        })
    }

    // ---- capability checks -------------------------------------------------

    fn ensure_active(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Capability(format!(
                "stream handle {} is closed",
                self.identity
            )));
        }
        Ok(())
    }

    fn ensure_can_produce(&self) -> Result<()> {
        self.ensure_active()?;
        if !self.role.can_produce() {
            return Err(Error::Capability(format!(
                "stream '{}' was not configured for producing",
                self.identity.stream_name
            )));
        }
        Ok(())
    }

    fn ensure_can_consume(&self) -> Result<()> {
        self.ensure_active()?;
        if !self.role.can_consume() {
            return Err(Error::Capability(format!(
                "stream '{}' was not configured for consuming",
                self.identity.stream_name
            )));
        }
        Ok(())
    }

    fn ensure_group(&self) -> Result<()> {
        self.ensure_active()?;
        if !self.role.is_group() {
            return Err(Error::Capability(format!(
                "stream '{}' was not configured as a consumer-group stream",
                self.identity.stream_name
            )));
        }
        Ok(())
    }

    fn membership(&self) -> Result<&GroupMembership> {
        self.ensure_group()?;
        self.group.as_ref().ok_or_else(|| {
            Error::Capability(format!(
                "stream '{}' has no group membership",
                self.identity.stream_name
            ))
        })
    }

    // ---- producing ---------------------------------------------------------

    /// Append one message to the stream. Fails with a capability error unless
    /// the handle was configured for producing.
    pub async fn send(&mut self, fields: &[(String, String)]) -> Result<MessageId> {
        self.ensure_can_produce()?;
        let id = self.backend.append(&self.identity.stream_name, fields).await?;
        self.messages_sent += 1;
        Ok(id)
    }

    // ---- simple consuming --------------------------------------------------

    /// Read up to `count` messages after the last one read in this session.
    ///
    /// Only this handle knows about the cursor; other consumers of the stream
    /// start at the beginning (or wherever their own configuration says).
    pub async fn read(&mut self, count: usize) -> Result<Vec<StreamEntry>> {
        self.ensure_can_consume()?;
        let entries = self
            .backend
            .read_range(&self.identity.stream_name, self.last_read_id, count)
            .await?;
        if let Some(last) = entries.last() {
            self.last_read_id = last.id;
        }
        self.messages_received += entries.len() as u64;
        Ok(entries)
    }

    // ---- group consuming ---------------------------------------------------

    /// Read up to `count` messages never delivered to any consumer in the
    /// group. Unless the handle was configured to acknowledge on delivery,
    /// every returned entry lands on the group's pending list under this
    /// consumer until acknowledged.
    pub async fn read_group(&mut self, count: usize) -> Result<Vec<StreamEntry>> {
        self.ensure_can_consume()?;
        let member = self.membership()?;
        let entries = self
            .backend
            .group_read(
                &self.identity.stream_name,
                &self.identity.application_name,
                &member.consumer_name,
                GroupReadStart::New,
                count,
                member.auto_ack,
            )
            .await?;
        self.messages_received += entries.len() as u64;
        Ok(entries)
    }

    /// Redeliver this consumer's own pending entries — messages it read
    /// before but never acknowledged, e.g. after a restart.
    pub async fn read_own_pending(&mut self, count: usize) -> Result<Vec<StreamEntry>> {
        self.ensure_can_consume()?;
        let member = self.membership()?;
        let entries = self
            .backend
            .group_read(
                &self.identity.stream_name,
                &self.identity.application_name,
                &member.consumer_name,
                GroupReadStart::Pending(MessageId::BEGINNING),
                count,
                false,
            )
            .await?;
        self.messages_received += entries.len() as u64;
        Ok(entries)
    }

    // ---- acknowledgments ---------------------------------------------------

    /// Acknowledge one message immediately, bypassing the pending buffer at
    /// the cost of a server round trip.
    pub async fn acknowledge(&mut self, id: MessageId) -> Result<()> {
        self.ensure_group()?;
        self.backend
            .acknowledge(
                &self.identity.stream_name,
                &self.identity.application_name,
                &[id],
            )
            .await?;
        Ok(())
    }

    /// Queue an acknowledgment; flushes automatically once the configured
    /// threshold is reached.
    pub async fn add_pending_ack(&mut self, id: MessageId) -> Result<()> {
        self.ensure_group()?;
        let backend = Arc::clone(&self.backend);
        let stream = self.identity.stream_name.clone();
        let group_name = self.identity.application_name.clone();
        let Some(member) = self.group.as_mut() else {
            return Err(Error::Capability(format!(
                "stream '{stream}' has no group membership"
            )));
        };
        member.acks.add(backend.as_ref(), &stream, &group_name, id).await
    }

    /// Send every queued acknowledgment to the server in one batch. Returns
    /// the count the server reports as newly acknowledged.
    pub async fn flush_pending_acks(&mut self) -> Result<i64> {
        self.ensure_group()?;
        let backend = Arc::clone(&self.backend);
        let stream = self.identity.stream_name.clone();
        let group_name = self.identity.application_name.clone();
        let Some(member) = self.group.as_mut() else {
            return Err(Error::Capability(format!(
                "stream '{stream}' has no group membership"
            )));
        };
        member.acks.flush(backend.as_ref(), &stream, &group_name).await
    }

    // ---- claiming ----------------------------------------------------------

    /// Claim up to `max` pending entries left unacknowledged past the
    /// configured idle threshold by any consumer in the group, scanning from
    /// the lowest pending id. Claimed entries must still be acknowledged.
    pub async fn claim_pending(&mut self, max: usize) -> Result<ClaimPage> {
        self.claim_page(max, MessageId::BEGINNING).await
    }

    /// Like [`Self::claim_pending`], resuming from a cursor returned by a
    /// previous page.
    pub async fn claim_page(&mut self, max: usize, cursor: MessageId) -> Result<ClaimPage> {
        self.ensure_can_consume()?;
        let member = self.membership()?;
        let page = claim::claim_page(
            self.backend.as_ref(),
            &self.identity.stream_name,
            &self.identity.application_name,
            &member.consumer_name,
            member.claim_older_than,
            max,
            cursor,
        )
        .await?;
        self.messages_received += page.entries.len() as u64;
        Ok(page)
    }

    /// Total entries pending across every consumer in the group — delivered
    /// but not yet acknowledged, regardless of idle time.
    pub async fn pending_count(&self) -> Result<i64> {
        self.ensure_group()?;
        claim::group_pending_count(
            self.backend.as_ref(),
            &self.identity.stream_name,
            &self.identity.application_name,
        )
        .await
    }

    // ---- stream maintenance ------------------------------------------------

    /// Compute a fresh vitals snapshot for the stream.
    pub async fn vitals(&self) -> Result<StreamVitals> {
        self.ensure_active()?;
        vitals::compute(self.backend.as_ref(), &self.identity.stream_name).await
    }

    /// Remove entries with ids strictly below `min_id`. Does NOT check
    /// whether every group has processed them — see
    /// [`Self::trim_fully_processed`] for the safe variant.
    pub async fn trim_before(&mut self, min_id: MessageId, approximate: bool) -> Result<i64> {
        self.ensure_active()?;
        self.backend
            .trim(&self.identity.stream_name, min_id, approximate)
            .await
    }

    /// Remove every entry already delivered to all consumer groups, using the
    /// vitals watermark as the trim bound.
    pub async fn trim_fully_processed(&mut self, approximate: bool) -> Result<i64> {
        self.ensure_active()?;
        let vitals = vitals::compute(self.backend.as_ref(), &self.identity.stream_name).await?;
        let removed = self
            .backend
            .trim(
                &self.identity.stream_name,
                vitals.first_fully_unprocessed_id,
                approximate,
            )
            .await?;
        debug!(
            stream = %self.identity.stream_name,
            watermark = %vitals.first_fully_unprocessed_id,
            removed,
            "trimmed fully processed messages"
        );
        Ok(removed)
    }

    /// Delete specific entries. Use with caution on consumer-group streams:
    /// deleted entries disappear from under the groups' pending lists.
    pub async fn delete_messages(&mut self, ids: &[MessageId]) -> Result<i64> {
        self.ensure_active()?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.backend.delete(&self.identity.stream_name, ids).await
    }

    /// Delete the stream key entirely — entries, groups, and pending lists
    /// all go with it. Returns whether the key existed. The handle stays
    /// usable; producing afterwards recreates the key.
    pub async fn delete_stream(&mut self) -> Result<bool> {
        self.ensure_active()?;
        let existed = self.backend.key_delete(&self.identity.stream_name).await?;
        info!(stream = %self.identity.stream_name, existed, "deleted stream key");
        Ok(existed)
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Close the handle. Group members delete their consumer record first;
    /// that is refused while the record still has pending entries unless
    /// `force` is set, in which case those entries are discarded. After a
    /// successful close every operation fails with a capability error.
    pub async fn close(&mut self, force: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(member) = self.group.as_ref() {
            if !member.acks.is_empty() {
                warn!(
                    identity = %self.identity,
                    buffered = member.acks.len(),
                    "closing stream handle with unflushed acknowledgments"
                );
            }
            let deleted = self
                .backend
                .consumer_delete(
                    &self.identity.stream_name,
                    &self.identity.application_name,
                    &member.consumer_name,
                    force,
                )
                .await?;
            if !deleted {
                return Err(Error::Capability(format!(
                    "consumer '{}' in group '{}' still has pending entries; close with force to discard them",
                    member.consumer_name, self.identity.application_name
                )));
            }
        }
        self.registry.remove(&self.identity).await;
        self.closed = true;
        info!(identity = %self.identity, "closed stream handle");
        Ok(())
    }

    // ---- accessors and statistics ------------------------------------------

    /// The handle's immutable identity.
    #[must_use]
    pub fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    /// Name of the stream key.
    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.identity.stream_name
    }

    /// Name of the application (the consumer-group name).
    #[must_use]
    pub fn application_name(&self) -> &str {
        &self.identity.application_name
    }

    /// The consumer id within the group; 0 for non-members.
    #[must_use]
    pub fn application_id(&self) -> u32 {
        self.identity.application_id
    }

    #[must_use]
    pub fn role(&self) -> StreamRole {
        self.role
    }

    #[must_use]
    pub fn can_produce(&self) -> bool {
        self.role.can_produce()
    }

    #[must_use]
    pub fn can_consume(&self) -> bool {
        self.role.can_consume()
    }

    #[must_use]
    pub fn is_consumer_group(&self) -> bool {
        self.role.is_group()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The session read cursor used by [`Self::read`].
    #[must_use]
    pub fn last_read_id(&self) -> MessageId {
        self.last_read_id
    }

    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    /// Acknowledgments queued but not yet flushed.
    #[must_use]
    pub fn pending_ack_count(&self) -> usize {
        self.group.as_ref().map_or(0, |m| m.acks.len())
    }

    /// How many acknowledgment batches have been flushed.
    #[must_use]
    pub fn ack_flush_count(&self) -> u64 {
        self.group.as_ref().map_or(0, |m| m.acks.flush_count())
    }

    /// Zero every statistic counter and the session read cursor.
    pub fn reset_statistics(&mut self) {
        self.messages_sent = 0;
        self.messages_received = 0;
        self.last_read_id = MessageId::BEGINNING;
        if let Some(member) = self.group.as_mut() {
            member.acks.reset_statistics();
        }
    }
}
