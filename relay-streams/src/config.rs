//! Configuration for stream handles.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::id::MessageId;

/// What a stream handle is allowed to do, fixed at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    /// Can only produce messages.
    ProducerOnly,
    /// Can only read messages; does not belong to a consumer group.
    SimpleConsumerOnly,
    /// Can only consume messages as part of a consumer group.
    ConsumerGroupOnly,
    /// Can produce and read messages without group membership.
    ProducerAndSimpleConsumer,
    /// Can produce and consume messages as part of a consumer group.
    ProducerAndConsumerGroup,
}

impl StreamRole {
    /// True when the role allows appending messages.
    #[must_use]
    pub fn can_produce(self) -> bool {
        matches!(
            self,
            Self::ProducerOnly | Self::ProducerAndSimpleConsumer | Self::ProducerAndConsumerGroup
        )
    }

    /// True when the role allows reading messages.
    #[must_use]
    pub fn can_consume(self) -> bool {
        !matches!(self, Self::ProducerOnly)
    }

    /// True when the role participates in a consumer group.
    #[must_use]
    pub fn is_group(self) -> bool {
        matches!(self, Self::ConsumerGroupOnly | Self::ProducerAndConsumerGroup)
    }
}

/// Where a consuming handle starts reading when it is first configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Replay from the very first message.
    Beginning,
    /// Start at the newest id as of configuration time; read only new messages.
    Now,
    /// Resume from the group's last consumed message.
    ///
    /// The coordination layer does not track this position; the mode currently
    /// behaves like [`StartPosition::Beginning`] and logs a warning.
    LastConsumedForGroup,
    /// Start at the id supplied in [`StreamConfig::start_id`]. Configuration
    /// fails if no id was provided.
    Specified,
}

/// Configuration for one stream handle.
///
/// The group-related fields (`max_pending_acks`, `claim_older_than`,
/// `auto_ack_on_delivery`) only take effect for group roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Name of the stream key on the server.
    pub stream_name: String,

    /// Name of the application; doubles as the consumer-group name.
    pub application_name: String,

    /// What the handle may do.
    #[serde(default = "default_role")]
    pub role: StreamRole,

    /// Where consumption starts.
    #[serde(default = "default_start")]
    pub start: StartPosition,

    /// Required when `start` is [`StartPosition::Specified`].
    #[serde(default)]
    pub start_id: Option<MessageId>,

    /// Buffered acknowledgments are flushed to the server once this many
    /// accumulate.
    #[serde(default = "default_max_pending_acks")]
    pub max_pending_acks: usize,

    /// How long another consumer's delivery may sit unacknowledged before this
    /// handle is willing to claim it.
    #[serde(default = "default_claim_older_than", with = "humantime_serde")]
    pub claim_older_than: Duration,

    /// If true, group reads acknowledge messages on delivery and the pending
    /// acknowledgment buffer is never used.
    #[serde(default)]
    pub auto_ack_on_delivery: bool,
}

fn default_role() -> StreamRole {
    StreamRole::ProducerAndSimpleConsumer
}

fn default_start() -> StartPosition {
    StartPosition::Now
}

fn default_max_pending_acks() -> usize {
    20
}

fn default_claim_older_than() -> Duration {
    Duration::from_secs(60)
}

impl StreamConfig {
    /// Create a config with defaults for everything but the names.
    #[must_use]
    pub fn new(stream_name: impl Into<String>, application_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            application_name: application_name.into(),
            role: default_role(),
            start: default_start(),
            start_id: None,
            max_pending_acks: default_max_pending_acks(),
            claim_older_than: default_claim_older_than(),
            auto_ack_on_delivery: false,
        }
    }

    /// Set the handle's role.
    #[must_use]
    pub fn with_role(mut self, role: StreamRole) -> Self {
        self.role = role;
        self
    }

    /// Set the start position.
    #[must_use]
    pub fn with_start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    /// Set the explicit start id used by [`StartPosition::Specified`].
    #[must_use]
    pub fn with_start_id(mut self, id: MessageId) -> Self {
        self.start_id = Some(id);
        self
    }

    /// Set the acknowledgment auto-flush threshold.
    #[must_use]
    pub fn with_max_pending_acks(mut self, max: usize) -> Self {
        self.max_pending_acks = max;
        self
    }

    /// Set the idle threshold for claiming another consumer's deliveries.
    #[must_use]
    pub fn with_claim_older_than(mut self, threshold: Duration) -> Self {
        self.claim_older_than = threshold;
        self
    }

    /// Enable or disable acknowledge-on-delivery for group reads.
    #[must_use]
    pub fn with_auto_ack_on_delivery(mut self, auto_ack: bool) -> Self {
        self.auto_ack_on_delivery = auto_ack;
        self
    }
}
