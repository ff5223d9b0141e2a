//! Stream message identifiers.
//!
//! Every entry in a stream is addressed by a two-part id: the server-assigned
//! timestamp in milliseconds and a sequence number disambiguating entries that
//! share a millisecond. The canonical text form is `<ms>-<seq>`, and ids are
//! totally ordered by `(ms, seq)` — the order the watermark computation in
//! [`crate::vitals`] relies on.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// A two-part ordered stream message id.
///
/// Ordering is lexicographic on `(ms, seq)`, matching the server's ordering
/// of entries. `parse(format(x)) == x` holds for every valid id.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    /// Milliseconds since the Unix epoch.
    pub ms: i64,
    /// Sequence number within the millisecond.
    pub seq: i64,
}

impl MessageId {
    /// The beginning-of-stream sentinel (`0-0`).
    pub const BEGINNING: MessageId = MessageId { ms: 0, seq: 0 };

    /// The greatest representable id. Used as the watermark when no group
    /// constrains trimming.
    pub const MAX: MessageId = MessageId {
        ms: i64::MAX,
        seq: i64::MAX,
    };

    /// Create an id from its parts.
    #[must_use]
    pub const fn new(ms: i64, seq: i64) -> Self {
        Self { ms, seq }
    }

    /// The wall-clock time encoded in the id, if it fits in the calendar.
    #[must_use]
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.ms)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    /// Parse the canonical `<ms>-<seq>` form.
    ///
    /// Splits on the last `-` so the millisecond part can never be mistaken
    /// for a negative sign. Both parts must be non-negative integers.
    fn from_str(s: &str) -> Result<Self, Error> {
        let (ms, seq) = s.rsplit_once('-').ok_or_else(|| Error::Format(s.to_string()))?;
        if ms.is_empty() {
            return Err(Error::Format(s.to_string()));
        }
        let ms: i64 = ms.parse().map_err(|_| Error::Format(s.to_string()))?;
        let seq: i64 = seq.parse().map_err(|_| Error::Format(s.to_string()))?;
        if ms < 0 || seq < 0 {
            return Err(Error::Format(s.to_string()));
        }
        Ok(MessageId { ms, seq })
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}
