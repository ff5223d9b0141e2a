//! Client-side coordination for consumer groups over Redis Streams.
//!
//! The server keeps the authoritative state — entries, groups, pending lists —
//! and this crate layers the client-side discipline on top: capability-scoped
//! stream handles, automatic consumer-identity allocation, batched
//! acknowledgments, reclaiming messages from dead consumers, and a
//! cross-group watermark that says what is safe to trim.
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_streams::{RedisLog, StreamConfig, StreamEngine, StreamRole};
//!
//! # async fn demo() -> relay_streams::Result<()> {
//! let backend = Arc::new(RedisLog::connect("redis://127.0.0.1/").await?);
//! let engine = StreamEngine::new(backend);
//!
//! let mut handle = engine
//!     .open(
//!         StreamConfig::new("orders", "billing")
//!             .with_role(StreamRole::ProducerAndConsumerGroup),
//!     )
//!     .await?;
//!
//! handle.send(&[("kind".to_string(), "order".to_string())]).await?;
//! for entry in handle.read_group(16).await? {
//!     handle.add_pending_ack(entry.id).await?;
//! }
//! handle.flush_pending_acks().await?;
//! handle.close(false).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Everything is written against the [`RemoteLog`] trait;
//! [`memory::InMemoryLog`] implements the same semantics in process for tests
//! and development.

mod ack;
pub mod backend;
mod claim;
mod config;
mod engine;
mod error;
mod id;
mod identity;
pub mod memory;
mod redis_log;
mod stream;
mod vitals;

pub use ack::AckBuffer;
pub use backend::{
    ClaimPage, ConsumerRecord, GroupInfo, GroupReadStart, RemoteLog, StreamEntry, StreamMetadata,
};
pub use config::{StartPosition, StreamConfig, StreamRole};
pub use engine::StreamEngine;
pub use error::{Error, Result};
pub use id::MessageId;
pub use memory::InMemoryLog;
pub use redis_log::RedisLog;
pub use stream::{StreamHandle, StreamIdentity};
pub use vitals::{compute as compute_vitals, StreamVitals};
