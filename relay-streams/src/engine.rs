//! The engine: backend ownership, handle construction, and the registry of
//! active stream identities.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::backend::RemoteLog;
use crate::config::StreamConfig;
use crate::error::Result;
use crate::stream::{StreamHandle, StreamIdentity};

/// Tracks the identities of every handle the engine has opened and not yet
/// closed. Dropping a handle without closing it leaves its entry behind; the
/// registry reflects close calls, not liveness.
pub(crate) struct Registry {
    inner: RwLock<HashMap<String, StreamIdentity>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn insert(&self, identity: &StreamIdentity) {
        self.inner
            .write()
            .await
            .insert(identity.registry_key(), identity.clone());
    }

    pub(crate) async fn remove(&self, identity: &StreamIdentity) {
        self.inner.write().await.remove(&identity.registry_key());
    }

    async fn snapshot(&self) -> Vec<StreamIdentity> {
        let mut identities: Vec<StreamIdentity> =
            self.inner.read().await.values().cloned().collect();
        identities.sort_by(|a, b| a.registry_key().cmp(&b.registry_key()));
        identities
    }
}

/// Factory for [`StreamHandle`]s sharing one backend connection.
///
/// Cheap to clone; clones share the backend and the registry.
#[derive(Clone)]
pub struct StreamEngine {
    backend: Arc<dyn RemoteLog>,
    registry: Arc<Registry>,
}

impl StreamEngine {
    /// Build an engine over any backend, typically a
    /// [`crate::redis_log::RedisLog`] in production and a
    /// [`crate::memory::InMemoryLog`] in tests.
    #[must_use]
    pub fn new(backend: Arc<dyn RemoteLog>) -> Self {
        debug!("stream engine created");
        Self {
            backend,
            registry: Arc::new(Registry::new()),
        }
    }

    /// Open a fully configured handle for `config`'s stream: bootstrap the
    /// key if missing, create the group and register a consumer identity for
    /// group roles, and record the identity in the registry.
    pub async fn open(&self, config: StreamConfig) -> Result<StreamHandle> {
        StreamHandle::configure(
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            config,
        )
        .await
    }

    /// Whether the stream key exists on the server.
    pub async fn stream_exists(&self, stream: &str) -> Result<bool> {
        self.backend.key_exists(stream).await
    }

    /// Identities of every handle opened through this engine and not yet
    /// closed, in stable order.
    pub async fn active_streams(&self) -> Vec<StreamIdentity> {
        self.registry.snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamRole;
    use crate::memory::InMemoryLog;

    fn engine() -> StreamEngine {
        StreamEngine::new(Arc::new(InMemoryLog::new()))
    }

    #[tokio::test]
    async fn open_registers_and_close_unregisters() {
        let engine = engine();
        let mut handle = engine
            .open(StreamConfig::new("orders", "billing").with_role(StreamRole::ProducerOnly))
            .await
            .unwrap();

        let active = engine.active_streams().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].stream_name, "orders");

        handle.close(false).await.unwrap();
        assert!(engine.active_streams().await.is_empty());
    }

    #[tokio::test]
    async fn group_members_register_distinct_identities() {
        let engine = engine();
        let first = engine
            .open(
                StreamConfig::new("orders", "billing")
                    .with_role(StreamRole::ProducerAndConsumerGroup),
            )
            .await
            .unwrap();
        let second = engine
            .open(
                StreamConfig::new("orders", "billing")
                    .with_role(StreamRole::ProducerAndConsumerGroup),
            )
            .await
            .unwrap();

        assert_eq!(first.application_id(), 1);
        assert_eq!(second.application_id(), 2);
        assert_eq!(engine.active_streams().await.len(), 2);
    }

    #[tokio::test]
    async fn stream_exists_follows_the_backend() {
        let engine = engine();
        assert!(!engine.stream_exists("orders").await.unwrap());

        engine
            .open(StreamConfig::new("orders", "billing").with_role(StreamRole::ProducerOnly))
            .await
            .unwrap();
        assert!(engine.stream_exists("orders").await.unwrap());
    }
}
