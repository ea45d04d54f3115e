#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-engine** – The facade of the Chronicle event-sourcing engine.
//!
//! The engine wires the registries, the storage backend and the processing
//! actor into one entry point. Application code registers its event types,
//! projectors and reactors during setup, then commits domain events:
//!
//! - [`Engine::commit`] appends an event to the log and returns a completion
//!   handle that resolves once every matching projector and reactor has been
//!   attempted.
//! - [`Engine::replay`] rebuilds every projection from the log as if history
//!   were replayed, with reactors suppressed.
//!
//! Storage selection follows the configuration: an in-memory backend for
//! tests and ephemeral deployments, or the sled backend for durable logs,
//! each behind its cargo feature.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use chronicle_processor::{Mode, Processor, ProcessorError, DEFAULT_QUEUE_CAPACITY};

pub use chronicle_processor::Completion;
use chronicle_projector::{ProjectionError, ProjectorRegistry, ProjectorStore};
use chronicle_reactor::ReactorRegistry;
use chronicle_registry::{EventRegistry, RegistryError};
use chronicle_store_core::{CursorStore, EventLog, StoreError};
use chronicle_types::{DomainEvent, NewEnvelope};

#[cfg(feature = "memory-storage")]
use chronicle_store_memory::MemoryStore;

#[cfg(feature = "sled-storage")]
use chronicle_store_sled::SledStore;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Configuration for a Chronicle engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the processing FIFO; committers block when it is full.
    pub queue_capacity: usize,
    /// Storage backend selection.
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            storage: StorageConfig::Memory,
        }
    }
}

/// Storage backend configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageConfig {
    /// In-memory storage (non-persistent).
    Memory,
    /// Sled-based persistent storage.
    #[cfg(feature = "sled-storage")]
    Sled {
        /// Database directory path.
        path: String,
    },
}

/// Configuration suitable for unit and integration tests: in-memory storage
/// and a small queue.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        queue_capacity: 16,
        storage: StorageConfig::Memory,
    }
}

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The committed event, or a projector interest set, is unknown to the
    /// event registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The log or cursor store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The processor rejected a lifecycle transition or a request.
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    /// Cursor maintenance failed.
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    /// The engine could not be assembled from its configuration.
    #[error("engine configuration error: {0}")]
    Configuration(String),
}

//─────────────────────────────
//  Engine
//─────────────────────────────

/// A fully wired Chronicle engine.
///
/// The registries are exposed for setup; registration normally happens once,
/// before [`start`]. The cursor table is written only by the processing
/// actor; committers share the log, which linearizes appends itself.
///
/// [`start`]: Engine::start
pub struct Engine {
    log: Arc<dyn EventLog>,
    cursors: Arc<dyn CursorStore>,
    events: Arc<EventRegistry>,
    projectors: Arc<ProjectorRegistry>,
    reactors: Arc<ReactorRegistry>,
    processor: Processor,
    queue_capacity: usize,
}

impl Engine {
    /// Create an engine with storage built from the configuration.
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        info!(?config, "initializing chronicle engine");
        let (log, cursors) = create_storage(&config.storage)?;
        Ok(Self::assemble(log, cursors, config.queue_capacity))
    }

    /// Create an engine over caller-provided storage.
    ///
    /// Useful for custom backends and for tests that need direct access to
    /// the log underneath the engine.
    pub fn with_storage(
        log: Arc<dyn EventLog>,
        cursors: Arc<dyn CursorStore>,
        config: EngineConfig,
    ) -> Self {
        Self::assemble(log, cursors, config.queue_capacity)
    }

    fn assemble(
        log: Arc<dyn EventLog>,
        cursors: Arc<dyn CursorStore>,
        queue_capacity: usize,
    ) -> Self {
        let events = Arc::new(EventRegistry::new());
        let projectors = Arc::new(ProjectorRegistry::new());
        let reactors = Arc::new(ReactorRegistry::new());
        let store = ProjectorStore::new(log.clone(), cursors.clone(), events.clone());
        let processor = Processor::with_capacity(
            log.clone(),
            events.clone(),
            projectors.clone(),
            reactors.clone(),
            store,
            Mode::Live,
            queue_capacity,
        );
        Self {
            log,
            cursors,
            events,
            projectors,
            reactors,
            processor,
            queue_capacity,
        }
    }

    /// Commit a domain event.
    ///
    /// Resolves the event's name and payload through the registry, appends
    /// an envelope stamped with the commit wall-clock time, and enqueues the
    /// new id on the processor. Any failure before the enqueue is returned
    /// to the caller and yields no completion handle; a failed append leaves
    /// no envelope in the log. Failures *during* processing are logged and
    /// still resolve the returned handle.
    pub async fn commit(&self, event: &dyn DomainEvent) -> Result<Completion, EngineError> {
        let name = self.events.name_of(event)?;
        let payload = self.events.encode_payload(event)?;
        let envelope = NewEnvelope {
            name,
            payload,
            version: event.version(),
            occurred_at: Utc::now().timestamp(),
        };

        let id = self.log.append(envelope).await?;
        debug!(id, "event committed");
        Ok(self.processor.process(id).await?)
    }

    /// Start the processing actor. Must be called exactly once.
    ///
    /// Events committed before `start` are retained on the queue and
    /// processed once the actor runs.
    pub fn start(&self) -> Result<(), EngineError> {
        Ok(self.processor.start()?)
    }

    /// Stop the processing actor; the in-flight event completes first.
    ///
    /// A stopped engine cannot be started again.
    pub async fn stop(&self) -> Result<(), EngineError> {
        Ok(self.processor.stop().await?)
    }

    /// Rebuild all projections from the log.
    ///
    /// Drops every projector cursor, then drives a replay-mode processor
    /// over an ascending scan of the log, one event in flight at a time so
    /// ordering is preserved and queue depth stays bounded. Reactors are
    /// suppressed for the whole run.
    ///
    /// The engine should not be committing while a replay runs; that
    /// discipline is the caller's responsibility and is not enforced here.
    pub async fn replay(&self) -> Result<(), EngineError> {
        info!("replaying event log into projections");

        let store = ProjectorStore::new(
            self.log.clone(),
            self.cursors.clone(),
            self.events.clone(),
        );
        store.drop_all().await?;

        let processor = Processor::with_capacity(
            self.log.clone(),
            self.events.clone(),
            self.projectors.clone(),
            self.reactors.clone(),
            store,
            Mode::Replay,
            self.queue_capacity,
        );
        processor.start()?;

        let mut ids = Vec::new();
        self.log.scan_ascending(&mut |id| ids.push(id)).await?;
        let total = ids.len();

        for id in ids {
            processor.process(id).await?.await;
        }

        processor.stop().await?;
        info!(events = total, "replay complete");
        Ok(())
    }

    /// The event registry, for registering event types during setup.
    pub fn events(&self) -> Arc<EventRegistry> {
        self.events.clone()
    }

    /// The projector registry, for registering projectors during setup.
    pub fn projectors(&self) -> Arc<ProjectorRegistry> {
        self.projectors.clone()
    }

    /// The reactor registry, for registering reactors during setup.
    pub fn reactors(&self) -> Arc<ReactorRegistry> {
        self.reactors.clone()
    }

    /// Direct access to the event log, for diagnostics and advanced use.
    pub fn log(&self) -> Arc<dyn EventLog> {
        self.log.clone()
    }
}

fn create_storage(
    config: &StorageConfig,
) -> Result<(Arc<dyn EventLog>, Arc<dyn CursorStore>), EngineError> {
    match config {
        #[cfg(feature = "memory-storage")]
        StorageConfig::Memory => {
            debug!("creating in-memory storage backend");
            let store = Arc::new(MemoryStore::new());
            let log: Arc<dyn EventLog> = store.clone();
            let cursors: Arc<dyn CursorStore> = store;
            Ok((log, cursors))
        }
        #[cfg(not(feature = "memory-storage"))]
        StorageConfig::Memory => Err(EngineError::Configuration(
            "memory storage feature not enabled".to_string(),
        )),
        #[cfg(feature = "sled-storage")]
        StorageConfig::Sled { path } => {
            debug!(path = %path, "creating sled storage backend");
            let store = Arc::new(
                SledStore::open(path).map_err(|e| EngineError::Configuration(e.to_string()))?,
            );
            let log: Arc<dyn EventLog> = store.clone();
            let cursors: Arc<dyn CursorStore> = store;
            Ok((log, cursors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engine_assembles_from_test_config() {
        let engine = Engine::new(test_config()).await.unwrap();
        assert!(engine.projectors().is_empty());
        assert!(engine.reactors().is_empty());
        engine.start().unwrap();
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let engine = Engine::new(test_config()).await.unwrap();
        engine.start().unwrap();
        assert!(matches!(
            engine.start(),
            Err(EngineError::Processor(ProcessorError::AlreadyStarted))
        ));
        engine.stop().await.unwrap();
    }

    #[test]
    fn config_roundtrips_through_serde() {
        let config = EngineConfig::default();
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: EngineConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.queue_capacity, config.queue_capacity);
        assert!(matches!(decoded.storage, StorageConfig::Memory));
    }
}
