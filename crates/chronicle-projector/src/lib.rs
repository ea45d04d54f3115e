#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-projector** – Projector support for Chronicle.
//!
//! A projector is a named consumer that builds a read-model from the event
//! stream and tracks the last event it handled through a persistent cursor.
//! This crate provides the [`Projector`] trait, the [`ProjectorRegistry`]
//! that routes events to interested projectors by runtime type, and the
//! [`ProjectorStore`] that answers the one question the processor keeps
//! asking: how far behind the log is this projector?

use std::any::TypeId;
use std::sync::{Arc, Mutex, PoisonError};

use chronicle_registry::{EventRegistry, RegistryError};
use chronicle_store_core::{CursorStore, EventLog, StoreError};
use chronicle_types::{event_type_id, DomainEvent, Envelope, EventId};

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors surfaced by projector registration and cursor tracking.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// A projector with the same name already exists in the registry.
    #[error("projector '{0}' is already registered")]
    DuplicateProjector(String),
    /// An interest set referenced an unregistered event type.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The log or cursor store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

//─────────────────────────────
//  Projector trait
//─────────────────────────────

/// A named consumer of events that maintains a derived read-model.
///
/// `interested_in` declares the runtime type identities of the event
/// carriers this projector wants to see; the registry matches against the
/// concrete type behind the trait object, so pointer and value access paths
/// land on the same subscription. `handle` updates the read-model and may
/// fail; failures are logged by the processor and leave the cursor where it
/// was.
pub trait Projector: Send + Sync {
    /// Unique name of the projector; also the cursor table key.
    fn name(&self) -> &str;

    /// Type identities of the events this projector subscribes to.
    fn interested_in(&self) -> Vec<TypeId>;

    /// Apply one event to the read-model.
    fn handle(&self, event: &dyn DomainEvent) -> anyhow::Result<()>;
}

//─────────────────────────────
//  Projector registry
//─────────────────────────────

/// Thread-safe set of projectors indexed by the event types they subscribe
/// to.
///
/// Projector names are unique within a registry. `for_event` returns
/// matching projectors in registration order, which is stable for a given
/// registry content.
#[derive(Default)]
pub struct ProjectorRegistry {
    inner: Mutex<Vec<Arc<dyn Projector>>>,
}

impl ProjectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a projector.
    pub fn register(&self, projector: Arc<dyn Projector>) -> Result<(), ProjectionError> {
        let mut projectors = self.lock();
        if projectors.iter().any(|p| p.name() == projector.name()) {
            return Err(ProjectionError::DuplicateProjector(
                projector.name().to_string(),
            ));
        }
        projectors.push(projector);
        Ok(())
    }

    /// Every projector interested in the runtime type of `event`.
    pub fn for_event(&self, event: &dyn DomainEvent) -> Vec<Arc<dyn Projector>> {
        let type_id = event_type_id(event);
        self.lock()
            .iter()
            .filter(|p| p.interested_in().contains(&type_id))
            .cloned()
            .collect()
    }

    /// Number of registered projectors.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Projector>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//─────────────────────────────
//  Projector store
//─────────────────────────────

/// Cursor tracking and lag queries for projectors.
///
/// Composes the event log, the cursor store and the event registry: the
/// registry translates a projector's interest set into persisted names, the
/// log counts matching envelopes past the cursor. A lag of one means the
/// event currently being processed is the next one to apply - the expected
/// steady state. A lag greater than one means an earlier event was missed.
#[derive(Clone)]
pub struct ProjectorStore {
    log: Arc<dyn EventLog>,
    cursors: Arc<dyn CursorStore>,
    events: Arc<EventRegistry>,
}

impl ProjectorStore {
    /// Wire a projector store over its three collaborators.
    pub fn new(
        log: Arc<dyn EventLog>,
        cursors: Arc<dyn CursorStore>,
        events: Arc<EventRegistry>,
    ) -> Self {
        Self {
            log,
            cursors,
            events,
        }
    }

    /// How many subscribed envelopes lie past the projector's cursor.
    ///
    /// With no cursor yet, this is the total count of subscribed envelopes.
    /// An unregistered type in the interest set fails the query.
    pub async fn out_of_sync_by(&self, projector: &dyn Projector) -> Result<u64, ProjectionError> {
        let names = self.events.names_of_types(&projector.interested_in())?;
        let cursor = self.cursors.last_handled(projector.name()).await?;
        Ok(self.log.count_matching(&names, cursor).await?)
    }

    /// How far behind the projector is as of one specific event.
    ///
    /// Counts subscribed envelopes past the cursor up to and including
    /// `event`. One means `event` is the next envelope to apply - the
    /// normal steady state, even when more events are already queued behind
    /// it. Greater than one means an earlier subscribed envelope was never
    /// handled.
    pub async fn out_of_sync_at(
        &self,
        projector: &dyn Projector,
        event: EventId,
    ) -> Result<u64, ProjectionError> {
        let names = self.events.names_of_types(&projector.interested_in())?;
        let cursor = self.cursors.last_handled(projector.name()).await?;
        let past_cursor = self.log.count_matching(&names, cursor).await?;
        let past_event = self.log.count_matching(&names, Some(event)).await?;
        Ok(past_cursor.saturating_sub(past_event))
    }

    /// Move the projector's cursor to `envelope`.
    pub async fn update_last_handled(
        &self,
        projector: &dyn Projector,
        envelope: &Envelope,
    ) -> Result<(), ProjectionError> {
        Ok(self
            .cursors
            .update_last_handled(projector.name(), envelope.id)
            .await?)
    }

    /// Read the projector's cursor, if it has one.
    pub async fn last_handled(
        &self,
        projector: &dyn Projector,
    ) -> Result<Option<EventId>, ProjectionError> {
        Ok(self.cursors.last_handled(projector.name()).await?)
    }

    /// Remove every cursor; replay starts from here.
    pub async fn drop_all(&self) -> Result<(), ProjectionError> {
        Ok(self.cursors.drop_all().await?)
    }
}
