#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-registry** – Typed event registry for Chronicle.
//!
//! The registry is the bidirectional mapping between an event type's runtime
//! identity and its stable persisted name. Committing walks one direction
//! (carrier → name + payload map); processing walks the other (envelope →
//! fresh typed carrier). Types are registered once, by example, and entries
//! are never removed.
//!
//! Payload conversion is delegated to the [`codec`] module, which treats the
//! serde data model as the per-field tag schema.

use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use chronicle_types::{
    downcast_event, event_type_id, DomainEvent, Envelope, EventMeta, PayloadMap, Reifiable,
};

pub mod codec;
pub use codec::{from_payload_map, to_payload, to_payload_map, CodecError};

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The name, or the event type behind it, already has an entry.
    #[error("event '{0}' is already registered")]
    AlreadyRegistered(String),
    /// No entry exists for the given persisted name.
    #[error("event '{0}' has not been registered")]
    Unregistered(String),
    /// No entry exists for the runtime type of the given carrier.
    #[error("event carrier type has not been registered")]
    UnregisteredType,
    /// The prototype's payload is not a map of supported tagged fields.
    #[error("event '{name}' does not have a usable payload aggregate: {source}")]
    InvalidEventShape {
        /// Name the registration attempted to claim.
        name: String,
        /// What the shape probe tripped over.
        source: CodecError,
    },
    /// An entry was asked to handle a carrier of a different concrete type.
    #[error("carrier does not match the registration for '{0}'")]
    CarrierMismatch(String),
    /// Payload conversion failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

//─────────────────────────────
//  Registered entries
//─────────────────────────────

type EncodeFn = Box<dyn Fn(&dyn DomainEvent) -> Result<PayloadMap, RegistryError> + Send + Sync>;
type ReifyFn = Box<dyn Fn(&Envelope) -> Result<Box<dyn DomainEvent>, RegistryError> + Send + Sync>;

/// One registered event type: its name plus the erased conversion closures
/// built from the concrete type at registration time.
struct RegisteredEvent {
    encode: EncodeFn,
    reify: ReifyFn,
}

#[derive(Default)]
struct RegistryState {
    by_name: HashMap<String, RegisteredEvent>,
    name_by_type: HashMap<TypeId, String>,
}

//─────────────────────────────
//  Event registry
//─────────────────────────────

/// Thread-safe registry of event types, keyed by stable name and by runtime
/// type identity.
///
/// All operations take the registry's single lock for their duration. The
/// registry is read-mostly after setup; registration typically happens once
/// during wiring.
#[derive(Default)]
pub struct EventRegistry {
    inner: Mutex<RegistryState>,
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event type by example under a stable name.
    ///
    /// The prototype instance is probe-encoded to validate its shape: the
    /// payload must serialize to a map of supported field kinds. Fails with
    /// [`RegistryError::AlreadyRegistered`] when either the name or the
    /// concrete type already has an entry, and with
    /// [`RegistryError::InvalidEventShape`] when the probe fails.
    pub fn register<E: Reifiable>(
        &self,
        name: impl Into<String>,
        prototype: &E,
    ) -> Result<(), RegistryError> {
        let name = name.into();

        // Shape probe before touching the tables.
        codec::to_payload_map(prototype.payload()).map_err(|source| {
            RegistryError::InvalidEventShape {
                name: name.clone(),
                source,
            }
        })?;

        let mut state = self.lock();
        if state.by_name.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        if let Some(existing) = state.name_by_type.get(&TypeId::of::<E>()) {
            return Err(RegistryError::AlreadyRegistered(existing.clone()));
        }

        let encode_name = name.clone();
        let encode: EncodeFn = Box::new(move |event| {
            let concrete = downcast_event::<E>(event)
                .ok_or_else(|| RegistryError::CarrierMismatch(encode_name.clone()))?;
            Ok(codec::to_payload_map(concrete.payload())?)
        });

        let reify: ReifyFn = Box::new(move |envelope| {
            let payload: E::Payload = codec::from_payload_map(&envelope.payload)?;
            let meta = EventMeta::new(envelope.version, envelope.occurred_at);
            Ok(Box::new(E::from_parts(payload, meta)) as Box<dyn DomainEvent>)
        });

        state
            .name_by_type
            .insert(TypeId::of::<E>(), name.clone());
        state.by_name.insert(name, RegisteredEvent { encode, reify });
        Ok(())
    }

    /// Resolve the stable name of an event carrier by its runtime type.
    pub fn name_of(&self, event: &dyn DomainEvent) -> Result<String, RegistryError> {
        self.name_of_type(event_type_id(event))
    }

    /// Resolve the stable name registered for a type identity.
    pub fn name_of_type(&self, type_id: TypeId) -> Result<String, RegistryError> {
        self.lock()
            .name_by_type
            .get(&type_id)
            .cloned()
            .ok_or(RegistryError::UnregisteredType)
    }

    /// Resolve the stable names for a set of type identities.
    ///
    /// Any unregistered identity fails the whole lookup; callers use this to
    /// translate a projector's interest set into log-queryable names.
    pub fn names_of_types(&self, types: &[TypeId]) -> Result<BTreeSet<String>, RegistryError> {
        let state = self.lock();
        types
            .iter()
            .map(|type_id| {
                state
                    .name_by_type
                    .get(type_id)
                    .cloned()
                    .ok_or(RegistryError::UnregisteredType)
            })
            .collect()
    }

    /// Serialize an event carrier's payload aggregate into a payload map.
    pub fn encode_payload(&self, event: &dyn DomainEvent) -> Result<PayloadMap, RegistryError> {
        let state = self.lock();
        let name = state
            .name_by_type
            .get(&event_type_id(event))
            .ok_or(RegistryError::UnregisteredType)?;
        let entry = state
            .by_name
            .get(name)
            .ok_or_else(|| RegistryError::Unregistered(name.clone()))?;
        (entry.encode)(event)
    }

    /// Rebuild a fresh typed carrier from a persisted envelope.
    ///
    /// The payload map is decoded into the registered type's aggregate with
    /// per-field coercion, and the envelope's `version` and `occurred_at`
    /// are attached to the new instance.
    pub fn reify(&self, envelope: &Envelope) -> Result<Box<dyn DomainEvent>, RegistryError> {
        let state = self.lock();
        let entry = state
            .by_name
            .get(&envelope.name)
            .ok_or_else(|| RegistryError::Unregistered(envelope.name.clone()))?;
        (entry.reify)(envelope)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
