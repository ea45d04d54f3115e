#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-types** – Shared primitive data structures for Chronicle.
//!
//! The crate is dependency‐light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the persisted event envelope, the payload value model, and the
//! traits a domain event carrier has to implement. It intentionally makes no
//! assumptions about I/O or storage.

use std::any::Any;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

//─────────────────────────────
//  Payload value model
//─────────────────────────────

/// Self-describing payload values and the string-keyed payload map.
pub mod payload;
pub use payload::{PayloadKind, PayloadMap, PayloadValue};

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Identifier of a committed event, assigned by the event log.
///
/// Ids are strictly increasing in commit order, totally comparable and
/// printable. They are opaque to everything except the log that minted them;
/// callers must not derive meaning from the numeric value beyond ordering.
pub type EventId = u64;

//─────────────────────────────
//  Event envelope
//─────────────────────────────

/// The persisted record for one committed event.
///
/// Envelopes are the only artifact the log stores. They are append-only:
/// never updated, never deleted except by wholesale log drop. The `name`
/// identifies the registered event type the payload belongs to; the pair is
/// reified back into a typed carrier by the event registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Log-assigned identifier; ordering equals commit ordering.
    pub id: EventId,
    /// Stable name of the event type, drawn from the registry's set.
    pub name: String,
    /// String-keyed structured payload.
    pub payload: PayloadMap,
    /// Schema version byte recorded with the event.
    pub version: u8,
    /// Seconds since the Unix epoch at commit time.
    pub occurred_at: i64,
}

/// An envelope that has not been appended yet - everything but the id.
///
/// `EventLog::append` consumes one of these and returns the id the log
/// assigned, which is the only way an [`Envelope`] comes into existence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEnvelope {
    /// Stable name of the event type.
    pub name: String,
    /// String-keyed structured payload.
    pub payload: PayloadMap,
    /// Schema version byte.
    pub version: u8,
    /// Seconds since the Unix epoch at commit time.
    pub occurred_at: i64,
}

impl NewEnvelope {
    /// Attach the log-assigned id, producing the persisted record.
    pub fn into_envelope(self, id: EventId) -> Envelope {
        Envelope {
            id,
            name: self.name,
            payload: self.payload,
            version: self.version,
            occurred_at: self.occurred_at,
        }
    }
}

//─────────────────────────────
//  Event metadata
//─────────────────────────────

/// Envelope metadata carried into a reified event instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Schema version of the event.
    pub version: u8,
    /// Seconds since the Unix epoch at commit time.
    pub occurred_at: i64,
}

impl EventMeta {
    /// Metadata for a reified event, taken from its envelope.
    pub fn new(version: u8, occurred_at: i64) -> Self {
        Self {
            version,
            occurred_at,
        }
    }

    /// Metadata for an event that has not been committed yet.
    ///
    /// The engine stamps the envelope with the commit wall-clock time, so
    /// the `occurred_at` of a fresh instance is never persisted.
    pub fn fresh(version: u8) -> Self {
        Self {
            version,
            occurred_at: 0,
        }
    }
}

//─────────────────────────────
//  Domain event traits
//─────────────────────────────

/// Object-safe surface of a typed domain event.
///
/// Every event carrier exposes its schema version and commit time and is
/// downcastable via the [`Any`] supertrait, which is how the registries
/// match carriers by runtime type identity. Implementations own their data
/// (`'static`) and cross thread boundaries freely.
pub trait DomainEvent: Any + Send + Sync {
    /// Schema version of this event.
    fn version(&self) -> u8;

    /// Seconds since the Unix epoch at which the event occurred.
    ///
    /// Meaningful on reified instances; a freshly constructed event that has
    /// not been committed yet may report zero.
    fn occurred_at(&self) -> i64;
}

/// Runtime type identity of an event carrier.
///
/// Pointer and value access paths land on the same identity: this is always
/// the `TypeId` of the concrete carrier type behind the trait object.
pub fn event_type_id(event: &dyn DomainEvent) -> std::any::TypeId {
    let any: &dyn Any = event;
    any.type_id()
}

/// Downcast an erased event carrier to its concrete type.
pub fn downcast_event<E: DomainEvent>(event: &dyn DomainEvent) -> Option<&E> {
    let any: &dyn Any = event;
    any.downcast_ref::<E>()
}

/// A domain event the registry can take apart and rebuild.
///
/// The associated payload aggregate is a plain serde struct; its field names
/// (after `#[serde(rename)]`) are the serialization keys under which the
/// fields travel inside an envelope. The registry erases this trait at
/// registration time, so it only needs to be nameable where events are
/// registered.
pub trait Reifiable: DomainEvent + Sized {
    /// The named payload aggregate of this event.
    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Borrow the payload aggregate for serialization.
    fn payload(&self) -> &Self::Payload;

    /// Rebuild a carrier from a decoded payload and envelope metadata.
    fn from_parts(payload: Self::Payload, meta: EventMeta) -> Self;
}
