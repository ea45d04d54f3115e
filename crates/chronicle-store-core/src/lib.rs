#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-store-core** – Core storage abstractions for Chronicle.
//!
//! This crate defines the contracts for event and cursor persistence without
//! providing concrete implementations. Storage drivers (in-memory, sled, …)
//! implement these traits in separate crates that depend on this core
//! abstraction.
//!
//! Two traits make up the storage surface: [`EventLog`], the append-only
//! ordered store of envelopes, and [`CursorStore`], the per-projector table
//! of last-handled event ids. A driver may implement both on one type when
//! it owns a single underlying database.

use std::collections::BTreeSet;

use async_trait::async_trait;

use chronicle_types::{Envelope, EventId, NewEnvelope};

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors surfaced by storage drivers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No envelope exists under the requested id.
    #[error("event {0} not found")]
    NotFound(EventId),
    /// A stored record could not be decoded.
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
    /// The underlying storage engine failed.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Wrap a driver-level failure as a backend error.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        StoreError::Backend(err.to_string())
    }
}

//─────────────────────────────
//  Event log trait
//─────────────────────────────

/// Abstraction over the durable, append-only ordered event log.
///
/// The log assigns every appended envelope an [`EventId`] that is strictly
/// greater than any id it handed out before; id order *is* commit order.
/// `append` is the linearization point for concurrent committers - drivers
/// must serialize id assignment and insertion so the two never interleave.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Persist an envelope and return the id the log assigned to it.
    ///
    /// The returned id is strictly greater than every previously returned
    /// id. A failed append leaves no envelope behind.
    async fn append(&self, envelope: NewEnvelope) -> Result<EventId, StoreError>;

    /// Fetch the envelope stored under `id`.
    async fn fetch_by_id(&self, id: EventId) -> Result<Envelope, StoreError>;

    /// Visit every envelope id in ascending order.
    ///
    /// The scan reflects all appends that completed before it started. The
    /// visitor must not mutate the log; drivers may hold internal locks for
    /// the duration of the scan.
    async fn scan_ascending(
        &self,
        visit: &mut (dyn FnMut(EventId) + Send),
    ) -> Result<(), StoreError>;

    /// Count envelopes whose `name` is in `names` and, when given, whose id
    /// is strictly greater than `since_id_exclusive`.
    async fn count_matching(
        &self,
        names: &BTreeSet<String>,
        since_id_exclusive: Option<EventId>,
    ) -> Result<u64, StoreError>;
}

//─────────────────────────────
//  Cursor store trait
//─────────────────────────────

/// Abstraction over the per-projector cursor table.
///
/// A cursor row exists iff the projector has handled at least one event.
/// Rows only ever move forward; the sole way back is [`drop_all`], which
/// replay uses to rebuild every projection from scratch.
///
/// [`drop_all`]: CursorStore::drop_all
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Read the cursor for `projector`, if it has one.
    async fn last_handled(&self, projector: &str) -> Result<Option<EventId>, StoreError>;

    /// Upsert the cursor for `projector` to `event`.
    async fn update_last_handled(&self, projector: &str, event: EventId)
        -> Result<(), StoreError>;

    /// Remove every cursor row.
    async fn drop_all(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_for_operators() {
        assert_eq!(StoreError::NotFound(7).to_string(), "event 7 not found");
        assert_eq!(
            StoreError::backend("disk on fire").to_string(),
            "storage backend failure: disk on fire"
        );
        assert!(StoreError::Corrupt("truncated".into())
            .to_string()
            .contains("truncated"));
    }
}
