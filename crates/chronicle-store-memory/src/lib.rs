#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-store-memory** – In-memory storage driver for Chronicle.
//!
//! This crate provides a fast, non-persistent backend suitable for testing,
//! development, and deployments where event persistence is not required. All
//! data is lost when the process terminates.
//!
//! One [`MemoryStore`] implements both storage traits: the ordered event log
//! and the projector cursor table.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use chronicle_store_core::{CursorStore, EventLog, StoreError};
use chronicle_types::{Envelope, EventId, NewEnvelope};

/// Ids start at one so that zero never names an envelope.
const FIRST_EVENT_ID: EventId = 1;

//─────────────────────────────
//  In-memory store
//─────────────────────────────

/// An in-memory, non-persistent event log and cursor store.
///
/// Envelopes live in an ordered map keyed by id, so ascending scans fall out
/// of the map's iteration order. Appends take the write lock for the whole
/// assign-and-insert step, which makes the id sequence equal to commit order
/// even under concurrent committers.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    log: Arc<RwLock<LogState>>,
    cursors: Arc<RwLock<HashMap<String, EventId>>>,
}

#[derive(Debug, Default)]
struct LogState {
    next_id: Option<EventId>,
    envelopes: BTreeMap<EventId, Envelope>,
}

impl MemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of envelopes currently in the log.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.envelopes.len()
    }

    /// Number of projector cursors currently tracked.
    pub async fn cursor_count(&self) -> usize {
        self.cursors.read().await.len()
    }

    /// Clear the log and all cursors.
    ///
    /// Useful in tests that reuse one store across scenarios. The id
    /// sequence is *not* reset, so previously handed-out ids stay unique.
    pub async fn clear(&self) {
        self.log.write().await.envelopes.clear();
        self.cursors.write().await.clear();
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append(&self, envelope: NewEnvelope) -> Result<EventId, StoreError> {
        let mut state = self.log.write().await;
        let id = state.next_id.unwrap_or(FIRST_EVENT_ID);
        state.next_id = Some(id + 1);
        state.envelopes.insert(id, envelope.into_envelope(id));
        Ok(id)
    }

    async fn fetch_by_id(&self, id: EventId) -> Result<Envelope, StoreError> {
        self.log
            .read()
            .await
            .envelopes
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn scan_ascending(
        &self,
        visit: &mut (dyn FnMut(EventId) + Send),
    ) -> Result<(), StoreError> {
        // The read lock is held for the whole scan; the visitor must not
        // append through the same store or it will deadlock.
        let state = self.log.read().await;
        for id in state.envelopes.keys() {
            visit(*id);
        }
        Ok(())
    }

    async fn count_matching(
        &self,
        names: &BTreeSet<String>,
        since_id_exclusive: Option<EventId>,
    ) -> Result<u64, StoreError> {
        let start = match since_id_exclusive {
            Some(id) => id + 1,
            None => FIRST_EVENT_ID,
        };
        let state = self.log.read().await;
        let count = state
            .envelopes
            .range(start..)
            .filter(|(_, envelope)| names.contains(&envelope.name))
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn last_handled(&self, projector: &str) -> Result<Option<EventId>, StoreError> {
        Ok(self.cursors.read().await.get(projector).copied())
    }

    async fn update_last_handled(
        &self,
        projector: &str,
        event: EventId,
    ) -> Result<(), StoreError> {
        self.cursors
            .write()
            .await
            .insert(projector.to_string(), event);
        Ok(())
    }

    async fn drop_all(&self) -> Result<(), StoreError> {
        self.cursors.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_types::PayloadMap;

    fn envelope(name: &str) -> NewEnvelope {
        NewEnvelope {
            name: name.to_string(),
            payload: PayloadMap::new(),
            version: 1,
            occurred_at: 0,
        }
    }

    fn names(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn append_assigns_strictly_increasing_ids() {
        let store = MemoryStore::new();
        let first = store.append(envelope("a")).await.unwrap();
        let second = store.append(envelope("b")).await.unwrap();
        let third = store.append(envelope("a")).await.unwrap();
        assert!(first < second && second < third);
        assert_eq!(store.event_count().await, 3);
    }

    #[tokio::test]
    async fn fetch_returns_the_stored_envelope() {
        let store = MemoryStore::new();
        let id = store.append(envelope("user.created")).await.unwrap();
        let fetched = store.fetch_by_id(id).await.unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.name, "user.created");
    }

    #[tokio::test]
    async fn fetch_of_unknown_id_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.fetch_by_id(99).await,
            Err(StoreError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn scan_visits_in_ascending_order() {
        let store = MemoryStore::new();
        let mut expected = Vec::new();
        for name in ["a", "b", "c", "d"] {
            expected.push(store.append(envelope(name)).await.unwrap());
        }

        let mut seen = Vec::new();
        store.scan_ascending(&mut |id| seen.push(id)).await.unwrap();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn count_matching_filters_by_name_and_cursor() {
        let store = MemoryStore::new();
        let a1 = store.append(envelope("a")).await.unwrap();
        let _b = store.append(envelope("b")).await.unwrap();
        let _a2 = store.append(envelope("a")).await.unwrap();
        let _c = store.append(envelope("c")).await.unwrap();

        assert_eq!(store.count_matching(&names(&["a"]), None).await.unwrap(), 2);
        assert_eq!(
            store
                .count_matching(&names(&["a", "c"]), None)
                .await
                .unwrap(),
            3
        );
        // Strictly-greater-than semantics: a1 itself is excluded.
        assert_eq!(
            store
                .count_matching(&names(&["a"]), Some(a1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store.count_matching(&names(&["x"]), None).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn concurrent_appends_get_unique_ids() {
        let store = MemoryStore::new();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..25 {
                    ids.push(store.append(envelope("e")).await.unwrap());
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
    }

    #[tokio::test]
    async fn cursors_upsert_and_drop() {
        let store = MemoryStore::new();
        assert_eq!(store.last_handled("p").await.unwrap(), None);

        store.update_last_handled("p", 4).await.unwrap();
        assert_eq!(store.last_handled("p").await.unwrap(), Some(4));

        store.update_last_handled("p", 9).await.unwrap();
        assert_eq!(store.last_handled("p").await.unwrap(), Some(9));

        store.update_last_handled("q", 2).await.unwrap();
        assert_eq!(store.cursor_count().await, 2);

        store.drop_all().await.unwrap();
        assert_eq!(store.cursor_count().await, 0);
        assert_eq!(store.last_handled("p").await.unwrap(), None);
    }
}
