#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-store-sled** – Sled-based persistent storage driver for
//! Chronicle.
//!
//! This crate provides a durable, embedded backend using the sled database
//! engine. One [`SledStore`] implements both storage traits over a single
//! database: envelopes live in one tree keyed by big-endian event id (so key
//! order equals id order), projector cursors in another keyed by projector
//! name. Envelopes are encoded at rest with MessagePack.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sled::{Db, Tree};
use tokio::sync::Mutex;

use chronicle_store_core::{CursorStore, EventLog, StoreError};
use chronicle_types::{Envelope, EventId, NewEnvelope};

const ENVELOPES_TREE: &str = "envelopes";
const CURSORS_TREE: &str = "cursors";

/// Ids start at one so that zero never names an envelope.
const FIRST_EVENT_ID: EventId = 1;

//─────────────────────────────
//  Sled storage driver
//─────────────────────────────

/// A persistent event log and cursor store on the sled embedded database.
///
/// Appends run under a dedicated lock spanning id assignment and insertion,
/// so assigned ids equal commit order even with concurrent committers. The
/// next id is derived from the highest stored key, which keeps the sequence
/// correct across process restarts without a separate counter record.
#[derive(Debug)]
pub struct SledStore {
    _db: Db, // Keep reference to prevent premature database closure
    envelopes: Tree,
    cursors: Tree,
    append_lock: Mutex<()>,
}

impl SledStore {
    /// Opens or creates a sled database at the specified path.
    ///
    /// The database will be created if it doesn't exist. This operation may
    /// perform recovery if the database was not properly closed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, sled::Config::default())
    }

    /// Opens a sled database with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: sled::Config) -> Result<Self> {
        let db = config.path(path).open()?;
        Self::from_db(db)
    }

    /// Creates a store from an existing sled database instance.
    ///
    /// Useful when the database is shared with other components or opened
    /// with a custom sled configuration.
    pub fn from_db(db: Db) -> Result<Self> {
        let envelopes = db.open_tree(ENVELOPES_TREE)?;
        let cursors = db.open_tree(CURSORS_TREE)?;
        Ok(Self {
            _db: db,
            envelopes,
            cursors,
            append_lock: Mutex::new(()),
        })
    }

    /// Creates a temporary store for testing purposes.
    ///
    /// The database lives in a temporary directory and is removed when the
    /// store is dropped.
    #[cfg(test)]
    pub fn temporary() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    /// Number of envelopes in the log.
    pub fn event_count(&self) -> usize {
        self.envelopes.len()
    }

    /// Number of projector cursors currently tracked.
    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    /// Flush all pending writes to disk.
    ///
    /// Committed events are only guaranteed to survive a crash or power
    /// failure once a flush has completed.
    pub async fn flush(&self) -> Result<()> {
        self.envelopes.flush_async().await?;
        self.cursors.flush_async().await?;
        Ok(())
    }

    /// Size of the database on disk, in bytes.
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self._db.size_on_disk()?)
    }

    fn next_id(&self) -> Result<EventId, StoreError> {
        match self.envelopes.last().map_err(StoreError::backend)? {
            Some((key, _)) => Ok(decode_id(&key)? + 1),
            None => Ok(FIRST_EVENT_ID),
        }
    }
}

fn decode_id(key: &[u8]) -> Result<EventId, StoreError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("envelope key of length {}", key.len())))?;
    Ok(EventId::from_be_bytes(bytes))
}

fn decode_envelope(bytes: &[u8]) -> Result<Envelope, StoreError> {
    rmp_serde::from_slice(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
}

#[async_trait]
impl EventLog for SledStore {
    async fn append(&self, envelope: NewEnvelope) -> Result<EventId, StoreError> {
        // Id assignment and insertion must not interleave across committers.
        let _guard = self.append_lock.lock().await;

        let id = self.next_id()?;
        let envelope = envelope.into_envelope(id);
        let bytes = rmp_serde::to_vec_named(&envelope).map_err(StoreError::backend)?;
        self.envelopes
            .insert(id.to_be_bytes(), bytes)
            .map_err(StoreError::backend)?;
        Ok(id)
    }

    async fn fetch_by_id(&self, id: EventId) -> Result<Envelope, StoreError> {
        match self
            .envelopes
            .get(id.to_be_bytes())
            .map_err(StoreError::backend)?
        {
            Some(bytes) => decode_envelope(&bytes),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn scan_ascending(
        &self,
        visit: &mut (dyn FnMut(EventId) + Send),
    ) -> Result<(), StoreError> {
        // Big-endian keys make sled's byte order the id order.
        for item in self.envelopes.iter() {
            let (key, _) = item.map_err(StoreError::backend)?;
            visit(decode_id(&key)?);
        }
        Ok(())
    }

    async fn count_matching(
        &self,
        names: &std::collections::BTreeSet<String>,
        since_id_exclusive: Option<EventId>,
    ) -> Result<u64, StoreError> {
        let start = match since_id_exclusive {
            Some(id) => id + 1,
            None => FIRST_EVENT_ID,
        };
        let mut count = 0_u64;
        for item in self.envelopes.range(start.to_be_bytes()..) {
            let (_, bytes) = item.map_err(StoreError::backend)?;
            if names.contains(&decode_envelope(&bytes)?.name) {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl CursorStore for SledStore {
    async fn last_handled(&self, projector: &str) -> Result<Option<EventId>, StoreError> {
        self.cursors
            .get(projector.as_bytes())
            .map_err(StoreError::backend)?
            .map(|bytes| decode_id(&bytes))
            .transpose()
    }

    async fn update_last_handled(
        &self,
        projector: &str,
        event: EventId,
    ) -> Result<(), StoreError> {
        self.cursors
            .insert(projector.as_bytes(), event.to_be_bytes().to_vec())
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn drop_all(&self) -> Result<(), StoreError> {
        self.cursors.clear().map_err(StoreError::backend)?;
        Ok(())
    }
}
