//! Closed presence sessions and where they are written.

use crate::face::FaceData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    #[error("session store error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// One continuous presence interval of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub identity_id: Uuid,
    pub arrival: DateTime<Utc>,
    pub departure: DateTime<Utc>,
    /// Whole seconds between arrival and departure.
    pub duration_secs: u64,
}

impl SessionRecord {
    pub fn new(identity_id: Uuid, arrival: DateTime<Utc>, departure: DateTime<Utc>) -> Self {
        let duration_secs = (departure - arrival).num_seconds().max(0) as u64;
        Self {
            identity_id,
            arrival,
            departure,
            duration_secs,
        }
    }

    /// Close the presence window held by a roster entry.
    pub fn closing(face: &FaceData) -> Self {
        Self::new(face.id, face.first_seen.wall, face.last_seen.wall)
    }
}

/// Append-only sink for session records, keyed by identity id.
pub trait PersistenceStore: Send + Sync {
    fn append(&self, record: &SessionRecord) -> Result<(), PersistenceError>;

    /// All records for `identity_id`, oldest first.
    fn records_for(&self, identity_id: Uuid) -> Result<Vec<SessionRecord>, PersistenceError>;
}

/// In-process store, for tests and runs that do not need durability.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<Vec<SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceStore for MemorySessionStore {
    fn append(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        self.records
            .lock()
            .map_err(|e| PersistenceError::Unavailable(format!("lock poisoned: {e}")))?
            .push(record.clone());
        Ok(())
    }

    fn records_for(&self, identity_id: Uuid) -> Result<Vec<SessionRecord>, PersistenceError> {
        let records = self
            .records
            .lock()
            .map_err(|e| PersistenceError::Unavailable(format!("lock poisoned: {e}")))?;
        Ok(records
            .iter()
            .filter(|r| r.identity_id == identity_id)
            .cloned()
            .collect())
    }
}
