//! Per-detection entity and the batch reducer.

use crate::clock::Timestamp;
use crate::types::{BoundingBox, Embedding, Frame, UNKNOWN_NAME};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One resolved detection of a face.
#[derive(Debug, Clone)]
pub struct FaceData {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub embedding: Embedding,
    pub bounding_box: BoundingBox,
    /// Frame the detection came from, shared by every detection of a batch.
    pub source_frame: Arc<Frame>,
    /// Match confidence in percent. `None` for unknown faces.
    pub confidence: Option<f32>,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

/// Outcome of [`FaceData::mark_seen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// Seen within the inactivity window; `last_seen` moved forward.
    Extended,
    /// Seen after the inactivity window; both bounds reset to the sighting.
    RolledOver,
    /// Sighting older than `last_seen`; nothing changed.
    Stale,
}

impl FaceData {
    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_NAME
    }

    /// Record a sighting at `at`.
    ///
    /// Within `inactivity` of `last_seen` the presence window is extended.
    /// Beyond it, the window restarts at `at` rather than opening a second
    /// session.
    pub fn mark_seen(&mut self, at: Timestamp, inactivity: Duration) -> Sighting {
        if at.mono < self.last_seen.mono {
            return Sighting::Stale;
        }
        if at.since(&self.last_seen) <= inactivity {
            self.last_seen = at;
            Sighting::Extended
        } else {
            self.first_seen = at;
            self.last_seen = at;
            Sighting::RolledOver
        }
    }

    /// Whether `other` should replace `self` when both resolve to one identity.
    fn outranked_by(&self, other: &FaceData) -> bool {
        match (self.confidence, other.confidence) {
            (None, Some(_)) => true,
            (Some(mine), Some(theirs)) => theirs > mine,
            _ => false,
        }
    }
}

/// Collapse a batch to one detection per identity, keeping the most
/// confident. Ties keep the earlier detection; output follows first
/// occurrence order.
pub fn reduce_by_identity(batch: Vec<FaceData>) -> Vec<FaceData> {
    let mut slots: HashMap<Uuid, usize> = HashMap::with_capacity(batch.len());
    let mut reduced: Vec<FaceData> = Vec::with_capacity(batch.len());

    for face in batch {
        match slots.get(&face.id) {
            Some(&slot) => {
                if reduced[slot].outranked_by(&face) {
                    reduced[slot] = face;
                }
            }
            None => {
                slots.insert(face.id, reduced.len());
                reduced.push(face);
            }
        }
    }

    reduced
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn frame() -> Arc<Frame> {
        Arc::new(Frame::new(vec![0; 4], 2, 2, 0))
    }

    pub fn face(id: Uuid, name: &str, confidence: Option<f32>, at: Timestamp) -> FaceData {
        FaceData {
            id,
            name: name.to_string(),
            description: String::new(),
            embedding: Embedding::new(vec![0.0; 4]),
            bounding_box: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
            },
            source_frame: frame(),
            confidence,
            first_seen: at,
            last_seen: at,
        }
    }
}
