//! Resolves localized faces in a frame to gallery identities.

use crate::clock::Clock;
use crate::face::{reduce_by_identity, FaceData};
use crate::gallery::{mint_unique_id, IdentityGallery};
use crate::recognizer::{Recognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding, Frame, UNKNOWN_NAME};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Distance threshold used by the confidence curve.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Largest usable threshold. At 1.0 the curve's range collapses to zero.
pub const MAX_MATCH_THRESHOLD: f32 = 0.99;

/// Upper bound on unknown embeddings remembered in stable mode.
const MAX_REMEMBERED_UNKNOWNS: usize = 256;

/// Confidence (percent, two decimals) that a face at `distance` is the
/// gallery identity it was matched against.
///
/// Linear above `threshold`; below it the curve is pushed towards 100%.
/// `threshold` is clamped to `[0, MAX_MATCH_THRESHOLD]`.
pub fn face_confidence(distance: f32, threshold: f32) -> f32 {
    let threshold = threshold.clamp(0.0, MAX_MATCH_THRESHOLD);
    let range = 1.0 - threshold;
    let linear = (1.0 - distance) / (range * 2.0);

    let value = if distance > threshold {
        linear * 100.0
    } else {
        (linear + (1.0 - linear) * ((linear - 0.5) * 2.0).powf(0.2)) * 100.0
    };
    (value * 100.0).round() / 100.0
}

/// How ids are assigned to faces that match no gallery identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnknownPolicy {
    /// Every unknown face gets a fresh id, unique within its batch only.
    FreshPerBatch,
    /// Reuse the id of a previously seen unknown face whose embedding lies
    /// within `tolerance`.
    Stable { tolerance: f32 },
}

impl Default for UnknownPolicy {
    fn default() -> Self {
        Self::FreshPerBatch
    }
}

pub struct MatchEngine {
    threshold: f32,
    policy: UnknownPolicy,
    remembered: VecDeque<(Uuid, Embedding)>,
    clock: Arc<dyn Clock>,
}

impl MatchEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            policy: UnknownPolicy::default(),
            remembered: VecDeque::new(),
            clock,
        }
    }

    /// Set the confidence threshold, clamped to `[0, MAX_MATCH_THRESHOLD]`.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        let clamped = threshold.clamp(0.0, MAX_MATCH_THRESHOLD);
        if clamped != threshold {
            tracing::warn!(requested = threshold, used = clamped, "match threshold out of range");
        }
        self.threshold = clamped;
        self
    }

    pub fn with_unknown_policy(mut self, policy: UnknownPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn unknown_policy(&self) -> UnknownPolicy {
        self.policy
    }

    /// Resolve every box to a [`FaceData`], one per box, in box order.
    ///
    /// A box takes gallery entry *k* only when *k* is the nearest entry and
    /// its match flag is set; otherwise it is unknown.
    pub fn resolve(
        &mut self,
        recognizer: &mut dyn Recognizer,
        gallery: &IdentityGallery,
        frame: Arc<Frame>,
        boxes: &[BoundingBox],
    ) -> Result<Vec<FaceData>, RecognizerError> {
        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings = recognizer.encode(&frame, boxes)?;
        if embeddings.len() != boxes.len() {
            return Err(RecognizerError::EncodeCount {
                expected: boxes.len(),
                actual: embeddings.len(),
            });
        }

        let now = self.clock.now();
        let mut batch_ids: HashSet<Uuid> = HashSet::with_capacity(boxes.len());
        let mut faces = Vec::with_capacity(boxes.len());

        for (bounding_box, embedding) in boxes.iter().zip(embeddings) {
            let comparison = recognizer.compare(gallery.embeddings(), &embedding);

            let (id, name, description, confidence) = match comparison.resolved() {
                Some((idx, distance)) => {
                    let name = &gallery.names()[idx];
                    // Names are unique in a gallery, so this is the entry's own id.
                    let id = gallery.id_for_name(name).unwrap_or(gallery.ids()[idx]);
                    (
                        id,
                        name.clone(),
                        gallery.descriptions()[idx].clone(),
                        Some(face_confidence(distance, self.threshold)),
                    )
                }
                None => (
                    self.unknown_id(&embedding, &batch_ids),
                    UNKNOWN_NAME.to_string(),
                    String::new(),
                    None,
                ),
            };

            batch_ids.insert(id);
            faces.push(FaceData {
                id,
                name,
                description,
                embedding,
                bounding_box: *bounding_box,
                source_frame: Arc::clone(&frame),
                confidence,
                first_seen: now,
                last_seen: now,
            });
        }

        Ok(faces)
    }

    /// [`resolve`](Self::resolve) followed by the per-identity reducer.
    pub fn run(
        &mut self,
        recognizer: &mut dyn Recognizer,
        gallery: &IdentityGallery,
        frame: Arc<Frame>,
        boxes: &[BoundingBox],
    ) -> Result<Vec<FaceData>, RecognizerError> {
        let faces = self.resolve(recognizer, gallery, frame, boxes)?;
        Ok(reduce_by_identity(faces))
    }

    fn unknown_id(&mut self, embedding: &Embedding, batch_ids: &HashSet<Uuid>) -> Uuid {
        let UnknownPolicy::Stable { tolerance } = self.policy else {
            return mint_unique_id(batch_ids);
        };

        let nearest = self
            .remembered
            .iter()
            .filter(|(id, _)| !batch_ids.contains(id))
            .map(|(id, known)| (*id, known.euclidean_distance(embedding)))
            .filter(|(_, d)| *d <= tolerance)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((id, distance)) = nearest {
            tracing::trace!(%id, distance, "re-identified unknown face");
            return id;
        }

        let id = mint_unique_id(batch_ids);
        if self.remembered.len() == MAX_REMEMBERED_UNKNOWNS {
            self.remembered.pop_front();
        }
        self.remembered.push_back((id, embedding.clone()));
        id
    }
}
