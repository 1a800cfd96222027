//! Recognizer capability consumed by the matching pipeline.
//!
//! Localization and embedding extraction are provided by an external
//! implementation; this crate only defines the seam and the default
//! distance-based comparison.

use crate::types::{BoundingBox, Embedding, Frame};
use thiserror::Error;

/// Default maximum Euclidean distance for a gallery entry to count as a match.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("face localization failed: {0}")]
    Locate(String),
    #[error("embedding extraction failed: {0}")]
    Encode(String),
    #[error("recognizer returned {actual} embeddings for {expected} boxes")]
    EncodeCount { expected: usize, actual: usize },
}

/// Per-entry comparison of one probe embedding against a gallery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GalleryComparison {
    /// `true` where the entry's distance is within tolerance.
    pub matches: Vec<bool>,
    /// Distance to every gallery entry, in gallery order.
    pub distances: Vec<f32>,
}

impl GalleryComparison {
    /// Index and distance of the nearest entry. Ties keep the first index.
    pub fn nearest(&self) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;
        for (i, &d) in self.distances.iter().enumerate() {
            if d.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }
        best
    }

    /// The nearest entry, only if its match flag is also set.
    pub fn resolved(&self) -> Option<(usize, f32)> {
        self.nearest()
            .filter(|(idx, _)| self.matches.get(*idx).copied().unwrap_or(false))
    }
}

/// Strategy for comparing a probe embedding against gallery embeddings.
pub trait Matcher {
    fn compare(&self, gallery: &[Embedding], probe: &Embedding) -> GalleryComparison;
}

/// Euclidean distance matcher: an entry matches when its distance is at
/// most `tolerance`.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, gallery: &[Embedding], probe: &Embedding) -> GalleryComparison {
        let distances: Vec<f32> = gallery
            .iter()
            .map(|known| known.euclidean_distance(probe))
            .collect();
        let matches = distances.iter().map(|&d| d <= self.tolerance).collect();
        GalleryComparison { matches, distances }
    }
}

/// Face localization, encoding and gallery comparison.
///
/// `encode` must return exactly one embedding per box, in box order.
pub trait Recognizer: Send {
    fn locate(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, RecognizerError>;

    fn encode(
        &mut self,
        frame: &Frame,
        boxes: &[BoundingBox],
    ) -> Result<Vec<Embedding>, RecognizerError>;

    fn compare(&self, gallery: &[Embedding], probe: &Embedding) -> GalleryComparison {
        EuclideanMatcher::default().compare(gallery, probe)
    }
}
