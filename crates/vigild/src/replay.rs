//! Recorded detections played back in place of a camera.
//!
//! A recording is a JSON-lines file, one frame per line:
//!
//! ```json
//! {"sequence":0,"width":640,"height":480,"detections":[{"bounding_box":{"x":10,"y":20,"width":80,"height":80},"embedding":[0.1,0.2]}]}
//! ```
//!
//! The same recording feeds the frame source and the recognizer, so the
//! daemon runs end to end without capture hardware.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vigil_core::{
    BoundingBox, Embedding, EuclideanMatcher, Frame, GalleryComparison, Matcher, Recognizer,
    RecognizerError,
};

use crate::monitor::FrameSource;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to read recording {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("recording line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("recording line {line}: duplicate frame sequence {sequence}")]
    DuplicateSequence { line: usize, sequence: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedDetection {
    pub bounding_box: BoundingBox,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedFrame {
    pub sequence: u64,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub detections: Vec<RecordedDetection>,
}

/// A parsed recording, in file order.
#[derive(Debug, Default)]
pub struct Recording {
    frames: Vec<RecordedFrame>,
    by_sequence: HashMap<u64, usize>,
}

impl Recording {
    pub fn load(path: &Path) -> Result<Self, ReplayError> {
        let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let recording = Self::parse(&text)?;
        tracing::info!(
            path = %path.display(),
            frames = recording.len(),
            "loaded recording"
        );
        Ok(recording)
    }

    /// Parse JSON lines; blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self, ReplayError> {
        let mut frames = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let frame: RecordedFrame = serde_json::from_str(line)
                .map_err(|source| ReplayError::Parse { line: i + 1, source })?;
            frames.push((i + 1, frame));
        }
        Self::from_numbered(frames)
    }

    fn from_numbered(numbered: Vec<(usize, RecordedFrame)>) -> Result<Self, ReplayError> {
        let mut frames = Vec::with_capacity(numbered.len());
        let mut by_sequence = HashMap::with_capacity(numbered.len());
        for (line, frame) in numbered {
            if by_sequence.insert(frame.sequence, frames.len()).is_some() {
                return Err(ReplayError::DuplicateSequence {
                    line,
                    sequence: frame.sequence,
                });
            }
            frames.push(frame);
        }
        Ok(Self { frames, by_sequence })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, sequence: u64) -> Option<&RecordedFrame> {
        self.by_sequence.get(&sequence).map(|&i| &self.frames[i])
    }
}

/// Yields recorded frames in file order, once each.
pub struct ReplaySource {
    recording: Arc<Recording>,
    next: usize,
}

impl ReplaySource {
    pub fn new(recording: Arc<Recording>) -> Self {
        Self { recording, next: 0 }
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Option<Frame> {
        let recorded = self.recording.frames.get(self.next)?;
        self.next += 1;
        Some(Frame::new(
            Vec::new(),
            recorded.width,
            recorded.height,
            recorded.sequence,
        ))
    }
}

/// Answers `locate` and `encode` from the recording by frame sequence.
#[derive(Clone)]
pub struct ReplayRecognizer {
    recording: Arc<Recording>,
    matcher: EuclideanMatcher,
}

impl ReplayRecognizer {
    pub fn new(recording: Arc<Recording>, tolerance: f32) -> Self {
        Self {
            recording,
            matcher: EuclideanMatcher { tolerance },
        }
    }

    fn recorded(&self, frame: &Frame) -> Result<&RecordedFrame, RecognizerError> {
        self.recording.frame(frame.sequence).ok_or_else(|| {
            RecognizerError::Locate(format!("frame {} not in recording", frame.sequence))
        })
    }
}

impl Recognizer for ReplayRecognizer {
    fn locate(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, RecognizerError> {
        Ok(self
            .recorded(frame)?
            .detections
            .iter()
            .map(|d| d.bounding_box)
            .collect())
    }

    fn encode(
        &mut self,
        frame: &Frame,
        boxes: &[BoundingBox],
    ) -> Result<Vec<Embedding>, RecognizerError> {
        let recorded = self.recorded(frame)?;
        boxes
            .iter()
            .map(|b| {
                recorded
                    .detections
                    .iter()
                    .find(|d| d.bounding_box == *b)
                    .map(|d| d.embedding.clone())
                    .ok_or_else(|| {
                        RecognizerError::Encode(format!(
                            "no recorded embedding for box {b:?} in frame {}",
                            frame.sequence
                        ))
                    })
            })
            .collect()
    }

    fn compare(&self, gallery: &[Embedding], probe: &Embedding) -> GalleryComparison {
        self.matcher.compare(gallery, probe)
    }
}
