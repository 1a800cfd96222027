//! vigil-core — Identity matching and presence tracking.
//!
//! Resolves localized face boxes against a static identity gallery,
//! reduces each batch to one detection per identity, and folds batches
//! into a roster of present identities whose closed sessions are written
//! to a [`PersistenceStore`].

pub mod clock;
pub mod face;
pub mod gallery;
pub mod matcher;
pub mod presence;
pub mod recognizer;
pub mod session;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use face::{reduce_by_identity, FaceData, Sighting};
pub use gallery::{GalleryEntry, GalleryError, Identity, IdentityGallery};
pub use matcher::{
    face_confidence, MatchEngine, UnknownPolicy, DEFAULT_MATCH_THRESHOLD, MAX_MATCH_THRESHOLD,
};
pub use presence::{PresenceError, PresenceEvent, PresenceTracker, RolloverPolicy, RosterEntry};
pub use recognizer::{EuclideanMatcher, GalleryComparison, Matcher, Recognizer, RecognizerError};
pub use session::{MemorySessionStore, PersistenceError, PersistenceStore, SessionRecord};
pub use types::{BoundingBox, Embedding, Frame, UNKNOWN_NAME};
