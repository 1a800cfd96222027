//! Roster of currently present identities and session windowing.
//!
//! Worker batches are folded into the roster with [`PresenceTracker::merge`];
//! [`PresenceTracker::sweep`] evicts identities that have not been seen for
//! a while and writes their closed sessions to the store. Both take the same
//! lock, so the roster is never observed half-updated.

use crate::clock::Clock;
use crate::face::{FaceData, Sighting};
use crate::session::{PersistenceError, PersistenceStore, SessionRecord};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default inactivity window: two minutes.
pub const DEFAULT_INACTIVITY: Duration = Duration::from_secs(2 * 60);

#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("failed to persist {failed} session(s): {source}")]
    Persist {
        failed: usize,
        #[source]
        source: PersistenceError,
    },
}

/// What happens when a present identity is seen again after the inactivity
/// window but before a sweep evicted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RolloverPolicy {
    /// Restart the window at the new sighting; the stale interval is dropped.
    #[default]
    ResetFirstSeen,
    /// Close the stale interval into a session record and open a new one.
    SplitSession,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Arrived { id: Uuid, name: String },
    Departed { name: String, record: SessionRecord },
}

/// Read-only view of a roster entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub confidence: Option<f32>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl From<&FaceData> for RosterEntry {
    fn from(face: &FaceData) -> Self {
        Self {
            id: face.id,
            name: face.name.clone(),
            description: face.description.clone(),
            confidence: face.confidence,
            first_seen: face.first_seen.wall,
            last_seen: face.last_seen.wall,
        }
    }
}

type Listener = Box<dyn Fn(&PresenceEvent) + Send + Sync>;

pub struct PresenceTracker {
    roster: Mutex<Vec<FaceData>>,
    store: Arc<dyn PersistenceStore>,
    clock: Arc<dyn Clock>,
    inactivity: Duration,
    rollover: RolloverPolicy,
    listener: Option<Listener>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PersistenceStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            roster: Mutex::new(Vec::new()),
            store,
            clock,
            inactivity: DEFAULT_INACTIVITY,
            rollover: RolloverPolicy::default(),
            listener: None,
        }
    }

    pub fn with_inactivity(mut self, inactivity: Duration) -> Self {
        self.inactivity = inactivity;
        self
    }

    pub fn with_rollover(mut self, rollover: RolloverPolicy) -> Self {
        self.rollover = rollover;
        self
    }

    /// Called with every arrival and departure, after the roster lock is released.
    pub fn with_listener(mut self, listener: impl Fn(&PresenceEvent) + Send + Sync + 'static) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn inactivity(&self) -> Duration {
        self.inactivity
    }

    /// Fold one worker batch into the roster.
    ///
    /// Unknown faces are ignored. A present identity has its window
    /// extended to the detection's first sighting; an absent one opens a
    /// new entry. If a split session cannot be persisted the events already
    /// produced are still delivered to the listener.
    pub fn merge(&self, batch: &[FaceData]) -> Result<Vec<PresenceEvent>, PresenceError> {
        let mut events = Vec::new();
        let mut failure: Option<(usize, PersistenceError)> = None;

        {
            let mut roster = self.lock();
            for face in batch.iter().filter(|f| !f.is_unknown()) {
                let Some(pos) = roster.iter().position(|e| e.id == face.id) else {
                    tracing::info!(id = %face.id, name = %face.name, confidence = ?face.confidence, "arrived");
                    roster.push(face.clone());
                    events.push(PresenceEvent::Arrived {
                        id: face.id,
                        name: face.name.clone(),
                    });
                    continue;
                };
                let entry = &mut roster[pos];

                let stale = face.first_seen.since(&entry.last_seen) > self.inactivity;
                if stale && self.rollover == RolloverPolicy::SplitSession {
                    let record = SessionRecord::closing(entry);
                    match self.store.append(&record) {
                        Ok(()) => {
                            tracing::info!(id = %face.id, duration_secs = record.duration_secs, "session split after inactivity");
                            events.push(PresenceEvent::Departed {
                                name: entry.name.clone(),
                                record,
                            });
                            *entry = face.clone();
                            events.push(PresenceEvent::Arrived {
                                id: face.id,
                                name: face.name.clone(),
                            });
                            continue;
                        }
                        Err(e) => {
                            tracing::error!(id = %face.id, error = %e, "failed to persist split session");
                            let count = failure.as_ref().map_or(0, |(n, _)| *n) + 1;
                            let source = failure.map_or(e, |(_, first)| first);
                            failure = Some((count, source));
                            // Keep the stale window so a later merge or sweep can close it.
                            continue;
                        }
                    }
                }

                if entry.mark_seen(face.first_seen, self.inactivity) == Sighting::RolledOver {
                    tracing::debug!(id = %face.id, "seen again after inactivity; window restarted");
                }
            }
        }

        self.notify(&events);
        match failure {
            Some((failed, source)) => Err(PresenceError::Persist { failed, source }),
            None => Ok(events),
        }
    }

    /// Evict every entry unseen for at least `threshold_secs` whole seconds,
    /// persisting one session record per eviction. `0` evicts everything.
    ///
    /// An entry whose record cannot be written stays in the roster and is
    /// retried on the next sweep.
    pub fn sweep(&self, threshold_secs: u64) -> Result<Vec<SessionRecord>, PresenceError> {
        let now = self.clock.now();
        let mut records = Vec::new();
        let mut events = Vec::new();
        let mut failed = 0usize;
        let mut first_error: Option<PersistenceError> = None;

        {
            let mut roster = self.lock();
            let mut kept = Vec::with_capacity(roster.len());

            for entry in roster.drain(..) {
                if now.since(&entry.last_seen).as_secs() < threshold_secs {
                    kept.push(entry);
                    continue;
                }

                let record = SessionRecord::closing(&entry);
                match self.store.append(&record) {
                    Ok(()) => {
                        tracing::info!(
                            id = %entry.id,
                            name = %entry.name,
                            duration_secs = record.duration_secs,
                            "departed"
                        );
                        events.push(PresenceEvent::Departed {
                            name: entry.name,
                            record: record.clone(),
                        });
                        records.push(record);
                    }
                    Err(e) => {
                        tracing::error!(id = %entry.id, error = %e, "failed to persist session; keeping entry");
                        failed += 1;
                        first_error.get_or_insert(e);
                        kept.push(entry);
                    }
                }
            }

            *roster = kept;
        }

        self.notify(&events);
        match first_error {
            Some(source) => Err(PresenceError::Persist { failed, source }),
            None => Ok(records),
        }
    }

    /// Evict and persist every entry.
    pub fn flush(&self) -> Result<Vec<SessionRecord>, PresenceError> {
        self.sweep(0)
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.lock().iter().map(RosterEntry::from).collect()
    }

    /// First and last sighting of a present identity.
    pub fn first_last_seen(&self, id: Uuid) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.lock()
            .iter()
            .find(|e| e.id == id)
            .map(|e| (e.first_seen.wall, e.last_seen.wall))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.lock().iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FaceData>> {
        self.roster.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, events: &[PresenceEvent]) {
        if let Some(listener) = &self.listener {
            for event in events {
                listener(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::face::fixtures::face;
    use crate::session::MemorySessionStore;
    use crate::types::UNKNOWN_NAME;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemorySessionStore>,
        tracker: PresenceTracker,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemorySessionStore::new());
        let tracker = PresenceTracker::new(store.clone(), clock.clone());
        Harness { clock, store, tracker }
    }

    struct FailingStore;

    impl PersistenceStore for FailingStore {
        fn append(&self, _record: &SessionRecord) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("disk full".into()))
        }

        fn records_for(&self, _id: Uuid) -> Result<Vec<SessionRecord>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    /// Memory store whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemorySessionStore,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl PersistenceStore for FlakyStore {
        fn append(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("disk full".into()));
            }
            self.inner.append(record)
        }

        fn records_for(&self, id: Uuid) -> Result<Vec<SessionRecord>, PersistenceError> {
            self.inner.records_for(id)
        }
    }

    #[test]
    fn test_merge_opens_entry_and_notifies_arrival() {
        let h = harness();
        let alice = Uuid::new_v4();

        let events = h.tracker.merge(&[face(alice, "Alice", Some(99.0), h.clock.now())]).unwrap();

        assert_eq!(events, vec![PresenceEvent::Arrived { id: alice, name: "Alice".into() }]);
        assert!(h.tracker.contains(alice));
        assert_eq!(h.tracker.roster()[0].confidence, Some(99.0));
    }

    #[test]
    fn test_merge_ignores_unknown_faces() {
        let h = harness();
        let events = h
            .tracker
            .merge(&[face(Uuid::new_v4(), UNKNOWN_NAME, None, h.clock.now())])
            .unwrap();
        assert!(events.is_empty());
        assert!(h.tracker.is_empty());
    }

    #[test]
    fn test_merge_repeat_sighting_extends_last_seen_only() {
        let h = harness();
        let alice = Uuid::new_v4();
        let t0 = h.clock.now();
        h.tracker.merge(&[face(alice, "Alice", Some(90.0), t0)]).unwrap();

        h.clock.advance(Duration::from_secs(45));
        let t1 = h.clock.now();
        let events = h.tracker.merge(&[face(alice, "Alice", Some(95.0), t1)]).unwrap();

        assert!(events.is_empty());
        assert_eq!(h.tracker.len(), 1);
        assert_eq!(h.tracker.first_last_seen(alice), Some((t0.wall, t1.wall)));
    }

    #[test]
    fn test_merge_after_inactivity_resets_window_by_default() {
        let h = harness();
        let alice = Uuid::new_v4();
        h.tracker.merge(&[face(alice, "Alice", None, h.clock.now())]).unwrap();

        h.clock.advance(Duration::from_secs(300));
        let t1 = h.clock.now();
        let events = h.tracker.merge(&[face(alice, "Alice", None, t1)]).unwrap();

        assert!(events.is_empty());
        assert_eq!(h.tracker.first_last_seen(alice), Some((t1.wall, t1.wall)));
        assert!(h.store.is_empty());
    }

    #[test]
    fn test_merge_after_inactivity_splits_when_configured() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemorySessionStore::new());
        let tracker = PresenceTracker::new(store.clone(), clock.clone())
            .with_rollover(RolloverPolicy::SplitSession);
        let alice = Uuid::new_v4();

        let t0 = clock.now();
        tracker.merge(&[face(alice, "Alice", None, t0)]).unwrap();
        clock.advance(Duration::from_secs(30));
        tracker.merge(&[face(alice, "Alice", None, clock.now())]).unwrap();

        clock.advance(Duration::from_secs(300));
        let t2 = clock.now();
        let events = tracker.merge(&[face(alice, "Alice", None, t2)]).unwrap();

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], PresenceEvent::Departed { record, .. } if record.duration_secs == 30));
        assert!(matches!(&events[1], PresenceEvent::Arrived { id, .. } if *id == alice));
        assert_eq!(store.records_for(alice).unwrap().len(), 1);
        assert_eq!(tracker.first_last_seen(alice), Some((t2.wall, t2.wall)));
    }

    #[test]
    fn test_failed_split_keeps_stale_window_for_retry() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(FlakyStore::default());
        let tracker = PresenceTracker::new(store.clone(), clock.clone())
            .with_rollover(RolloverPolicy::SplitSession);
        let alice = Uuid::new_v4();

        let t0 = clock.now();
        tracker.merge(&[face(alice, "Alice", None, t0)]).unwrap();
        clock.advance(Duration::from_secs(30));
        let t1 = clock.now();
        tracker.merge(&[face(alice, "Alice", None, t1)]).unwrap();

        store.set_failing(true);
        clock.advance(Duration::from_secs(300));
        let err = tracker.merge(&[face(alice, "Alice", None, clock.now())]).unwrap_err();
        assert!(matches!(err, PresenceError::Persist { failed: 1, .. }));
        assert_eq!(tracker.first_last_seen(alice), Some((t0.wall, t1.wall)));

        store.set_failing(false);
        let records = tracker.flush().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].duration_secs, 30);
        assert_eq!(store.records_for(alice).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_split_is_retried_on_next_merge() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(FlakyStore::default());
        let tracker = PresenceTracker::new(store.clone(), clock.clone())
            .with_rollover(RolloverPolicy::SplitSession);
        let alice = Uuid::new_v4();

        tracker.merge(&[face(alice, "Alice", None, clock.now())]).unwrap();
        clock.advance(Duration::from_secs(20));
        tracker.merge(&[face(alice, "Alice", None, clock.now())]).unwrap();

        store.set_failing(true);
        clock.advance(Duration::from_secs(300));
        assert!(tracker.merge(&[face(alice, "Alice", None, clock.now())]).is_err());

        store.set_failing(false);
        clock.advance(Duration::from_secs(1));
        let t3 = clock.now();
        let events = tracker.merge(&[face(alice, "Alice", None, t3)]).unwrap();

        assert!(matches!(&events[0], PresenceEvent::Departed { record, .. } if record.duration_secs == 20));
        assert_eq!(tracker.first_last_seen(alice), Some((t3.wall, t3.wall)));
        assert_eq!(store.records_for(alice).unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_zero_flushes_everything() {
        let h = harness();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let batch: Vec<FaceData> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| face(*id, &format!("P{i}"), Some(80.0), h.clock.now()))
            .collect();
        h.tracker.merge(&batch).unwrap();

        let records = h.tracker.sweep(0).unwrap();

        assert_eq!(records.len(), 3);
        assert!(h.tracker.is_empty());
        for id in ids {
            assert_eq!(h.store.records_for(id).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_sweep_below_threshold_evicts_nothing() {
        let h = harness();
        h.tracker.merge(&[face(Uuid::new_v4(), "Alice", None, h.clock.now())]).unwrap();
        h.clock.advance(Duration::from_secs(10));

        assert!(h.tracker.sweep(11).unwrap().is_empty());
        assert_eq!(h.tracker.len(), 1);
        assert!(h.store.is_empty());
    }

    #[test]
    fn test_sweep_inactivity_boundary() {
        // Alice seen at t0 and again at t0+30s; last seen is t1.
        let h = harness();
        let alice = Uuid::new_v4();
        let t0 = h.clock.now();
        h.tracker.merge(&[face(alice, "Alice", Some(97.0), t0)]).unwrap();
        h.clock.advance(Duration::from_secs(30));
        let t1 = h.clock.now();
        h.tracker.merge(&[face(alice, "Alice", Some(97.0), t1)]).unwrap();

        h.clock.advance(Duration::from_secs(119));
        assert!(h.tracker.sweep(120).unwrap().is_empty());
        assert!(h.tracker.contains(alice));
        assert!(h.store.is_empty());

        h.clock.advance(Duration::from_secs(2));
        let records = h.tracker.sweep(120).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!h.tracker.contains(alice));

        let record = &records[0];
        assert_eq!(record.identity_id, alice);
        assert_eq!(record.arrival, t0.wall);
        assert_eq!(record.departure, t1.wall);
        assert_eq!(record.duration_secs, 30);
        assert_eq!(h.store.records_for(alice).unwrap(), records);
    }

    #[test]
    fn test_sweep_notifies_departure() {
        let clock = Arc::new(ManualClock::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let tracker = PresenceTracker::new(Arc::new(MemorySessionStore::new()), clock.clone())
            .with_listener(move |e| sink.lock().unwrap().push(e.clone()));
        let alice = Uuid::new_v4();

        tracker.merge(&[face(alice, "Alice", None, clock.now())]).unwrap();
        tracker.flush().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[0], PresenceEvent::Arrived { .. }));
        assert!(matches!(&seen[1], PresenceEvent::Departed { name, record } if name == "Alice" && record.identity_id == alice));
    }

    #[test]
    fn test_sweep_keeps_entry_when_store_fails() {
        let clock = Arc::new(ManualClock::new());
        let tracker = PresenceTracker::new(Arc::new(FailingStore), clock.clone());
        let alice = Uuid::new_v4();
        tracker.merge(&[face(alice, "Alice", None, clock.now())]).unwrap();

        let err = tracker.sweep(0).unwrap_err();
        assert!(matches!(err, PresenceError::Persist { failed: 1, .. }));
        assert!(tracker.contains(alice));
    }
}
