//! Capture-side loop: localize, forward to the worker, merge results.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use vigil_core::{
    Clock, Frame, IdentityGallery, PresenceError, PresenceEvent, PresenceTracker, Recognizer,
    SessionRecord,
};

use crate::worker::{FaceBatch, WorkerError, WorkerHandle, WorkerSettings};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("presence error: {0}")]
    Presence(#[from] PresenceError),
    #[error("worker already running")]
    AlreadyRunning,
}

/// Anything that produces frames for the monitor.
pub trait FrameSource {
    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Option<Frame>;
}

/// Decides which localized frames are worth sending to the worker.
///
/// A frame goes out when its box count differs from the last one sent, or
/// when `interval` has passed and faces are present. Frames without boxes
/// always go out so the worker can reset its own debounce state.
#[derive(Debug)]
pub struct SubmitGate {
    interval: Duration,
    last_count: Option<usize>,
    last_submit: Option<Instant>,
}

impl SubmitGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_count: None,
            last_submit: None,
        }
    }

    pub fn admit(&mut self, box_count: usize, now: Instant) -> bool {
        let changed = self.last_count != Some(box_count);
        let due = self
            .last_submit
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);

        let admit = box_count == 0 || changed || due;
        if admit {
            self.last_count = Some(box_count);
            self.last_submit = Some(now);
        }
        admit
    }
}

/// Summary of one [`Monitor::tick`].
#[derive(Debug, Default)]
pub struct Tick {
    /// The frame source had nothing left.
    pub exhausted: bool,
    pub boxes: usize,
    pub submitted: bool,
    pub events: Vec<PresenceEvent>,
    pub closed: Vec<SessionRecord>,
    /// Sessions that could not be persisted this tick. Their entries stay
    /// in the roster and are retried by later merges and sweeps.
    pub errors: Vec<PresenceError>,
}

/// Outcome of folding worker batches into the roster.
#[derive(Debug, Default)]
pub struct Merged {
    pub events: Vec<PresenceEvent>,
    pub errors: Vec<PresenceError>,
}

/// Merge every batch in order. A failed merge does not stop later batches.
pub fn merge_batches(tracker: &PresenceTracker, batches: Vec<FaceBatch>) -> Merged {
    let mut merged = Merged::default();
    for batch in batches {
        match tracker.merge(&batch) {
            Ok(events) => merged.events.extend(events),
            Err(e) => {
                tracing::warn!(error = %e, faces = batch.len(), "batch merged with persistence errors");
                merged.errors.push(e);
            }
        }
    }
    merged
}

pub struct Monitor<S, L> {
    source: S,
    locator: L,
    worker: Option<WorkerHandle>,
    tracker: Arc<PresenceTracker>,
    gate: SubmitGate,
    clock: Arc<dyn Clock>,
}

impl<S: FrameSource, L: Recognizer> Monitor<S, L> {
    pub fn new(
        source: S,
        locator: L,
        tracker: Arc<PresenceTracker>,
        clock: Arc<dyn Clock>,
        submit_interval: Duration,
    ) -> Self {
        Self {
            source,
            locator,
            worker: None,
            tracker,
            gate: SubmitGate::new(submit_interval),
            clock,
        }
    }

    pub fn tracker(&self) -> &Arc<PresenceTracker> {
        &self.tracker
    }

    pub fn worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(WorkerHandle::is_running)
    }

    pub fn start_worker<R>(
        &mut self,
        recognizer: R,
        gallery: Arc<IdentityGallery>,
        settings: WorkerSettings,
    ) -> Result<(), MonitorError>
    where
        R: Recognizer + 'static,
    {
        if self.worker.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }
        let worker = WorkerHandle::start(recognizer, gallery, self.clock.clone(), settings)?;
        self.worker = Some(worker);
        tracing::info!("worker started");
        Ok(())
    }

    /// One capture step: read a frame, localize, maybe forward, then merge
    /// whatever the worker has published and sweep inactive identities.
    ///
    /// Only worker failures are returned as errors. Persistence failures are
    /// reported in [`Tick::errors`] and the sweep always runs.
    pub fn tick(&mut self) -> Result<Tick, MonitorError> {
        let mut tick = Tick::default();

        match self.source.next_frame() {
            Some(frame) => self.capture(&frame, &mut tick)?,
            None => tick.exhausted = true,
        }

        let merged = self.drain_results();
        tick.events = merged.events;
        tick.errors = merged.errors;

        match self.tracker.sweep(self.tracker.inactivity().as_secs()) {
            Ok(closed) => tick.closed = closed,
            Err(e) => tick.errors.push(e),
        }
        Ok(tick)
    }

    fn capture(&mut self, frame: &Frame, tick: &mut Tick) -> Result<(), MonitorError> {
        let boxes = match self.locator.locate(frame) {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!(sequence = frame.sequence, error = %e, "locate failed; skipping frame");
                return Ok(());
            }
        };
        tick.boxes = boxes.len();

        let Some(worker) = self.worker.as_ref() else {
            return Ok(());
        };
        if self.gate.admit(boxes.len(), self.clock.now().mono) {
            worker.submit(&boxes, frame)?;
            tick.submitted = true;
            tracing::trace!(sequence = frame.sequence, boxes = boxes.len(), "frame submitted");
        }
        Ok(())
    }

    /// Merge every batch the worker has ready into the roster.
    pub fn drain_results(&mut self) -> Merged {
        match self.worker.as_mut() {
            Some(worker) => merge_batches(&self.tracker, worker.drain_ready()),
            None => Merged::default(),
        }
    }

    /// Stop the worker, discarding anything it published but we never read.
    pub fn stop_worker(&mut self) -> Result<usize, MonitorError> {
        match self.worker.take() {
            Some(worker) => {
                tracing::debug!(busy = worker.is_active(), "stopping worker");
                Ok(worker.stop()?)
            }
            None => Ok(0),
        }
    }

    /// Stop the worker and close every open session.
    ///
    /// The roster is flushed even when the worker fails to stop cleanly.
    pub fn shutdown(&mut self) -> Result<Vec<SessionRecord>, MonitorError> {
        let stopped = self.stop_worker();
        let closed = self.tracker.flush()?;
        tracing::info!(closed = closed.len(), "roster flushed");
        stopped?;
        Ok(closed)
    }
}
