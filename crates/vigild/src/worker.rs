use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use vigil_core::{
    BoundingBox, Clock, FaceData, Frame, IdentityGallery, MatchEngine, Recognizer, UnknownPolicy,
};

/// Re-match an unchanged scene at least this often.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(3);

/// How long `stop()` waits for the worker thread to confirm it has exited.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker is not running")]
    Disconnected,
    #[error("worker did not terminate within {0:?}")]
    TerminationTimeout(Duration),
    #[error("queue teardown failed: {0}")]
    QueueTeardown(String),
}

/// One unit of work: localized boxes plus a private copy of their frame.
pub struct MatchRequest {
    pub boxes: Vec<BoundingBox>,
    pub frame: Frame,
}

/// Faces resolved from one request, published as a whole.
pub type FaceBatch = Vec<FaceData>;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub recheck_interval: Duration,
    pub stop_timeout: Duration,
    pub match_threshold: f32,
    pub unknown_policy: UnknownPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            match_threshold: vigil_core::DEFAULT_MATCH_THRESHOLD,
            unknown_policy: UnknownPolicy::default(),
        }
    }
}

/// Per-request matching with debounce. Runs on the worker thread only.
struct MatchLoop<R> {
    recognizer: R,
    gallery: Arc<IdentityGallery>,
    engine: MatchEngine,
    clock: Arc<dyn Clock>,
    recheck_interval: Duration,
    previous_box_count: usize,
    last_match: Option<Instant>,
    previous_batch: FaceBatch,
}

impl<R: Recognizer> MatchLoop<R> {
    fn new(
        recognizer: R,
        gallery: Arc<IdentityGallery>,
        clock: Arc<dyn Clock>,
        settings: &WorkerSettings,
    ) -> Self {
        let engine = MatchEngine::new(clock.clone())
            .with_threshold(settings.match_threshold)
            .with_unknown_policy(settings.unknown_policy);
        Self {
            recognizer,
            gallery,
            engine,
            clock,
            recheck_interval: settings.recheck_interval,
            previous_box_count: 0,
            last_match: None,
            previous_batch: Vec::new(),
        }
    }

    /// Process one request, returning a batch to publish if matching ran.
    fn process(&mut self, request: MatchRequest) -> Option<FaceBatch> {
        let MatchRequest { boxes, frame } = request;

        if boxes.is_empty() {
            self.previous_box_count = 0;
            return None;
        }
        if self.gallery.is_empty() {
            tracing::trace!("gallery empty; skipping match");
            return None;
        }

        let now = self.clock.now().mono;
        if self.is_unchanged(boxes.len(), now) {
            tracing::trace!(boxes = boxes.len(), "scene unchanged; skipping match");
            return None;
        }

        self.previous_box_count = boxes.len();
        self.last_match = Some(now);

        let started = Instant::now();
        let batch = match self.engine.run(
            &mut self.recognizer,
            &self.gallery,
            Arc::new(frame),
            &boxes,
        ) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, boxes = boxes.len(), "match failed; dropping request");
                return None;
            }
        };

        tracing::debug!(
            sequence = batch.first().map_or(0, |f| f.source_frame.sequence),
            frame_age_ms = batch
                .first()
                .map_or(0, |f| f.source_frame.captured_at.elapsed().as_millis() as u64),
            boxes = boxes.len(),
            faces = batch.len(),
            unknown = batch.iter().filter(|f| f.is_unknown()).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch matched"
        );

        self.previous_batch = batch.clone();
        Some(batch)
    }

    /// Same box count, everyone known, and the recheck interval not yet up.
    fn is_unchanged(&self, box_count: usize, now: Instant) -> bool {
        let Some(last) = self.last_match else {
            return false;
        };
        box_count == self.previous_box_count
            && !self.previous_batch.iter().any(FaceData::is_unknown)
            && now.saturating_duration_since(last) < self.recheck_interval
    }
}

#[derive(Default)]
struct Activity {
    busy: bool,
    exited: bool,
}

/// State shared between the handle and the worker thread.
#[derive(Default)]
struct Shared {
    activity: Mutex<Activity>,
    changed: Condvar,
    cancelled: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_busy(&self, busy: bool) {
        self.lock().busy = busy;
        self.changed.notify_all();
    }
}

/// Marks the worker as exited when the thread ends, including by panic.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut activity = self.0.lock();
        activity.busy = false;
        activity.exited = true;
        drop(activity);
        self.0.changed.notify_all();
    }
}

/// Owner of the worker thread and both of its queues.
pub struct WorkerHandle {
    inbound: Option<mpsc::UnboundedSender<MatchRequest>>,
    outbound: mpsc::UnboundedReceiver<FaceBatch>,
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
    stop_timeout: Duration,
}

impl WorkerHandle {
    /// Spawn the match loop on a dedicated OS thread.
    pub fn start<R>(
        recognizer: R,
        gallery: Arc<IdentityGallery>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Result<Self, WorkerError>
    where
        R: Recognizer + 'static,
    {
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<MatchRequest>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<FaceBatch>();
        let shared = Arc::new(Shared::default());

        let thread_shared = shared.clone();
        let mut match_loop = MatchLoop::new(recognizer, gallery, clock, &settings);

        let thread = std::thread::Builder::new()
            .name("vigil-worker".into())
            .spawn(move || {
                let _exit = ExitGuard(thread_shared.clone());
                tracing::info!(
                    identities = match_loop.gallery.len(),
                    unknown_policy = ?match_loop.engine.unknown_policy(),
                    "worker thread started"
                );

                while let Some(request) = in_rx.blocking_recv() {
                    if thread_shared.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    thread_shared.set_busy(true);
                    let published = match match_loop.process(request) {
                        Some(batch) => out_tx.send(batch).is_ok(),
                        None => true,
                    };
                    thread_shared.set_busy(false);
                    if !published {
                        tracing::warn!("outbound queue closed; worker exiting");
                        break;
                    }
                }

                in_rx.close();
                let mut discarded = 0usize;
                while in_rx.try_recv().is_ok() {
                    discarded += 1;
                }
                tracing::info!(discarded, "worker thread exiting");
            })
            .map_err(WorkerError::Spawn)?;

        Ok(Self {
            inbound: Some(in_tx),
            outbound: out_rx,
            shared,
            thread: Some(thread),
            stop_timeout: settings.stop_timeout,
        })
    }

    /// Queue boxes with a copy of their frame. Never blocks.
    ///
    /// Fails once the worker has exited or the handle is stopping.
    pub fn submit(&self, boxes: &[BoundingBox], frame: &Frame) -> Result<(), WorkerError> {
        let inbound = self.inbound.as_ref().ok_or(WorkerError::Disconnected)?;
        if !self.is_running() {
            return Err(WorkerError::Disconnected);
        }
        inbound
            .send(MatchRequest {
                boxes: boxes.to_vec(),
                frame: frame.clone(),
            })
            .map_err(|_| WorkerError::Disconnected)
    }

    /// Whether a batch is being matched right now.
    pub fn is_active(&self) -> bool {
        self.shared.lock().busy
    }

    /// Whether the worker thread is still alive.
    pub fn is_running(&self) -> bool {
        !self.shared.lock().exited
    }

    /// Every batch ready right now, oldest first.
    pub fn drain_ready(&mut self) -> Vec<FaceBatch> {
        let mut batches = Vec::new();
        while let Ok(batch) = self.outbound.try_recv() {
            batches.push(batch);
        }
        batches
    }

    /// Block until a batch arrives or the worker exits.
    #[cfg(test)]
    pub fn recv_blocking(&mut self) -> Option<FaceBatch> {
        self.outbound.blocking_recv()
    }

    /// Stop the worker: signal exit, wait for any in-flight batch and for
    /// the thread to finish, then discard unread results.
    ///
    /// Returns how many published batches were discarded. A thread that does
    /// not finish within the stop timeout is a hard failure.
    pub fn stop(mut self) -> Result<usize, WorkerError> {
        self.shared.cancelled.store(true, Ordering::Release);
        drop(self.inbound.take());

        let activity = self.shared.lock();
        let (activity, wait) = self
            .shared
            .changed
            .wait_timeout_while(activity, self.stop_timeout, |a| !a.exited)
            .unwrap_or_else(|e| e.into_inner());
        let timed_out = wait.timed_out() && !activity.exited;
        drop(activity);

        if timed_out {
            tracing::error!(timeout = ?self.stop_timeout, "worker did not terminate");
            return Err(WorkerError::TerminationTimeout(self.stop_timeout));
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                let err = WorkerError::QueueTeardown("worker thread panicked".into());
                tracing::warn!(error = %err, "continuing shutdown");
            }
        }

        self.outbound.close();
        let mut discarded = 0usize;
        while self.outbound.try_recv().is_ok() {
            discarded += 1;
        }
        tracing::info!(discarded, "worker stopped");
        Ok(discarded)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shared.cancelled.store(true, Ordering::Release);
            drop(self.inbound.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;
    use vigil_core::{Embedding, GalleryEntry, ManualClock, RecognizerError};

    /// Recognizer that returns one fixed embedding per box and counts calls.
    #[derive(Clone)]
    struct CountingRecognizer {
        embedding: Vec<f32>,
        encode_calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl CountingRecognizer {
        fn new(embedding: &[f32]) -> Self {
            Self {
                embedding: embedding.to_vec(),
                encode_calls: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.encode_calls.load(Ordering::SeqCst)
        }
    }

    impl Recognizer for CountingRecognizer {
        fn locate(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, RecognizerError> {
            Ok(Vec::new())
        }

        fn encode(
            &mut self,
            _frame: &Frame,
            boxes: &[BoundingBox],
        ) -> Result<Vec<Embedding>, RecognizerError> {
            self.encode_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            Ok(boxes
                .iter()
                .map(|_| Embedding::new(self.embedding.clone()))
                .collect())
        }
    }

    fn gallery_with(name: &str, id: Uuid) -> Arc<IdentityGallery> {
        Arc::new(
            IdentityGallery::from_entries(vec![GalleryEntry {
                id: Some(id),
                name: name.into(),
                description: String::new(),
                reference_image: None,
                embedding: Embedding::new(vec![0.0, 0.0]),
            }])
            .unwrap(),
        )
    }

    fn boxes(n: usize) -> Vec<BoundingBox> {
        (0..n)
            .map(|i| BoundingBox {
                x: 30.0 * i as f32,
                y: 0.0,
                width: 20.0,
                height: 20.0,
            })
            .collect()
    }

    fn request(n: usize) -> MatchRequest {
        MatchRequest {
            boxes: boxes(n),
            frame: Frame::new(vec![0; 16], 4, 4, 0),
        }
    }

    fn match_loop(
        recognizer: CountingRecognizer,
        gallery: Arc<IdentityGallery>,
        clock: Arc<ManualClock>,
    ) -> MatchLoop<CountingRecognizer> {
        MatchLoop::new(recognizer, gallery, clock, &WorkerSettings::default())
    }

    #[test]
    fn test_unchanged_known_scene_is_debounced() {
        let clock = Arc::new(ManualClock::new());
        let recognizer = CountingRecognizer::new(&[0.1, 0.0]);
        let mut lp = match_loop(recognizer.clone(), gallery_with("Alice", Uuid::new_v4()), clock.clone());

        assert!(lp.process(request(2)).is_some());
        clock.advance(Duration::from_secs(1));
        assert!(lp.process(request(2)).is_none());
        assert_eq!(recognizer.calls(), 1);
    }

    #[test]
    fn test_recheck_interval_forces_rematch() {
        let clock = Arc::new(ManualClock::new());
        let recognizer = CountingRecognizer::new(&[0.1, 0.0]);
        let mut lp = match_loop(recognizer.clone(), gallery_with("Alice", Uuid::new_v4()), clock.clone());

        lp.process(request(1));
        clock.advance(Duration::from_secs(3));
        assert!(lp.process(request(1)).is_some());
        assert_eq!(recognizer.calls(), 2);
    }

    #[test]
    fn test_changed_box_count_forces_rematch() {
        let clock = Arc::new(ManualClock::new());
        let recognizer = CountingRecognizer::new(&[0.1, 0.0]);
        let mut lp = match_loop(recognizer.clone(), gallery_with("Alice", Uuid::new_v4()), clock.clone());

        lp.process(request(1));
        clock.advance(Duration::from_millis(100));
        assert!(lp.process(request(2)).is_some());
        assert_eq!(recognizer.calls(), 2);
    }

    #[test]
    fn test_unknown_in_previous_batch_forces_rematch() {
        let clock = Arc::new(ManualClock::new());
        // Far from the only gallery entry: every face is unknown.
        let recognizer = CountingRecognizer::new(&[5.0, 5.0]);
        let mut lp = match_loop(recognizer.clone(), gallery_with("Alice", Uuid::new_v4()), clock.clone());

        let first = lp.process(request(1)).unwrap();
        assert!(first[0].is_unknown());
        clock.advance(Duration::from_millis(100));
        assert!(lp.process(request(1)).is_some());
        assert_eq!(recognizer.calls(), 2);
    }

    #[test]
    fn test_empty_boxes_produce_nothing_and_reset_count() {
        let clock = Arc::new(ManualClock::new());
        let recognizer = CountingRecognizer::new(&[0.1, 0.0]);
        let mut lp = match_loop(recognizer.clone(), gallery_with("Alice", Uuid::new_v4()), clock.clone());

        lp.process(request(1));
        assert!(lp.process(request(0)).is_none());
        // Same count as before the empty frame, but the reset forces a match.
        assert!(lp.process(request(1)).is_some());
        assert_eq!(recognizer.calls(), 2);
    }

    #[test]
    fn test_empty_gallery_is_skipped() {
        let clock = Arc::new(ManualClock::new());
        let recognizer = CountingRecognizer::new(&[0.1, 0.0]);
        let mut lp = match_loop(recognizer.clone(), Arc::new(IdentityGallery::empty()), clock);

        assert!(lp.process(request(1)).is_none());
        assert_eq!(recognizer.calls(), 0);
    }

    #[test]
    fn test_worker_publishes_batches_in_order() {
        let alice = Uuid::new_v4();
        let recognizer = CountingRecognizer::new(&[0.1, 0.0]);
        let clock = Arc::new(ManualClock::new());
        let mut worker = WorkerHandle::start(
            recognizer.clone(),
            gallery_with("Alice", alice),
            clock,
            WorkerSettings::default(),
        )
        .unwrap();

        let frame = Frame::new(vec![1; 16], 4, 4, 7);
        worker.submit(&boxes(1), &frame).unwrap();
        worker.submit(&boxes(2), &frame).unwrap();

        let first = worker.recv_blocking().unwrap();
        let second = worker.recv_blocking().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, alice);
        assert_eq!(first[0].source_frame.sequence, 7);
        // Two boxes resolving to Alice reduce to one detection.
        assert_eq!(second.len(), 1);
        assert_eq!(recognizer.calls(), 2);

        assert_eq!(worker.stop().unwrap(), 0);
    }

    #[test]
    fn test_debounced_request_publishes_nothing() {
        let recognizer = CountingRecognizer::new(&[0.1, 0.0]);
        let clock = Arc::new(ManualClock::new());
        let mut worker = WorkerHandle::start(
            recognizer.clone(),
            gallery_with("Alice", Uuid::new_v4()),
            clock.clone(),
            WorkerSettings::default(),
        )
        .unwrap();

        let frame = Frame::new(vec![0; 16], 4, 4, 0);
        worker.submit(&boxes(2), &frame).unwrap();
        assert!(worker.recv_blocking().is_some());

        clock.advance(Duration::from_secs(1));
        worker.submit(&boxes(2), &frame).unwrap();
        // A changed count afterwards proves the debounced request was consumed.
        worker.submit(&boxes(3), &frame).unwrap();
        let next = worker.recv_blocking().unwrap();
        assert_eq!(next[0].source_frame.sequence, 0);
        assert_eq!(recognizer.calls(), 2);
        assert!(worker.drain_ready().is_empty());

        worker.stop().unwrap();
    }

    #[test]
    fn test_stop_discards_unread_results() {
        let recognizer = CountingRecognizer::new(&[0.1, 0.0]);
        let mut worker = WorkerHandle::start(
            recognizer,
            gallery_with("Alice", Uuid::new_v4()),
            Arc::new(ManualClock::new()),
            WorkerSettings::default(),
        )
        .unwrap();

        let frame = Frame::new(vec![0; 16], 4, 4, 0);
        for n in 1..=3 {
            worker.submit(&boxes(n), &frame).unwrap();
        }
        // Consume one to be sure the worker has been running.
        assert!(worker.recv_blocking().is_some());

        let discarded = worker.stop().unwrap();
        assert!(discarded <= 2);
    }

    #[test]
    fn test_stop_waits_for_in_flight_batch() {
        let mut recognizer = CountingRecognizer::new(&[0.1, 0.0]);
        recognizer.delay = Duration::from_millis(200);
        let worker = WorkerHandle::start(
            recognizer.clone(),
            gallery_with("Alice", Uuid::new_v4()),
            Arc::new(ManualClock::new()),
            WorkerSettings::default(),
        )
        .unwrap();

        worker.submit(&boxes(1), &Frame::new(vec![0; 16], 4, 4, 0)).unwrap();
        while recognizer.calls() == 0 {
            std::thread::yield_now();
        }
        assert!(worker.is_active());

        let discarded = worker.stop().unwrap();
        assert_eq!(discarded, 1);
    }

    #[test]
    fn test_stop_times_out_on_stuck_batch() {
        let mut recognizer = CountingRecognizer::new(&[0.1, 0.0]);
        recognizer.delay = Duration::from_millis(500);
        let settings = WorkerSettings {
            stop_timeout: Duration::from_millis(50),
            ..WorkerSettings::default()
        };
        let worker = WorkerHandle::start(
            recognizer.clone(),
            gallery_with("Alice", Uuid::new_v4()),
            Arc::new(ManualClock::new()),
            settings,
        )
        .unwrap();

        worker.submit(&boxes(1), &Frame::new(vec![0; 16], 4, 4, 0)).unwrap();
        while recognizer.calls() == 0 {
            std::thread::yield_now();
        }

        let err = worker.stop().unwrap_err();
        assert!(matches!(err, WorkerError::TerminationTimeout(_)));
    }

    #[test]
    fn test_submit_after_worker_exit_is_refused() {
        let recognizer = CountingRecognizer::new(&[0.1, 0.0]);
        let mut worker = WorkerHandle::start(
            recognizer,
            gallery_with("Alice", Uuid::new_v4()),
            Arc::new(ManualClock::new()),
            WorkerSettings::default(),
        )
        .unwrap();

        // Dropping the outbound side makes the worker exit on its next publish.
        worker.outbound.close();
        worker.submit(&boxes(1), &Frame::new(vec![0; 16], 4, 4, 0)).unwrap();
        while worker.is_running() {
            std::thread::yield_now();
        }

        let err = worker.submit(&boxes(1), &Frame::new(vec![0; 16], 4, 4, 0));
        assert!(matches!(err, Err(WorkerError::Disconnected)));
        assert!(worker.stop().is_ok());
    }
}
