use crate::camera::{CameraBackend, CameraInfo, Frame, FrameReceiver, FrameSource};
use crate::common::{AttendanceError, Config, DataLayout, Result};
use crate::core::{Annotator, Classifier, Detector, Embedder, OnnxEmbedder, OnnxFaceDetector};
use crate::service::recognition::{CycleThrottle, Identification, RecognitionPipeline};
use crate::service::training::{Trainer, TrainingReport};
use crate::storage::{AttendanceLedger, EnrollmentWriter, IdentityRecord, ModelStore};
use chrono::{Local, NaiveDate};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, RgbImage};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Capturing,
    Recognizing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    /// `None` when idle.
    pub mode: Option<Mode>,
    pub session_id: Option<u64>,
    pub device_index: u32,
}

/// What a caller gets back from [`SessionController::activate`].
pub struct SessionHandle {
    pub id: u64,
    pub mode: Mode,
    pub frames: FrameReceiver,
}

/// Outcome of [`SessionController::stop`]. The camera is released even when
/// the ledger flush fails.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopReport {
    pub stopped: bool,
    pub flushed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentReport {
    pub name: String,
    pub saved: usize,
    pub dir: PathBuf,
}

/// Detection and embedding networks. Loaded once; the classifier on top of
/// them is swapped on retraining.
#[derive(Clone)]
pub struct Networks {
    pub detector: Arc<dyn Detector>,
    pub embedder: Arc<dyn Embedder>,
}

impl Networks {
    pub fn load(config: &Config, layout: &DataLayout) -> Result<Self> {
        let detector = OnnxFaceDetector::new(
            &config.detector,
            &layout.model_path(&config.models.detector_path),
            config.recognizer.optimization_level,
        )?;
        let embedder = OnnxEmbedder::new(
            &config.recognizer,
            &layout.model_path(&config.models.recognizer_path),
        )?;
        Ok(Self { detector: Arc::new(detector), embedder: Arc::new(embedder) })
    }
}

struct ActiveSession {
    id: u64,
    mode: Mode,
    source: FrameSource,
}

struct Inner {
    active: Option<ActiveSession>,
    device_index: u32,
    next_id: u64,
}

/// Owns the camera session, the attendance ledger and the loaded models.
/// At most one camera is held at a time.
pub struct SessionController {
    backend: Arc<dyn CameraBackend>,
    config: Config,
    layout: DataLayout,
    inner: Mutex<Inner>,
    ledger: Arc<Mutex<AttendanceLedger>>,
    networks: Option<Networks>,
    classifier: RwLock<Option<Arc<dyn Classifier>>>,
    annotator: Annotator,
    today: fn() -> NaiveDate,
}

fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

impl SessionController {
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        config: Config,
        layout: DataLayout,
        ledger: AttendanceLedger,
        networks: Option<Networks>,
        annotator: Annotator,
    ) -> Self {
        let controller = Self {
            backend,
            inner: Mutex::new(Inner {
                active: None,
                device_index: config.camera.device_index,
                next_id: 0,
            }),
            config,
            layout,
            ledger: Arc::new(Mutex::new(ledger)),
            networks,
            classifier: RwLock::new(None),
            annotator,
            today: local_today,
        };

        match controller.reload_models() {
            Ok(()) => {}
            Err(AttendanceError::ModelsMissing) => {
                tracing::warn!("No trained classifier found; recognition disabled until training")
            }
            Err(e) => tracing::warn!("Failed to load classifier: {}", e),
        }
        controller
    }

    /// Replaces the wall clock used to roll the ledger over on reads.
    pub fn with_clock(mut self, today: fn() -> NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn model_store(&self) -> ModelStore {
        ModelStore::new(self.layout.models_dir())
    }

    /// Starts a session in `mode`, or switches the running one in place.
    pub fn activate(&self, mode: Mode) -> Result<SessionHandle> {
        if mode == Mode::Recognizing {
            self.pipeline()?;
        }

        let mut inner = self.lock_inner()?;
        if let Some(active) = inner.active.as_mut() {
            if active.mode != mode {
                tracing::info!("Session {} switching {:?} -> {:?}", active.id, active.mode, mode);
                active.mode = mode;
            }
            return Ok(SessionHandle {
                id: active.id,
                mode: active.mode,
                frames: active.source.subscribe(),
            });
        }

        let retry_delay = Duration::from_millis(self.config.camera.retry_delay_ms);
        let source = FrameSource::start(self.backend.as_ref(), inner.device_index, retry_delay)?;
        inner.next_id += 1;
        let id = inner.next_id;
        let frames = source.subscribe();
        inner.active = Some(ActiveSession { id, mode, source });
        tracing::info!("Session {} started in {:?} mode", id, mode);

        Ok(SessionHandle { id, mode, frames })
    }

    /// Releases the camera and flushes the ledger. A failed flush is logged and
    /// reported, not returned as an error.
    pub fn stop(&self) -> Result<StopReport> {
        let active = self.lock_inner()?.active.take();
        let stopped = active.is_some();
        if let Some(mut session) = active {
            session.source.stop();
            tracing::info!("Session {} stopped", session.id);
        }

        match self.flush_ledger() {
            Ok(()) => Ok(StopReport { stopped, flushed: true, error: None }),
            Err(e) => {
                tracing::error!("Failed to flush attendance on stop: {}", e);
                Ok(StopReport { stopped, flushed: false, error: Some(e.to_string()) })
            }
        }
    }

    /// Records the device for the next activation; a running session is stopped.
    pub fn select_device(&self, index: u32) -> Result<()> {
        let active = {
            let mut inner = self.lock_inner()?;
            inner.device_index = index;
            inner.active.take()
        };
        tracing::info!("Selected camera device {}", index);

        if let Some(mut session) = active {
            session.source.stop();
            tracing::info!("Session {} stopped for device change", session.id);
            self.flush_ledger()?;
        }
        Ok(())
    }

    /// Puts session `id` back into `mode` if it is still the active one.
    fn restore_mode(&self, id: u64, mode: Mode) -> Result<()> {
        let mut inner = self.lock_inner()?;
        if let Some(active) = inner.active.as_mut().filter(|a| a.id == id) {
            if active.mode != mode {
                tracing::info!("Session {} back to {:?}", id, mode);
                active.mode = mode;
            }
        }
        Ok(())
    }

    /// Current mode of session `id`; `None` once it is no longer active.
    pub fn mode_of(&self, id: u64) -> Option<Mode> {
        let inner = self.lock_inner().ok()?;
        inner.active.as_ref().filter(|a| a.id == id).map(|a| a.mode)
    }

    pub fn state(&self) -> Result<SessionState> {
        let inner = self.lock_inner()?;
        Ok(SessionState {
            mode: inner.active.as_ref().map(|a| a.mode),
            session_id: inner.active.as_ref().map(|a| a.id),
            device_index: inner.device_index,
        })
    }

    pub fn list_cameras(&self) -> Result<Vec<CameraInfo>> {
        self.backend.list_cameras()
    }

    pub fn models_loaded(&self) -> bool {
        self.pipeline().is_ok()
    }

    /// Reloads classifier and label map from `models/`.
    pub fn reload_models(&self) -> Result<()> {
        let loaded = self.model_store().load_classifier();
        let mut slot = self.classifier.write()
            .map_err(|_| AttendanceError::Model("Classifier lock poisoned".into()))?;
        match loaded {
            Ok(classifier) => {
                tracing::info!("Loaded classifier with {} identities", classifier.labels().len());
                *slot = Some(Arc::new(classifier));
                Ok(())
            }
            Err(e) => {
                *slot = None;
                Err(e)
            }
        }
    }

    pub fn install_classifier(&self, classifier: Arc<dyn Classifier>) -> Result<()> {
        let mut slot = self.classifier.write()
            .map_err(|_| AttendanceError::Model("Classifier lock poisoned".into()))?;
        *slot = Some(classifier);
        Ok(())
    }

    pub fn pipeline(&self) -> Result<RecognitionPipeline> {
        let networks = self.networks.as_ref().ok_or(AttendanceError::ModelsMissing)?;
        let classifier = self.classifier.read()
            .map_err(|_| AttendanceError::Model("Classifier lock poisoned".into()))?
            .clone()
            .ok_or(AttendanceError::ModelsMissing)?;
        Ok(RecognitionPipeline::new(networks.detector.clone(), networks.embedder.clone(), classifier))
    }

    /// Encodes a frame for streaming. In recognition mode the pipeline runs when
    /// the throttle allows and its results are drawn on this frame only.
    pub fn render_frame(&self, frame: &Frame, mode: Mode, throttle: &mut CycleThrottle) -> Result<Vec<u8>> {
        let quality = self.config.annotation.jpeg_quality;
        if mode == Mode::Capturing || !throttle.ready(Instant::now()) {
            return encode_jpeg(&frame.image, quality);
        }

        let results = match self.pipeline().and_then(|p| p.run_cycle(frame, &self.ledger)) {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!("Recognition cycle failed: {}", e);
                Vec::new()
            }
        };

        if let Ok(mut ledger) = self.ledger.lock() {
            if let Err(e) = ledger.flush_if_due(Instant::now()) {
                tracing::error!("Periodic attendance flush failed: {}", e);
            }
        }

        if results.is_empty() {
            return encode_jpeg(&frame.image, quality);
        }
        let mut canvas = frame.image.clone();
        self.annotator.draw(&mut canvas, &results);
        encode_jpeg(&canvas, quality)
    }

    /// Captures enrollment frames for a new identity into `faces/<name>/`.
    /// A session started here is stopped again once the quota is met; a
    /// running session gets its previous mode back. On failure the identity
    /// folder is removed so the name can be enrolled again.
    pub async fn enroll(self: &Arc<Self>, name: &str) -> Result<EnrollmentReport> {
        let name = validate_identity_name(name)?;
        let dir = self.layout.identity_dir(&name);
        if dir.exists() {
            return Err(AttendanceError::DuplicateIdentity(name));
        }

        let previous = self.state()?.mode;
        let session = self.clone();
        let handle = blocking(move || session.activate(Mode::Capturing)).await?;
        let timeout = Duration::from_secs(self.config.enrollment.frame_timeout_secs);
        tracing::info!("Enrolling {} into {}", name, dir.display());

        let outcome = match EnrollmentWriter::create(&dir, self.config.enrollment.quota) {
            Ok(writer) => fill_quota(writer, handle.frames, timeout).await,
            Err(e) => Err(e),
        };

        let released = match previous {
            None => {
                let session = self.clone();
                blocking(move || session.stop()).await.map(|_| ())
            }
            Some(mode) => self.restore_mode(handle.id, mode),
        };
        if let Err(e) = released {
            tracing::error!("Failed to release session after enrolling {}: {}", name, e);
        }

        let writer = match outcome {
            Ok(writer) => writer,
            Err(e) => {
                tracing::warn!("Enrollment of {} failed: {}", name, e);
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        tracing::error!("Failed to remove {}: {}", dir.display(), cleanup);
                    }
                }
                return Err(e);
            }
        };

        tracing::info!("Enrolled {} with {} images", name, writer.saved());
        Ok(EnrollmentReport { name, saved: writer.saved(), dir })
    }

    /// Retrains from `faces/` and swaps in the new classifier.
    pub fn train(&self) -> Result<TrainingReport> {
        let networks = self.networks.as_ref().ok_or(AttendanceError::ModelsMissing)?;
        let trainer = Trainer::new(
            networks.detector.as_ref(),
            networks.embedder.as_ref(),
            &self.config.recognition,
        );
        let (report, classifier) = trainer.run(&self.layout.faces_dir(), &self.model_store())?;
        self.install_classifier(Arc::new(classifier))?;
        Ok(report)
    }

    /// Classifies every face in an uploaded image without touching the ledger.
    pub fn identify_image(&self, bytes: &[u8]) -> Result<Vec<Identification>> {
        let pipeline = self.pipeline()?;
        let image = image::load_from_memory(bytes)
            .map_err(|e| AttendanceError::InvalidRequest(format!("Unreadable image: {}", e)))?;
        pipeline.identify(&image)
    }

    #[cfg(feature = "visualization")]
    pub fn analyze(&self) -> Result<Vec<u8>> {
        let features = self.model_store().load_features()?;
        crate::analysis::render_projection(&features)
    }

    /// Today's records; rolls the ledger over first if the date has changed.
    pub fn attendance_snapshot(&self) -> Result<Vec<IdentityRecord>> {
        let mut ledger = self.lock_ledger()?;
        ledger.advance_to((self.today)())?;
        Ok(ledger.snapshot())
    }

    pub fn attendance_files(&self) -> Result<Vec<String>> {
        self.lock_ledger()?.list_files()
    }

    pub fn read_attendance_file(&self, file_name: &str) -> Result<Vec<IdentityRecord>> {
        self.lock_ledger()?.read_file(file_name)
    }

    pub fn flush_ledger(&self) -> Result<()> {
        self.lock_ledger()?.flush()
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock()
            .map_err(|_| AttendanceError::Camera("Session lock poisoned".into()))
    }

    fn lock_ledger(&self) -> Result<MutexGuard<'_, AttendanceLedger>> {
        self.ledger.lock()
            .map_err(|_| AttendanceError::Storage("Attendance ledger lock poisoned".into()))
    }
}

/// Persists each new frame until the writer's quota is met.
async fn fill_quota(
    mut writer: EnrollmentWriter,
    mut frames: FrameReceiver,
    timeout: Duration,
) -> Result<EnrollmentWriter> {
    while !writer.is_complete() {
        match tokio::time::timeout(timeout, frames.changed()).await {
            Err(_) => {
                return Err(AttendanceError::Camera(format!("No frame within {}s", timeout.as_secs())))
            }
            Ok(Err(_)) => return Err(AttendanceError::Camera("Capture stopped".into())),
            Ok(Ok(())) => {}
        }

        let latest = frames.borrow_and_update().clone();
        let Some(frame) = latest else {
            continue;
        };
        writer = blocking(move || writer.persist(&frame.image).map(|_| writer)).await?;
    }
    Ok(writer)
}

/// Runs camera, disk and model work off the async workers.
pub(crate) async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| AttendanceError::Other(anyhow::anyhow!("Blocking task failed: {}", e)))?
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder.encode(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)?;
    Ok(jpeg)
}

/// Identity names become directory names: no separators, no leading dot.
pub fn validate_identity_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AttendanceError::InvalidRequest("user_name is required".into()));
    }
    if name.len() > 64
        || name.starts_with('.')
        || name.chars().any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(AttendanceError::InvalidRequest(format!("Invalid user_name {:?}", name)));
    }
    Ok(name.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::source::tests::FakeBackend;
    use crate::service::recognition::tests::{
        frame_with, BandDetector, ColorClassifier, MeanColorEmbedder,
    };
    use crate::storage::ledger::tests::{day, MemoryStore};
    use crate::storage::Thresholds;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub controller: Arc<SessionController>,
        pub backend: Arc<FakeBackend>,
        pub store: MemoryStore,
        pub _dir: TempDir,
    }

    pub(crate) fn fixture(with_classifier: bool) -> Fixture {
        build(FakeBackend::default(), with_classifier, day)
    }

    fn next_day() -> NaiveDate {
        day().succ_opt().unwrap()
    }

    fn build(backend: FakeBackend, with_classifier: bool, today: fn() -> NaiveDate) -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path());
        layout.ensure().unwrap();

        let mut config = Config::default();
        config.camera.retry_delay_ms = 1;
        config.enrollment.quota = 5;
        config.enrollment.frame_timeout_secs = 5;

        let store = MemoryStore::default();
        let ledger = AttendanceLedger::open(
            Box::new(store.clone()),
            day(),
            Thresholds::default(),
            Duration::from_secs(10),
        ).unwrap();
        let backend = Arc::new(backend);
        let networks = Networks { detector: Arc::new(BandDetector), embedder: Arc::new(MeanColorEmbedder) };

        let controller = SessionController::new(
            backend.clone(),
            config,
            layout,
            ledger,
            Some(networks),
            Annotator::bundled(18.0).unwrap(),
        )
        .with_clock(today);
        if with_classifier {
            controller.install_classifier(Arc::new(ColorClassifier)).unwrap();
        }
        Fixture { controller: Arc::new(controller), backend, store, _dir: dir }
    }

    #[test]
    fn second_activation_reuses_the_device() {
        let f = fixture(true);
        let first = f.controller.activate(Mode::Capturing).unwrap();
        let second = f.controller.activate(Mode::Recognizing).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.mode, Mode::Recognizing);
        assert_eq!(f.backend.opens.load(Ordering::SeqCst), 1);
        assert_eq!(f.controller.mode_of(first.id), Some(Mode::Recognizing));
    }

    #[test]
    fn recognition_requires_a_classifier() {
        let f = fixture(false);
        assert!(matches!(f.controller.activate(Mode::Recognizing), Err(AttendanceError::ModelsMissing)));
        assert_eq!(f.backend.opens.load(Ordering::SeqCst), 0);
        assert!(f.controller.activate(Mode::Capturing).is_ok());
    }

    #[test]
    fn stop_releases_camera_and_flushes() {
        let f = fixture(true);
        let handle = f.controller.activate(Mode::Capturing).unwrap();

        let report = f.controller.stop().unwrap();
        assert_eq!(report, StopReport { stopped: true, flushed: true, error: None });
        assert_eq!(f.controller.mode_of(handle.id), None);
        assert_eq!(*f.store.saves.lock().unwrap(), 1);
        assert!(!f.controller.stop().unwrap().stopped);

        let next = f.controller.activate(Mode::Capturing).unwrap();
        assert_ne!(next.id, handle.id);
        assert_eq!(f.backend.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn device_change_stops_active_session() {
        let f = fixture(true);
        f.controller.activate(Mode::Capturing).unwrap();
        f.controller.select_device(2).unwrap();

        let state = f.controller.state().unwrap();
        assert_eq!(state, SessionState { mode: None, session_id: None, device_index: 2 });
    }

    #[test]
    fn recognized_frame_is_recorded_and_annotated() {
        let f = fixture(true);
        let mut throttle = CycleThrottle::new(Duration::from_millis(100));
        let frame = frame_with(&[(4, 0.9)]);

        let jpeg = f.controller.render_frame(&frame, Mode::Recognizing, &mut throttle).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let records = f.controller.attendance_snapshot().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "id4");

        // Throttled: the next frame passes through without touching the ledger
        let other = frame_with(&[(5, 0.9)]);
        f.controller.render_frame(&other, Mode::Recognizing, &mut throttle).unwrap();
        assert_eq!(f.controller.attendance_snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enrollment_fills_quota_and_rejects_duplicates() {
        let f = fixture(false);
        let report = f.controller.enroll("alice").await.unwrap();
        assert_eq!(report.saved, 5);
        assert_eq!(std::fs::read_dir(&report.dir).unwrap().count(), 5);
        assert_eq!(f.controller.state().unwrap().mode, None);

        assert!(matches!(
            f.controller.enroll("alice").await,
            Err(AttendanceError::DuplicateIdentity(_))
        ));
        assert!(matches!(f.controller.enroll("  ").await, Err(AttendanceError::InvalidRequest(_))));
        assert!(matches!(f.controller.enroll("../x").await, Err(AttendanceError::InvalidRequest(_))));
    }

    #[test]
    fn failed_flush_still_releases_camera() {
        let f = fixture(true);
        let handle = f.controller.activate(Mode::Capturing).unwrap();
        f.store.fail_saves.store(true, Ordering::SeqCst);

        let report = f.controller.stop().unwrap();
        assert!(report.stopped);
        assert!(!report.flushed);
        assert!(report.error.unwrap().contains("disk full"));
        assert_eq!(f.controller.mode_of(handle.id), None);
    }

    #[tokio::test]
    async fn failed_enrollment_can_be_retried() {
        let f = build(FakeBackend { broken: true, ..Default::default() }, false, day);
        let dir = f.controller.layout().identity_dir("bob");

        for _ in 0..2 {
            let stopper = async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                f.controller.stop().unwrap();
            };
            let (result, ()) = tokio::join!(f.controller.enroll("bob"), stopper);
            assert!(matches!(result, Err(AttendanceError::Camera(_))), "{:?}", result.err());
            assert!(!dir.exists());
        }
        assert_eq!(f.controller.state().unwrap().mode, None);
    }

    #[tokio::test]
    async fn enrollment_during_recognition_restores_mode() {
        let f = fixture(true);
        let handle = f.controller.activate(Mode::Recognizing).unwrap();

        let report = f.controller.enroll("carol").await.unwrap();
        assert_eq!(report.saved, 5);
        assert_eq!(f.controller.mode_of(handle.id), Some(Mode::Recognizing));
        assert_eq!(f.backend.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reading_attendance_after_midnight_starts_a_new_day() {
        let f = build(FakeBackend::default(), true, next_day);
        let mut throttle = CycleThrottle::new(Duration::from_millis(100));
        f.controller.render_frame(&frame_with(&[(4, 0.9)]), Mode::Recognizing, &mut throttle).unwrap();

        assert!(f.controller.attendance_snapshot().unwrap().is_empty());
        assert_eq!(f.store.days.lock().unwrap()[&day()].len(), 1);
    }
}
