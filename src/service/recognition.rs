use crate::camera::Frame;
use crate::common::{AttendanceError, Result};
use crate::core::{
    BoundingBox, Classifier, Detection, Detector, Embedder, Prediction, RecognitionResult, Sighting,
};
use crate::storage::{AttendanceLedger, RecordOutcome};
use image::DynamicImage;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A classified face in a single image, independent of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identification {
    pub name: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: [u32; 4],
}

/// Detector → Embedder → Classifier over one image.
#[derive(Clone)]
pub struct RecognitionPipeline {
    detector: Arc<dyn Detector>,
    embedder: Arc<dyn Embedder>,
    classifier: Arc<dyn Classifier>,
}

impl RecognitionPipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        embedder: Arc<dyn Embedder>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self { detector, embedder, classifier }
    }

    /// Every detected face with its predicted identity.
    pub fn classify(&self, image: &DynamicImage) -> Result<Vec<(BoundingBox, Prediction)>> {
        let boxes = self.detector.detect(image)?;
        let detections = Detection::crop_all(image, &boxes);

        let mut out = Vec::with_capacity(detections.len());
        for detection in detections {
            let embedding = self.embedder.embed(&detection.face)?;
            let prediction = self.classifier.classify(&embedding)?;
            out.push((detection.bbox, prediction));
        }
        Ok(out)
    }

    pub fn identify(&self, image: &DynamicImage) -> Result<Vec<Identification>> {
        Ok(self.classify(image)?
            .into_iter()
            .map(|(bbox, prediction)| Identification {
                name: prediction.label,
                confidence: prediction.confidence,
                bbox: bbox.as_array(),
            })
            .collect())
    }

    /// One recognition cycle: classify every face in the frame and record it.
    /// Ignored detections are left out of the result.
    pub fn run_cycle(&self, frame: &Frame, ledger: &Mutex<AttendanceLedger>) -> Result<Vec<RecognitionResult>> {
        let image = DynamicImage::ImageRgb8(frame.image.clone());
        let predictions = self.classify(&image)?;
        if predictions.is_empty() {
            return Ok(Vec::new());
        }

        let now = frame.captured_at.naive_local();
        let mut ledger = ledger.lock()
            .map_err(|_| AttendanceError::Storage("Attendance ledger lock poisoned".into()))?;

        let mut results = Vec::with_capacity(predictions.len());
        for (bbox, prediction) in predictions {
            let sighting = match ledger.record(&prediction.label, prediction.confidence, now)? {
                RecordOutcome::Ignored => continue,
                RecordOutcome::Tentative => Sighting::Tentative,
                RecordOutcome::Inserted => Sighting::New,
                RecordOutcome::AlreadyPresent { .. } => Sighting::Known,
            };
            results.push(RecognitionResult {
                name: prediction.label,
                confidence: prediction.confidence,
                bbox,
                status: sighting,
            });
        }
        Ok(results)
    }
}

/// Rate-limits recognition to once per interval for a single stream.
#[derive(Debug, Clone)]
pub struct CycleThrottle {
    interval: Duration,
    last_run: Option<Instant>,
}

impl CycleThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_run: None }
    }

    /// True when a cycle should run at `now`; marks it as run.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last_run {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_run = Some(now);
                true
            }
        }
    }
}
