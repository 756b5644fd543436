pub mod annotate;
pub mod classifier;
pub mod detector;
pub mod recognizer;

use image::DynamicImage;
use serde::Serialize;
use crate::error::Result;

pub use annotate::{Annotator, RecognitionResult, Sighting};
pub use classifier::{CentroidClassifier, LabelMap, LabelledClassifier};
pub use detector::{BoundingBox, Detection, FaceBox, OnnxFaceDetector};
pub use recognizer::{cosine_similarity, Embedding, OnnxEmbedder};

/// Finds face regions in a frame, in frame coordinates.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>>;
}

/// Maps a cropped face to a fixed-length feature vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, face: &DynamicImage) -> Result<Embedding>;
}

/// Predicts an identity for a feature vector.
pub trait Classifier: Send + Sync {
    fn classify(&self, embedding: &[f32]) -> Result<Prediction>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}
