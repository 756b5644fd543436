use crate::common::{AttendanceError, Result, config::RecognizerConfig};
use crate::core::Embedder;
use ort::{Environment, Session, SessionBuilder, Value, GraphOptimizationLevel};
use std::path::Path;
use std::sync::Arc;
use image::{DynamicImage, imageops::FilterType};
use ndarray::{Array4, CowArray};

pub type Embedding = Vec<f32>;

/// Face embedding network (single-channel ArcFace-style input) on ONNX Runtime.
pub struct OnnxEmbedder {
    session: Session,
    _environment: Arc<Environment>,
    config: RecognizerConfig,
}

impl OnnxEmbedder {
    pub fn new(config: &RecognizerConfig, model_path: &Path) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_embedder")
                .build()
                .map_err(|e| AttendanceError::Model(format!("Failed to create environment: {}", e)))?
        );

        if !model_path.exists() {
            return Err(AttendanceError::Model(
                format!("Recognition model not found at: {:?}", model_path)
            ));
        }

        let opt_level = match config.optimization_level {
            0 => GraphOptimizationLevel::Disable,
            1 => GraphOptimizationLevel::Level1,
            2 => GraphOptimizationLevel::Level2,
            _ => GraphOptimizationLevel::Level3,
        };
        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(opt_level)?
            .with_model_from_file(model_path)?;

        tracing::info!("Loaded face embedder from {:?}", model_path);

        Ok(Self {
            session,
            _environment: environment,
            config: config.clone(),
        })
    }

    fn preprocess_face(&self, img: &DynamicImage) -> Array4<f32> {
        let gray = img.to_luma8();
        let size = self.config.input_size as usize;
        let norm_val = self.config.normalization_value;
        let mut array = Array4::<f32>::zeros((1, 1, size, size));

        for (x, y, pixel) in gray.enumerate_pixels() {
            array[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 - norm_val) / norm_val;
        }

        array
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&self, face: &DynamicImage) -> Result<Embedding> {
        let resized = face.resize_exact(
            self.config.input_size,
            self.config.input_size,
            FilterType::Triangle
        );

        let input_array = self.preprocess_face(&resized);
        let cow_array = CowArray::from(input_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;

        let outputs = self.session.run(vec![input_tensor])?;
        let first = outputs.first()
            .ok_or_else(|| AttendanceError::Model("Embedding model produced no output".into()))?;

        let embedding = first.try_extract::<f32>()?.view().to_owned().into_raw_vec();
        Ok(l2_normalize(embedding))
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

pub fn l2_norm(embedding: &[f32]) -> f32 {
    embedding.iter().map(|x| x * x).sum::<f32>().sqrt()
}

pub fn l2_normalize(mut embedding: Embedding) -> Embedding {
    let norm = l2_norm(&embedding);
    if norm > 0.0 {
        for value in &mut embedding {
            *value /= norm;
        }
    }
    embedding
}

/// Element-wise mean of equally sized embeddings.
pub fn average_embeddings<'a>(embeddings: impl IntoIterator<Item = &'a Embedding>) -> Embedding {
    let mut averaged: Embedding = Vec::new();
    let mut count = 0usize;

    for embedding in embeddings {
        if averaged.is_empty() {
            averaged = vec![0.0f32; embedding.len()];
        }
        for (slot, &value) in averaged.iter_mut().zip(embedding.iter()) {
            *slot += value;
        }
        count += 1;
    }

    if count > 0 {
        for value in &mut averaged {
            *value /= count as f32;
        }
    }
    averaged
}
