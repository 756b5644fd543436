use crate::common::{AttendanceError, Result, config::RecognitionConfig};
use crate::core::{CentroidClassifier, Detection, Detector, Embedder, Embedding, LabelledClassifier};
use crate::storage::{FeatureSet, ModelStore};
use image::DynamicImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingReport {
    /// Usable faces per identity.
    pub identities: BTreeMap<String, usize>,
    pub images: usize,
    pub used: usize,
    pub no_face: usize,
    pub multiple_faces: usize,
    pub unreadable: usize,
}

/// Rebuilds the classifier from `faces/<name>/*` images.
pub struct Trainer<'a> {
    detector: &'a dyn Detector,
    embedder: &'a dyn Embedder,
    temperature: f32,
    unknown_similarity: f32,
}

impl<'a> Trainer<'a> {
    pub fn new(detector: &'a dyn Detector, embedder: &'a dyn Embedder, config: &RecognitionConfig) -> Self {
        Self {
            detector,
            embedder,
            temperature: config.softmax_temperature,
            unknown_similarity: config.unknown_similarity,
        }
    }

    /// Trains, persists the classifier, labels and features, and returns the
    /// curation summary with the ready-to-use classifier.
    pub fn run(&self, faces_dir: &Path, models: &ModelStore) -> Result<(TrainingReport, LabelledClassifier)> {
        if !faces_dir.is_dir() {
            return Err(AttendanceError::NoFacesDirectory(faces_dir.display().to_string()));
        }

        let mut report = TrainingReport::default();
        let mut samples: Vec<(Embedding, String)> = Vec::new();

        for (name, dir) in identity_dirs(faces_dir)? {
            for path in image_files(&dir)? {
                report.images += 1;
                let image = match image::open(&path) {
                    Ok(image) => image,
                    Err(e) => {
                        tracing::warn!("Skipping unreadable image {}: {}", path.display(), e);
                        report.unreadable += 1;
                        continue;
                    }
                };

                match self.single_face(&image) {
                    Ok(face) => {
                        samples.push((self.embedder.embed(&face)?, name.clone()));
                        *report.identities.entry(name.clone()).or_default() += 1;
                        report.used += 1;
                    }
                    Err(AttendanceError::NoFacesFound) => {
                        tracing::debug!("No face in {}", path.display());
                        report.no_face += 1;
                    }
                    Err(AttendanceError::AmbiguousFace(n)) => {
                        tracing::debug!("{} faces in {}", n, path.display());
                        report.multiple_faces += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        tracing::info!(
            "Training on {} of {} images ({} without a face, {} with several)",
            report.used, report.images, report.no_face, report.multiple_faces
        );

        let (model, labels) = CentroidClassifier::train(&samples, self.temperature, self.unknown_similarity)?;
        models.save_classifier(&model, &labels)?;

        let features = FeatureSet {
            labels: samples.iter()
                .map(|(_, name)| labels.names.iter().position(|n| n == name).unwrap_or_default())
                .collect(),
            features: samples.into_iter().map(|(embedding, _)| embedding).collect(),
            names: labels.names.clone(),
        };
        models.save_features(&features)?;

        let classifier = LabelledClassifier::new(model, labels)?;
        Ok((report, classifier))
    }

    /// The one face in an enrollment image, cropped.
    fn single_face(&self, image: &DynamicImage) -> Result<DynamicImage> {
        let boxes = self.detector.detect(image)?;
        match boxes.len() {
            0 => return Err(AttendanceError::NoFacesFound),
            1 => {}
            n => return Err(AttendanceError::AmbiguousFace(n)),
        }
        Detection::crop_all(image, &boxes)
            .into_iter()
            .next()
            .map(|d| d.face)
            .ok_or(AttendanceError::NoFacesFound)
    }
}

fn identity_dirs(faces_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(faces_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            dirs.push((name, entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}
