use crate::common::{AttendanceError, Result};
use crate::core::{CentroidClassifier, Embedding, LabelMap, LabelledClassifier};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CLASSIFIER_FILE: &str = "classifier.bincode";
const LABELS_FILE: &str = "labels.json";
const FEATURES_FILE: &str = "features.bincode";

/// Training vectors kept for model analysis: `labels[i]` indexes `names`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FeatureSet {
    pub features: Vec<Embedding>,
    pub labels: Vec<usize>,
    pub names: Vec<String>,
}

impl FeatureSet {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Serialized classifier, label map and feature arrays under `models/`.
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save_classifier(&self, model: &CentroidClassifier, labels: &LabelMap) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let encoded = bincode::serialize(model)
            .map_err(|e| AttendanceError::Storage(format!("Failed to serialize classifier: {}", e)))?;
        fs::write(self.dir.join(CLASSIFIER_FILE), encoded)?;

        let json = serde_json::to_string_pretty(labels)
            .map_err(|e| AttendanceError::Storage(format!("Failed to serialize labels: {}", e)))?;
        fs::write(self.dir.join(LABELS_FILE), json)?;
        Ok(())
    }

    /// `ModelsMissing` unless both the classifier and its label map are present.
    pub fn load_classifier(&self) -> Result<LabelledClassifier> {
        let model_path = self.dir.join(CLASSIFIER_FILE);
        let labels_path = self.dir.join(LABELS_FILE);
        if !model_path.is_file() || !labels_path.is_file() {
            return Err(AttendanceError::ModelsMissing);
        }

        let data = fs::read(&model_path)?;
        let model: CentroidClassifier = bincode::deserialize(&data)
            .map_err(|e| AttendanceError::Storage(format!("Failed to deserialize classifier: {}", e)))?;

        let json = fs::read_to_string(&labels_path)?;
        let labels: LabelMap = serde_json::from_str(&json)
            .map_err(|e| AttendanceError::Storage(format!("Failed to parse labels: {}", e)))?;

        LabelledClassifier::new(model, labels)
    }

    pub fn save_features(&self, features: &FeatureSet) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let encoded = bincode::serialize(features)
            .map_err(|e| AttendanceError::Storage(format!("Failed to serialize features: {}", e)))?;
        fs::write(self.dir.join(FEATURES_FILE), encoded)?;
        Ok(())
    }

    pub fn load_features(&self) -> Result<FeatureSet> {
        let path = self.dir.join(FEATURES_FILE);
        if !path.is_file() {
            return Err(AttendanceError::ModelsMissing);
        }
        let data = fs::read(path)?;
        bincode::deserialize(&data)
            .map_err(|e| AttendanceError::Storage(format!("Failed to deserialize features: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Classifier;
    use tempfile::TempDir;

    #[test]
    fn missing_files_mean_models_missing() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path());
        assert!(matches!(store.load_classifier(), Err(AttendanceError::ModelsMissing)));
        assert!(matches!(store.load_features(), Err(AttendanceError::ModelsMissing)));
    }

    #[test]
    fn saved_classifier_predicts_the_same() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path().join("models"));
        let samples = vec![
            (vec![1.0, 0.0], "bob".to_string()),
            (vec![0.0, 1.0], "alice".to_string()),
        ];
        let (model, labels) = CentroidClassifier::train(&samples, 0.05, 0.5).unwrap();
        store.save_classifier(&model, &labels).unwrap();

        let loaded = store.load_classifier().unwrap();
        assert_eq!(loaded.labels().names, vec!["alice", "bob"]);
        assert_eq!(loaded.classify(&[0.9, 0.1]).unwrap().label, "bob");
    }

    #[test]
    fn features_persist() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path());
        let features = FeatureSet {
            features: vec![vec![0.5, 0.5], vec![1.0, 0.0]],
            labels: vec![0, 1],
            names: vec!["alice".into(), "bob".into()],
        };
        store.save_features(&features).unwrap();
        assert_eq!(store.load_features().unwrap(), features);
    }
}
