use crate::core::recognizer::{average_embeddings, cosine_similarity, l2_normalize, Embedding};
use crate::core::{Classifier, Prediction};
use crate::error::{AttendanceError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Class index → identity name, stored next to the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LabelMap {
    pub names: Vec<String>,
}

impl LabelMap {
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Nearest-centroid classifier over L2-normalized embeddings.
///
/// Confidence is a softmax over `similarity / temperature` for every class plus a
/// reference "unknown" logit at `unknown_similarity`, so a lone enrolled identity
/// still gets a low score for faces that do not resemble it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidClassifier {
    centroids: Vec<Embedding>,
    temperature: f32,
    unknown_similarity: f32,
}

impl CentroidClassifier {
    /// Trains from `(embedding, identity)` pairs; returns the classifier and the
    /// label map ordered by name.
    pub fn train(
        samples: &[(Embedding, String)],
        temperature: f32,
        unknown_similarity: f32,
    ) -> Result<(Self, LabelMap)> {
        if samples.is_empty() {
            return Err(AttendanceError::NoTrainingData);
        }

        let mut by_name: BTreeMap<&str, Vec<&Embedding>> = BTreeMap::new();
        for (embedding, name) in samples {
            by_name.entry(name.as_str()).or_default().push(embedding);
        }

        let dim = samples[0].0.len();
        if samples.iter().any(|(e, _)| e.len() != dim) {
            return Err(AttendanceError::Model("Embeddings have inconsistent dimensions".into()));
        }

        let mut names = Vec::with_capacity(by_name.len());
        let mut centroids = Vec::with_capacity(by_name.len());
        for (name, embeddings) in by_name {
            let normalized: Vec<Embedding> = embeddings.into_iter()
                .map(|e| l2_normalize(e.clone()))
                .collect();
            centroids.push(l2_normalize(average_embeddings(&normalized)));
            names.push(name.to_string());
        }

        Ok((
            Self { centroids, temperature, unknown_similarity },
            LabelMap { names },
        ))
    }

    pub fn num_classes(&self) -> usize {
        self.centroids.len()
    }

    /// Best class index and its probability.
    pub fn predict(&self, embedding: &[f32]) -> Option<(usize, f32)> {
        if self.centroids.is_empty() {
            return None;
        }

        let logits: Vec<f32> = self.centroids.iter()
            .map(|c| cosine_similarity(embedding, c) / self.temperature)
            .collect();
        let unknown = self.unknown_similarity / self.temperature;

        let max = logits.iter().copied().fold(unknown, f32::max);
        let denom: f32 = logits.iter().map(|l| (l - max).exp()).sum::<f32>() + (unknown - max).exp();

        let (best, best_logit) = logits.iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))?;

        Some((best, (best_logit - max).exp() / denom))
    }
}

/// Classifier paired with its label map; the form loaded for recognition.
pub struct LabelledClassifier {
    model: CentroidClassifier,
    labels: LabelMap,
}

impl LabelledClassifier {
    pub fn new(model: CentroidClassifier, labels: LabelMap) -> Result<Self> {
        if model.num_classes() != labels.len() {
            return Err(AttendanceError::Model(format!(
                "Classifier has {} classes but label map has {}",
                model.num_classes(), labels.len()
            )));
        }
        Ok(Self { model, labels })
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }
}

impl Classifier for LabelledClassifier {
    fn classify(&self, embedding: &[f32]) -> Result<Prediction> {
        let (index, confidence) = self.model.predict(embedding)
            .ok_or(AttendanceError::ModelsMissing)?;
        let label = self.labels.name(index)
            .ok_or_else(|| AttendanceError::Model(format!("No label for class {}", index)))?;
        Ok(Prediction { label: label.to_string(), confidence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<(Embedding, String)> {
        vec![
            (vec![1.0, 0.0, 0.0], "bob".to_string()),
            (vec![0.9, 0.1, 0.0], "bob".to_string()),
            (vec![0.0, 1.0, 0.0], "alice".to_string()),
            (vec![0.1, 0.9, 0.0], "alice".to_string()),
        ]
    }

    #[test]
    fn labels_are_sorted_by_name() {
        let (model, labels) = CentroidClassifier::train(&samples(), 0.05, 0.5).unwrap();
        assert_eq!(labels.names, vec!["alice", "bob"]);
        assert_eq!(model.num_classes(), 2);
    }

    #[test]
    fn classifies_close_embeddings_confidently() {
        let (model, labels) = CentroidClassifier::train(&samples(), 0.05, 0.5).unwrap();
        let classifier = LabelledClassifier::new(model, labels).unwrap();

        let prediction = classifier.classify(&[0.05, 1.0, 0.0]).unwrap();
        assert_eq!(prediction.label, "alice");
        assert!(prediction.confidence > 0.9, "{}", prediction.confidence);
    }

    #[test]
    fn unrelated_face_scores_low_with_single_identity() {
        let single = vec![(vec![1.0, 0.0, 0.0], "bob".to_string())];
        let (model, labels) = CentroidClassifier::train(&single, 0.05, 0.5).unwrap();
        let classifier = LabelledClassifier::new(model, labels).unwrap();

        let prediction = classifier.classify(&[0.0, 0.0, 1.0]).unwrap();
        assert_eq!(prediction.label, "bob");
        assert!(prediction.confidence < 0.3, "{}", prediction.confidence);
    }

    #[test]
    fn empty_training_set_is_rejected() {
        assert!(matches!(
            CentroidClassifier::train(&[], 0.05, 0.5),
            Err(AttendanceError::NoTrainingData)
        ));
    }

    #[test]
    fn mismatched_label_map_is_rejected() {
        let (model, _) = CentroidClassifier::train(&samples(), 0.05, 0.5).unwrap();
        let labels = LabelMap { names: vec!["only".into()] };
        assert!(LabelledClassifier::new(model, labels).is_err());
    }
}
