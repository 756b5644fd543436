use crate::common::{AttendanceError, Result, config::DetectorConfig};
use crate::core::Detector;
use ort::{Environment, Session, SessionBuilder, Value, GraphOptimizationLevel};
use std::path::Path;
use std::sync::Arc;
use image::{DynamicImage, imageops::FilterType};
use ndarray::{Array4, CowArray};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    /// Integer rectangle clamped to an image of the given size.
    pub fn to_bbox(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let x1 = self.x1.max(0.0).min(width as f32) as u32;
        let y1 = self.y1.max(0.0).min(height as f32) as u32;
        let x2 = self.x2.max(0.0).min(width as f32) as u32;
        let y2 = self.y2.max(0.0).min(height as f32) as u32;
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(BoundingBox { x: x1, y: y1, width: x2 - x1, height: y2 - y1 })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn as_array(&self) -> [u32; 4] {
        [self.x, self.y, self.width, self.height]
    }
}

/// A detected face region and its cropped pixels; lives for one recognition cycle.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub face: DynamicImage,
}

impl Detection {
    /// Crops every valid box out of `image`; degenerate boxes are dropped.
    pub fn crop_all(image: &DynamicImage, boxes: &[FaceBox]) -> Vec<Detection> {
        boxes.iter()
            .filter_map(|face| {
                let bbox = face.to_bbox(image.width(), image.height())?;
                Some(Detection {
                    bbox,
                    score: face.confidence,
                    face: image.crop_imm(bbox.x, bbox.y, bbox.width, bbox.height),
                })
            })
            .collect()
    }
}

/// YOLO-style single-class face detector running on ONNX Runtime.
pub struct OnnxFaceDetector {
    session: Session,
    _environment: Arc<Environment>,
    config: DetectorConfig,
}

impl OnnxFaceDetector {
    pub fn new(config: &DetectorConfig, model_path: &Path, optimization_level: u32) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_detector")
                .build()
                .map_err(|e| AttendanceError::Model(format!("Failed to create environment: {}", e)))?
        );

        if !model_path.exists() {
            return Err(AttendanceError::Model(
                format!("Detector model not found at: {:?}", model_path)
            ));
        }

        let opt_level = match optimization_level {
            0 => GraphOptimizationLevel::Disable,
            1 => GraphOptimizationLevel::Level1,
            2 => GraphOptimizationLevel::Level2,
            _ => GraphOptimizationLevel::Level3,
        };
        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(opt_level)?
            .with_model_from_file(model_path)?;

        tracing::info!("Loaded face detector from {:?}", model_path);

        Ok(Self {
            session,
            _environment: environment,
            config: config.clone(),
        })
    }

    fn image_to_array(&self, img: &DynamicImage) -> Array4<f32> {
        let rgb = img.to_rgb8();
        let width = rgb.width() as usize;
        let height = rgb.height() as usize;
        let mut array = Array4::<f32>::zeros((1, 3, height, width));

        let norm_factor = 1.0 / 255.0;
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 * norm_factor;
            array[[0, 1, y, x]] = pixel[1] as f32 * norm_factor;
            array[[0, 2, y, x]] = pixel[2] as f32 * norm_factor;
        }

        array
    }

    fn parse_detections(&self, outputs: &[Value]) -> Result<Vec<FaceBox>> {
        let Some(first) = outputs.first() else {
            return Ok(Vec::new());
        };
        let output = first.try_extract::<f32>()?.view().to_owned();
        let shape = output.shape().to_vec();
        let values: Vec<f32> = output.iter().copied().collect();

        let boxes = decode_predictions(
            &values,
            &shape,
            self.config.input_width as f32,
            self.config.input_height as f32,
            self.config.min_face_size,
        );

        // NMS on everything first, then the confidence cut
        let mut faces = apply_nms(boxes, self.config.iou_threshold);
        faces.retain(|face| face.confidence >= self.config.confidence);
        faces.truncate(self.config.max_faces);
        Ok(faces)
    }
}

impl Detector for OnnxFaceDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;

        let img_array = if image.width() == self.config.input_width
            && image.height() == self.config.input_height {
            self.image_to_array(image)
        } else {
            let resized = image.resize_exact(
                self.config.input_width,
                self.config.input_height,
                FilterType::Nearest
            );
            self.image_to_array(&resized)
        };

        let cow_array = CowArray::from(img_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let mut faces = self.parse_detections(&outputs)?;

        // Scale back to frame coordinates
        let scale_x = orig_width / self.config.input_width as f32;
        let scale_y = orig_height / self.config.input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        Ok(faces)
    }
}

/// Decodes YOLOv8 output, either `[1, N, 5]` or transposed `[1, 5, N]`, where each
/// prediction is `[x_center, y_center, width, height, score]`.
fn decode_predictions(
    values: &[f32],
    shape: &[usize],
    input_width: f32,
    input_height: f32,
    min_size: f32,
) -> Vec<FaceBox> {
    let (num_predictions, prediction_length, is_transposed) = match shape.len() {
        n if n >= 3 => {
            if shape[1] <= 10 && shape[2] > 10 {
                (shape[2], shape[1], true)
            } else {
                (shape[1], shape[2], false)
            }
        }
        2 => (shape[0], shape[1], false),
        _ => {
            tracing::warn!("Unexpected output shape: {:?}", shape);
            return Vec::new();
        }
    };
    if prediction_length < 5 || values.len() < num_predictions * prediction_length {
        tracing::warn!("Detector output too short for shape {:?}", shape);
        return Vec::new();
    }

    let at = |i: usize, field: usize| {
        if is_transposed {
            values[field * num_predictions + i]
        } else {
            values[i * prediction_length + field]
        }
    };

    let mut faces = Vec::new();
    for i in 0..num_predictions {
        let (cx, cy, w, h, confidence) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3), at(i, 4));
        if confidence <= 0.001 {
            continue;
        }

        // Normalized outputs are scaled to input pixels
        let scale = if cx > 1.0 || cy > 1.0 || w > 1.0 || h > 1.0 { 1.0 } else { input_width };
        let (cx, cy, w, h) = (cx * scale, cy * scale, w * scale, h * scale);

        let x1 = (cx - w / 2.0).max(0.0);
        let y1 = (cy - h / 2.0).max(0.0);
        let x2 = (cx + w / 2.0).min(input_width);
        let y2 = (cy + h / 2.0).min(input_height);

        if x2 - x1 > min_size && y2 - y1 > min_size {
            faces.push(FaceBox { x1, y1, x2, y2, confidence });
        }
    }
    faces
}

fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| calculate_iou(kept, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn calculate_iou(box1: &FaceBox, box2: &FaceBox) -> f32 {
    let x1 = box1.x1.max(box2.x1);
    let y1 = box1.y1.max(box2.y1);
    let x2 = box1.x2.min(box2.x2);
    let y2 = box1.y2.min(box2.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area1 = (box1.x2 - box1.x1) * (box1.y2 - box1.y1);
    let area2 = (box2.x2 - box2.x1) * (box2.y2 - box2.y1);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> FaceBox {
        FaceBox { x1, y1, x2, y2, confidence }
    }

    #[test]
    fn nms_drops_overlapping_lower_scores() {
        let kept = apply_nms(
            vec![
                face(0.0, 0.0, 100.0, 100.0, 0.6),
                face(5.0, 5.0, 105.0, 105.0, 0.9),
                face(300.0, 300.0, 400.0, 400.0, 0.7),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn decodes_transposed_output() {
        // [1, 5, 12] layout with a single populated prediction in slot 0
        let n = 12;
        let mut values = vec![0.0f32; 5 * n];
        values[0] = 320.0;
        values[n] = 240.0;
        values[2 * n] = 100.0;
        values[3 * n] = 120.0;
        values[4 * n] = 0.95;
        let faces = decode_predictions(&values, &[1, 5, n], 640.0, 640.0, 10.0);
        assert_eq!(faces, vec![face(270.0, 180.0, 370.0, 300.0, 0.95)]);
    }

    #[test]
    fn decodes_row_major_output_and_skips_tiny_boxes() {
        let values = vec![
            100.0, 100.0, 50.0, 50.0, 0.8,
            200.0, 200.0, 4.0, 4.0, 0.9,
        ];
        let faces = decode_predictions(&values, &[1, 2, 5], 640.0, 640.0, 10.0);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].confidence, 0.8);
    }

    #[test]
    fn crop_clamps_to_image_bounds() {
        let image = DynamicImage::new_rgb8(100, 80);
        let detections = Detection::crop_all(
            &image,
            &[face(-10.0, 20.0, 50.0, 200.0, 0.9), face(60.0, 60.0, 60.0, 70.0, 0.8)],
        );
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bbox, BoundingBox { x: 0, y: 20, width: 50, height: 60 });
        assert_eq!(detections[0].face.width(), 50);
        assert_eq!(detections[0].face.height(), 60);
    }
}
