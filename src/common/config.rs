use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{AttendanceError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "configs/attendance.toml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub attendance: AttendanceConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub annotation: AnnotationConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

fn default_bind() -> String { "0.0.0.0:5000".to_string() }
fn default_static_dir() -> PathBuf { PathBuf::from("static") }

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind(), static_dir: default_static_dir() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fourcc")]
    pub fourcc: String,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_fourcc() -> String { "MJPG".to_string() }
fn default_retry_delay() -> u64 { 50 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_width(),
            height: default_height(),
            fourcc: default_fourcc(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Paths to the ONNX networks. Relative paths resolve against the data root's
/// `models/` directory.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_detector_path")]
    pub detector_path: PathBuf,
    #[serde(default = "default_recognizer_path")]
    pub recognizer_path: PathBuf,
}

fn default_detector_path() -> PathBuf { PathBuf::from("face_detector.onnx") }
fn default_recognizer_path() -> PathBuf { PathBuf::from("face_embedder.onnx") }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_path: default_detector_path(),
            recognizer_path: default_recognizer_path(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
    #[serde(default = "default_detection_confidence")]
    pub confidence: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_max_faces")]
    pub max_faces: usize,
    #[serde(default = "default_min_face_size")]
    pub min_face_size: f32,
}

fn default_detector_input() -> u32 { 640 }
fn default_detection_confidence() -> f32 { 0.5 }
fn default_iou_threshold() -> f32 { 0.45 }
fn default_max_faces() -> usize { 10 }
fn default_min_face_size() -> f32 { 30.0 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
            confidence: default_detection_confidence(),
            iou_threshold: default_iou_threshold(),
            max_faces: default_max_faces(),
            min_face_size: default_min_face_size(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_normalization")]
    pub normalization_value: f32,
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u32,
}

fn default_input_size() -> u32 { 112 }
fn default_normalization() -> f32 { 127.5 }
fn default_optimization_level() -> u32 { 3 }

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            normalization_value: default_normalization(),
            optimization_level: default_optimization_level(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognitionConfig {
    /// Below this confidence a detection is ignored entirely.
    #[serde(default = "default_display_threshold")]
    pub display_threshold: f32,
    /// At or above this confidence a new identity is written to the ledger.
    #[serde(default = "default_confirm_threshold")]
    pub confirm_threshold: f32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_temperature")]
    pub softmax_temperature: f32,
    /// Similarity assigned to the implicit "unknown" class.
    #[serde(default = "default_unknown_similarity")]
    pub unknown_similarity: f32,
}

fn default_display_threshold() -> f32 { 0.3 }
fn default_confirm_threshold() -> f32 { 0.7 }
fn default_interval_ms() -> u64 { 100 }
fn default_temperature() -> f32 { 0.05 }
fn default_unknown_similarity() -> f32 { 0.5 }

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            display_threshold: default_display_threshold(),
            confirm_threshold: default_confirm_threshold(),
            interval_ms: default_interval_ms(),
            softmax_temperature: default_temperature(),
            unknown_similarity: default_unknown_similarity(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AttendanceConfig {
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_flush_interval() -> u64 { 10 }

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self { flush_interval_secs: default_flush_interval() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrollmentConfig {
    #[serde(default = "default_quota")]
    pub quota: usize,
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_secs: u64,
}

fn default_quota() -> usize { 50 }
fn default_frame_timeout() -> u64 { 10 }

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self { quota: default_quota(), frame_timeout_secs: default_frame_timeout() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Root for attendance/, faces/, models/ and passkey/. Falls back to the
    /// platform data directory when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnnotationConfig {
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default = "default_font_scale")]
    pub font_scale: f32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_font_scale() -> f32 { 18.0 }
fn default_jpeg_quality() -> u8 { 80 }

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            font_scale: default_font_scale(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SecurityConfig {
    #[serde(default = "default_password")]
    pub default_password: String,
}

fn default_password() -> String { "admin".to_string() }

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { default_password: default_password() }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Loads the file at `path`, or the built-in defaults when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load_from_path(path);
        }
        tracing::warn!("Config file {} not found, using defaults", path.display());
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AttendanceError::Other(anyhow::anyhow!(
                "Config file not found: {}. Please create it from the example.", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| AttendanceError::Other(anyhow::anyhow!("Config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(invalid(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(invalid(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }
        if self.camera.fourcc.len() != 4 {
            return Err(invalid(format!(
                "Camera fourcc must have 4 characters, got {:?}", self.camera.fourcc
            )));
        }

        let r = &self.recognition;
        if !(0.0..=1.0).contains(&r.display_threshold) || !(0.0..=1.0).contains(&r.confirm_threshold) {
            return Err(invalid("Recognition thresholds must be between 0.0 and 1.0".to_string()));
        }
        if r.display_threshold > r.confirm_threshold {
            return Err(invalid(format!(
                "Display threshold {} exceeds confirm threshold {}",
                r.display_threshold, r.confirm_threshold
            )));
        }
        if r.softmax_temperature <= 0.0 {
            return Err(invalid(format!(
                "Softmax temperature must be positive, got {}", r.softmax_temperature
            )));
        }

        if self.detector.confidence < 0.0 || self.detector.confidence > 1.0 {
            return Err(invalid(format!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.detector.confidence
            )));
        }
        if self.detector.input_width == 0 || self.detector.input_width > 4096
            || self.detector.input_height == 0 || self.detector.input_height > 4096
        {
            return Err(invalid(format!(
                "Detector input must be between 1 and 4096, got {}x{}",
                self.detector.input_width, self.detector.input_height
            )));
        }

        if self.recognizer.input_size == 0 || self.recognizer.input_size > 1024 {
            return Err(invalid(format!(
                "Recognizer input size must be between 1 and 1024, got {}",
                self.recognizer.input_size
            )));
        }

        if self.enrollment.quota == 0 {
            return Err(invalid("Enrollment quota must be at least 1".to_string()));
        }
        if self.attendance.flush_interval_secs == 0 {
            return Err(invalid("Flush interval must be at least 1 second".to_string()));
        }
        if self.annotation.jpeg_quality == 0 || self.annotation.jpeg_quality > 100 {
            return Err(invalid(format!(
                "JPEG quality must be between 1 and 100, got {}", self.annotation.jpeg_quality
            )));
        }

        Ok(())
    }
}

fn invalid(message: String) -> AttendanceError {
    AttendanceError::Other(anyhow::anyhow!(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.recognition.confirm_threshold, 0.7);
        assert_eq!(config.recognition.display_threshold, 0.3);
        assert_eq!(config.recognition.interval_ms, 100);
        assert_eq!(config.attendance.flush_interval_secs, 10);
        assert_eq!(config.enrollment.quota, 50);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            "[camera]\ndevice_index = 2\n\n[enrollment]\nquota = 10\n",
        )
        .unwrap();
        assert_eq!(config.camera.device_index, 2);
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.enrollment.quota, 10);
        assert_eq!(config.enrollment.frame_timeout_secs, 10);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let result = Config::from_toml(
            "[recognition]\ndisplay_threshold = 0.8\nconfirm_threshold = 0.7\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_bad_fourcc() {
        assert!(Config::from_toml("[camera]\nfourcc = \"MJPEG\"\n").is_err());
    }
}
