use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("Camera device {0} unavailable")]
    DeviceUnavailable(u32),

    #[error("Classifier or label mapping not loaded")]
    ModelsMissing,

    #[error("Identity already enrolled: {0}")]
    DuplicateIdentity(String),

    #[error("No face detected")]
    NoFacesFound,

    #[error("Multiple faces detected ({0})")]
    AmbiguousFace(usize),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Password mismatch")]
    PasswordMismatch,

    #[error("Faces directory not found: {0}")]
    NoFacesDirectory(String),

    #[error("No usable training images")]
    NoTrainingData,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AttendanceError>;
