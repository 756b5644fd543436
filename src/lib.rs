// Core modules
pub mod common;
pub mod core;
pub mod camera;
pub mod storage;
pub mod service;
pub mod http;
#[cfg(feature = "visualization")]
pub mod analysis;

// Re-export commonly used types
pub use common::{AttendanceError, Config, DataLayout, DevMode, Result};
pub use core::{BoundingBox, Embedding, FaceBox, OnnxEmbedder, OnnxFaceDetector, cosine_similarity};
pub use camera::{Frame, FrameSource, V4l2Backend};
pub use storage::{AttendanceLedger, CredentialStore, IdentityRecord, XlsxLedgerStore};
pub use service::{Mode, SessionController};

// Short paths into common
pub mod config {
    pub use crate::common::config::*;
}
pub mod dev_mode {
    pub use crate::common::dev_mode::*;
}
pub mod error {
    pub use crate::common::error::*;
}
pub mod paths {
    pub use crate::common::paths::*;
}
