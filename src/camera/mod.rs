pub mod source;
pub mod v4l2;

use chrono::{DateTime, Local};
use image::RgbImage;
use serde::Serialize;
use crate::error::Result;

pub use source::{FrameReceiver, FrameSource};
pub use v4l2::V4l2Backend;

/// A captured image plus the time it was grabbed. Shared as `Arc<Frame>`;
/// consumers clone the pixels before drawing on them.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Local>,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
    pub formats: Vec<String>,
}

/// An opened device that yields frames until dropped.
pub trait FrameGrabber: Send {
    fn grab(&mut self) -> Result<RgbImage>;
}

/// Enumerates and opens capture devices.
pub trait CameraBackend: Send + Sync {
    fn open(&self, device_index: u32) -> Result<Box<dyn FrameGrabber>>;
    fn list_cameras(&self) -> Result<Vec<CameraInfo>>;
}
