use crate::common::Result;
use image::{ImageFormat, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};

/// Saves frames verbatim as `<n>.jpg` into one identity's folder until the quota
/// is met. Existing numbers are skipped, never overwritten.
pub struct EnrollmentWriter {
    dir: PathBuf,
    quota: usize,
    next_index: usize,
    saved: usize,
}

impl EnrollmentWriter {
    pub fn create(dir: impl Into<PathBuf>, quota: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, quota, next_index: 0, saved: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn saved(&self) -> usize {
        self.saved
    }

    pub fn is_complete(&self) -> bool {
        self.saved >= self.quota
    }

    /// Writes the frame under the next free number. `None` once the quota is met.
    pub fn persist(&mut self, frame: &RgbImage) -> Result<Option<PathBuf>> {
        if self.is_complete() {
            return Ok(None);
        }

        let path = loop {
            let candidate = self.dir.join(format!("{}.jpg", self.next_index));
            self.next_index += 1;
            if !candidate.exists() {
                break candidate;
            }
        };

        frame.save_with_format(&path, ImageFormat::Jpeg)?;
        self.saved += 1;
        tracing::debug!("Saved enrollment image {}", path.display());
        Ok(Some(path))
    }
}
