use std::fs;
use std::path::{Path, PathBuf};
use chrono::NaiveDate;
use crate::error::Result;

/// On-disk layout under the data root:
/// `attendance/<MMDDYYYY>.xlsx`, `faces/<name>/<n>.jpg`, `models/`, `passkey/`.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates every directory except `faces/`, whose absence is meaningful to training.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.attendance_dir())?;
        fs::create_dir_all(self.models_dir())?;
        fs::create_dir_all(self.passkey_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn attendance_dir(&self) -> PathBuf {
        self.root.join("attendance")
    }

    pub fn faces_dir(&self) -> PathBuf {
        self.root.join("faces")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn passkey_dir(&self) -> PathBuf {
        self.root.join("passkey")
    }

    pub fn identity_dir(&self, name: &str) -> PathBuf {
        self.faces_dir().join(name)
    }

    pub fn attendance_file(&self, date: NaiveDate) -> PathBuf {
        self.attendance_dir().join(attendance_file_name(date))
    }

    /// Resolves a model path from the config: relative paths live in `models/`.
    pub fn model_path(&self, configured: &Path) -> PathBuf {
        if configured.is_relative() {
            self.models_dir().join(configured)
        } else {
            configured.to_path_buf()
        }
    }
}

pub fn attendance_file_name(date: NaiveDate) -> String {
    format!("{}.xlsx", date.format("%m%d%Y"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attendance_file_uses_month_day_year() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(attendance_file_name(date), "03072024.xlsx");
        let layout = DataLayout::new("/data");
        assert_eq!(layout.attendance_file(date), PathBuf::from("/data/attendance/03072024.xlsx"));
    }

    #[test]
    fn relative_model_paths_resolve_under_models() {
        let layout = DataLayout::new("/data");
        assert_eq!(
            layout.model_path(Path::new("det.onnx")),
            PathBuf::from("/data/models/det.onnx")
        );
        assert_eq!(
            layout.model_path(Path::new("/opt/det.onnx")),
            PathBuf::from("/opt/det.onnx")
        );
    }
}
