use std::path::PathBuf;
use std::fs;
use directories::ProjectDirs;
use crate::config::Config;
use crate::error::{AttendanceError, Result};
use crate::paths::DataLayout;

const DEV_DATA_DIR: &str = "./dev_data";

#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        let base_dir = if enabled {
            PathBuf::from(DEV_DATA_DIR)
        } else {
            PathBuf::new()
        };

        if enabled {
            fs::create_dir_all(&base_dir)?;
            tracing::info!("Development mode enabled - data will be saved to: {}", base_dir.display());
        }

        Ok(Self { enabled, base_dir })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Resolves the data root: `./dev_data` in dev mode, then the configured
    /// directory, then the platform data directory.
    pub fn data_root(&self, config: &Config) -> Result<PathBuf> {
        if self.enabled {
            return Ok(self.base_dir.clone());
        }
        if let Some(dir) = &config.storage.data_dir {
            return Ok(dir.clone());
        }
        let dirs = ProjectDirs::from("com", "faceattendance", "FaceAttendance")
            .ok_or_else(|| AttendanceError::Storage("Failed to get project dirs".into()))?;
        Ok(dirs.data_dir().to_path_buf())
    }

    pub fn layout(&self, config: &Config) -> Result<DataLayout> {
        let layout = DataLayout::new(self.data_root(config)?);
        layout.ensure()?;
        if self.enabled {
            tracing::debug!("Using dev directories under {:?}", layout.root());
        }
        Ok(layout)
    }
}
