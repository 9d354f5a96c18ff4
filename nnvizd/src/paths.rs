//! Cross-platform application paths

use std::fs;
use std::path::{Path, PathBuf};

use crate::DriverError;

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_file: PathBuf,
    frames_dir: PathBuf,
}

impl AppPaths {
    /// `frames_override` replaces the default frame directory; it is created either way.
    pub fn new(frames_override: Option<PathBuf>) -> Result<Self, DriverError> {
        let config_file = dirs::config_dir()
            .ok_or(DriverError::NoHomeDir("config"))?
            .join("nnviz")
            .join("config.json");
        let frames_dir = match frames_override {
            Some(dir) => dir,
            None => dirs::data_dir()
                .ok_or(DriverError::NoHomeDir("data"))?
                .join("nnviz")
                .join("frames"),
        };

        fs::create_dir_all(&frames_dir)?;

        Ok(Self {
            config_file,
            frames_dir,
        })
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn frames_dir(&self) -> &Path {
        &self.frames_dir
    }

    pub fn frame_file(&self, panel: &str, index: usize) -> PathBuf {
        self.frames_dir.join(format!("{panel}_{index:04}.ppm"))
    }
}
