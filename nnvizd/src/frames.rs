//! Writes panel canvases out as binary PPM files.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use nnviz::viz::PixelCanvas;
use tracing::debug;

use crate::paths::AppPaths;
use crate::DriverError;

pub struct FrameWriter {
    paths: AppPaths,
    written: Vec<PathBuf>,
}

impl FrameWriter {
    pub fn new(paths: AppPaths) -> Self {
        Self {
            paths,
            written: Vec::new(),
        }
    }

    pub fn write(
        &mut self,
        panel: &str,
        index: usize,
        canvas: &PixelCanvas,
    ) -> Result<PathBuf, DriverError> {
        let path = self.paths.frame_file(panel, index);
        let out = BufWriter::new(File::create(&path)?);
        canvas.write_ppm(out)?;
        debug!("Wrote {:?}", path);
        self.written.push(path.clone());
        Ok(path)
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}
