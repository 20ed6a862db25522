use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::ImageFormat;

use crate::models::job::{ErrorDetail, JobId};

/// Crop window and output size.
///
/// Horizontal bounds are absolute pixels, vertical bounds are fractions of
/// the source height. The window is clamped to the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropSpec {
    pub left: u32,
    pub right: u32,
    pub top_fraction: f64,
    pub bottom_fraction: f64,
    pub target_width: u32,
    pub target_height: u32,
}

impl Default for CropSpec {
    fn default() -> Self {
        Self {
            left: 4,
            right: 154,
            top_fraction: 0.2,
            bottom_fraction: 0.6,
            target_width: 300,
            target_height: 300,
        }
    }
}

impl CropSpec {
    /// Crop rectangle `(x, y, width, height)` inside a `width` x `height`
    /// image, or `None` if nothing of the window lies inside it.
    pub fn region(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.left.min(width);
        let x1 = self.right.min(width);
        let y0 = ((height as f64) * self.top_fraction) as u32;
        let y1 = (((height as f64) * self.bottom_fraction) as u32).min(height);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Progress checkpoints reported while a job runs.
pub mod checkpoints {
    pub const READ: f64 = 0.1;
    pub const DECODED: f64 = 0.3;
    pub const CROPPED: f64 = 0.5;
    pub const RESIZED: f64 = 0.8;
}

/// Crop-and-resize step run by workers. CPU bound; call from a blocking thread.
#[derive(Debug, Clone, Default)]
pub struct ImageProcessor {
    spec: CropSpec,
}

impl ImageProcessor {
    pub fn new(spec: CropSpec) -> Self {
        Self { spec }
    }

    /// Crop and resize `source`, writing `<job_id>.<ext>` into `output_dir`
    /// in the source's own format. Returns the written path.
    pub fn process(
        &self,
        job_id: JobId,
        source: &Path,
        output_dir: &Path,
        mut on_progress: impl FnMut(f64),
    ) -> Result<PathBuf, ProcessingError> {
        let bytes = std::fs::read(source).map_err(|e| ProcessingError::Io(source.to_path_buf(), e))?;
        on_progress(checkpoints::READ);

        let format = image::guess_format(&bytes).map_err(ProcessingError::Decode)?;
        let img = image::load_from_memory_with_format(&bytes, format)
            .map_err(ProcessingError::Decode)?;
        on_progress(checkpoints::DECODED);

        let (width, height) = (img.width(), img.height());
        let (x, y, w, h) = self
            .spec
            .region(width, height)
            .ok_or(ProcessingError::EmptyCrop { width, height })?;
        let cropped = img.crop_imm(x, y, w, h);
        on_progress(checkpoints::CROPPED);

        let resized = cropped.resize_exact(
            self.spec.target_width,
            self.spec.target_height,
            FilterType::Lanczos3,
        );
        on_progress(checkpoints::RESIZED);

        let dest = output_dir.join(format!("{job_id}.{}", extension_for(format)));
        resized
            .save_with_format(&dest, format)
            .map_err(ProcessingError::Encode)?;

        tracing::debug!(
            job_id = %job_id,
            source_width = width,
            source_height = height,
            output = %dest.display(),
            "Image cropped and resized"
        );

        Ok(dest)
    }
}

fn extension_for(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("img")
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Cannot read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Cannot decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Crop window lies outside a {width}x{height} image")]
    EmptyCrop { width: u32, height: u32 },

    #[error("Cannot encode result: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Processing aborted: {0}")]
    Aborted(String),
}

impl ProcessingError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::Io(..) => "io",
            ProcessingError::Decode(_) => "decode",
            ProcessingError::EmptyCrop { .. } => "empty_crop",
            ProcessingError::Encode(_) => "encode",
            ProcessingError::Aborted(_) => "aborted",
        }
    }
}

impl From<&ProcessingError> for ErrorDetail {
    fn from(e: &ProcessingError) -> Self {
        ErrorDetail::new(e.kind(), e.to_string())
    }
}
