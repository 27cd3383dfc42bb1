use std::io;
use thiserror::Error;

pub type EditResult<T> = Result<T, EditError>;

#[derive(Debug, Error)]
pub enum EditError {
    #[error("Cannot normalize a near-zero vector (norm {0:e}).")]
    DegenerateVector(f64),

    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    #[error(
        "Scene calibration failed: fixed up vector has z = {z:.3}, expected more than {threshold:.2}. Please inspect the scene manually."
    )]
    CalibrationQuality { z: f64, threshold: f64 },

    #[error("Mask has {found} entries but the point set has {expected} points.")]
    MaskLengthMismatch { expected: usize, found: usize },

    #[error("Mask geometry '{0}' does not support the points-inside test.")]
    UnsupportedMaskGeometry(String),

    #[error("Mask is stale: computed at generation {mask}, point set is at generation {current}.")]
    StaleMask { mask: u64, current: u64 },

    #[error("Cannot create mask: {0}")]
    MissingParent(&'static str),

    #[error("Point sets have incompatible layouts: {0}")]
    LayoutMismatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to parse PLY data: {0}")]
    ParsePly(String),

    #[error("Failed to read COLMAP model: {0}")]
    Colmap(String),

    #[error("Calibration cache is corrupt: {0}")]
    CorruptCache(String),

    #[error("Zstandard compression failed: {0}")]
    ZstdCompress(String),

    #[error("Zstandard decompression failed: {0}")]
    ZstdDecompress(String),

    #[error("Failed to parse region file: {0}")]
    Regions(#[from] serde_json::Error),

    #[error("An I/O error occurred: {0}")]
    Io(#[from] io::Error),
}

impl EditError {
    /// Mask creation and mask application failures that the interactive
    /// workflow reports and skips instead of aborting.
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            EditError::MaskLengthMismatch { .. }
                | EditError::UnsupportedMaskGeometry(_)
                | EditError::StaleMask { .. }
                | EditError::MissingParent(_)
        )
    }
}
