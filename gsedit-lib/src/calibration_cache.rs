use crate::error::{EditError, EditResult};
use crate::structures::Mat3;
use nalgebra::Rotation3;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const MAGIC: u32 = 0x5452_5347; // 'GSRT'
pub const VERSION: u32 = 1;
pub const DEFAULT_CACHE_DIR: &str = "cache";
pub const ROTATION_FILE: &str = "rotation.bin";

const HEADER_SIZE: usize = 16;
const PAYLOAD_SIZE: usize = 9 * 8;

/// File-backed store for the rotation a scene was fixed with, keyed by the
/// scene's source directory.
#[derive(Debug, Clone)]
pub struct CalibrationCache {
    dir_name: String,
}

impl Default for CalibrationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_DIR)
    }
}

impl CalibrationCache {
    pub fn new(dir_name: impl Into<String>) -> Self {
        Self {
            dir_name: dir_name.into(),
        }
    }

    pub fn path_for(&self, source_path: &Path) -> PathBuf {
        source_path.join(&self.dir_name).join(ROTATION_FILE)
    }

    pub fn load(&self, source_path: &Path) -> EditResult<Option<Rotation3<f64>>> {
        let path = self.path_for(source_path);
        if !path.is_file() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        decode_rotation(&data).map(Some)
    }

    pub fn store(&self, source_path: &Path, rotation: &Rotation3<f64>) -> EditResult<PathBuf> {
        let path = self.path_for(source_path);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, encode_rotation(rotation))?;
        info!(path = %path.display(), "fix rotation cached");
        Ok(path)
    }
}

pub fn encode_rotation(rotation: &Rotation3<f64>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + PAYLOAD_SIZE);
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    let m = rotation.matrix();
    for row in 0..3 {
        for col in 0..3 {
            out.extend_from_slice(&m[(row, col)].to_le_bytes());
        }
    }
    out
}

pub fn decode_rotation(data: &[u8]) -> EditResult<Rotation3<f64>> {
    if data.len() != HEADER_SIZE + PAYLOAD_SIZE {
        return Err(EditError::CorruptCache(format!(
            "expected {} bytes, found {}",
            HEADER_SIZE + PAYLOAD_SIZE,
            data.len()
        )));
    }
    let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    if word(0) != MAGIC {
        return Err(EditError::CorruptCache("invalid magic number".to_string()));
    }
    if word(4) != VERSION {
        return Err(EditError::CorruptCache("unsupported version".to_string()));
    }

    let mut values = [0f64; 9];
    for (i, chunk) in data[HEADER_SIZE..].chunks_exact(8).enumerate() {
        let bytes: [u8; 8] = chunk
            .try_into()
            .map_err(|e| EditError::CorruptCache(format!("matrix entry {}: {}", i, e)))?;
        values[i] = f64::from_le_bytes(bytes);
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(EditError::CorruptCache("non-finite matrix entry".to_string()));
    }
    Ok(Rotation3::from_matrix_unchecked(Mat3::from_row_slice(
        &values,
    )))
}
