pub mod calibration_cache;
pub mod colmap;
pub mod common;
pub mod config;
pub mod context;
pub mod dataset;
pub mod error;
pub mod gaussian;
pub mod geometry;
pub mod mask;
pub mod ply;
pub mod regions;
pub mod render;
pub mod scene;
pub mod structures;

pub use calibration_cache::CalibrationCache;
pub use config::{DatasetSettings, EditorConfig};
pub use context::{load_and_fix_scene, EditorContext, ModelId, ModelRegistry};
pub use error::{EditError, EditResult};
pub use gaussian::GaussianManager;
pub use mask::{AxisAlignedBox, Mask, MaskGeometry, MaskWrapper, OrientedBox, PolygonPrism};
pub use render::{PipelineConfig, RenderedImage, Renderer};
pub use scene::{verify_calibration, CalibrationState, SceneManager};
pub use structures::{CameraPose, GaussianPointSet, SceneSnapshot};

use common::ZSTD_MAX_COMPRESSION_LVL;
use ply::{parse_gaussian_ply, write_gaussian_ply};
use std::io::{Cursor, Write};
use tracing::debug;
use zstd::stream::{decode_all, Encoder};

#[inline(never)]
fn compress_zstd(data: &[u8], level: u32, workers: u32) -> EditResult<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new(), level.min(ZSTD_MAX_COMPRESSION_LVL) as i32)
        .map_err(|e| EditError::ZstdCompress(format!("Encoder creation failed: {}", e)))?;
    encoder
        .multithread(workers)
        .map_err(|e| EditError::ZstdCompress(format!("Setting multithread failed: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| EditError::ZstdCompress(format!("Writing data failed: {}", e)))?;

    let compressed_data = encoder
        .finish()
        .map_err(|e| EditError::ZstdCompress(format!("Finalizing compression failed: {}", e)))?;
    Ok(compressed_data)
}

#[inline(never)]
fn decompress_zstd(data: &[u8]) -> EditResult<Vec<u8>> {
    decode_all(Cursor::new(data))
        .map_err(|e| EditError::ZstdDecompress(format!("Decompression failed: {}", e)))
}

/// Parses the PLY and rewrites it in canonical form, so that only valid
/// gaussian data ends up in a checkpoint.
pub fn prepare_uncompressed(raw_data: &[u8]) -> EditResult<Vec<u8>> {
    let set = parse_gaussian_ply(raw_data)?;
    if set.is_empty() {
        return Err(EditError::DegenerateInput(
            "gaussian model has no points".to_string(),
        ));
    }
    let mut out = Vec::new();
    write_gaussian_ply(&mut out, &set)?;
    Ok(out)
}

/// Compresses a 3DGS PLY file into a zstd checkpoint.
pub fn compress(
    raw_data: &[u8],
    compression_level: u32,
    workers: u32,
    output: &mut Vec<u8>,
) -> EditResult<()> {
    let uncompressed = prepare_uncompressed(raw_data)?;
    let compressed = compress_zstd(&uncompressed, compression_level, workers)?;
    debug!(
        raw = uncompressed.len(),
        compressed = compressed.len(),
        "checkpoint compressed"
    );
    output.clear();
    output.extend_from_slice(&compressed);
    Ok(())
}

/// Expands a checkpoint back into PLY bytes.
pub fn decompress(checkpoint: &[u8], output: &mut Vec<u8>) -> EditResult<()> {
    let uncompressed = decompress_zstd(checkpoint)?;
    let set = parse_gaussian_ply(&uncompressed)?;
    write_gaussian_ply(output, &set)
}

pub fn save_checkpoint(
    model: &GaussianManager,
    compression_level: u32,
    workers: u32,
) -> EditResult<Vec<u8>> {
    let mut ply = Vec::new();
    write_gaussian_ply(&mut ply, model.points())?;
    compress_zstd(&ply, compression_level, workers)
}

pub fn load_checkpoint(checkpoint: &[u8]) -> EditResult<GaussianManager> {
    let ply = decompress_zstd(checkpoint)?;
    GaussianManager::new(parse_gaussian_ply(&ply)?)
}

cfg_if::cfg_if! {
if #[cfg(feature = "async")] {
    use async_compression::zstd::CParameter;
    use async_compression::Level;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use async_compression::tokio::bufread::ZstdDecoder;
    use async_compression::tokio::write::ZstdEncoder;
    use tokio::io::BufReader;

    #[inline(never)]
    async fn compress_zstd_async(
        data: &[u8],
        level: u32,
        workers: u32,
    ) -> EditResult<Vec<u8>> {
        let mut compressed = Vec::new();
        let params = &[CParameter::nb_workers(workers)];
        let mut encoder = ZstdEncoder::with_quality_and_params(
            &mut compressed,
            Level::Precise(level.min(ZSTD_MAX_COMPRESSION_LVL) as i32),
            params,
        );

        encoder.write_all(data)
            .await
            .map_err(|e| EditError::ZstdCompress(e.to_string()))?;

        encoder.shutdown()
            .await
            .map_err(|e| EditError::ZstdCompress(e.to_string()))?;

        Ok(compressed)
    }

    #[inline(never)]
    async fn decompress_zstd_async(data: &[u8]) -> EditResult<Vec<u8>> {
        let cursor = Cursor::new(data);
        let reader = BufReader::new(cursor);
        let mut decoder = ZstdDecoder::new(reader);
        let mut decompressed = Vec::new();

        decoder.read_to_end(&mut decompressed)
            .await
            .map_err(|e| EditError::ZstdDecompress(e.to_string()))?;

        Ok(decompressed)
    }

    #[inline(never)]
    pub async fn compress_async(
        raw_data: &[u8],
        compression_level: u32,
        workers: u32,
        output: &mut Vec<u8>,
    ) -> EditResult<()> {
        let uncompressed = prepare_uncompressed(raw_data)?;
        let compressed = compress_zstd_async(&uncompressed, compression_level, workers).await?;
        output.clear();
        output.extend_from_slice(&compressed);
        Ok(())
    }

    #[inline(never)]
    pub async fn decompress_async(checkpoint: &[u8], output: &mut Vec<u8>) -> EditResult<()> {
        let uncompressed = decompress_zstd_async(checkpoint).await?;
        let set = parse_gaussian_ply(&uncompressed)?;
        write_gaussian_ply(output, &set)
    }
}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian::tests::line_set;

    fn create_test_ply() -> Vec<u8> {
        // One vertex, properties in a non-canonical order.
        let header = b"ply
format binary_little_endian 1.0
comment exported for testing
element vertex 1
property float x
property float y
property float z
property float scale_0
property float scale_1
property float scale_2
property float rot_0
property float rot_1
property float rot_2
property float rot_3
property float opacity
property float f_dc_0
property float f_dc_1
property float f_dc_2
end_header
";

        #[rustfmt::skip]
        let floats = [
            // x, y, z
            0.0f32, 0.1, 0.2,
            // scale_0, scale_1, scale_2
            0.01, 0.02, 0.03,
            // rot_0, rot_1, rot_2, rot_3
            1.0, 0.0, 0.0, 0.0,
            // opacity
            0.5,
            // f_dc_0, f_dc_1, f_dc_2
            0.2, 0.3, 0.4,
        ];

        let mut raw_ply = Vec::new();
        raw_ply.extend_from_slice(header);
        for &f in &floats {
            raw_ply.extend_from_slice(&f.to_le_bytes());
        }
        raw_ply
    }

    fn validate_output_ply(out_ply: &[u8]) {
        let set = parse_gaussian_ply(out_ply).expect("output is not a valid ply");
        assert_eq!(set.len(), 1);
        assert_eq!(set.positions, vec![0.0, 0.1, 0.2]);
        assert_eq!(set.sh_dc, vec![0.2, 0.3, 0.4]);
        assert_eq!(set.rotations, vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_compress_decompress() {
        let raw_ply = create_test_ply();

        let mut checkpoint = Vec::new();
        compress(&raw_ply, 1, 1, &mut checkpoint).expect("compress(...) failed");

        let mut out_ply = Vec::new();
        decompress(&checkpoint, &mut out_ply).expect("decompress(...) failed");

        validate_output_ply(&out_ply);
    }

    #[test]
    fn empty_model_is_not_compressed() {
        let data =
            b"ply\nformat binary_little_endian 1.0\nelement vertex 0\nproperty float x\nend_header";
        let mut out = Vec::new();
        assert!(matches!(
            compress(data, 3, 1, &mut out),
            Err(EditError::DegenerateInput(_))
        ));
    }

    #[test]
    fn garbage_checkpoint_fails_to_decompress() {
        let mut out = Vec::new();
        assert!(matches!(
            decompress(b"not zstd", &mut out),
            Err(EditError::ZstdDecompress(_))
        ));
    }

    #[test]
    fn model_checkpoint_keeps_points() {
        let model = GaussianManager::new(line_set(10, 3)).unwrap();
        let checkpoint = save_checkpoint(&model, 30, 2).unwrap();
        let loaded = load_checkpoint(&checkpoint).unwrap();
        assert_eq!(loaded.points().positions, model.points().positions);
        assert_eq!(loaded.points().sh_rest, model.points().sh_rest);
        assert_eq!(loaded.points().sh_degree, 3);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_compress_decompress_async() {
        let raw_ply = create_test_ply();

        let mut checkpoint = Vec::new();
        compress_async(&raw_ply, 1, 1, &mut checkpoint)
            .await
            .expect("compress_async failed");

        let mut out_ply = Vec::new();
        decompress_async(&checkpoint, &mut out_ply)
            .await
            .expect("decompress_async failed");

        validate_output_ply(&out_ply);
    }
}
