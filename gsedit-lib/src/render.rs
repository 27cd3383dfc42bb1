use crate::common::clamp_u8;
use crate::structures::{CameraPose, GaussianPointSet};
use serde::{Deserialize, Serialize};

/// Flags forwarded untouched to the rasterizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub convert_shs: bool,
    pub compute_cov3d: bool,
    pub debug: bool,
}

/// Float RGB image in `[0, 1]`, row-major, as produced by a rasterizer.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<f32>,
}

impl RenderedImage {
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rgb: vec![0.0; width as usize * height as usize * 3],
        }
    }

    pub fn to_rgb8(&self) -> Vec<u8> {
        self.rgb
            .iter()
            .map(|&c| clamp_u8(c.clamp(0.0, 1.0) * 255.0))
            .collect()
    }

    /// RGB8 with an opaque alpha channel appended to every pixel.
    pub fn to_rgba8(&self) -> Vec<u8> {
        self.rgb
            .chunks_exact(3)
            .flat_map(|px| {
                [
                    clamp_u8(px[0].clamp(0.0, 1.0) * 255.0),
                    clamp_u8(px[1].clamp(0.0, 1.0) * 255.0),
                    clamp_u8(px[2].clamp(0.0, 1.0) * 255.0),
                    255,
                ]
            })
            .collect()
    }
}

/// External gaussian rasterizer.
pub trait Renderer {
    fn render(
        &self,
        camera: &CameraPose,
        points: &GaussianPointSet,
        background: [f32; 3],
        pipeline: &PipelineConfig,
    ) -> RenderedImage;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_conversion_clamps_and_adds_alpha() {
        let img = RenderedImage {
            width: 2,
            height: 1,
            rgb: vec![1.5, 0.5, -0.2, 0.0, 1.0, 0.25],
        };
        assert_eq!(img.to_rgba8(), vec![255, 128, 0, 255, 0, 255, 64, 255]);
        assert_eq!(img.to_rgb8().len(), 6);
    }
}
