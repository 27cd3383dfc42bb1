use crate::calibration_cache::DEFAULT_CACHE_DIR;
use crate::common::MAX_SH_DEGREE;
use crate::error::EditResult;
use crate::scene::DEFAULT_CALIBRATION_THRESHOLD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub sh_degree: u32,
    pub background: [f32; 3],
    pub calibration_threshold: f64,
    /// Seeds the up-vector estimation. `None` draws from OS entropy.
    pub seed: Option<u64>,
    pub cache_dir_name: String,
    pub images: String,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            sh_degree: MAX_SH_DEGREE,
            background: [0.0; 3],
            calibration_threshold: DEFAULT_CALIBRATION_THRESHOLD,
            seed: None,
            cache_dir_name: DEFAULT_CACHE_DIR.to_string(),
            images: "images".to_string(),
        }
    }
}

impl EditorConfig {
    pub fn from_json_file(path: &Path) -> EditResult<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Sampling ranges for generated mask datasets. Angles are in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    pub num_masks: usize,
    pub mask_size_min: f32,
    pub mask_size_max: f32,
    pub camera_angle_y_min: f64,
    pub camera_angle_y_max: f64,
    pub camera_radius_min: f64,
    pub camera_radius_max: f64,
    pub angle_x_sample: usize,
    pub angle_y_sample: usize,
    pub radius_sample: usize,
    pub enable_pix2pix_output: bool,
    /// Side of the square views rendered per mask.
    pub image_size: u32,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            num_masks: 100,
            mask_size_min: 0.1,
            mask_size_max: 0.5,
            camera_angle_y_min: -175.0,
            camera_angle_y_max: -135.0,
            camera_radius_min: 1.0,
            camera_radius_max: 5.0,
            angle_x_sample: 18,
            angle_y_sample: 4,
            radius_sample: 4,
            enable_pix2pix_output: true,
            image_size: 512,
        }
    }
}
