//! Rectangular selections exported by the annotation tool.

use crate::error::EditResult;
use crate::gaussian::GaussianManager;
use crate::mask::{AxisAlignedBox, Mask};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionBound {
    #[serde(rename = "xMin")]
    pub x_min: f32,
    #[serde(rename = "yMin")]
    pub y_min: f32,
    #[serde(rename = "xMax")]
    pub x_max: f32,
    #[serde(rename = "yMax")]
    pub y_max: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Region {
    #[serde(rename = "boundDataArr", default)]
    pub bounds: Vec<RegionBound>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionFile {
    #[serde(default)]
    pub regions: Vec<Region>,
}

impl RegionFile {
    pub fn parse(json: &str) -> EditResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &Path) -> EditResult<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// One list of boxes per region, each spanning `[z_min, z_max]`.
    pub fn bboxes(&self, z_min: f32, z_max: f32) -> Vec<Vec<AxisAlignedBox>> {
        self.regions
            .iter()
            .enumerate()
            .map(|(r, region)| {
                region
                    .bounds
                    .iter()
                    .enumerate()
                    .map(|(b, bound)| {
                        AxisAlignedBox::new(
                            format!("region_{}_{}", r, b),
                            [bound.x_min, bound.y_min, z_min],
                            [bound.x_max, bound.y_max, z_max],
                        )
                    })
                    .collect()
            })
            .collect()
    }
}

pub fn bboxes_from_json(path: &Path, z_min: f32, z_max: f32) -> EditResult<Vec<Vec<AxisAlignedBox>>> {
    Ok(RegionFile::from_path(path)?.bboxes(z_min, z_max))
}

impl GaussianManager {
    /// One mask per region: the union of that region's boxes.
    pub fn masks_from_json(&self, path: &Path, z_min: f32, z_max: f32) -> EditResult<Vec<Mask>> {
        let regions = bboxes_from_json(path, z_min, z_max)?;
        self.masks_from_regions(&regions)
    }

    /// Union over every box of every region.
    pub fn mask_from_json(&self, path: &Path, z_min: f32, z_max: f32) -> EditResult<Mask> {
        let masks = self.masks_from_json(path, z_min, z_max)?;
        self.combine_masks(&masks)
    }

    pub fn masks_from_regions(&self, regions: &[Vec<AxisAlignedBox>]) -> EditResult<Vec<Mask>> {
        regions
            .iter()
            .map(|boxes| {
                let masks = boxes
                    .iter()
                    .map(|b| self.mask_from_geometry(b))
                    .collect::<EditResult<Vec<_>>>()?;
                self.combine_masks(&masks)
            })
            .collect()
    }
}
