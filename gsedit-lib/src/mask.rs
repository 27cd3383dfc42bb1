//! Point selections and the solids that produce them.

use crate::context::{ModelId, ModelRegistry};
use crate::error::{EditError, EditResult};
use crate::structures::Vec3;
use nalgebra::UnitQuaternion;
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;

/// Boolean selection over the points of one gaussian model, tagged with the
/// generation of the point set it was computed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    bits: Vec<bool>,
    generation: u64,
}

impl Mask {
    pub(crate) fn new(bits: Vec<bool>, generation: u64) -> Self {
        Self { bits, generation }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        self.bits[i]
    }

    /// Number of selected points.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    pub fn inverted(&self) -> Mask {
        Mask::new(self.bits.iter().map(|b| !b).collect(), self.generation)
    }

    pub fn or(&self, other: &Mask) -> EditResult<Mask> {
        if self.len() != other.len() {
            return Err(EditError::MaskLengthMismatch {
                expected: self.len(),
                found: other.len(),
            });
        }
        let bits = self
            .bits
            .iter()
            .zip(&other.bits)
            .map(|(&a, &b)| a || b)
            .collect();
        Ok(Mask::new(bits, self.generation))
    }
}

/// A solid that can classify points as inside or outside.
pub trait MaskGeometry: Send + Sync {
    fn name(&self) -> &str;

    /// Inside flags for the flat `N x 3` positions, or `None` when this
    /// geometry cannot enclose points.
    fn is_points_inside(&self, positions: &[f32]) -> Option<Vec<bool>>;
}

impl fmt::Debug for dyn MaskGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MaskGeometry({})", self.name())
    }
}

fn classify<F>(positions: &[f32], inside: F) -> Vec<bool>
where
    F: Fn(&[f32]) -> bool + Sync + Send,
{
    positions.par_chunks_exact(3).map(inside).collect()
}

/// Box with inclusive bounds on every axis.
#[derive(Debug, Clone)]
pub struct AxisAlignedBox {
    pub name: String,
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl AxisAlignedBox {
    pub fn new(name: impl Into<String>, min: [f32; 3], max: [f32; 3]) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }

    #[inline]
    pub fn contains(&self, p: &[f32]) -> bool {
        (0..3).all(|a| p[a] >= self.min[a] && p[a] <= self.max[a])
    }
}

impl MaskGeometry for AxisAlignedBox {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_points_inside(&self, positions: &[f32]) -> Option<Vec<bool>> {
        Some(classify(positions, |p| self.contains(p)))
    }
}

/// Unit cube centered at the origin, scaled, rotated, then translated.
#[derive(Debug, Clone)]
pub struct OrientedBox {
    pub name: String,
    pub translation: Vec3,
    pub rotation: UnitQuaternion<f64>,
    pub scale: Vec3,
}

impl OrientedBox {
    pub fn new(name: impl Into<String>, translation: Vec3, scale: Vec3) -> Self {
        Self {
            name: name.into(),
            translation,
            rotation: UnitQuaternion::identity(),
            scale,
        }
    }

    pub fn with_rotation(mut self, rotation: UnitQuaternion<f64>) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn contains(&self, p: &[f32]) -> bool {
        let world = Vec3::new(p[0] as f64, p[1] as f64, p[2] as f64);
        let local = self.rotation.inverse_transform_vector(&(world - self.translation));
        (0..3).all(|a| local[a].abs() <= self.scale[a].abs() * 0.5)
    }
}

impl MaskGeometry for OrientedBox {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_points_inside(&self, positions: &[f32]) -> Option<Vec<bool>> {
        Some(classify(positions, |p| self.contains(p)))
    }
}

/// Polygon in the XY plane extruded over `[z_min, z_max]`.
#[derive(Debug, Clone)]
pub struct PolygonPrism {
    pub name: String,
    pub polygon: Vec<[f64; 2]>,
    pub z_min: f64,
    pub z_max: f64,
}

impl PolygonPrism {
    pub fn new(name: impl Into<String>, polygon: Vec<[f64; 2]>, z_min: f64, z_max: f64) -> Self {
        Self {
            name: name.into(),
            polygon,
            z_min,
            z_max,
        }
    }

    pub fn contains(&self, p: &[f32]) -> bool {
        let (x, y, z) = (p[0] as f64, p[1] as f64, p[2] as f64);
        if z < self.z_min || z > self.z_max || self.polygon.len() < 3 {
            return false;
        }
        // Even-odd ray cast along +X.
        let mut inside = false;
        let n = self.polygon.len();
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.polygon[i];
            let [xj, yj] = self.polygon[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

impl MaskGeometry for PolygonPrism {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_points_inside(&self, positions: &[f32]) -> Option<Vec<bool>> {
        Some(classify(positions, |p| self.contains(p)))
    }
}

/// Named mask with optional provenance, so it can be rebuilt from the model
/// and geometry that produced it.
#[derive(Debug, Clone)]
pub struct MaskWrapper {
    pub name: String,
    parent_model: Option<ModelId>,
    parent_geometry: Option<Arc<dyn MaskGeometry>>,
    mask: Option<Mask>,
    num_points: usize,
}

impl MaskWrapper {
    pub fn new(
        name: impl Into<String>,
        parent_model: Option<ModelId>,
        parent_geometry: Option<Arc<dyn MaskGeometry>>,
    ) -> Self {
        Self {
            name: name.into(),
            parent_model,
            parent_geometry,
            mask: None,
            num_points: 0,
        }
    }

    /// Recomputes the mask from the parent model and geometry. Returns the
    /// number of selected points. On failure the error's `Display` text is
    /// the message to show the user.
    pub fn create_mask_by_parent(&mut self, models: &ModelRegistry) -> EditResult<usize> {
        let model_id = self
            .parent_model
            .ok_or(EditError::MissingParent("no target gaussian model"))?;
        let geometry = self
            .parent_geometry
            .as_ref()
            .ok_or(EditError::MissingParent("no target geometry as mask"))?;
        let model = models
            .get(model_id)
            .ok_or(EditError::MissingParent("target gaussian model was removed"))?;

        let mask = model.mask_from_geometry(geometry.as_ref())?;
        self.num_points = mask.count();
        self.mask = Some(mask);
        Ok(self.num_points)
    }

    /// Result of combining masks. It still targets `model` when every input
    /// did, but has no geometry and so cannot be recomputed.
    pub fn combined(name: impl Into<String>, model: Option<ModelId>, mask: Mask) -> Self {
        Self {
            name: name.into(),
            parent_model: model,
            parent_geometry: None,
            num_points: mask.count(),
            mask: Some(mask),
        }
    }

    pub fn has_parent(&self) -> bool {
        self.parent_model.is_some() && self.parent_geometry.is_some()
    }

    pub fn parent_model(&self) -> Option<ModelId> {
        self.parent_model
    }

    pub fn mask(&self) -> Option<&Mask> {
        self.mask.as_ref()
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }
}
