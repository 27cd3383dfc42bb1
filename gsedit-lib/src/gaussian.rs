//! Gaussian model ownership and the mask-driven editing operations.

use crate::common::{
    dim_for_degree, inv_sigmoid, retain_rows, rgb_to_sh_dc, INITIAL_OPACITY, MAX_SH_DEGREE,
    SH_C0,
};
use crate::error::{EditError, EditResult};
use crate::mask::{Mask, MaskGeometry};
use crate::ply::{parse_gaussian_ply, write_gaussian_ply};
use crate::render::{PipelineConfig, RenderedImage, Renderer};
use crate::structures::{CameraPose, GaussianPointSet, SceneSnapshot};
use kiddo::{KdTree, SquaredEuclidean};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const MIN_NEIGHBOR_DIST_SQ: f32 = 1e-7;

impl GaussianPointSet {
    /// Initializes one gaussian per point: DC color from RGB, zero higher
    /// order SH, isotropic scale from the three nearest neighbours, identity
    /// rotation and low opacity.
    pub fn from_point_cloud(
        points: &[[f32; 3]],
        colors: &[[f32; 3]],
        sh_degree: u32,
    ) -> EditResult<Self> {
        if points.len() != colors.len() {
            return Err(EditError::DegenerateInput(format!(
                "{} points but {} colors",
                points.len(),
                colors.len()
            )));
        }
        let sh_degree = sh_degree.min(MAX_SH_DEGREE);
        let n = points.len();
        let k = dim_for_degree(sh_degree);
        let dist2 = mean_neighbor_dist_sq(points);

        let mut set = GaussianPointSet {
            sh_degree,
            positions: Vec::with_capacity(n * 3),
            sh_dc: Vec::with_capacity(n * 3),
            sh_rest: vec![0.0; n * k * 3],
            scales: Vec::with_capacity(n * 3),
            rotations: Vec::with_capacity(n * 4),
            opacities: vec![inv_sigmoid(INITIAL_OPACITY); n],
            ..Default::default()
        };
        for ((p, c), d2) in points.iter().zip(colors).zip(dist2) {
            set.positions.extend_from_slice(p);
            set.sh_dc
                .extend(c.iter().map(|&channel| rgb_to_sh_dc(channel)));
            let scale = d2.max(MIN_NEIGHBOR_DIST_SQ).sqrt().ln();
            set.scales.extend_from_slice(&[scale; 3]);
            set.rotations.extend_from_slice(&[1.0, 0.0, 0.0, 0.0]);
        }
        Ok(set)
    }

    /// Concatenates point sets in order. Optimizer accumulators survive only
    /// when every input has them allocated.
    pub fn merge(sets: &[&GaussianPointSet]) -> EditResult<GaussianPointSet> {
        let first = match sets.first() {
            Some(first) => first,
            None => return Ok(GaussianPointSet::default()),
        };
        let mut merged = GaussianPointSet::empty(first.sh_degree);
        for set in sets {
            set.validate()?;
            if set.sh_degree != first.sh_degree {
                return Err(EditError::LayoutMismatch(format!(
                    "cannot merge SH degree {} with degree {}",
                    set.sh_degree, first.sh_degree
                )));
            }
            merged.positions.extend_from_slice(&set.positions);
            merged.sh_dc.extend_from_slice(&set.sh_dc);
            merged.sh_rest.extend_from_slice(&set.sh_rest);
            merged.scales.extend_from_slice(&set.scales);
            merged.rotations.extend_from_slice(&set.rotations);
            merged.opacities.extend_from_slice(&set.opacities);
        }
        if sets.iter().all(|s| s.max_radii_2d.len() == s.len()) {
            merged.max_radii_2d = sets
                .iter()
                .flat_map(|s| s.max_radii_2d.iter().copied())
                .collect();
        }
        if sets.iter().all(|s| s.xyz_gradient_accum.len() == s.len()) {
            merged.xyz_gradient_accum = sets
                .iter()
                .flat_map(|s| s.xyz_gradient_accum.iter().copied())
                .collect();
        }
        if sets.iter().all(|s| s.denom.len() == s.len()) {
            merged.denom = sets.iter().flat_map(|s| s.denom.iter().copied()).collect();
        }
        Ok(merged)
    }
}

/// Per-point offset step, relative to the coordinate magnitude. Large enough
/// to separate equal `f64` coordinates, small enough to leave distances
/// unchanged at `f32` precision.
const TIE_BREAK_STEP: f64 = 1e-13;

/// Tree key for point `i`. kd-tree buckets cannot split when every item
/// shares a coordinate on the split axis, as happens for coincident points
/// or an exactly planar cloud; a distinct offset per index keeps all keys
/// apart.
#[inline]
fn tie_broken(p: &[f32; 3], i: usize) -> [f64; 3] {
    let step = (i + 1) as f64 * TIE_BREAK_STEP;
    p.map(|c| {
        let c = c as f64;
        c + step * (1.0 + c.abs())
    })
}

fn mean_neighbor_dist_sq(points: &[[f32; 3]]) -> Vec<f32> {
    if points.len() < 2 {
        return vec![MIN_NEIGHBOR_DIST_SQ; points.len()];
    }
    let keys: Vec<[f64; 3]> = points
        .iter()
        .enumerate()
        .map(|(i, p)| tie_broken(p, i))
        .collect();
    let mut tree: KdTree<f64, 3> = KdTree::new();
    for (i, key) in keys.iter().enumerate() {
        tree.add(key, i as u64);
    }
    let wanted = points.len().min(4);
    keys.iter()
        .enumerate()
        .map(|(i, key)| {
            let neighbors: Vec<f64> = tree
                .nearest_n::<SquaredEuclidean>(key, wanted)
                .into_iter()
                .filter(|nn| nn.item != i as u64)
                .take(3)
                .map(|nn| nn.distance)
                .collect();
            if neighbors.is_empty() {
                MIN_NEIGHBOR_DIST_SQ
            } else {
                (neighbors.iter().sum::<f64>() / neighbors.len() as f64) as f32
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
struct Backup {
    points: GaussianPointSet,
    background: [f32; 3],
    generation: u64,
}

/// Owns one gaussian model and edits it. Single writer: callers must not
/// mutate one manager from several threads.
#[derive(Debug, Clone)]
pub struct GaussianManager {
    points: GaussianPointSet,
    background: [f32; 3],
    backup: Option<Backup>,
    generation: u64,
    next_generation: u64,
    spatial_lr_scale: f64,
}

impl GaussianManager {
    pub fn new(points: GaussianPointSet) -> EditResult<Self> {
        points.validate()?;
        Ok(Self {
            points,
            background: [0.0; 3],
            backup: None,
            generation: 0,
            next_generation: 1,
            spatial_lr_scale: 1.0,
        })
    }

    pub fn from_scene(scene: &SceneSnapshot, sh_degree: u32) -> EditResult<Self> {
        info!(points = scene.points.len(), "creating gaussians from scene");
        let set = GaussianPointSet::from_point_cloud(&scene.points, &scene.colors, sh_degree)?;
        let mut manager = Self::new(set)?;
        manager.spatial_lr_scale = scene.camera_extent();
        Ok(manager)
    }

    pub fn from_ply_file(path: &Path) -> EditResult<Self> {
        info!(path = %path.display(), "creating gaussians from ply");
        let data = fs::read(path)?;
        Self::new(parse_gaussian_ply(&data)?)
    }

    pub fn save_ply_file(&self, path: &Path) -> EditResult<()> {
        let mut out = Vec::new();
        write_gaussian_ply(&mut out, &self.points)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, out)?;
        Ok(())
    }

    #[inline]
    pub fn points(&self) -> &GaussianPointSet {
        &self.points
    }

    /// Raw access for external optimizers. Outstanding masks are invalidated
    /// since the point count may change.
    pub fn points_mut(&mut self) -> &mut GaussianPointSet {
        self.bump_generation();
        &mut self.points
    }

    pub fn replace_points(&mut self, points: GaussianPointSet) -> EditResult<()> {
        points.validate()?;
        self.points = points;
        self.bump_generation();
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn background(&self) -> [f32; 3] {
        self.background
    }

    pub fn set_background(&mut self, background: [f32; 3]) {
        self.background = background;
    }

    pub fn spatial_lr_scale(&self) -> f64 {
        self.spatial_lr_scale
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn bump_generation(&mut self) {
        self.generation = self.next_generation;
        self.next_generation += 1;
    }

    // Transactional edits: a single backup slot, no stack.

    /// Snapshots the point set and background, replacing any earlier backup.
    pub fn cache(&mut self) {
        self.backup = Some(Backup {
            points: self.points.clone(),
            background: self.background,
            generation: self.generation,
        });
    }

    /// Puts the backup back and clears the slot. No-op without a backup.
    pub fn restore(&mut self) {
        if let Some(backup) = self.backup.take() {
            self.points = backup.points;
            self.background = backup.background;
            self.generation = backup.generation;
        }
    }

    /// Keeps the current state and drops the backup.
    pub fn apply(&mut self) {
        self.backup = None;
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    /// Runs `edit` inside a `cache()`/`restore()` bracket. Calling `apply()`
    /// inside `edit` keeps the changes.
    pub fn virtual_edit<T>(&mut self, edit: impl FnOnce(&mut Self) -> T) -> T {
        self.cache();
        let result = edit(self);
        self.restore();
        result
    }

    // Masks.

    pub fn zeros_mask(&self) -> Mask {
        Mask::new(vec![false; self.len()], self.generation)
    }

    pub fn ones_mask(&self) -> Mask {
        Mask::new(vec![true; self.len()], self.generation)
    }

    /// Points inside the axis-aligned box, bounds inclusive.
    pub fn position_mask(&self, min: [f32; 3], max: [f32; 3]) -> Mask {
        let bits = self
            .points
            .positions
            .chunks_exact(3)
            .map(|p| (0..3).all(|a| p[a] >= min[a] && p[a] <= max[a]))
            .collect();
        Mask::new(bits, self.generation)
    }

    pub fn mask_from_geometry(&self, geometry: &dyn MaskGeometry) -> EditResult<Mask> {
        let bits = geometry
            .is_points_inside(&self.points.positions)
            .ok_or_else(|| EditError::UnsupportedMaskGeometry(geometry.name().to_string()))?;
        self.mask_from_bits(bits)
    }

    pub fn mask_from_bits(&self, bits: Vec<bool>) -> EditResult<Mask> {
        if bits.len() != self.len() {
            return Err(EditError::MaskLengthMismatch {
                expected: self.len(),
                found: bits.len(),
            });
        }
        Ok(Mask::new(bits, self.generation))
    }

    pub fn check_mask(&self, mask: &Mask) -> EditResult<()> {
        if mask.len() != self.len() {
            return Err(EditError::MaskLengthMismatch {
                expected: self.len(),
                found: mask.len(),
            });
        }
        if mask.generation() != self.generation {
            return Err(EditError::StaleMask {
                mask: mask.generation(),
                current: self.generation,
            });
        }
        Ok(())
    }

    /// Logical OR of all masks. An empty list selects nothing.
    pub fn combine_masks(&self, masks: &[Mask]) -> EditResult<Mask> {
        let mut combined = self.zeros_mask();
        for mask in masks {
            self.check_mask(mask)?;
            combined = combined.or(mask)?;
        }
        Ok(combined)
    }

    /// Removes every selected point from all per-point arrays at once.
    /// Returns the number of removed points.
    pub fn delete_by_mask(&mut self, mask: &Mask) -> EditResult<usize> {
        self.check_mask(mask)?;
        let keep: Vec<bool> = mask.bits().iter().map(|b| !b).collect();
        let removed = mask.count();
        let k = self.points.sh_rest_dim();

        let p = &mut self.points;
        retain_rows(&mut p.positions, 3, &keep);
        retain_rows(&mut p.sh_dc, 3, &keep);
        retain_rows(&mut p.sh_rest, k * 3, &keep);
        retain_rows(&mut p.scales, 3, &keep);
        retain_rows(&mut p.rotations, 4, &keep);
        retain_rows(&mut p.max_radii_2d, 1, &keep);
        retain_rows(&mut p.xyz_gradient_accum, 1, &keep);
        retain_rows(&mut p.denom, 1, &keep);
        retain_rows(&mut p.opacities, 1, &keep);

        self.bump_generation();
        debug!(removed, remaining = self.len(), "deleted masked points");
        Ok(removed)
    }

    fn selected(&self, mask: Option<&Mask>) -> EditResult<Vec<usize>> {
        match mask {
            Some(mask) => {
                self.check_mask(mask)?;
                Ok(mask
                    .bits()
                    .iter()
                    .enumerate()
                    .filter_map(|(i, &b)| b.then_some(i))
                    .collect())
            }
            None => Ok((0..self.len()).collect()),
        }
    }

    /// Sets the DC color of the selected points (all when `mask` is `None`).
    pub fn set_color(&mut self, rgb: [f32; 3], mask: Option<&Mask>) -> EditResult<()> {
        let dc = rgb.map(rgb_to_sh_dc);
        for i in self.selected(mask)? {
            self.points.sh_dc[i * 3..i * 3 + 3].copy_from_slice(&dc);
        }
        Ok(())
    }

    pub fn set_alpha(&mut self, alpha: f32, mask: Option<&Mask>) -> EditResult<()> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(EditError::InvalidArgument(format!(
                "alpha must be in (0, 1), got {}",
                alpha
            )));
        }
        let logit = inv_sigmoid(alpha);
        for i in self.selected(mask)? {
            self.points.opacities[i] = logit;
        }
        Ok(())
    }

    pub fn clear_features_rest(&mut self, mask: Option<&Mask>) -> EditResult<()> {
        let stride = self.points.sh_rest_dim() * 3;
        for i in self.selected(mask)? {
            self.points.sh_rest[i * stride..(i + 1) * stride].fill(0.0);
        }
        Ok(())
    }

    /// Colors selected points `inside` and the rest `outside`, with view
    /// dependent color cleared and a black background. Geometry is untouched;
    /// meant to run between `cache()` and `restore()`.
    pub fn paint_by_mask(
        &mut self,
        mask: &Mask,
        inside: [f32; 3],
        outside: [f32; 3],
    ) -> EditResult<()> {
        self.check_mask(mask)?;
        self.background = [0.0; 3];
        self.clear_features_rest(None)?;
        self.set_color(outside, Some(&mask.inverted()))?;
        self.set_color(inside, Some(mask))
    }

    pub fn add_position_noise<R: Rng + ?Sized>(
        &mut self,
        std: f32,
        mask: Option<&Mask>,
        rng: &mut R,
    ) -> EditResult<()> {
        let normal = normal(std)?;
        for i in self.selected(mask)? {
            for v in &mut self.points.positions[i * 3..i * 3 + 3] {
                *v += normal.sample(rng);
            }
        }
        Ok(())
    }

    /// `std` is given in RGB units and converted to DC space.
    pub fn add_color_noise<R: Rng + ?Sized>(
        &mut self,
        std: f32,
        mask: Option<&Mask>,
        rng: &mut R,
    ) -> EditResult<()> {
        let normal = normal(std / SH_C0)?;
        for i in self.selected(mask)? {
            for v in &mut self.points.sh_dc[i * 3..i * 3 + 3] {
                *v += normal.sample(rng);
            }
        }
        Ok(())
    }

    /// Moves every selected point to a uniformly random spot in the box.
    pub fn noise_position<R: Rng + ?Sized>(
        &mut self,
        mask: &Mask,
        min: [f32; 3],
        max: [f32; 3],
        rng: &mut R,
    ) -> EditResult<()> {
        if (0..3).any(|a| min[a] > max[a]) {
            return Err(EditError::InvalidArgument(format!(
                "box min {:?} exceeds max {:?}",
                min, max
            )));
        }
        for i in self.selected(Some(mask))? {
            for a in 0..3 {
                self.points.positions[i * 3 + a] = rng.gen_range(min[a]..=max[a]);
            }
        }
        Ok(())
    }

    pub fn move_by(&mut self, offset: [f32; 3]) {
        for p in self.points.positions.chunks_exact_mut(3) {
            p[0] += offset[0];
            p[1] += offset[1];
            p[2] += offset[2];
        }
    }

    /// Renders through `renderer`; a missing renderer yields a blank frame of
    /// the camera's size.
    pub fn render(
        &self,
        renderer: Option<&dyn Renderer>,
        camera: &CameraPose,
        pipeline: &PipelineConfig,
    ) -> RenderedImage {
        match renderer {
            Some(r) => r.render(camera, &self.points, self.background, pipeline),
            None => RenderedImage::blank(camera.width, camera.height),
        }
    }
}

fn normal(std: f32) -> EditResult<Normal<f32>> {
    Normal::new(0.0, std)
        .map_err(|e| EditError::InvalidArgument(format!("noise std {}: {}", std, e)))
}
