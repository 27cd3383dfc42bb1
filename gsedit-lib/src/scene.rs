//! Ground-plane calibration of a reconstructed scene.
//!
//! Photogrammetry leaves the scene in an arbitrary frame. Cameras are mostly
//! held level, so the cross product of two cameras' "right" axes points along
//! the ground normal. Averaging many such products gives the up vector, and
//! the scene is then rotated so that up becomes `+Z`.

use crate::error::{EditError, EditResult};
use crate::geometry::{normalize, rotate_pose, rotation_aligning, translation_rotation_to_pose};
use crate::structures::{Mat3, SceneSnapshot, Vec3};
use nalgebra::Rotation3;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

/// Pairs of right axes closer than this (squared) are skipped.
const MIN_RIGHT_AXIS_DIST_SQ: f64 = 0.1;

/// Cross products shorter than this come from (anti)parallel axes.
const MIN_CROSS_NORM: f64 = 1e-6;

pub const DEFAULT_CALIBRATION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Uninitialized,
    PoseCached,
    UpVectorEstimated,
    Fixed,
}

pub struct SceneManager {
    scene: Arc<SceneSnapshot>,
    cam_positions: Option<Vec<Vec3>>,
    cam_axes: Option<Vec<Mat3>>,
    ground_up: Option<Vec3>,
    fixed_with: Option<Rotation3<f64>>,
}

impl SceneManager {
    pub fn new(scene: SceneSnapshot) -> Self {
        Self::from_shared(Arc::new(scene))
    }

    pub fn from_shared(scene: Arc<SceneSnapshot>) -> Self {
        Self {
            scene,
            cam_positions: None,
            cam_axes: None,
            ground_up: None,
            fixed_with: None,
        }
    }

    pub fn scene(&self) -> &Arc<SceneSnapshot> {
        &self.scene
    }

    pub fn state(&self) -> CalibrationState {
        if self.fixed_with.is_some() {
            CalibrationState::Fixed
        } else if self.ground_up.is_some() {
            CalibrationState::UpVectorEstimated
        } else if self.cam_axes.is_some() {
            CalibrationState::PoseCached
        } else {
            CalibrationState::Uninitialized
        }
    }

    pub fn clear_cache(&mut self) {
        self.cam_positions = None;
        self.cam_axes = None;
        self.ground_up = None;
        self.fixed_with = None;
    }

    /// World positions and axis frames (rows: right, down, forward) of every
    /// camera. Cached after the first call.
    pub fn camera_positions_and_axes(&mut self) -> (&[Vec3], &[Mat3]) {
        if self.cam_positions.is_none() || self.cam_axes.is_none() {
            let (positions, axes): (Vec<Vec3>, Vec<Mat3>) = self
                .scene
                .cameras
                .iter()
                .map(|cam| translation_rotation_to_pose(&cam.translation, &cam.rotation))
                .unzip();
            self.cam_positions = Some(positions);
            self.cam_axes = Some(axes);
        }
        match (&self.cam_positions, &self.cam_axes) {
            (Some(p), Some(a)) => (p.as_slice(), a.as_slice()),
            _ => (&[], &[]),
        }
    }

    /// Estimates the unit ground normal from random pairs of cameras. The
    /// result points from the scene points toward the cameras. Always
    /// re-estimates and replaces the cached value.
    pub fn estimate_ground_up_vector<R: Rng + ?Sized>(&mut self, rng: &mut R) -> EditResult<Vec3> {
        let mean_point = self.scene.mean_point();
        let (positions, axes) = self.camera_positions_and_axes();
        if axes.is_empty() {
            return Err(EditError::DegenerateInput(
                "scene has no cameras to estimate the up vector from".to_string(),
            ));
        }

        let mut rights: Vec<Vec3> = axes.iter().map(|a| a.row(0).transpose()).collect();
        let sample_size = rights.len() / 3 * 2;
        rights.shuffle(rng);
        rights.truncate(sample_size);
        let half = rights.len() / 2;
        let (group1, group2) = rights.split_at(half);

        let mut ups: Vec<Vec3> = Vec::with_capacity(half);
        for (r1, r2) in group1.iter().zip(group2) {
            let v1 = normalize(r1)?;
            let v2 = normalize(r2)?;
            if (v1 - v2).norm_squared() < MIN_RIGHT_AXIS_DIST_SQ {
                continue;
            }
            let cross = v1.cross(&v2);
            if cross.norm() < MIN_CROSS_NORM {
                continue;
            }
            let mut up = normalize(&cross)?;
            if let Some(first) = ups.first() {
                if first.dot(&up) < 0.0 {
                    up = -up;
                }
            }
            ups.push(up);
        }
        if ups.is_empty() {
            return Err(EditError::DegenerateInput(format!(
                "no usable camera pairs among {} cameras",
                axes.len()
            )));
        }

        let mean_up = ups.iter().fold(Vec3::zeros(), |a, u| a + u) / ups.len() as f64;
        let mean_cam = positions.iter().fold(Vec3::zeros(), |a, p| a + p) / positions.len() as f64;
        let mut up = normalize(&mean_up)?;
        if up.dot(&(mean_cam - mean_point)) < 0.0 {
            up = -up;
        }
        debug!(pairs = ups.len(), ?up, "estimated ground up vector");
        self.ground_up = Some(up);
        Ok(up)
    }

    /// Cached up vector, estimating it first if needed.
    pub fn ground_up_vector<R: Rng + ?Sized>(&mut self, rng: &mut R) -> EditResult<Vec3> {
        match self.ground_up {
            Some(up) => Ok(up),
            None => self.estimate_ground_up_vector(rng),
        }
    }

    /// New manager over the scene with every point and camera rotated.
    pub fn rotate(&self, rotation: &Rotation3<f64>) -> SceneManager {
        let points = self
            .scene
            .points
            .iter()
            .map(|p| {
                let v = rotation * Vec3::new(p[0] as f64, p[1] as f64, p[2] as f64);
                [v.x as f32, v.y as f32, v.z as f32]
            })
            .collect();
        let cameras = self
            .scene
            .cameras
            .iter()
            .map(|cam| {
                let (translation, cam_rotation) =
                    rotate_pose(rotation, &cam.translation, &cam.rotation);
                let mut rotated = cam.clone();
                rotated.translation = translation;
                rotated.rotation = cam_rotation;
                rotated
            })
            .collect();

        SceneManager::new(SceneSnapshot {
            points,
            colors: self.scene.colors.clone(),
            normals: self.scene.normals.clone(),
            cameras,
        })
    }

    /// Reorients the scene so its ground normal becomes `+Z`. A supplied
    /// `cached_rotation` is applied as is, which makes repeated runs
    /// reproduce the same scene exactly.
    pub fn fix<R: Rng + ?Sized>(
        &mut self,
        cached_rotation: Option<Rotation3<f64>>,
        rng: &mut R,
    ) -> EditResult<(SceneManager, Rotation3<f64>)> {
        let rotation = match cached_rotation {
            Some(rotation) => {
                info!("using cached rotation");
                rotation
            }
            None => {
                let up = self.ground_up_vector(rng)?;
                info!(?up, "original up vector");
                let rotation = rotation_aligning(&up, &Vec3::z())?;
                let (roll, pitch, yaw) = rotation.euler_angles();
                info!(
                    roll = roll.to_degrees(),
                    pitch = pitch.to_degrees(),
                    yaw = yaw.to_degrees(),
                    "fix rotation"
                );
                rotation
            }
        };
        self.fixed_with = Some(rotation);
        Ok((self.rotate(&rotation), rotation))
    }
}

/// Re-estimates the up vector of a fixed scene and fails unless its Z
/// component exceeds `threshold`.
pub fn verify_calibration<R: Rng + ?Sized>(
    fixed: &mut SceneManager,
    threshold: f64,
    rng: &mut R,
) -> EditResult<Vec3> {
    let up = fixed.estimate_ground_up_vector(rng)?;
    info!(?up, "fixed up vector");
    if up.z > threshold {
        Ok(up)
    } else {
        Err(EditError::CalibrationQuality { z: up.z, threshold })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::pose_to_translation_rotation;
    use crate::structures::CameraPose;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Cameras on a ring above a flat grid, looking at its center. Angles are
    /// multiples of 31 degrees so no two cameras face opposite ways.
    pub(crate) fn ring_scene(num_cameras: usize, tilt: Option<Rotation3<f64>>) -> SceneSnapshot {
        let tilt = tilt.unwrap_or_else(Rotation3::identity);
        let mut points = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                let p = Vec3::new(i as f64 * 0.4 - 2.0, j as f64 * 0.4 - 2.0, 0.0);
                let p = tilt * p;
                points.push([p.x as f32, p.y as f32, p.z as f32]);
            }
        }
        let colors = vec![[0.5; 3]; points.len()];

        let cameras = (0..num_cameras)
            .map(|i| {
                let theta = (i as f64 * 31.0).to_radians();
                let height = 3.0 + 0.1 * i as f64;
                let position = Vec3::new(4.0 * theta.cos(), 4.0 * theta.sin(), height);
                let forward = (-position).normalize();
                let right = forward.cross(&Vec3::z()).normalize();
                let down = forward.cross(&right);
                let axis = Mat3::from_rows(&[
                    right.transpose(),
                    down.transpose(),
                    forward.transpose(),
                ]);
                let position = tilt * position;
                let axis = axis * tilt.matrix().transpose();
                let (translation, rotation) = pose_to_translation_rotation(&position, &axis);
                CameraPose {
                    uid: i as u32,
                    image_name: format!("{:05}.jpg", i),
                    translation,
                    rotation,
                    fov_x: 1.0,
                    fov_y: 0.8,
                    width: 64,
                    height: 48,
                }
            })
            .collect();

        SceneSnapshot::new(points, colors, None, cameras).unwrap()
    }

    #[test]
    fn state_machine_advances_and_clears() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut sm = SceneManager::new(ring_scene(10, None));
        assert_eq!(sm.state(), CalibrationState::Uninitialized);
        sm.camera_positions_and_axes();
        assert_eq!(sm.state(), CalibrationState::PoseCached);
        sm.estimate_ground_up_vector(&mut rng).unwrap();
        assert_eq!(sm.state(), CalibrationState::UpVectorEstimated);
        sm.fix(None, &mut rng).unwrap();
        assert_eq!(sm.state(), CalibrationState::Fixed);
        sm.clear_cache();
        assert_eq!(sm.state(), CalibrationState::Uninitialized);
    }

    #[test]
    fn up_vector_points_toward_cameras_for_any_seed() {
        let mut sm = SceneManager::new(ring_scene(10, None));
        for seed in 0..25 {
            let mut rng = StdRng::seed_from_u64(seed);
            let up = sm.estimate_ground_up_vector(&mut rng).unwrap();
            assert!(up.dot(&Vec3::z()) > 0.0, "seed {} gave {:?}", seed, up);
            assert!((up.norm() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn fix_corrects_thirty_degree_tilt() {
        let tilt = Rotation3::from_axis_angle(&Vec3::x_axis(), 30f64.to_radians());
        let mut rng = StdRng::seed_from_u64(11);
        let mut sm = SceneManager::new(ring_scene(10, Some(tilt)));
        let before = sm.estimate_ground_up_vector(&mut rng).unwrap();
        assert!(before.z < 0.9);

        let (mut fixed, _) = sm.fix(None, &mut rng).unwrap();
        let up = verify_calibration(&mut fixed, DEFAULT_CALIBRATION_THRESHOLD, &mut rng).unwrap();
        assert!(up.z > 0.99);
    }

    #[test]
    fn fix_with_same_rotation_is_bit_identical() {
        let tilt = Rotation3::from_axis_angle(&Vec3::y_axis(), 0.6);
        let mut rng = StdRng::seed_from_u64(5);
        let mut sm = SceneManager::new(ring_scene(10, Some(tilt)));
        let (first, rotation) = sm.fix(None, &mut rng).unwrap();
        let (second, reused) = sm.fix(Some(rotation), &mut rng).unwrap();
        assert_eq!(rotation, reused);
        assert_eq!(first.scene().points, second.scene().points);
        assert_eq!(first.scene().cameras, second.scene().cameras);
    }

    #[test]
    fn too_few_cameras_is_degenerate() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut none = SceneManager::new(ring_scene(0, None));
        assert!(matches!(
            none.estimate_ground_up_vector(&mut rng),
            Err(EditError::DegenerateInput(_))
        ));
        let mut two = SceneManager::new(ring_scene(2, None));
        assert!(matches!(
            two.fix(None, &mut rng),
            Err(EditError::DegenerateInput(_))
        ));
    }

    #[test]
    fn upside_down_scene_fails_verification() {
        let flip = Rotation3::from_axis_angle(&Vec3::x_axis(), std::f64::consts::PI);
        let mut rng = StdRng::seed_from_u64(2);
        let mut flipped = SceneManager::new(ring_scene(10, Some(flip)));
        assert!(matches!(
            verify_calibration(&mut flipped, DEFAULT_CALIBRATION_THRESHOLD, &mut rng),
            Err(EditError::CalibrationQuality { .. })
        ));
    }
}
