//! Pose decomposition and small rotation helpers shared by the calibration
//! code.
//!
//! A camera's axis frame stores the camera's right, down and forward
//! directions in world space as its rows. With the 3DGS convention
//! (`rotation` is the camera-to-world rotation, `translation` the
//! world-to-camera translation) the frame is `rotation^T` and the world
//! position is `-rotation * translation`.

use crate::error::{EditError, EditResult};
use crate::structures::{Mat3, Vec3};
use nalgebra::{Rotation3, Unit};
use std::f64::consts::PI;

/// Norms below this are treated as zero.
pub const DEGENERATE_NORM: f64 = 1e-8;

/// Returns `(translation, rotation)` for a camera at `position` whose rows of
/// `axis_frame` are its right, down and forward directions.
pub fn pose_to_translation_rotation(position: &Vec3, axis_frame: &Mat3) -> (Vec3, Mat3) {
    let rotation = axis_frame.transpose();
    let translation = -(axis_frame * position);
    (translation, rotation)
}

/// Inverse of [`pose_to_translation_rotation`]: returns `(position, axis_frame)`.
pub fn translation_rotation_to_pose(translation: &Vec3, rotation: &Mat3) -> (Vec3, Mat3) {
    let position = -(rotation * translation);
    (position, rotation.transpose())
}

pub fn normalize(v: &Vec3) -> EditResult<Vec3> {
    let norm = v.norm();
    if !norm.is_finite() || norm < DEGENERATE_NORM {
        return Err(EditError::DegenerateVector(norm));
    }
    Ok(v / norm)
}

/// Minimal rotation taking the direction of `from` onto the direction of `to`.
/// Antiparallel inputs turn by half a revolution about an axis perpendicular
/// to `from`.
pub fn rotation_aligning(from: &Vec3, to: &Vec3) -> EditResult<Rotation3<f64>> {
    let a = normalize(from)?;
    let b = normalize(to)?;
    if let Some(rotation) = Rotation3::rotation_between(&a, &b) {
        if rotation.matrix().iter().all(|x| x.is_finite()) {
            return Ok(rotation);
        }
    }
    // Antiparallel: any axis perpendicular to `a` works.
    let helper = if a.x.abs() < 0.9 {
        Vec3::x()
    } else {
        Vec3::y()
    };
    let axis = Unit::new_normalize(a.cross(&helper));
    Ok(Rotation3::from_axis_angle(&axis, PI))
}

/// Rotates a camera's position and axis frame together and returns the new
/// `(translation, rotation)` pair.
pub fn rotate_pose(
    rotation: &Rotation3<f64>,
    translation: &Vec3,
    camera_rotation: &Mat3,
) -> (Vec3, Mat3) {
    let (position, axis) = translation_rotation_to_pose(translation, camera_rotation);
    let new_position = rotation * position;
    // Each row of the frame is a world direction.
    let new_axis = axis * rotation.matrix().transpose();
    pose_to_translation_rotation(&new_position, &new_axis)
}

pub fn is_orthonormal(m: &Mat3, tolerance: f64) -> bool {
    let identity_error = (m.transpose() * m - Mat3::identity()).abs().max();
    identity_error < tolerance && (m.determinant() - 1.0).abs() < tolerance
}
