use crate::common::dim_for_degree;
use crate::error::{EditError, EditResult};
use nalgebra::{Matrix3, Vector3};

pub type Vec3 = Vector3<f64>;
pub type Mat3 = Matrix3<f64>;

/// A registered camera in the 3DGS convention: `rotation` is the transpose of
/// the world-to-camera rotation and `translation` is the world-to-camera
/// translation.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPose {
    pub uid: u32,
    pub image_name: String,
    pub translation: Vec3,
    pub rotation: Mat3,
    pub fov_x: f64,
    pub fov_y: f64,
    pub width: u32,
    pub height: u32,
}

/// Point cloud plus camera poses produced by a sparse reconstruction. Never
/// mutated; calibration produces a new snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneSnapshot {
    pub points: Vec<[f32; 3]>,
    pub colors: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub cameras: Vec<CameraPose>,
}

impl SceneSnapshot {
    pub fn new(
        points: Vec<[f32; 3]>,
        colors: Vec<[f32; 3]>,
        normals: Option<Vec<[f32; 3]>>,
        cameras: Vec<CameraPose>,
    ) -> EditResult<Self> {
        if points.len() != colors.len() {
            return Err(EditError::DegenerateInput(format!(
                "{} points but {} colors",
                points.len(),
                colors.len()
            )));
        }
        if let Some(n) = &normals {
            if n.len() != points.len() {
                return Err(EditError::DegenerateInput(format!(
                    "{} points but {} normals",
                    points.len(),
                    n.len()
                )));
            }
        }
        Ok(Self {
            points,
            colors,
            normals,
            cameras,
        })
    }

    pub fn mean_point(&self) -> Vec3 {
        if self.points.is_empty() {
            return Vec3::zeros();
        }
        let sum = self.points.iter().fold(Vec3::zeros(), |acc, p| {
            acc + Vec3::new(p[0] as f64, p[1] as f64, p[2] as f64)
        });
        sum / self.points.len() as f64
    }

    /// Radius of the camera centers around their mean, enlarged by 10%.
    pub fn camera_extent(&self) -> f64 {
        if self.cameras.is_empty() {
            return 0.0;
        }
        let centers: Vec<Vec3> = self
            .cameras
            .iter()
            .map(|c| -(c.rotation * c.translation))
            .collect();
        let center = centers.iter().fold(Vec3::zeros(), |a, c| a + c) / centers.len() as f64;
        let diagonal = centers
            .iter()
            .map(|c| (c - center).norm())
            .fold(0.0, f64::max);
        diagonal * 1.1
    }
}

/// Per-point gaussian parameters in the layout the 3DGS trainer uses. All
/// arrays are flat and row-major with the same leading dimension `N`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GaussianPointSet {
    pub sh_degree: u32,
    /// `N x 3`
    pub positions: Vec<f32>,
    /// `N x 3`
    pub sh_dc: Vec<f32>,
    /// `N x K x 3`, `K = dim_for_degree(sh_degree)`
    pub sh_rest: Vec<f32>,
    /// `N x 3`, log space
    pub scales: Vec<f32>,
    /// `N x 4`, `(w, x, y, z)`
    pub rotations: Vec<f32>,
    /// `N`, logit space
    pub opacities: Vec<f32>,
    // Optimizer accumulators; either `N` long or not yet allocated.
    pub max_radii_2d: Vec<f32>,
    pub xyz_gradient_accum: Vec<f32>,
    pub denom: Vec<f32>,
}

impl GaussianPointSet {
    pub fn empty(sh_degree: u32) -> Self {
        Self {
            sh_degree,
            ..Default::default()
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.opacities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.opacities.is_empty()
    }

    #[inline]
    pub fn sh_rest_dim(&self) -> usize {
        dim_for_degree(self.sh_degree)
    }

    #[inline]
    pub fn position(&self, i: usize) -> [f32; 3] {
        [
            self.positions[i * 3],
            self.positions[i * 3 + 1],
            self.positions[i * 3 + 2],
        ]
    }

    /// Checks that the required per-point arrays share one leading dimension.
    pub fn validate(&self) -> EditResult<()> {
        let n = self.len();
        let k = self.sh_rest_dim();
        let checks = [
            ("positions", self.positions.len(), n * 3),
            ("sh_dc", self.sh_dc.len(), n * 3),
            ("sh_rest", self.sh_rest.len(), n * k * 3),
            ("scales", self.scales.len(), n * 3),
            ("rotations", self.rotations.len(), n * 4),
        ];
        for (name, found, expected) in checks {
            if found != expected {
                return Err(EditError::LayoutMismatch(format!(
                    "{} has {} values, expected {} for {} points",
                    name, found, expected, n
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_rejects_mismatched_colors() {
        let err = SceneSnapshot::new(vec![[0.0; 3]; 2], vec![[0.0; 3]], None, Vec::new());
        assert!(matches!(err, Err(EditError::DegenerateInput(_))));
    }

    #[test]
    fn mean_point_of_empty_cloud_is_origin() {
        assert_eq!(SceneSnapshot::default().mean_point(), Vec3::zeros());
    }

    #[test]
    fn validate_reports_the_broken_array() {
        let mut set = GaussianPointSet::empty(0);
        set.positions = vec![0.0; 6];
        set.sh_dc = vec![0.0; 6];
        set.scales = vec![0.0; 6];
        set.rotations = vec![0.0; 8];
        set.opacities = vec![0.0; 2];
        assert!(set.validate().is_ok());

        set.scales.pop();
        let msg = set.validate().unwrap_err().to_string();
        assert!(msg.contains("scales"));
    }
}
