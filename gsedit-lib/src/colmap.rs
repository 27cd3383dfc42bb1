//! Reader for COLMAP binary sparse reconstructions (`sparse/0/*.bin`).

use crate::error::{EditError, EditResult};
use crate::structures::{CameraPose, Mat3, SceneSnapshot, Vec3};
use foldhash::HashMap;
use foldhash::HashMapExt;
use nalgebra::{Quaternion, UnitQuaternion};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const SPARSE_DIR: &str = "sparse/0";

const SIMPLE_PINHOLE: i32 = 0;
const PINHOLE: i32 = 1;

// Smallest possible record per file, used to bound pre-allocation.
const MIN_CAMERA_RECORD: usize = 4 + 4 + 8 + 8;
const MIN_IMAGE_RECORD: usize = 4 + 7 * 8 + 4 + 1 + 8;
const MIN_POINT_RECORD: usize = 8 + 3 * 8 + 3 + 8 + 8;

fn num_params(model_id: i32) -> Option<usize> {
    match model_id {
        0 => Some(3),  // SIMPLE_PINHOLE
        1 => Some(4),  // PINHOLE
        2 => Some(4),  // SIMPLE_RADIAL
        3 => Some(5),  // RADIAL
        4 => Some(8),  // OPENCV
        5 => Some(8),  // OPENCV_FISHEYE
        6 => Some(12), // FULL_OPENCV
        7 => Some(5),  // FOV
        8 => Some(4),  // SIMPLE_RADIAL_FISHEYE
        9 => Some(5),  // RADIAL_FISHEYE
        10 => Some(12), // THIN_PRISM_FISHEYE
        _ => None,
    }
}

struct BinReader<'a> {
    data: &'a [u8],
    offset: usize,
    file: &'static str,
}

impl<'a> BinReader<'a> {
    fn new(data: &'a [u8], file: &'static str) -> Self {
        Self {
            data,
            offset: 0,
            file,
        }
    }

    fn take<const N: usize>(&mut self) -> EditResult<[u8; N]> {
        let end = self.offset + N;
        let bytes: [u8; N] = self
            .data
            .get(self.offset..end)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                EditError::Colmap(format!(
                    "{}: unexpected end of data at byte {}",
                    self.file, self.offset
                ))
            })?;
        self.offset = end;
        Ok(bytes)
    }

    fn skip(&mut self, n: usize) -> EditResult<()> {
        if self.offset.checked_add(n).map_or(true, |end| end > self.data.len()) {
            return Err(EditError::Colmap(format!(
                "{}: unexpected end of data at byte {}",
                self.file, self.offset
            )));
        }
        self.offset += n;
        Ok(())
    }

    fn u8(&mut self) -> EditResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn i32(&mut self) -> EditResult<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> EditResult<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn f64(&mut self) -> EditResult<f64> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    /// Capacity for `n` records of at least `record` bytes each, never more
    /// than the remaining data could hold.
    fn capacity_for(&self, n: usize, record: usize) -> usize {
        n.min(self.data.len().saturating_sub(self.offset) / record)
    }

    fn count(&mut self) -> EditResult<usize> {
        let n = self.u64()?;
        usize::try_from(n)
            .map_err(|_| EditError::Colmap(format!("{}: count {} out of range", self.file, n)))
    }

    fn cstr(&mut self) -> EditResult<String> {
        let rest = &self.data[self.offset.min(self.data.len())..];
        let len = memchr::memchr(0, rest).ok_or_else(|| {
            EditError::Colmap(format!("{}: unterminated string", self.file))
        })?;
        let s = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.offset += len + 1;
        Ok(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColmapCamera {
    pub id: i32,
    pub model_id: i32,
    pub width: u64,
    pub height: u64,
    pub params: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColmapImage {
    pub id: i32,
    /// `(w, x, y, z)`, world to camera.
    pub qvec: [f64; 4],
    pub tvec: [f64; 3],
    pub camera_id: i32,
    pub name: String,
}

pub fn read_cameras_binary(data: &[u8]) -> EditResult<HashMap<i32, ColmapCamera>> {
    let mut r = BinReader::new(data, "cameras.bin");
    let n = r.count()?;
    let mut cameras = HashMap::with_capacity(r.capacity_for(n, MIN_CAMERA_RECORD));
    for _ in 0..n {
        let id = r.i32()?;
        let model_id = r.i32()?;
        let width = r.u64()?;
        let height = r.u64()?;
        let np = num_params(model_id)
            .ok_or_else(|| EditError::Colmap(format!("unknown camera model id {}", model_id)))?;
        let params = (0..np).map(|_| r.f64()).collect::<EditResult<Vec<_>>>()?;
        cameras.insert(
            id,
            ColmapCamera {
                id,
                model_id,
                width,
                height,
                params,
            },
        );
    }
    Ok(cameras)
}

pub fn read_images_binary(data: &[u8]) -> EditResult<Vec<ColmapImage>> {
    let mut r = BinReader::new(data, "images.bin");
    let n = r.count()?;
    let mut images = Vec::with_capacity(r.capacity_for(n, MIN_IMAGE_RECORD));
    for _ in 0..n {
        let id = r.i32()?;
        let qvec = [r.f64()?, r.f64()?, r.f64()?, r.f64()?];
        let tvec = [r.f64()?, r.f64()?, r.f64()?];
        let camera_id = r.i32()?;
        let name = r.cstr()?;
        let num_points_2d = r.count()?;
        // x, y as f64 and the point3D id as i64.
        r.skip(num_points_2d.saturating_mul(24))?;
        images.push(ColmapImage {
            id,
            qvec,
            tvec,
            camera_id,
            name,
        });
    }
    Ok(images)
}

/// Positions and colors in `[0, 1]`.
pub fn read_points3d_binary(data: &[u8]) -> EditResult<(Vec<[f32; 3]>, Vec<[f32; 3]>)> {
    let mut r = BinReader::new(data, "points3D.bin");
    let n = r.count()?;
    let cap = r.capacity_for(n, MIN_POINT_RECORD);
    let mut points = Vec::with_capacity(cap);
    let mut colors = Vec::with_capacity(cap);
    for _ in 0..n {
        let _id = r.u64()?;
        points.push([r.f64()? as f32, r.f64()? as f32, r.f64()? as f32]);
        colors.push([
            r.u8()? as f32 / 255.0,
            r.u8()? as f32 / 255.0,
            r.u8()? as f32 / 255.0,
        ]);
        let _error = r.f64()?;
        let track_length = r.count()?;
        r.skip(track_length.saturating_mul(8))?;
    }
    Ok((points, colors))
}

#[inline]
pub fn focal_to_fov(focal: f64, pixels: f64) -> f64 {
    2.0 * (pixels / (2.0 * focal)).atan()
}

fn camera_pose(image: &ColmapImage, camera: &ColmapCamera) -> EditResult<CameraPose> {
    let (focal_x, focal_y) = match camera.model_id {
        SIMPLE_PINHOLE => (camera.params[0], camera.params[0]),
        PINHOLE => (camera.params[0], camera.params[1]),
        other => {
            return Err(EditError::Colmap(format!(
                "camera model {} is not supported, only undistorted datasets (PINHOLE or SIMPLE_PINHOLE)",
                other
            )))
        }
    };
    let [w, x, y, z] = image.qvec;
    let world_to_camera = UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z));
    let rotation: Mat3 = world_to_camera.to_rotation_matrix().matrix().transpose();

    Ok(CameraPose {
        uid: image.id as u32,
        image_name: image.name.clone(),
        translation: Vec3::from(image.tvec),
        rotation,
        fov_x: focal_to_fov(focal_x, camera.width as f64),
        fov_y: focal_to_fov(focal_y, camera.height as f64),
        width: camera.width as u32,
        height: camera.height as u32,
    })
}

/// Loads `source/sparse/0` into a scene. `images` is the image folder name,
/// only used in log output since pixels are never read here.
pub fn read_colmap_scene(source: &Path, images: &str) -> EditResult<SceneSnapshot> {
    let sparse = source.join(SPARSE_DIR);
    info!(path = %sparse.display(), images, "reading colmap scene");

    let cameras = read_cameras_binary(&fs::read(sparse.join("cameras.bin"))?)?;
    let images_bin = read_images_binary(&fs::read(sparse.join("images.bin"))?)?;
    let (points, colors) = read_points3d_binary(&fs::read(sparse.join("points3D.bin"))?)?;

    let mut poses = images_bin
        .iter()
        .map(|image| {
            let camera = cameras.get(&image.camera_id).ok_or_else(|| {
                EditError::Colmap(format!(
                    "image '{}' references unknown camera {}",
                    image.name, image.camera_id
                ))
            })?;
            camera_pose(image, camera)
        })
        .collect::<EditResult<Vec<_>>>()?;
    poses.sort_by(|a, b| a.image_name.cmp(&b.image_name));

    debug!(cameras = poses.len(), points = points.len(), "colmap scene loaded");
    SceneSnapshot::new(points, colors, None, poses)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::translation_rotation_to_pose;
    use std::path::PathBuf;

    pub(crate) struct ColmapFixture {
        pub cameras: Vec<(i32, i32, u64, u64, Vec<f64>)>,
        /// id, qvec, tvec, camera id, name
        pub images: Vec<(i32, [f64; 4], [f64; 3], i32, &'static str)>,
        pub points: Vec<([f64; 3], [u8; 3])>,
    }

    impl ColmapFixture {
        pub(crate) fn write(&self, source: &Path) -> PathBuf {
            let sparse = source.join(SPARSE_DIR);
            fs::create_dir_all(&sparse).unwrap();

            let mut cams = Vec::new();
            cams.extend_from_slice(&(self.cameras.len() as u64).to_le_bytes());
            for (id, model, w, h, params) in &self.cameras {
                cams.extend_from_slice(&id.to_le_bytes());
                cams.extend_from_slice(&model.to_le_bytes());
                cams.extend_from_slice(&w.to_le_bytes());
                cams.extend_from_slice(&h.to_le_bytes());
                for p in params {
                    cams.extend_from_slice(&p.to_le_bytes());
                }
            }
            fs::write(sparse.join("cameras.bin"), cams).unwrap();

            let mut imgs = Vec::new();
            imgs.extend_from_slice(&(self.images.len() as u64).to_le_bytes());
            for (id, q, t, cam, name) in &self.images {
                imgs.extend_from_slice(&id.to_le_bytes());
                for v in q.iter().chain(t) {
                    imgs.extend_from_slice(&v.to_le_bytes());
                }
                imgs.extend_from_slice(&cam.to_le_bytes());
                imgs.extend_from_slice(name.as_bytes());
                imgs.push(0);
                // One observation.
                imgs.extend_from_slice(&1u64.to_le_bytes());
                imgs.extend_from_slice(&10.0f64.to_le_bytes());
                imgs.extend_from_slice(&20.0f64.to_le_bytes());
                imgs.extend_from_slice(&(-1i64).to_le_bytes());
            }
            fs::write(sparse.join("images.bin"), imgs).unwrap();

            let mut pts = Vec::new();
            pts.extend_from_slice(&(self.points.len() as u64).to_le_bytes());
            for (i, (xyz, rgb)) in self.points.iter().enumerate() {
                pts.extend_from_slice(&(i as u64).to_le_bytes());
                for v in xyz {
                    pts.extend_from_slice(&v.to_le_bytes());
                }
                pts.extend_from_slice(rgb);
                pts.extend_from_slice(&0.5f64.to_le_bytes());
                pts.extend_from_slice(&2u64.to_le_bytes());
                for _ in 0..2 {
                    pts.extend_from_slice(&1i32.to_le_bytes());
                    pts.extend_from_slice(&0i32.to_le_bytes());
                }
            }
            fs::write(sparse.join("points3D.bin"), pts).unwrap();
            sparse
        }
    }

    fn fixture(model: i32, params: Vec<f64>) -> ColmapFixture {
        let half = std::f64::consts::FRAC_1_SQRT_2;
        ColmapFixture {
            cameras: vec![(1, model, 800, 600, params)],
            images: vec![
                (7, [half, 0.0, 0.0, half], [1.0, 2.0, 3.0], 1, "b.png"),
                (3, [1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 5.0], 1, "a.png"),
            ],
            points: vec![([0.5, -1.0, 2.0], [255, 0, 51]), ([1.0, 1.0, 1.0], [0, 0, 0])],
        }
    }

    #[test]
    fn reads_pinhole_scene() {
        let dir = tempfile::tempdir().unwrap();
        fixture(PINHOLE, vec![400.0, 300.0, 400.0, 300.0]).write(dir.path());

        let scene = read_colmap_scene(dir.path(), "images").unwrap();
        assert_eq!(scene.points.len(), 2);
        assert_eq!(scene.colors[0], [1.0, 0.0, 0.2]);
        assert!(scene.normals.is_none());

        let names: Vec<_> = scene.cameras.iter().map(|c| c.image_name.as_str()).collect();
        assert_eq!(names, ["a.png", "b.png"]);
        let a = &scene.cameras[0];
        assert_eq!(a.uid, 3);
        assert!((a.fov_x - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert!((a.fov_y - 2.0 * 1.0f64.atan()).abs() < 1e-12);
        let (position, _) = translation_rotation_to_pose(&a.translation, &a.rotation);
        assert!((position - Vec3::new(0.0, 0.0, -5.0)).norm() < 1e-12);

        // 90 degrees about z: the stored rotation is its transpose.
        let b = &scene.cameras[1];
        assert!((b.rotation[(0, 1)] - 1.0).abs() < 1e-12);
        assert!((b.rotation[(1, 0)] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn simple_pinhole_uses_one_focal() {
        let dir = tempfile::tempdir().unwrap();
        fixture(SIMPLE_PINHOLE, vec![400.0, 400.0, 300.0]).write(dir.path());
        let scene = read_colmap_scene(dir.path(), "images").unwrap();
        assert!((scene.cameras[0].fov_y - 2.0 * 0.75f64.atan()).abs() < 1e-12);
    }

    #[test]
    fn distorted_models_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fixture(4, vec![400.0, 400.0, 400.0, 300.0, 0.0, 0.0, 0.0, 0.0]).write(dir.path());
        let err = read_colmap_scene(dir.path(), "images").unwrap_err();
        assert!(matches!(err, EditError::Colmap(_)));
        assert!(err.to_string().contains("undistorted"));
    }

    #[test]
    fn truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sparse = fixture(PINHOLE, vec![400.0, 300.0, 400.0, 300.0]).write(dir.path());
        let data = fs::read(sparse.join("points3D.bin")).unwrap();
        assert!(read_points3d_binary(&data[..data.len() - 3]).is_err());
    }

    #[test]
    fn huge_counts_fail_without_allocating() {
        let mut data = (1u64 << 58).to_le_bytes().to_vec();
        data.extend_from_slice(&[0; 16]);
        assert!(matches!(read_images_binary(&data), Err(EditError::Colmap(_))));
        assert!(matches!(read_cameras_binary(&data), Err(EditError::Colmap(_))));
        assert!(matches!(read_points3d_binary(&data), Err(EditError::Colmap(_))));
    }
}
