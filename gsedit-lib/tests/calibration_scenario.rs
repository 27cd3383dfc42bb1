use gsedit_lib::calibration_cache::CalibrationCache;
use gsedit_lib::geometry::pose_to_translation_rotation;
use gsedit_lib::scene::{verify_calibration, SceneManager, DEFAULT_CALIBRATION_THRESHOLD};
use gsedit_lib::structures::{CameraPose, Mat3, SceneSnapshot, Vec3};
use gsedit_lib::{load_and_fix_scene, EditError, EditorConfig};
use nalgebra::{Rotation3, UnitQuaternion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::f64::consts::FRAC_PI_4;
use std::fs;
use std::path::Path;

/// Level rig: a flat grid on z = 0 and cameras on a ring above it looking at
/// the center. Returns points and `(position, axis frame)` per camera.
fn level_rig(num_cameras: usize) -> (Vec<Vec3>, Vec<(Vec3, Mat3)>) {
    let mut points = Vec::new();
    for i in 0..12 {
        for j in 0..12 {
            points.push(Vec3::new(i as f64 * 0.5 - 3.0, j as f64 * 0.5 - 3.0, 0.0));
        }
    }
    let cameras = (0..num_cameras)
        .map(|i| {
            let theta = (i as f64 * 31.0).to_radians();
            let position = Vec3::new(5.0 * theta.cos(), 5.0 * theta.sin(), 2.5 + 0.2 * i as f64);
            let forward = (-position).normalize();
            let right = forward.cross(&Vec3::z()).normalize();
            let down = forward.cross(&right);
            let axis = Mat3::from_rows(&[right.transpose(), down.transpose(), forward.transpose()]);
            (position, axis)
        })
        .collect();
    (points, cameras)
}

fn tilted_rig(num_cameras: usize, tilt: &Rotation3<f64>) -> (Vec<Vec3>, Vec<(Vec3, Mat3)>) {
    let (points, cameras) = level_rig(num_cameras);
    let points = points.into_iter().map(|p| tilt * p).collect();
    let cameras = cameras
        .into_iter()
        .map(|(position, axis)| (tilt * position, axis * tilt.matrix().transpose()))
        .collect();
    (points, cameras)
}

fn snapshot(points: &[Vec3], cameras: &[(Vec3, Mat3)]) -> SceneSnapshot {
    let poses = cameras
        .iter()
        .enumerate()
        .map(|(i, (position, axis))| {
            let (translation, rotation) = pose_to_translation_rotation(position, axis);
            CameraPose {
                uid: i as u32,
                image_name: format!("{:05}.jpg", i),
                translation,
                rotation,
                fov_x: 1.2,
                fov_y: 0.9,
                width: 160,
                height: 120,
            }
        })
        .collect();
    SceneSnapshot::new(
        points.iter().map(|p| [p.x as f32, p.y as f32, p.z as f32]).collect(),
        vec![[0.4, 0.5, 0.6]; points.len()],
        None,
        poses,
    )
    .unwrap()
}

/// Writes `sparse/0/{cameras,images,points3D}.bin` for a single PINHOLE camera.
fn write_colmap(source: &Path, points: &[Vec3], cameras: &[(Vec3, Mat3)]) {
    let sparse = source.join("sparse/0");
    fs::create_dir_all(&sparse).unwrap();

    let mut cams = Vec::new();
    cams.extend_from_slice(&1u64.to_le_bytes());
    cams.extend_from_slice(&1i32.to_le_bytes());
    cams.extend_from_slice(&1i32.to_le_bytes());
    cams.extend_from_slice(&160u64.to_le_bytes());
    cams.extend_from_slice(&120u64.to_le_bytes());
    for p in [100.0f64, 100.0, 80.0, 60.0] {
        cams.extend_from_slice(&p.to_le_bytes());
    }
    fs::write(sparse.join("cameras.bin"), cams).unwrap();

    let mut imgs = Vec::new();
    imgs.extend_from_slice(&(cameras.len() as u64).to_le_bytes());
    for (i, (position, axis)) in cameras.iter().enumerate() {
        let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*axis));
        let t = -(axis * position);
        imgs.extend_from_slice(&(i as i32 + 1).to_le_bytes());
        for v in [q.w, q.i, q.j, q.k, t.x, t.y, t.z] {
            imgs.extend_from_slice(&v.to_le_bytes());
        }
        imgs.extend_from_slice(&1i32.to_le_bytes());
        imgs.extend_from_slice(format!("{:05}.jpg", i).as_bytes());
        imgs.push(0);
        imgs.extend_from_slice(&0u64.to_le_bytes());
    }
    fs::write(sparse.join("images.bin"), imgs).unwrap();

    let mut pts = Vec::new();
    pts.extend_from_slice(&(points.len() as u64).to_le_bytes());
    for (i, p) in points.iter().enumerate() {
        pts.extend_from_slice(&(i as u64).to_le_bytes());
        for v in [p.x, p.y, p.z] {
            pts.extend_from_slice(&v.to_le_bytes());
        }
        pts.extend_from_slice(&[100, 120, 140]);
        pts.extend_from_slice(&0.1f64.to_le_bytes());
        pts.extend_from_slice(&0u64.to_le_bytes());
    }
    fs::write(sparse.join("points3D.bin"), pts).unwrap();
}

#[test]
fn tilted_scene_is_fixed_cached_and_reproduced() {
    let dir = tempfile::tempdir().unwrap();
    let tilt = Rotation3::from_axis_angle(&Vec3::x_axis(), FRAC_PI_4);
    let (points, cameras) = tilted_rig(10, &tilt);
    let scene = snapshot(&points, &cameras);
    let cache = CalibrationCache::default();
    let mut rng = StdRng::seed_from_u64(2024);

    assert!(cache.load(dir.path()).unwrap().is_none());
    let mut first = SceneManager::new(scene.clone());
    let (mut fixed, rotation) = first.fix(None, &mut rng).unwrap();
    let up = verify_calibration(&mut fixed, DEFAULT_CALIBRATION_THRESHOLD, &mut rng).unwrap();
    assert!(up.z > 0.85, "fixed up vector {:?}", up);

    let path = cache.store(dir.path(), &rotation).unwrap();
    assert!(path.is_file());

    let cached = cache.load(dir.path()).unwrap().expect("rotation was cached");
    let mut second = SceneManager::new(scene);
    let (refixed, _) = second.fix(Some(cached), &mut StdRng::seed_from_u64(7)).unwrap();
    assert_eq!(refixed.scene().points, fixed.scene().points);
    assert_eq!(refixed.scene().cameras, fixed.scene().cameras);
}

#[test]
fn colmap_scene_fix_reuses_cache_on_second_load() {
    let dir = tempfile::tempdir().unwrap();
    let tilt = Rotation3::from_axis_angle(&Vec3::y_axis(), FRAC_PI_4);
    let (points, cameras) = tilted_rig(10, &tilt);
    write_colmap(dir.path(), &points, &cameras);

    let config = EditorConfig::default();
    let first = load_and_fix_scene(dir.path(), &config, &mut StdRng::seed_from_u64(1)).unwrap();
    assert!(dir.path().join("cache").join("rotation.bin").is_file());
    assert_eq!(first.scene().cameras.len(), 10);

    let second = load_and_fix_scene(dir.path(), &config, &mut StdRng::seed_from_u64(99)).unwrap();
    assert_eq!(first.scene().points, second.scene().points);
}

#[test]
fn failed_calibration_is_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let tilt = Rotation3::from_axis_angle(&Vec3::x_axis(), FRAC_PI_4);
    let (points, cameras) = tilted_rig(10, &tilt);
    write_colmap(dir.path(), &points, &cameras);
    let rotation_file = CalibrationCache::default().path_for(dir.path());

    // No up vector can have z above one.
    let strict = EditorConfig {
        calibration_threshold: 1.01,
        ..Default::default()
    };
    let err = load_and_fix_scene(dir.path(), &strict, &mut StdRng::seed_from_u64(4))
        .err()
        .expect("threshold above one must fail");
    assert!(matches!(err, EditError::CalibrationQuality { .. }));
    assert!(!rotation_file.exists());

    load_and_fix_scene(dir.path(), &EditorConfig::default(), &mut StdRng::seed_from_u64(4))
        .unwrap();
    assert!(rotation_file.is_file());
}

#[test]
fn upside_down_rotation_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let (points, cameras) = level_rig(10);
    write_colmap(dir.path(), &points, &cameras);

    // A cached rotation that flips the scene over is applied as is, and the
    // level check must catch it.
    let flip = Rotation3::from_axis_angle(&Vec3::x_axis(), std::f64::consts::PI);
    CalibrationCache::default().store(dir.path(), &flip).unwrap();

    let err = load_and_fix_scene(
        dir.path(),
        &EditorConfig::default(),
        &mut StdRng::seed_from_u64(3),
    )
    .err()
    .expect("flipped scene must not pass");
    assert!(matches!(err, EditError::CalibrationQuality { .. }));
    assert!(err.to_string().contains("Please inspect the scene manually"));
}
