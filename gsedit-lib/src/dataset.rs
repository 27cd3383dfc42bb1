//! Synthetic mask datasets: random boxes over the ground, orbit views of
//! every model with and without the mask painted in.

use crate::config::DatasetSettings;
use crate::context::{ModelId, ModelRegistry};
use crate::error::{EditError, EditResult};
use crate::gaussian::GaussianManager;
use crate::geometry::{normalize, pose_to_translation_rotation};
use crate::mask::{MaskGeometry, MaskWrapper, OrientedBox};
use crate::render::{PipelineConfig, RenderedImage, Renderer};
use crate::structures::{CameraPose, Mat3, Vec3};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub const MASK_HEIGHT: f64 = 10.0;
pub const MASK_GEOMETRY_NAME: &str = "_random_mask_geo";

const MAX_ASPECT_RATIO: f32 = 3.0;
const ORBIT_FOV_DEG: f64 = 60.0;
const MASK_INSIDE: [f32; 3] = [1.0; 3];
const MASK_OUTSIDE: [f32; 3] = [0.0; 3];
const PIX2PIX_MARK: [f32; 3] = [1.0, 0.0, 1.0];

/// Random box centered on the ground inside the given XY bounds, with
/// footprint sides in `[mask_size_min, mask_size_max]` and an aspect ratio
/// of at most 3.
pub fn sample_mask_box<R: Rng + ?Sized>(
    bounds_min: [f64; 2],
    bounds_max: [f64; 2],
    ground_height: f64,
    settings: &DatasetSettings,
    rng: &mut R,
) -> EditResult<OrientedBox> {
    let (lo, hi) = (settings.mask_size_min, settings.mask_size_max);
    if !(lo > 0.0 && lo <= hi) {
        return Err(EditError::InvalidArgument(format!(
            "mask size range [{}, {}] is empty or not positive",
            lo, hi
        )));
    }
    if bounds_min[0] > bounds_max[0] || bounds_min[1] > bounds_max[1] {
        return Err(EditError::InvalidArgument(format!(
            "mask bounds min {:?} exceeds max {:?}",
            bounds_min, bounds_max
        )));
    }

    let center_x = rng.gen_range(bounds_min[0]..=bounds_max[0]);
    let center_y = rng.gen_range(bounds_min[1]..=bounds_max[1]);
    let (size_x, size_y) = loop {
        let size_x = rng.gen_range(lo..=hi);
        let size_y = rng.gen_range(lo..=hi);
        if size_x.max(size_y) / size_x.min(size_y) <= MAX_ASPECT_RATIO {
            break (size_x, size_y);
        }
    };

    Ok(OrientedBox::new(
        MASK_GEOMETRY_NAME,
        Vec3::new(center_x, center_y, ground_height),
        Vec3::new(size_x as f64, size_y as f64, MASK_HEIGHT),
    ))
}

/// `n` evenly spaced values from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// Camera at `position` looking at `target`, with its image "down" axis
/// pointing towards `-Z`.
pub fn look_at(
    uid: u32,
    position: Vec3,
    target: Vec3,
    fov: f64,
    size: u32,
) -> EditResult<CameraPose> {
    let forward = normalize(&(target - position))?;
    let right = normalize(&forward.cross(&Vec3::z()))
        .or_else(|_| normalize(&forward.cross(&Vec3::x())))?;
    let down = forward.cross(&right);
    let axis = Mat3::from_rows(&[right.transpose(), down.transpose(), forward.transpose()]);
    let (translation, rotation) = pose_to_translation_rotation(&position, &axis);
    Ok(CameraPose {
        uid,
        image_name: format!("orbit_{:05}", uid),
        translation,
        rotation,
        fov_x: fov,
        fov_y: fov,
        width: size,
        height: size,
    })
}

/// Views around `target` over every radius, polar angle and azimuth sample.
/// A polar angle of -180 degrees looks straight down; azimuths cover the
/// full circle without repeating 0.
pub fn orbit_cameras(target: Vec3, settings: &DatasetSettings) -> EditResult<Vec<CameraPose>> {
    let radii = linspace(
        settings.camera_radius_min,
        settings.camera_radius_max,
        settings.radius_sample,
    );
    let polar = linspace(
        settings.camera_angle_y_min,
        settings.camera_angle_y_max,
        settings.angle_y_sample,
    );
    let n_x = settings.angle_x_sample;
    let azimuths = if n_x == 0 {
        Vec::new()
    } else {
        linspace(0.0, 360.0 - 360.0 / n_x as f64, n_x)
    };

    let fov = ORBIT_FOV_DEG.to_radians();
    let mut cameras = Vec::with_capacity(radii.len() * polar.len() * azimuths.len());
    for &radius in &radii {
        for &angle_y in &polar {
            let elevation = (-angle_y - 90.0).to_radians();
            for &angle_x in &azimuths {
                let azimuth = angle_x.to_radians();
                let offset = Vec3::new(
                    elevation.cos() * azimuth.cos(),
                    elevation.cos() * azimuth.sin(),
                    elevation.sin(),
                ) * radius;
                let uid = cameras.len() as u32;
                cameras.push(look_at(
                    uid,
                    target + offset,
                    target,
                    fov,
                    settings.image_size,
                )?);
            }
        }
    }
    Ok(cameras)
}

/// Raw view with every pixel that is white in the mask view marked pink.
pub fn pix2pix_input(raw: &RenderedImage, mask: &RenderedImage) -> EditResult<RenderedImage> {
    if raw.width != mask.width || raw.height != mask.height {
        return Err(EditError::InvalidArgument(format!(
            "raw view is {}x{} but mask view is {}x{}",
            raw.width, raw.height, mask.width, mask.height
        )));
    }
    let mut marked = raw.clone();
    for (px, m) in marked.rgb.chunks_exact_mut(3).zip(mask.rgb.chunks_exact(3)) {
        if m[0] > 0.5 {
            px.copy_from_slice(&PIX2PIX_MARK);
        }
    }
    Ok(marked)
}

#[derive(Debug, Clone)]
pub struct MaskViews {
    pub model: ModelId,
    pub selected: usize,
    pub raw: Vec<RenderedImage>,
    pub masked: Vec<RenderedImage>,
}

/// Renders every model from `cameras` as is and with the mask painted
/// white on black. Painting is undone before returning. Models whose mask
/// cannot be built are skipped.
pub fn render_mask_views(
    models: &mut ModelRegistry,
    mask_name: &str,
    geometry: Arc<dyn MaskGeometry>,
    cameras: &[CameraPose],
    renderer: Option<&dyn Renderer>,
    pipeline: &PipelineConfig,
) -> Vec<MaskViews> {
    let ids: Vec<ModelId> = models.iter().map(|(id, _)| id).collect();
    let mut views = Vec::with_capacity(ids.len());

    for id in ids {
        let mut wrapper = MaskWrapper::new(mask_name, Some(id), Some(Arc::clone(&geometry)));
        let selected = match wrapper.create_mask_by_parent(models) {
            Ok(selected) => selected,
            Err(err) => {
                warn!(mask = mask_name, %err, "skipping model");
                continue;
            }
        };
        let (Some(mask), Some(model)) = (wrapper.mask(), models.get_mut(id)) else {
            continue;
        };

        let render_all = |model: &GaussianManager| -> Vec<RenderedImage> {
            cameras
                .iter()
                .map(|camera| model.render(renderer, camera, pipeline))
                .collect()
        };
        let raw = render_all(&*model);
        model.cache();
        let masked = model
            .paint_by_mask(mask, MASK_INSIDE, MASK_OUTSIDE)
            .map(|()| render_all(&*model));
        model.restore();

        match masked {
            Ok(masked) => views.push(MaskViews {
                model: id,
                selected,
                raw,
                masked,
            }),
            Err(err) => warn!(mask = mask_name, %err, "skipping model"),
        }
    }
    views
}

#[derive(Debug, Clone)]
pub struct DatasetSample {
    pub mask_name: String,
    pub geometry: OrientedBox,
    pub views: Vec<MaskViews>,
    pub pix2pix: Vec<RenderedImage>,
}

/// Generates `settings.num_masks` samples. `stop` is checked before each
/// mask, so a request to stop finishes the current one first.
#[allow(clippy::too_many_arguments)]
pub fn generate_mask_dataset<R: Rng + ?Sized>(
    models: &mut ModelRegistry,
    bounds_min: [f64; 2],
    bounds_max: [f64; 2],
    ground_height: f64,
    settings: &DatasetSettings,
    renderer: Option<&dyn Renderer>,
    pipeline: &PipelineConfig,
    rng: &mut R,
    stop: &AtomicBool,
) -> EditResult<Vec<DatasetSample>> {
    let mut samples = Vec::with_capacity(settings.num_masks);
    for i in 0..settings.num_masks {
        if stop.load(Ordering::Acquire) {
            info!(done = samples.len(), "dataset creation stopped");
            break;
        }
        let geometry = sample_mask_box(bounds_min, bounds_max, ground_height, settings, rng)?;
        let target = geometry.translation;
        let cameras = orbit_cameras(target, settings)?;
        let mask_name = format!("mask_{}", i);
        info!(mask = %mask_name, cameras = cameras.len(), "rendering mask views");

        let views = render_mask_views(
            models,
            &mask_name,
            Arc::new(geometry.clone()),
            &cameras,
            renderer,
            pipeline,
        );

        let mut pix2pix = Vec::new();
        if settings.enable_pix2pix_output {
            for view in &views {
                for (raw, masked) in view.raw.iter().zip(&view.masked) {
                    pix2pix.push(pix2pix_input(raw, masked)?);
                }
            }
        }
        samples.push(DatasetSample {
            mask_name,
            geometry,
            views,
            pix2pix,
        });
    }
    Ok(samples)
}
