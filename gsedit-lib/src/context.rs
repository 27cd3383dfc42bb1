//! Application state shared by the editing front ends.

use crate::calibration_cache::CalibrationCache;
use crate::colmap::read_colmap_scene;
use crate::config::EditorConfig;
use crate::error::{EditError, EditResult};
use crate::gaussian::GaussianManager;
use crate::mask::{Mask, MaskGeometry, MaskWrapper};
use crate::scene::{verify_calibration, SceneManager};
use foldhash::HashMap;
use foldhash::HashMapExt;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(u32);

/// Named gaussian models. Ids are never reused.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: HashMap<ModelId, (String, GaussianManager)>,
    next_id: u32,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, model: GaussianManager) -> ModelId {
        let id = ModelId(self.next_id);
        self.next_id += 1;
        self.models.insert(id, (name.into(), model));
        id
    }

    pub fn get(&self, id: ModelId) -> Option<&GaussianManager> {
        self.models.get(&id).map(|(_, model)| model)
    }

    pub fn get_mut(&mut self, id: ModelId) -> Option<&mut GaussianManager> {
        self.models.get_mut(&id).map(|(_, model)| model)
    }

    pub fn name(&self, id: ModelId) -> Option<&str> {
        self.models.get(&id).map(|(name, _)| name.as_str())
    }

    pub fn find(&self, name: &str) -> Option<ModelId> {
        self.models
            .iter()
            .find(|(_, (n, _))| n == name)
            .map(|(&id, _)| id)
    }

    pub fn remove(&mut self, id: ModelId) -> Option<GaussianManager> {
        self.models.remove(&id).map(|(_, model)| model)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Models in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ModelId, &GaussianManager)> {
        let mut ids: Vec<_> = self.models.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(move |id| self.get(id).map(|model| (id, model)))
    }
}

/// One past the largest trailing number among `names`, 0 when none has one.
pub fn next_name_index<'a>(names: impl IntoIterator<Item = &'a str>) -> u64 {
    names
        .into_iter()
        .filter_map(|name| {
            let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
            name[name.len() - digits..].parse::<u64>().ok()
        })
        .max()
        .map_or(0, |max| max.saturating_add(1))
}

/// Looks up the cached rotation for `source`, fixes the scene with it (or
/// with a fresh estimate), and checks that the result is level. A fresh
/// rotation is cached only once it passes that check.
pub fn load_and_fix_scene<R: Rng + ?Sized>(
    source: &Path,
    config: &EditorConfig,
    rng: &mut R,
) -> EditResult<SceneManager> {
    let scene = read_colmap_scene(source, &config.images)?;
    let mut manager = SceneManager::new(scene);

    let cache = CalibrationCache::new(config.cache_dir_name.as_str());
    let cached = cache.load(source)?;
    let from_cache = cached.is_some();
    let (mut fixed, rotation) = manager.fix(cached, rng)?;

    // Only a rotation that passed the level check is worth reusing.
    verify_calibration(&mut fixed, config.calibration_threshold, rng)?;
    if !from_cache {
        cache.store(source, &rotation)?;
    }
    info!(source = %source.display(), from_cache, "scene fixed");
    Ok(fixed)
}

/// Work running on a named thread. The owner polls `is_running` once per
/// frame and collects the result with `poll` once it turns false.
#[derive(Debug)]
pub struct BackgroundTask<T> {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<T>>,
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn spawn<F>(name: &str, work: F) -> EditResult<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let guard = RunningGuard(Arc::clone(&running));
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                work()
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The result once the worker has finished, `None` while it is still
    /// running or after the result was taken.
    pub fn poll(&mut self) -> Option<T> {
        if self.is_running() {
            return None;
        }
        self.handle.take().map(join_worker)
    }

    /// Blocks until the worker finishes.
    pub fn wait(mut self) -> Option<T> {
        self.handle.take().map(join_worker)
    }
}

fn join_worker<T>(handle: JoinHandle<T>) -> T {
    match handle.join() {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Everything the editor works on: the fixed scene, the loaded models and
/// the masks built over them.
pub struct EditorContext {
    pub config: EditorConfig,
    scene: Option<SceneManager>,
    models: ModelRegistry,
    masks: Vec<MaskWrapper>,
    fixing_scene: Option<BackgroundTask<EditResult<SceneManager>>>,
    loading_model: Option<BackgroundTask<EditResult<(String, GaussianManager)>>>,
}

impl EditorContext {
    pub fn new(config: EditorConfig) -> Self {
        Self {
            config,
            scene: None,
            models: ModelRegistry::new(),
            masks: Vec::new(),
            fixing_scene: None,
            loading_model: None,
        }
    }

    pub fn scene(&self) -> Option<&SceneManager> {
        self.scene.as_ref()
    }

    pub fn scene_mut(&mut self) -> Option<&mut SceneManager> {
        self.scene.as_mut()
    }

    pub fn set_scene(&mut self, scene: SceneManager) {
        self.scene = Some(scene);
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut ModelRegistry {
        &mut self.models
    }

    pub fn add_model(&mut self, name: impl Into<String>, mut model: GaussianManager) -> ModelId {
        model.set_background(self.config.background);
        self.models.insert(name, model)
    }

    pub fn masks(&self) -> &[MaskWrapper] {
        &self.masks
    }

    pub fn mask(&self, name: &str) -> Option<&MaskWrapper> {
        self.masks.iter().find(|m| m.name == name)
    }

    pub fn remove_mask(&mut self, name: &str) -> Option<MaskWrapper> {
        let idx = self.masks.iter().position(|m| m.name == name)?;
        Some(self.masks.remove(idx))
    }

    pub fn next_mask_name(&self) -> String {
        format!(
            "mask_{}",
            next_name_index(self.masks.iter().map(|m| m.name.as_str()))
        )
    }

    /// Builds a mask of `model` from `geometry` and keeps it only on
    /// success.
    pub fn create_mask_using_geometry(
        &mut self,
        model: ModelId,
        geometry: Arc<dyn MaskGeometry>,
    ) -> EditResult<&MaskWrapper> {
        let mut wrapper = MaskWrapper::new(self.next_mask_name(), Some(model), Some(geometry));
        let selected = wrapper.create_mask_by_parent(&self.models)?;
        info!(name = %wrapper.name, selected, "mask created");
        self.masks.push(wrapper);
        Ok(&self.masks[self.masks.len() - 1])
    }

    /// Unions the named masks into a new mask that cannot be recomputed but
    /// keeps targeting the model all inputs share. Masks that still know
    /// their model are checked against its current generation.
    pub fn combine_masks(&mut self, names: &[&str], delete_originals: bool) -> EditResult<String> {
        let mut selected: Vec<(&MaskWrapper, &Mask)> = Vec::with_capacity(names.len());
        for &name in names {
            let wrapper = self
                .mask(name)
                .ok_or_else(|| EditError::InvalidArgument(format!("no mask named '{}'", name)))?;
            let mask = wrapper.mask().ok_or_else(|| {
                EditError::InvalidArgument(format!("mask '{}' has not been computed", name))
            })?;
            selected.push((wrapper, mask));
        }
        let Some(&(_, first)) = selected.first() else {
            return Err(EditError::InvalidArgument("no masks selected".to_string()));
        };

        let mut combined = first.clone();
        for (wrapper, mask) in &selected {
            if let Some(model) = wrapper.parent_model().and_then(|id| self.models.get(id)) {
                model.check_mask(mask)?;
            }
            combined = combined.or(mask)?;
        }

        let mut parents = selected.iter().map(|(wrapper, _)| wrapper.parent_model());
        let target = parents
            .next()
            .flatten()
            .filter(|&first| parents.all(|id| id == Some(first)));

        let name = self.next_mask_name();
        let wrapper = MaskWrapper::combined(name.clone(), target, combined);
        if delete_originals {
            self.masks.retain(|m| !names.contains(&m.name.as_str()));
        }
        self.masks.push(wrapper);
        Ok(name)
    }

    /// Recomputes every mask that still has both parents, typically after
    /// its model changed. Failures are logged and returned, not fatal.
    pub fn refresh_masks(&mut self) -> Vec<(String, EditError)> {
        let mut failures = Vec::new();
        for wrapper in self.masks.iter_mut().filter(|w| w.has_parent()) {
            if let Err(err) = wrapper.create_mask_by_parent(&self.models) {
                warn!(mask = %wrapper.name, %err, "cannot rebuild mask");
                failures.push((wrapper.name.clone(), err));
            }
        }
        failures
    }

    /// Deletes the points selected by the named mask from its model.
    /// Returns the number of removed points.
    pub fn delete_by_mask(&mut self, mask_name: &str) -> EditResult<usize> {
        let wrapper = self
            .mask(mask_name)
            .ok_or_else(|| EditError::InvalidArgument(format!("no mask named '{}'", mask_name)))?;
        let model_id = wrapper
            .parent_model()
            .ok_or(EditError::MissingParent("no target gaussian model"))?;
        let mask = wrapper
            .mask()
            .cloned()
            .ok_or_else(|| EditError::InvalidArgument(format!("mask '{}' has not been computed", mask_name)))?;
        let model = self
            .models
            .get_mut(model_id)
            .ok_or(EditError::MissingParent("target gaussian model was removed"))?;
        model.delete_by_mask(&mask)
    }

    pub fn start_fix_scene(&mut self, source: PathBuf) -> EditResult<()> {
        if self.is_fixing_scene() {
            return Err(EditError::InvalidArgument(
                "scene fix already running".to_string(),
            ));
        }
        let config = self.config.clone();
        self.fixing_scene = Some(BackgroundTask::spawn("fix-scene", move || {
            let mut rng = config.rng();
            load_and_fix_scene(&source, &config, &mut rng)
        })?);
        Ok(())
    }

    pub fn is_fixing_scene(&self) -> bool {
        self.fixing_scene.as_ref().is_some_and(|t| t.is_running())
    }

    /// Installs the fixed scene once the worker is done. `None` while it is
    /// still running or when nothing was started.
    pub fn poll_fix_scene(&mut self) -> Option<EditResult<()>> {
        let result = self.fixing_scene.as_mut()?.poll()?;
        self.fixing_scene = None;
        Some(result.map(|scene| self.scene = Some(scene)))
    }

    pub fn start_load_model(&mut self, name: String, ply_path: PathBuf) -> EditResult<()> {
        if self.is_loading_model() {
            return Err(EditError::InvalidArgument(
                "model load already running".to_string(),
            ));
        }
        self.loading_model = Some(BackgroundTask::spawn("load-model", move || {
            GaussianManager::from_ply_file(&ply_path).map(|model| (name, model))
        })?);
        Ok(())
    }

    pub fn is_loading_model(&self) -> bool {
        self.loading_model.as_ref().is_some_and(|t| t.is_running())
    }

    pub fn poll_load_model(&mut self) -> Option<EditResult<ModelId>> {
        let result = self.loading_model.as_mut()?.poll()?;
        self.loading_model = None;
        Some(result.map(|(name, model)| self.add_model(name, model)))
    }
}
