//! A small progressive CPU renderer.
//!
//! It knows a single built-in scene (a sphere on a ground plane under a sun and sky
//! gradient), so the model path only names it. Every pass adds one jittered sample
//! per pixel; partial images are reported while the passes accumulate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use cgmath::{InnerSpace, Matrix4, SquareMatrix, Vector3, Vector4};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

use crate::camera::{CameraPreset, EngineCamera, EngineProjection};
use crate::color::{ColorProcessor, ToneMapper};
use crate::engine::{
    EngineImage, ModelHandle, ModelInfo, ModelScene, RenderEngine, RenderObserver, RenderRequest,
};
use crate::settings::EnvironmentSettings;
use crate::Float;

const DEFAULT_ROWS_PER_JOB: usize = 16;
const DEFAULT_VERTICAL_FOV: Float = 45.0;

const SPHERE_CENTER: [Float; 3] = [0.0, 0.0, -4.0];
const SPHERE_RADIUS: Float = 1.0;
const GROUND_HEIGHT: Float = -1.0;
const GROUND_ALBEDO: Float = 0.4;
const DEFAULT_ALBEDO: [Float; 3] = [0.7, 0.7, 0.7];
const MATERIAL_VARIANTS: [(&str, [Float; 3]); 2] = [("Clay", [0.8, 0.55, 0.4]), ("Copper", [0.95, 0.64, 0.54])];

/// cos of the sun's angular radius
const SUN_COS_RADIUS: Float = 0.9995;
const SUN_DISC_RADIANCE: Float = 50.0;

#[derive(Clone, Debug)]
pub struct SoftwareEngineConfig {
    /// Deliver a filtered copy of the final image along with the original.
    pub denoise: bool,
    /// Minimum time between two partial images.
    pub update_interval: Duration,
}

impl Default for SoftwareEngineConfig {
    fn default() -> Self {
        Self {
            denoise: true,
            update_interval: Duration::from_millis(100),
        }
    }
}

pub struct SoftwareEngine {
    config: SoftwareEngineConfig,
    next_handle: AtomicU64,
    models: Mutex<HashMap<ModelHandle, LoadedModel>>,
    colors: Arc<ToneMapper>,
}

struct LoadedModel {
    path: PathBuf,
    job: Option<RenderJob>,
}

struct RenderJob {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl RenderJob {
    fn stop(self) {
        self.cancel.store(true, Ordering::Relaxed);
        if self.thread.join().is_err() {
            tracing::warn!("render thread panicked");
        }
    }
}

impl SoftwareEngine {
    pub fn new(config: SoftwareEngineConfig) -> Self {
        Self {
            config,
            next_handle: AtomicU64::new(1),
            models: Mutex::new(HashMap::new()),
            colors: Arc::new(ToneMapper::default()),
        }
    }

    fn take_job(&self, model: ModelHandle) -> Option<RenderJob> {
        self.models.lock().get_mut(&model).and_then(|m| m.job.take())
    }
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self::new(SoftwareEngineConfig::default())
    }
}

impl RenderEngine for SoftwareEngine {
    fn load_model(&self, path: &Path) -> anyhow::Result<ModelHandle> {
        if path.as_os_str().is_empty() {
            anyhow::bail!("no model path given");
        }
        let handle = ModelHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.models.lock().insert(
            handle,
            LoadedModel {
                path: path.to_path_buf(),
                job: None,
            },
        );
        tracing::debug!(?handle, path = %path.display(), "model loaded");
        Ok(handle)
    }

    fn model_info(&self, model: ModelHandle) -> ModelInfo {
        if !self.models.lock().contains_key(&model) {
            return ModelInfo::default();
        }
        let overview = EngineCamera {
            projection: EngineProjection::Perspective,
            preset: CameraPreset::Front,
            matrix: vec![
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, //
                0.0, 0.5, 1.0, 1.0,
            ],
            near_clip: 0.1,
            far_clip: 100.0,
            vertical_fov: DEFAULT_VERTICAL_FOV,
            ..EngineCamera::default()
        };
        ModelInfo {
            // unnamed, the way most exported files leave their scenes
            scenes: vec![ModelScene {
                name: String::new(),
                cameras: vec![overview],
            }],
            material_variants: MATERIAL_VARIANTS.iter().map(|(name, _)| name.to_string()).collect(),
        }
    }

    fn start_render(
        &self,
        model: ModelHandle,
        request: &RenderRequest,
        observer: Arc<dyn RenderObserver>,
    ) -> anyhow::Result<bool> {
        let settings = &request.settings;
        if settings.width == 0 || settings.height == 0 || settings.samples == 0 {
            return Ok(false);
        }
        if request.scene.map_or(false, |s| s > 0) {
            return Ok(false);
        }
        if request.material_variant.map_or(false, |v| v >= MATERIAL_VARIANTS.len()) {
            return Ok(false);
        }

        let previous = {
            let mut models = self.models.lock();
            let loaded = models.get_mut(&model).with_context(|| format!("unknown model {:?}", model))?;
            tracing::debug!(path = %loaded.path.display(), "starting render");
            loaded.job.take()
        };
        if let Some(job) = previous {
            job.stop();
        }

        let frame = Frame::new(request);
        let cancel = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name("software-render".to_string())
            .spawn({
                let cancel = cancel.clone();
                let config = self.config.clone();
                move || render(frame, observer, cancel, config)
            })
            .context("failed to spawn render thread")?;

        let job = RenderJob { cancel, thread };
        let orphaned = match self.models.lock().get_mut(&model) {
            Some(loaded) => {
                loaded.job = Some(job);
                None
            }
            None => Some(job),
        };
        if let Some(job) = orphaned {
            // freed while we were starting
            job.stop();
            return Ok(false);
        }
        Ok(true)
    }

    fn stop_render(&self, model: ModelHandle) {
        if let Some(job) = self.take_job(model) {
            job.stop();
        }
    }

    fn free_model(&self, model: ModelHandle) {
        let removed = self.models.lock().remove(&model);
        if let Some(LoadedModel { job: Some(job), .. }) = removed {
            job.stop();
        }
    }

    fn color_processor(&self) -> Arc<dyn ColorProcessor> {
        self.colors.clone()
    }
}

impl Drop for SoftwareEngine {
    fn drop(&mut self) {
        let jobs: Vec<RenderJob> = self.models.lock().drain().filter_map(|(_, m)| m.job).collect();
        for job in jobs {
            job.stop();
        }
    }
}

/// Everything a render thread needs, resolved from the request up front.
struct Frame {
    width: u32,
    height: u32,
    samples: u32,
    rows_per_job: usize,
    to_world: Matrix4<Float>,
    origin: Vector3<Float>,
    tan_half_fov: Float,
    aspect: Float,
    albedo: [Float; 3],
    environment: EnvironmentSettings,
    sun_dir: Vector3<Float>,
}

impl Frame {
    fn new(request: &RenderRequest) -> Self {
        let camera = &request.camera;
        let to_world = if camera.matrix.len() == 16 {
            let mut columns = [[0.0 as Float; 4]; 4];
            for (column, chunk) in columns.iter_mut().zip(camera.matrix.chunks_exact(4)) {
                column.copy_from_slice(chunk);
            }
            Matrix4::from(columns)
        } else {
            Matrix4::identity()
        };
        let vertical_fov = if camera.vertical_fov > 0.0 {
            camera.vertical_fov
        } else {
            DEFAULT_VERTICAL_FOV
        };

        let environment = request.environment;
        let elevation = environment.sun_elevation.to_radians();
        let rotation = environment.sun_rotation.to_radians();
        let sun_dir = Vector3::new(
            elevation.cos() * rotation.sin(),
            elevation.sin(),
            -elevation.cos() * rotation.cos(),
        );

        let settings = &request.settings;
        Self {
            width: settings.width,
            height: settings.height,
            samples: settings.samples,
            rows_per_job: if settings.tile_size > 0 {
                settings.tile_size as usize
            } else {
                DEFAULT_ROWS_PER_JOB
            },
            origin: to_world.w.truncate(),
            to_world,
            tan_half_fov: (vertical_fov.to_radians() / 2.0).tan(),
            aspect: settings.width as Float / settings.height as Float,
            albedo: request
                .material_variant
                .and_then(|v| MATERIAL_VARIANTS.get(v))
                .map_or(DEFAULT_ALBEDO, |(_, albedo)| *albedo),
            environment,
            sun_dir,
        }
    }

    /// Radiance and coverage seen through film position `(u, v)`, both in `[0, 1]`,
    /// `v = 0` at the bottom.
    fn sample(&self, u: Float, v: Float) -> [Float; 4] {
        let x = (2.0 * u - 1.0) * self.tan_half_fov * self.aspect;
        let y = (2.0 * v - 1.0) * self.tan_half_fov;
        let dir = (self.to_world * Vector4::new(x, y, -1.0, 0.0)).truncate().normalize();

        if let Some(t) = hit_sphere(self.origin, dir) {
            let n = (self.origin + dir * t - Vector3::from(SPHERE_CENTER)).normalize();
            let l = self.direct_light(n);
            return [self.albedo[0] * l, self.albedo[1] * l, self.albedo[2] * l, 1.0];
        }

        if dir.y < 0.0 && self.origin.y > GROUND_HEIGHT {
            let l = GROUND_ALBEDO * self.direct_light(Vector3::unit_y());
            return [l, l, l, 1.0];
        }

        if self.environment.transparent_background {
            return [0.0; 4];
        }
        let mut sky = background(dir) * self.environment.sky_intensity;
        if dir.dot(self.sun_dir) > SUN_COS_RADIUS {
            sky += Vector3::new(1.0, 1.0, 1.0) * (self.environment.sun_intensity * SUN_DISC_RADIANCE);
        }
        [sky.x, sky.y, sky.z, 1.0]
    }

    fn direct_light(&self, n: Vector3<Float>) -> Float {
        let ambient = 0.5 * self.environment.sky_intensity;
        ambient + self.environment.sun_intensity * n.dot(self.sun_dir).max(0.0)
    }
}

fn background(dir: Vector3<Float>) -> Vector3<Float> {
    // scale so t is between 0.0 and 1.0
    let t = 0.5 * (dir.y + 1.0);
    Vector3::new(1.0, 1.0, 1.0) * (1.0 - t) + Vector3::new(0.5, 0.7, 1.0) * t
}

fn hit_sphere(origin: Vector3<Float>, dir: Vector3<Float>) -> Option<Float> {
    let oc = origin - Vector3::from(SPHERE_CENTER);
    let b = oc.dot(dir);
    let c = oc.magnitude2() - SPHERE_RADIUS * SPHERE_RADIUS;
    let discriminant = b * b - c;
    if discriminant < 0.0 {
        return None;
    }
    let root = discriminant.sqrt();
    [-b - root, -b + root].iter().copied().find(|&t| t > 1e-4)
}

fn render(frame: Frame, observer: Arc<dyn RenderObserver>, cancel: Arc<AtomicBool>, config: SoftwareEngineConfig) {
    let span = tracing::debug_span!("software_render", w = frame.width, h = frame.height, samples = frame.samples);
    let _enter = span.enter();

    let (w, h) = (frame.width as usize, frame.height as usize);
    let mut accum = vec![0.0 as Float; w * h * 4];
    let mut average = vec![0.0 as Float; w * h * 4];
    let mut last_update = Instant::now();

    for pass in 0..frame.samples {
        if cancel.load(Ordering::Relaxed) {
            tracing::debug!(pass, "render cancelled");
            return;
        }

        accum
            .par_chunks_mut(4 * w * frame.rows_per_job)
            .enumerate()
            .for_each(|(job, chunk)| {
                let mut rng = Xoshiro256PlusPlus::seed_from_u64(((pass as u64) << 32) | job as u64);
                let first_row = job * frame.rows_per_job;
                for (i, px) in chunk.chunks_exact_mut(4).enumerate() {
                    let (x, y) = (i % w, first_row + i / w);
                    let u = (x as Float + rng.gen::<Float>()) / w as Float;
                    let v = (y as Float + rng.gen::<Float>()) / h as Float;
                    let l = frame.sample(u, v);
                    for (acc, l) in px.iter_mut().zip(l.iter()) {
                        *acc += l;
                    }
                }
            });

        let done = pass + 1;
        let inv = 1.0 / done as Float;
        average
            .par_iter_mut()
            .zip(accum.par_iter())
            .for_each(|(avg, sum)| *avg = sum * inv);

        observer.on_progress(
            done as Float / frame.samples as Float,
            &format!("Sample {}/{}", done, frame.samples),
        );
        if done < frame.samples && (pass == 0 || last_update.elapsed() >= config.update_interval) {
            observer.on_updated(&EngineImage::float_rgba(frame.width, frame.height, &average));
            last_update = Instant::now();
        }
    }

    let original = EngineImage::float_rgba(frame.width, frame.height, &average);
    let filtered = if config.denoise {
        Some(box_filter(&average, w, h))
    } else {
        None
    };
    let denoised = filtered
        .as_deref()
        .map(|pixels| EngineImage::float_rgba(frame.width, frame.height, pixels));
    observer.on_finished(Some(&original), denoised.as_ref());
}

/// 3x3 box filter over RGBA pixels; edge pixels average what is in bounds.
fn box_filter(pixels: &[Float], w: usize, h: usize) -> Vec<Float> {
    let mut out = vec![0.0 as Float; pixels.len()];
    out.par_chunks_mut(4 * w).enumerate().for_each(|(y, row)| {
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            let mut n = 0.0;
            for yy in y.saturating_sub(1)..(y + 2).min(h) {
                for xx in x.saturating_sub(1)..(x + 2).min(w) {
                    let i = (yy * w + xx) * 4;
                    for c in 0..4 {
                        px[c] += pixels[i + c];
                    }
                    n += 1.0;
                }
            }
            for c in px.iter_mut() {
                *c /= n;
            }
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RenderSettings;
    use approx::assert_abs_diff_eq;
    use crossbeam_channel::{unbounded, Receiver, Sender};

    #[derive(Debug)]
    enum Callback {
        Updated,
        Progress(Float),
        Finished { original: Vec<Float>, denoised: Option<Vec<Float>> },
    }

    struct ChannelObserver(Sender<Callback>);

    impl RenderObserver for ChannelObserver {
        fn on_updated(&self, _image: &EngineImage<'_>) {
            let _ = self.0.send(Callback::Updated);
        }

        fn on_progress(&self, fraction: Float, _status: &str) {
            let _ = self.0.send(Callback::Progress(fraction));
        }

        fn on_finished(&self, original: Option<&EngineImage<'_>>, denoised: Option<&EngineImage<'_>>) {
            let _ = self.0.send(Callback::Finished {
                original: original.map(|i| i.pixels.to_vec()).unwrap_or_default(),
                denoised: denoised.map(|i| i.pixels.to_vec()),
            });
        }
    }

    fn request(samples: u32, environment: EnvironmentSettings) -> RenderRequest {
        RenderRequest {
            scene: None,
            material_variant: None,
            camera: EngineCamera::default(),
            settings: RenderSettings {
                width: 8,
                height: 6,
                samples,
                tile_size: 0,
            },
            environment,
        }
    }

    fn wait_finished(rx: &Receiver<Callback>) -> (Vec<Callback>, Vec<Float>, Option<Vec<Float>>) {
        let mut seen = vec![];
        loop {
            match rx.recv_timeout(Duration::from_secs(10)).expect("render never finished") {
                Callback::Finished { original, denoised } => return (seen, original, denoised),
                other => seen.push(other),
            }
        }
    }

    #[test]
    fn test_progressive_render_finishes() {
        let engine = SoftwareEngine::default();
        let model = engine.load_model(Path::new("scene.gltf")).unwrap();
        let (tx, rx) = unbounded();

        let accepted = engine
            .start_render(model, &request(4, EnvironmentSettings::default()), Arc::new(ChannelObserver(tx)))
            .unwrap();
        assert!(accepted);

        let (seen, original, denoised) = wait_finished(&rx);
        assert_eq!(original.len(), 8 * 6 * 4);
        assert_eq!(denoised.map(|d| d.len()), Some(8 * 6 * 4));
        assert!(seen.iter().any(|c| matches!(c, Callback::Updated)));
        match seen.last() {
            Some(Callback::Progress(f)) => assert_abs_diff_eq!(*f, 1.0),
            other => panic!("expected final progress, got {:?}", other),
        }
        engine.free_model(model);
    }

    #[test]
    fn test_transparent_sky_has_zero_alpha() {
        let engine = SoftwareEngine::new(SoftwareEngineConfig {
            denoise: false,
            ..SoftwareEngineConfig::default()
        });
        let model = engine.load_model(Path::new("scene.gltf")).unwrap();
        let (tx, rx) = unbounded();
        let environment = EnvironmentSettings {
            transparent_background: true,
            ..EnvironmentSettings::default()
        };
        engine
            .start_render(model, &request(1, environment), Arc::new(ChannelObserver(tx)))
            .unwrap();

        let (_, original, denoised) = wait_finished(&rx);
        assert!(denoised.is_none());
        // top row looks up into the sky, rows are stored bottom-up
        let top_left = (5 * 8) * 4;
        assert_eq!(original[top_left + 3], 0.0);
    }

    #[test]
    fn test_rejects_unrenderable_requests() {
        let engine = SoftwareEngine::default();
        let model = engine.load_model(Path::new("scene.gltf")).unwrap();
        let (tx, _rx) = unbounded();
        let observer: Arc<dyn RenderObserver> = Arc::new(ChannelObserver(tx));

        let mut empty = request(4, EnvironmentSettings::default());
        empty.settings.width = 0;
        assert!(!engine.start_render(model, &empty, observer.clone()).unwrap());

        let mut missing_scene = request(4, EnvironmentSettings::default());
        missing_scene.scene = Some(3);
        assert!(!engine.start_render(model, &missing_scene, observer.clone()).unwrap());

        assert!(engine
            .start_render(ModelHandle(999), &request(4, EnvironmentSettings::default()), observer)
            .is_err());
        assert!(engine.load_model(Path::new("")).is_err());
    }

    #[test]
    fn test_stop_cancels_without_finishing() {
        let engine = SoftwareEngine::default();
        let model = engine.load_model(Path::new("scene.gltf")).unwrap();
        let (tx, rx) = unbounded();
        engine
            .start_render(model, &request(1_000_000, EnvironmentSettings::default()), Arc::new(ChannelObserver(tx)))
            .unwrap();

        engine.stop_render(model);
        // the thread is joined, so everything it sent is already queued
        assert!(rx.try_iter().all(|c| !matches!(c, Callback::Finished { .. })));
    }

    #[test]
    fn test_model_info_lists_variants() {
        let engine = SoftwareEngine::default();
        let model = engine.load_model(Path::new("scene.gltf")).unwrap();
        let info = engine.model_info(model);
        assert_eq!(info.scenes.len(), 1);
        assert_eq!(info.scenes[0].cameras.len(), 1);
        assert_eq!(info.material_variants, vec!["Clay".to_string(), "Copper".to_string()]);

        engine.free_model(model);
        assert_eq!(engine.model_info(model), ModelInfo::default());
    }

    #[test]
    fn test_box_filter_averages_neighbours() {
        let mut pixels = vec![0.0; 3 * 3 * 4];
        pixels[(1 * 3 + 1) * 4] = 9.0;
        let out = box_filter(&pixels, 3, 3);
        assert_abs_diff_eq!(out[(1 * 3 + 1) * 4], 1.0);
        // corners see four pixels
        assert_abs_diff_eq!(out[0], 9.0 / 4.0);
    }
}
