//! One loaded model and at most one render in flight on it.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use crossbeam_channel::Sender;

use crate::camera::{from_engine_camera, CameraState, EngineCamera};
use crate::engine::{EngineImage, ModelHandle, ModelInfo, RenderEngine, RenderObserver, RenderRequest};
use crate::image::RenderImage;
use crate::settings::{EnvironmentSettings, RenderSettings};
use crate::Float;

/// Engine output, tagged with the preview state the render was started for.
#[derive(Clone, Debug)]
pub enum RenderEvent {
    Updated {
        version: u64,
        image: Arc<RenderImage>,
    },
    Progress {
        version: u64,
        fraction: Float,
        status: String,
    },
    Finished {
        version: u64,
        original: Option<Arc<RenderImage>>,
        denoised: Option<Arc<RenderImage>>,
    },
}

impl RenderEvent {
    pub fn version(&self) -> u64 {
        match *self {
            RenderEvent::Updated { version, .. }
            | RenderEvent::Progress { version, .. }
            | RenderEvent::Finished { version, .. } => version,
        }
    }
}

/// Attempt number in the high bits, "rendering" in bit 0. Packing both into one word
/// lets a finishing render clear the flag only if no newer attempt has started.
struct AttemptStatus(AtomicU64);

impl AttemptStatus {
    const RENDERING: u64 = 1;

    fn is_rendering(&self) -> bool {
        self.0.load(Ordering::Acquire) & Self::RENDERING != 0
    }

    fn begin(&self, attempt: u64) {
        self.0.store(attempt << 1 | Self::RENDERING, Ordering::Release);
    }

    /// Clears the flag if `attempt` is still the current one.
    fn end(&self, attempt: u64) -> bool {
        self.0
            .compare_exchange(
                attempt << 1 | Self::RENDERING,
                attempt << 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn clear(&self) -> bool {
        self.0.fetch_and(!Self::RENDERING, Ordering::AcqRel) & Self::RENDERING != 0
    }
}

pub struct RenderSession {
    engine: Arc<dyn RenderEngine>,
    model: ModelHandle,
    info: ModelInfo,
    events: Sender<RenderEvent>,
    status: Arc<AttemptStatus>,
    attempts: AtomicU64,
    disposed: AtomicBool,
}

impl RenderSession {
    /// Loads `path` into the engine. Render output is sent to `events`.
    pub fn open(engine: Arc<dyn RenderEngine>, path: &Path, events: Sender<RenderEvent>) -> anyhow::Result<Self> {
        let model = engine
            .load_model(path)
            .with_context(|| format!("failed to load {}", path.display()))?;

        let mut info = engine.model_info(model);
        for (i, scene) in info.scenes.iter_mut().enumerate() {
            if scene.name.is_empty() {
                scene.name = format!("Scene {}", i + 1);
            }
        }
        for (i, variant) in info.material_variants.iter_mut().enumerate() {
            if variant.is_empty() {
                *variant = format!("Variant {}", i + 1);
            }
        }
        tracing::info!(
            path = %path.display(),
            scenes = info.scenes.len(),
            variants = info.material_variants.len(),
            "model loaded"
        );

        Ok(Self {
            engine,
            model,
            info,
            events,
            status: Arc::new(AttemptStatus(AtomicU64::new(0))),
            attempts: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Cameras stored with `scene`, as preview cameras. Malformed ones are skipped.
    pub fn scene_cameras(&self, scene: usize) -> Vec<CameraState> {
        self.info
            .scenes
            .get(scene)
            .map(|s| s.cameras.iter().filter_map(from_engine_camera).collect())
            .unwrap_or_default()
    }

    /// True from an accepted start until that render finishes or is stopped.
    pub fn is_rendering(&self) -> bool {
        self.status.is_rendering()
    }

    /// Stops any current render and starts a new one tagged with `version`.
    ///
    /// Returns whether the engine accepted the request.
    pub fn start(
        &self,
        version: u64,
        camera: &EngineCamera,
        settings: &RenderSettings,
        environment: &EnvironmentSettings,
        scene: Option<usize>,
        material_variant: Option<usize>,
    ) -> anyhow::Result<bool> {
        if self.disposed.load(Ordering::Acquire) {
            anyhow::bail!("render session already disposed");
        }
        self.stop();

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let observer = Arc::new(SessionObserver {
            version,
            attempt,
            has_alpha: environment.transparent_background,
            status: self.status.clone(),
            events: self.events.clone(),
        });
        let request = RenderRequest {
            scene,
            material_variant,
            camera: camera.clone(),
            settings: *settings,
            environment: *environment,
        };

        // mark before starting: a quick engine may finish before start_render returns
        self.status.begin(attempt);
        let started = panic::catch_unwind(AssertUnwindSafe(|| {
            self.engine.start_render(self.model, &request, observer)
        }))
        .unwrap_or_else(|_| Err(anyhow::anyhow!("engine panicked while starting a render")));
        match started {
            Ok(true) => {
                tracing::debug!(version, attempt, "render started");
                Ok(true)
            }
            Ok(false) => {
                self.status.end(attempt);
                Ok(false)
            }
            Err(e) => {
                self.status.end(attempt);
                Err(e)
            }
        }
    }

    /// Stops the current render, if any. Late callbacks may still arrive.
    pub fn stop(&self) {
        if self.status.clear() {
            self.engine.stop_render(self.model);
        }
    }

    /// Stops rendering and releases the model. Only the first call does anything.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        self.engine.free_model(self.model);
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct SessionObserver {
    version: u64,
    attempt: u64,
    has_alpha: bool,
    status: Arc<AttemptStatus>,
    events: Sender<RenderEvent>,
}

impl SessionObserver {
    fn copy(&self, image: Option<&EngineImage<'_>>) -> Option<Arc<RenderImage>> {
        let image = image?;
        match RenderImage::from_engine(image, self.has_alpha) {
            Some(copy) => Some(Arc::new(copy)),
            None => {
                tracing::debug!(format = ?image.format, width = image.width, height = image.height, "dropping malformed image");
                None
            }
        }
    }
}

impl RenderObserver for SessionObserver {
    fn on_updated(&self, image: &EngineImage<'_>) {
        if let Some(image) = self.copy(Some(image)) {
            let _ = self.events.send(RenderEvent::Updated {
                version: self.version,
                image,
            });
        }
    }

    fn on_progress(&self, fraction: Float, status: &str) {
        let _ = self.events.send(RenderEvent::Progress {
            version: self.version,
            fraction,
            status: status.to_string(),
        });
    }

    fn on_finished(&self, original: Option<&EngineImage<'_>>, denoised: Option<&EngineImage<'_>>) {
        let original = self.copy(original);
        let denoised = self.copy(denoised);
        if original.is_some() || denoised.is_some() {
            let _ = self.events.send(RenderEvent::Finished {
                version: self.version,
                original,
                denoised,
            });
        }
        if self.status.end(self.attempt) {
            tracing::debug!(version = self.version, attempt = self.attempt, "render finished");
        }
    }
}
