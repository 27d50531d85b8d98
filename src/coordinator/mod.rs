//! Keeps a progressive render in step with an interactive view.
//!
//! The foreground pushes camera snapshots and setting changes; every change bumps the
//! preview state and stops the render in flight. A supervisor thread restarts the
//! render once it is out of date, and a display thread converts whatever the engine
//! produces for the current state and hands it to the [`Presenter`].

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{bounded, Sender};

use crate::camera::CameraState;
use crate::color::ColorProfiles;
use crate::engine::{ModelInfo, RenderEngine};
use crate::image::{AlphaPolicy, DisplayImage};
use crate::present::Presenter;
use crate::settings::{sample_preset_label, EnvironmentSettings, SAMPLE_PRESETS};
use crate::Float;

mod display;
mod shared;
mod supervisor;


use self::shared::Shared;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// How often the supervisor checks whether a new render is due.
    pub supervisor_period: Duration,
    pub alpha_policy: AlphaPolicy,
    /// Index into [`SAMPLE_PRESETS`].
    pub samples_preset: usize,
    pub tile_size: u32,
    pub color_profile: usize,
    /// Stops.
    pub exposure: Float,
    pub show_denoised: bool,
    pub environment: EnvironmentSettings,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            supervisor_period: Duration::from_millis(500),
            alpha_policy: AlphaPolicy::default(),
            samples_preset: 0,
            tile_size: 0,
            color_profile: 0,
            exposure: 0.0,
            show_denoised: true,
            environment: EnvironmentSettings::default(),
        }
    }
}

pub struct Coordinator {
    running: Option<Running>,
}

struct Running {
    shared: Arc<Shared>,
    profiles: ColorProfiles,
    /// Dropping the sender wakes both loops.
    cancel: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Starts the supervisor and display threads.
    ///
    /// Without an engine the coordinator stays inert: nothing is rendered and every
    /// operation does nothing.
    pub fn new(
        config: CoordinatorConfig,
        engine: anyhow::Result<Arc<dyn RenderEngine>>,
        presenter: Arc<dyn Presenter>,
    ) -> anyhow::Result<Self> {
        let engine = match engine {
            Ok(engine) => engine,
            Err(e) => {
                tracing::warn!("rendering disabled: {:#}", e);
                return Ok(Self { running: None });
            }
        };

        let (shared, signals) = Shared::new(engine, presenter, &config);
        let profiles = shared.color_profiles();
        let (cancel_tx, cancel_rx) = bounded::<()>(0);

        let supervisor = std::thread::Builder::new()
            .name("render-supervisor".to_string())
            .spawn({
                let shared = shared.clone();
                let cancel = cancel_rx.clone();
                let stop = signals.stop;
                let period = config.supervisor_period;
                move || supervisor::run(&shared, &cancel, &stop, period)
            })
            .context("failed to spawn render supervisor")?;

        let display = std::thread::Builder::new()
            .name("display-update".to_string())
            .spawn({
                let shared = shared.clone();
                let events = signals.events;
                let dirty = signals.dirty;
                move || display::run(&shared, &cancel_rx, &events, &dirty)
            })
            .context("failed to spawn display thread")?;

        Ok(Self {
            running: Some(Running {
                shared,
                profiles,
                cancel: Some(cancel_tx),
                threads: vec![supervisor, display],
            }),
        })
    }

    fn shared(&self) -> Option<&Shared> {
        self.running.as_ref().map(|r| &*r.shared)
    }

    /// False when running without an engine.
    pub fn is_enabled(&self) -> bool {
        self.running.is_some()
    }

    /// Replaces the current model. The surface stays blank until a camera is pushed.
    pub fn load_model(&self, path: impl AsRef<Path>) -> anyhow::Result<ModelInfo> {
        match self.shared() {
            Some(shared) => shared.load_model(path.as_ref()),
            None => Ok(ModelInfo::default()),
        }
    }

    /// The user started dragging the view: stop rendering and hide stale output.
    pub fn begin_camera_interaction(&self) {
        if let Some(shared) = self.shared() {
            shared.begin_camera_interaction();
        }
    }

    pub fn end_camera_interaction(&self, camera: CameraState) {
        self.camera_changed(camera);
    }

    pub fn camera_changed(&self, camera: CameraState) {
        if let Some(shared) = self.shared() {
            shared.camera_changed(camera);
        }
    }

    pub fn resize(&self, width: u32, height: u32) {
        if let Some(shared) = self.shared() {
            shared.resize(width, height);
        }
    }

    /// Selects one of [`SAMPLE_PRESETS`]; out of range indices are ignored.
    pub fn select_samples(&self, preset: usize) {
        if let Some(shared) = self.shared() {
            shared.select_samples(preset);
        }
    }

    pub fn select_scene(&self, scene: Option<usize>) {
        if let Some(shared) = self.shared() {
            shared.select_scene(scene);
        }
    }

    pub fn select_material_variant(&self, variant: Option<usize>) {
        if let Some(shared) = self.shared() {
            shared.select_material_variant(variant);
        }
    }

    pub fn set_color_profile(&self, index: usize) {
        if let Some(shared) = self.shared() {
            shared.set_color_profile(index);
        }
    }

    pub fn set_exposure(&self, exposure: Float) {
        if let Some(shared) = self.shared() {
            shared.set_exposure(exposure);
        }
    }

    pub fn set_show_denoised(&self, show: bool) {
        if let Some(shared) = self.shared() {
            shared.set_show_denoised(show);
        }
    }

    pub fn set_sky_intensity(&self, intensity: Float) {
        self.update_environment(|env| env.sky_intensity = intensity);
    }

    pub fn set_sun_intensity(&self, intensity: Float) {
        self.update_environment(|env| env.sun_intensity = intensity);
    }

    pub fn set_sun_elevation(&self, degrees: Float) {
        self.update_environment(|env| env.sun_elevation = degrees);
    }

    pub fn set_sun_rotation(&self, degrees: Float) {
        self.update_environment(|env| env.sun_rotation = degrees);
    }

    pub fn set_transparent_background(&self, transparent: bool) {
        self.update_environment(|env| env.transparent_background = transparent);
    }

    fn update_environment(&self, change: impl FnOnce(&mut EnvironmentSettings)) {
        if let Some(shared) = self.shared() {
            shared.update_environment(change);
        }
    }

    pub fn preview_state(&self) -> u64 {
        self.shared().map_or(0, Shared::preview_state)
    }

    pub fn render_state(&self) -> u64 {
        self.shared().map_or(0, Shared::render_state)
    }

    pub fn is_rendering(&self) -> bool {
        self.shared().map_or(false, Shared::is_rendering)
    }

    /// The image last handed to the presenter (or held back while hidden).
    pub fn display_image(&self) -> Option<Arc<DisplayImage>> {
        self.shared().and_then(Shared::display_image)
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.shared().and_then(Shared::model_info)
    }

    /// Cameras stored in the model for `scene`.
    pub fn scene_cameras(&self, scene: usize) -> Vec<CameraState> {
        self.shared().map(|s| s.scene_cameras(scene)).unwrap_or_default()
    }

    /// Colour profile names; empty without an engine.
    pub fn color_profiles(&self) -> &[String] {
        match &self.running {
            Some(running) => running.profiles.names(),
            None => &[],
        }
    }

    pub fn sample_presets(&self) -> Vec<String> {
        SAMPLE_PRESETS.iter().map(|&s| sample_preset_label(s)).collect()
    }

    /// Stops both threads and releases the model. Also done on drop.
    pub fn shutdown(&mut self) {
        let mut running = match self.running.take() {
            Some(running) => running,
            None => return,
        };

        drop(running.cancel.take());
        for thread in running.threads.drain(..) {
            if thread.join().is_err() {
                tracing::warn!("coordinator thread panicked");
            }
        }
        running.shared.dispose_session();
        tracing::debug!("coordinator shut down");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
