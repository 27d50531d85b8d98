//! State shared by the foreground, the supervisor and the display loop, and the
//! steps each of them performs on it.
//!
//! `preview_state` counts invalidations of what the user sees; `render_state` is the
//! value the current render was started for, 0 when nothing is rendering. A render's
//! output is only current while the two are equal.

use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::camera::{to_engine_camera, CameraState};
use crate::color::{ColorProcessor, ColorProfiles};
use crate::coordinator::CoordinatorConfig;
use crate::engine::{ModelInfo, RenderEngine};
use crate::image::{convert, AlphaPolicy, DisplayImage, RenderImage};
use crate::present::Presenter;
use crate::session::{RenderEvent, RenderSession};
use crate::settings::{EnvironmentSettings, RenderSettings, SceneSelection, SAMPLE_PRESETS};
use crate::Float;

pub(crate) struct SharedState {
    pub preview_state: u64,
    pub render_state: u64,
    pub settings: RenderSettings,
    pub environment: EnvironmentSettings,
    pub selection: SceneSelection,
    pub camera: Option<CameraState>,
    pub session: Option<Arc<RenderSession>>,
    /// Replaced sessions waiting for the supervisor to dispose them.
    pub retired: Vec<Arc<RenderSession>>,
    pub surface_visible: bool,
    pub color_profile: usize,
    pub exposure: Float,
    pub show_denoised: bool,
    pub render_image: Option<Arc<RenderImage>>,
    pub denoised_image: Option<Arc<RenderImage>>,
    pub display_image: Option<Arc<DisplayImage>>,
}

impl SharedState {
    /// Whether output of the render started for `version` still matches the preview.
    pub fn is_current(&self, version: u64) -> bool {
        version == self.render_state && version == self.preview_state
    }
}

/// Receiving ends of the signals, handed to the loops.
pub(crate) struct Signals {
    pub stop: Receiver<()>,
    pub dirty: Receiver<()>,
    pub events: Receiver<RenderEvent>,
}

pub(crate) struct Shared {
    pub state: Mutex<SharedState>,
    engine: Arc<dyn RenderEngine>,
    processor: Arc<dyn ColorProcessor>,
    presenter: Arc<dyn Presenter>,
    alpha_policy: AlphaPolicy,
    stop_tx: Sender<()>,
    dirty_tx: Sender<()>,
    events_tx: Sender<RenderEvent>,
}

struct PendingStart {
    version: u64,
    session: Arc<RenderSession>,
    camera: CameraState,
    settings: RenderSettings,
    environment: EnvironmentSettings,
    scene: Option<usize>,
    material_variant: Option<usize>,
}

impl Shared {
    pub fn new(
        engine: Arc<dyn RenderEngine>,
        presenter: Arc<dyn Presenter>,
        config: &CoordinatorConfig,
    ) -> (Arc<Self>, Signals) {
        let processor = engine.color_processor();
        let profiles = ColorProfiles::from_processor(&*processor);
        let color_profile = if config.color_profile < profiles.len() {
            config.color_profile
        } else {
            0
        };
        let samples = SAMPLE_PRESETS[config.samples_preset.min(SAMPLE_PRESETS.len() - 1)];

        let (stop_tx, stop) = unbounded();
        let (dirty_tx, dirty) = unbounded();
        let (events_tx, events) = unbounded();

        let state = SharedState {
            preview_state: 0,
            render_state: 0,
            settings: RenderSettings {
                samples,
                tile_size: config.tile_size,
                ..RenderSettings::default()
            },
            environment: config.environment,
            selection: SceneSelection::default(),
            camera: None,
            session: None,
            retired: Vec::new(),
            surface_visible: true,
            color_profile,
            exposure: config.exposure,
            show_denoised: config.show_denoised,
            render_image: None,
            denoised_image: None,
            display_image: None,
        };

        let shared = Arc::new(Self {
            state: Mutex::new(state),
            engine,
            processor,
            presenter,
            alpha_policy: config.alpha_policy,
            stop_tx,
            dirty_tx,
            events_tx,
        });
        (shared, Signals { stop, dirty, events })
    }

    pub fn raise_stop(&self) {
        let _ = self.stop_tx.send(());
    }

    pub fn raise_dirty(&self) {
        let _ = self.dirty_tx.send(());
    }

    /// Applies `change` and, if it reports a change, invalidates the render: bumps
    /// `preview_state`, drops stored images and asks the supervisor to stop. With
    /// `hide` the surface is hidden until the next [`refresh`](Self::refresh).
    pub fn invalidate_with<F>(&self, hide: bool, change: F) -> bool
    where
        F: FnOnce(&mut SharedState) -> bool,
    {
        {
            let mut state = self.state.lock();
            if !change(&mut *state) {
                return false;
            }
            state.preview_state += 1;
            state.render_image = None;
            state.denoised_image = None;
            if hide {
                state.surface_visible = false;
                state.display_image = None;
            }
            tracing::trace!(preview_state = state.preview_state, hide, "invalidated");
            // queued before the lock is released, so no tick sees the new state without it
            self.raise_stop();
        }

        if hide {
            self.presenter.set_visible(false);
        }
        self.presenter.set_denoised_available(false);
        true
    }

    /// Shows the surface again and asks for a redraw.
    pub fn refresh(&self) {
        self.state.lock().surface_visible = true;
        self.presenter.set_visible(true);
        self.raise_dirty();
    }

    /// Applies a change that only affects how existing images are displayed.
    fn restyle<F>(&self, change: F)
    where
        F: FnOnce(&mut SharedState) -> bool,
    {
        let changed = change(&mut *self.state.lock());
        if changed {
            self.raise_dirty();
        }
    }

    // foreground

    pub fn load_model(&self, path: &Path) -> anyhow::Result<ModelInfo> {
        let span = tracing::info_span!("load_model", path = %path.display());
        let _enter = span.enter();

        self.invalidate_with(true, |state| {
            state.selection = SceneSelection {
                model_path: Some(path.to_path_buf()),
                scene: None,
                material_variant: None,
            };
            state.camera = None;
            // freeing can wait for a render pass, so the supervisor does it
            if let Some(previous) = state.session.take() {
                state.retired.push(previous);
            }
            true
        });

        let session = match self.open_session(path) {
            Ok(session) => session,
            Err(e) => {
                self.state.lock().selection.model_path = None;
                return Err(e);
            }
        };
        let info = session.info().clone();
        self.state.lock().session = Some(Arc::new(session));
        self.refresh();
        Ok(info)
    }

    /// Opens a session whose events feed the display loop.
    pub fn open_session(&self, path: &Path) -> anyhow::Result<RenderSession> {
        RenderSession::open(self.engine.clone(), path, self.events_tx.clone())
    }

    pub fn begin_camera_interaction(&self) {
        self.invalidate_with(true, |state| state.session.is_some());
    }

    pub fn camera_changed(&self, camera: CameraState) {
        self.invalidate_with(true, |state| {
            if state.camera == Some(camera) {
                return false;
            }
            state.camera = Some(camera);
            true
        });
        self.refresh();
    }

    pub fn resize(&self, width: u32, height: u32) {
        let changed = self.invalidate_with(true, |state| {
            if (state.settings.width, state.settings.height) == (width, height) {
                return false;
            }
            state.settings.width = width;
            state.settings.height = height;
            true
        });
        if changed {
            self.refresh();
        }
    }

    pub fn select_samples(&self, preset: usize) {
        let samples = match SAMPLE_PRESETS.get(preset) {
            Some(&samples) => samples,
            None => return,
        };
        let changed = self.invalidate_with(false, |state| {
            if state.settings.samples == samples {
                return false;
            }
            state.settings.samples = samples;
            true
        });
        if changed {
            self.refresh();
        }
    }

    pub fn select_scene(&self, scene: Option<usize>) {
        let changed = self.invalidate_with(true, |state| {
            if state.selection.model_path.is_none() || state.selection.scene == scene {
                return false;
            }
            state.selection.scene = scene;
            true
        });
        if changed {
            self.refresh();
        }
    }

    pub fn select_material_variant(&self, variant: Option<usize>) {
        let changed = self.invalidate_with(false, |state| {
            if state.selection.material_variant == variant {
                return false;
            }
            state.selection.material_variant = variant;
            true
        });
        if changed {
            self.refresh();
        }
    }

    pub fn update_environment<F>(&self, change: F)
    where
        F: FnOnce(&mut EnvironmentSettings),
    {
        let changed = self.invalidate_with(false, |state| {
            let before = state.environment;
            change(&mut state.environment);
            state.environment != before
        });
        if changed {
            self.refresh();
        }
    }

    pub fn set_color_profile(&self, index: usize) {
        self.restyle(|state| {
            if state.color_profile == index {
                return false;
            }
            state.color_profile = index;
            true
        });
    }

    pub fn set_exposure(&self, exposure: Float) {
        self.restyle(|state| {
            if state.exposure == exposure {
                return false;
            }
            state.exposure = exposure;
            true
        });
    }

    pub fn set_show_denoised(&self, show: bool) {
        self.restyle(|state| {
            if state.show_denoised == show {
                return false;
            }
            state.show_denoised = show;
            true
        });
    }

    // supervisor

    pub fn handle_stop_signal(&self, stop: &Receiver<()>) {
        self.dispose_retired();
        let session = self.state.lock().session.clone();
        if let Some(session) = session {
            session.stop();
        }
        for _ in stop.try_iter() {}
        self.state.lock().render_state = 0;
    }

    pub fn handle_tick(&self) {
        let host_visible = self.presenter.is_visible();
        let pending = {
            let mut state = self.state.lock();
            if state.render_state == state.preview_state || !state.surface_visible || !host_visible {
                return;
            }
            let session = match &state.session {
                Some(session) if !session.is_rendering() => session.clone(),
                _ => return,
            };
            let camera = match state.camera {
                Some(camera) => camera,
                None => return,
            };
            state.render_state = state.preview_state;
            PendingStart {
                version: state.render_state,
                session,
                camera,
                settings: state.settings,
                environment: state.environment,
                scene: state.selection.scene,
                material_variant: state.selection.material_variant,
            }
        };

        let span = tracing::debug_span!("start_render", version = pending.version);
        let _enter = span.enter();

        let camera = to_engine_camera(&pending.camera, pending.settings.width, pending.settings.height);
        let result = pending.session.start(
            pending.version,
            &camera,
            &pending.settings,
            &pending.environment,
            pending.scene,
            pending.material_variant,
        );
        match result {
            Ok(true) => tracing::debug!(samples = pending.settings.samples, "render started"),
            Ok(false) => {
                tracing::debug!("engine rejected render");
                self.retry_later(pending.version);
            }
            Err(e) => {
                tracing::debug!("failed to start render: {:#}", e);
                self.retry_later(pending.version);
            }
        }
    }

    fn retry_later(&self, version: u64) {
        let mut state = self.state.lock();
        if state.render_state == version {
            state.render_state = 0;
        }
    }

    // display

    /// Records a render event. Returns whether the display needs refreshing.
    pub fn handle_render_event(&self, event: RenderEvent) -> bool {
        tracing::trace!(version = event.version(), "render event");
        match event {
            RenderEvent::Updated { version, image } => {
                let current = {
                    let mut state = self.state.lock();
                    if state.is_current(version) {
                        state.render_image = Some(image);
                        true
                    } else {
                        false
                    }
                };
                if !current {
                    tracing::trace!(version, "stale image");
                    self.raise_stop();
                }
                current
            }
            RenderEvent::Progress {
                version,
                fraction,
                status,
            } => {
                let line = {
                    let state = self.state.lock();
                    if !state.is_current(version) {
                        return false;
                    }
                    status_line(state.selection.model_path.as_deref(), fraction, &status)
                };
                self.presenter.show_status(&line);
                false
            }
            RenderEvent::Finished {
                version,
                original,
                denoised,
            } => {
                let has_denoised = denoised.is_some();
                {
                    let mut state = self.state.lock();
                    if original.is_some() {
                        state.render_image = original;
                    }
                    if has_denoised {
                        state.denoised_image = denoised;
                    }
                }
                tracing::debug!(version, has_denoised, "render finished");
                if has_denoised {
                    self.presenter.set_denoised_available(true);
                }
                self.presenter.render_finished();
                true
            }
        }
    }

    /// Converts the image to show and hands it to the presenter.
    pub fn refresh_display(&self) {
        let (image, color_profile, exposure, preview_state) = {
            let state = self.state.lock();
            let image = match (&state.denoised_image, state.show_denoised) {
                (Some(denoised), true) => Some(denoised.clone()),
                _ => state.render_image.clone(),
            };
            (image, state.color_profile, state.exposure, state.preview_state)
        };
        let image = match image {
            Some(image) => image,
            None => return,
        };

        let converted = match convert(&image, color_profile, exposure, &*self.processor, self.alpha_policy) {
            Some(converted) => Arc::new(converted),
            None => {
                tracing::debug!("image could not be converted");
                return;
            }
        };

        let visible = {
            let mut state = self.state.lock();
            if state.preview_state != preview_state {
                // invalidated while converting
                return;
            }
            state.display_image = Some(converted.clone());
            state.surface_visible
        };
        if visible && self.presenter.is_visible() {
            self.presenter.present(&converted);
        }
    }

    // accessors

    pub fn preview_state(&self) -> u64 {
        self.state.lock().preview_state
    }

    pub fn render_state(&self) -> u64 {
        self.state.lock().render_state
    }

    pub fn display_image(&self) -> Option<Arc<DisplayImage>> {
        self.state.lock().display_image.clone()
    }

    pub fn is_rendering(&self) -> bool {
        self.state.lock().session.as_ref().map_or(false, |s| s.is_rendering())
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.state.lock().session.as_ref().map(|s| s.info().clone())
    }

    pub fn scene_cameras(&self, scene: usize) -> Vec<CameraState> {
        let session = self.state.lock().session.clone();
        session.map(|s| s.scene_cameras(scene)).unwrap_or_default()
    }

    pub fn color_profiles(&self) -> ColorProfiles {
        ColorProfiles::from_processor(&*self.processor)
    }

    /// Takes the session out of the shared state and disposes it, along with any
    /// replaced ones.
    pub fn dispose_session(&self) {
        self.dispose_retired();
        let session = self.state.lock().session.take();
        if let Some(session) = session {
            session.dispose();
        }
    }

    fn dispose_retired(&self) {
        let retired = std::mem::take(&mut self.state.lock().retired);
        for session in retired {
            session.dispose();
        }
    }
}

/// `"<file> - NN%"`, followed by the engine's own status in brackets.
fn status_line(model: Option<&Path>, fraction: Float, status: &str) -> String {
    let percent = (fraction.clamp(0.0, 1.0) * 100.0).round() as u32;
    let mut line = match model.and_then(|p| p.file_name()) {
        Some(name) => format!("{} - {}%", name.to_string_lossy(), percent),
        None => format!("{}%", percent),
    };
    if !status.is_empty() {
        line.push_str(&format!(" [{}]", status));
    }
    line
}
