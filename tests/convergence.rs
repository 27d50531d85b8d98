use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cgmath::{Deg, Matrix4, Vector3};

use progressive_preview::engine::software::SoftwareEngine;
use progressive_preview::{
    AlphaPolicy, CameraState, Coordinator, CoordinatorConfig, DisplayImage, Presenter, RenderEngine,
};

#[derive(Default)]
struct CountingPresenter {
    presented: AtomicUsize,
    finished: AtomicUsize,
}

impl Presenter for CountingPresenter {
    fn present(&self, _image: &DisplayImage) {
        self.presented.fetch_add(1, Ordering::SeqCst);
    }

    fn render_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// 4 samples
const CHEAP_PRESET: usize = 8;

fn start(config: CoordinatorConfig) -> anyhow::Result<(Coordinator, Arc<CountingPresenter>)> {
    let presenter = Arc::new(CountingPresenter::default());
    let engine: Arc<dyn RenderEngine> = Arc::new(SoftwareEngine::default());
    let coordinator = Coordinator::new(
        CoordinatorConfig {
            supervisor_period: Duration::from_millis(10),
            samples_preset: CHEAP_PRESET,
            ..config
        },
        Ok(engine),
        presenter.clone(),
    )?;
    Ok((coordinator, presenter))
}

fn orbit(degrees: f32) -> CameraState {
    let transform = Matrix4::from_angle_y(Deg(degrees)) * Matrix4::from_translation(Vector3::new(0.0, 0.5, 1.0));
    CameraState::perspective(60.0, transform, 0.1, 100.0)
}

/// Waits until the latest state has been rendered to completion and shown.
fn wait_converged(coordinator: &Coordinator, presenter: &CountingPresenter, size: (u32, u32)) -> Arc<DisplayImage> {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let settled = coordinator.render_state() == coordinator.preview_state()
            && !coordinator.is_rendering()
            && presenter.finished.load(Ordering::SeqCst) > 0;
        if settled {
            if let Some(image) = coordinator.display_image() {
                if (image.width, image.height) == size {
                    return image;
                }
            }
        }
        assert!(Instant::now() < deadline, "coordinator never converged");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn converges_after_burst_of_changes() -> anyhow::Result<()> {
    let (mut coordinator, presenter) = start(CoordinatorConfig::default())?;
    let info = coordinator.load_model("scene.glb")?;
    assert_eq!(info.scenes[0].name, "Scene 1");

    coordinator.resize(24, 16);
    coordinator.begin_camera_interaction();
    for step in 0..20 {
        coordinator.camera_changed(orbit(step as f32 * 3.0));
    }
    coordinator.end_camera_interaction(orbit(15.0));
    coordinator.set_exposure(0.5);
    coordinator.set_sun_elevation(30.0);
    coordinator.select_material_variant(Some(1));
    coordinator.resize(16, 12);

    let image = wait_converged(&coordinator, &presenter, (16, 12));
    assert_eq!(image.pixels.len(), 16 * 12 * 4);
    assert!(presenter.presented.load(Ordering::SeqCst) > 0);

    coordinator.shutdown();
    Ok(())
}

#[test]
fn transparent_background_keeps_alpha() -> anyhow::Result<()> {
    let (mut coordinator, presenter) = start(CoordinatorConfig {
        alpha_policy: AlphaPolicy::Preserve,
        ..CoordinatorConfig::default()
    })?;
    coordinator.load_model("scene.glb")?;
    coordinator.set_transparent_background(true);
    coordinator.resize(16, 12);
    coordinator.camera_changed(CameraState::default());

    let image = wait_converged(&coordinator, &presenter, (16, 12));
    // top left looks into the sky
    assert_eq!(image.pixel(0, 0).map(|px| px[3]), Some(0));
    // bottom row is ground
    assert_eq!(image.pixel(0, 11).map(|px| px[3]), Some(255));

    coordinator.shutdown();
    Ok(())
}

#[test]
fn model_cameras_are_usable() -> anyhow::Result<()> {
    let (mut coordinator, presenter) = start(CoordinatorConfig::default())?;
    coordinator.load_model("scene.glb")?;
    let cameras = coordinator.scene_cameras(0);
    assert_eq!(cameras.len(), 1);

    coordinator.resize(8, 8);
    coordinator.camera_changed(cameras[0]);
    wait_converged(&coordinator, &presenter, (8, 8));

    coordinator.shutdown();
    Ok(())
}
