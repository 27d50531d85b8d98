//! Drives the coordinator headless: loads a model, pushes one camera and writes the
//! image it ends up showing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cgmath::{Matrix4, Vector3};
use clap::Parser;
use crossbeam_channel::{bounded, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_tree::HierarchicalLayer;

use progressive_preview::engine::software::{SoftwareEngine, SoftwareEngineConfig};
use progressive_preview::settings::SAMPLE_PRESETS;
use progressive_preview::{
    AlphaPolicy, CameraState, Coordinator, CoordinatorConfig, DisplayImage, Presenter, RenderEngine,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model to render
    #[arg(default_value = "scene.glb")]
    model: PathBuf,

    /// Where to write the final image
    #[arg(short, long, value_name = "FILE", default_value = "preview.png")]
    output: PathBuf,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 360)]
    height: u32,

    /// Index into the sample presets, 0 is the most expensive
    #[arg(short, long, default_value_t = 6)]
    samples: usize,

    /// Horizontal field of view in degrees
    #[arg(long, default_value_t = 60.0)]
    fov: f64,

    /// Use the first camera stored in the model instead of the default view
    #[arg(long)]
    model_camera: bool,

    #[arg(long, default_value_t = 0)]
    color_profile: usize,

    /// In stops
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    exposure: f32,

    #[arg(long)]
    material_variant: Option<usize>,

    #[arg(long, default_value_t = 1.0)]
    sky_intensity: f32,

    #[arg(long, default_value_t = 1.0)]
    sun_intensity: f32,

    #[arg(long, default_value_t = 45.0)]
    sun_elevation: f32,

    #[arg(long, default_value_t = 0.0)]
    sun_rotation: f32,

    #[arg(long)]
    transparent: bool,

    /// Keep alpha in the output instead of compositing over white
    #[arg(long)]
    preserve_alpha: bool,

    /// Save the raw render even when a denoised one is available
    #[arg(long)]
    no_denoise: bool,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 600)]
    timeout: u64,
}

/// Mirrors status lines onto a progress bar and hands over the final image.
struct CliPresenter {
    progress: ProgressBar,
    finished: AtomicBool,
    image: Mutex<Option<DisplayImage>>,
    done: Sender<()>,
}

impl Presenter for CliPresenter {
    fn present(&self, image: &DisplayImage) {
        *self.image.lock() = Some(image.clone());
        if self.finished.load(Ordering::SeqCst) {
            let _ = self.done.try_send(());
        }
    }

    fn show_status(&self, status: &str) {
        self.progress.set_message(status.to_string());
        self.progress.tick();
    }

    fn render_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(HierarchicalLayer::new(2).with_targets(true))
        .init();

    let args = Args::parse();

    let progress = ProgressBar::new_spinner();
    progress.set_style(ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}")?);
    progress.enable_steady_tick(Duration::from_millis(120));

    let (done_tx, done_rx) = bounded(1);
    let presenter = Arc::new(CliPresenter {
        progress: progress.clone(),
        finished: AtomicBool::new(false),
        image: Mutex::new(None),
        done: done_tx,
    });

    let config = CoordinatorConfig {
        supervisor_period: Duration::from_millis(100),
        alpha_policy: if args.preserve_alpha {
            AlphaPolicy::Preserve
        } else {
            AlphaPolicy::CompositeOverWhite
        },
        samples_preset: args.samples.min(SAMPLE_PRESETS.len() - 1),
        color_profile: args.color_profile,
        exposure: args.exposure,
        show_denoised: !args.no_denoise,
        ..CoordinatorConfig::default()
    };
    let engine: Arc<dyn RenderEngine> = Arc::new(SoftwareEngine::new(SoftwareEngineConfig {
        denoise: !args.no_denoise,
        ..SoftwareEngineConfig::default()
    }));
    let mut coordinator = Coordinator::new(config, Ok(engine), presenter.clone())?;

    let info = coordinator.load_model(&args.model)?;
    for scene in &info.scenes {
        tracing::info!(scene = %scene.name, cameras = scene.cameras.len(), "scene");
    }

    coordinator.resize(args.width, args.height);
    coordinator.select_material_variant(args.material_variant);
    coordinator.set_sky_intensity(args.sky_intensity);
    coordinator.set_sun_intensity(args.sun_intensity);
    coordinator.set_sun_elevation(args.sun_elevation);
    coordinator.set_sun_rotation(args.sun_rotation);
    coordinator.set_transparent_background(args.transparent);

    let default_camera = CameraState::perspective(
        args.fov,
        Matrix4::from_translation(Vector3::new(0.0, 0.5, 1.0)),
        0.1,
        100.0,
    );
    let camera = if args.model_camera {
        coordinator
            .scene_cameras(0)
            .into_iter()
            .next()
            .context("the model has no usable camera")?
    } else {
        default_camera
    };
    coordinator.camera_changed(camera);

    done_rx
        .recv_timeout(Duration::from_secs(args.timeout))
        .context("render did not finish in time")?;
    progress.finish_and_clear();

    let image = presenter.image.lock().take().context("nothing was presented")?;
    image
        .to_rgba_image()
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!("Wrote {}x{} image to {}", image.width, image.height, args.output.display());

    coordinator.shutdown();
    Ok(())
}
