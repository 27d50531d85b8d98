//! The boundary to the render engine.
//!
//! Everything the coordinator knows about the renderer goes through [`RenderEngine`];
//! images come back through a [`RenderObserver`] on whatever thread the engine likes.

use std::path::Path;
use std::sync::Arc;

use crate::camera::EngineCamera;
use crate::color::ColorProcessor;
use crate::settings::{EnvironmentSettings, RenderSettings};
use crate::Float;

pub mod software;

#[cfg(test)]
pub(crate) mod mock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModelHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    FloatRgba,
    UcharBgra,
}

/// An image owned by the engine, only valid for the duration of a callback.
#[derive(Clone, Copy, Debug)]
pub struct EngineImage<'a> {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub stride_bytes: u32,
    pub pixels: &'a [Float],
}

impl<'a> EngineImage<'a> {
    pub fn float_rgba(width: u32, height: u32, pixels: &'a [Float]) -> Self {
        Self {
            format: PixelFormat::FloatRgba,
            width,
            height,
            stride_bytes: width.saturating_mul(16),
            pixels,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelScene {
    pub name: String,
    pub cameras: Vec<EngineCamera>,
}

/// What a loaded model offers to choose from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelInfo {
    pub scenes: Vec<ModelScene>,
    pub material_variants: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderRequest {
    /// `None` renders the model's default scene.
    pub scene: Option<usize>,
    /// `None` renders the model's own materials.
    pub material_variant: Option<usize>,
    pub camera: EngineCamera,
    pub settings: RenderSettings,
    pub environment: EnvironmentSettings,
}

/// Receives render output. Called from engine threads; implementations must not block.
pub trait RenderObserver: Send + Sync {
    /// A partial, progressively refined image.
    fn on_updated(&self, image: &EngineImage<'_>);

    fn on_progress(&self, fraction: Float, status: &str);

    /// The render is done. `denoised` is absent when denoising is off or unsupported.
    fn on_finished(&self, original: Option<&EngineImage<'_>>, denoised: Option<&EngineImage<'_>>);
}

pub trait RenderEngine: Send + Sync {
    fn load_model(&self, path: &Path) -> anyhow::Result<ModelHandle>;

    fn model_info(&self, model: ModelHandle) -> ModelInfo;

    /// Starts rendering `model`. Returns whether the engine accepted the request.
    fn start_render(
        &self,
        model: ModelHandle,
        request: &RenderRequest,
        observer: Arc<dyn RenderObserver>,
    ) -> anyhow::Result<bool>;

    /// Best effort: callbacks of the stopped render may still trickle in.
    fn stop_render(&self, model: ModelHandle);

    fn free_model(&self, model: ModelHandle);

    /// Colour management used to turn render output into display images. Its looks
    /// are the colour profiles offered to the user.
    fn color_processor(&self) -> Arc<dyn ColorProcessor>;
}
