//! Scripted engine for unit tests: records what it is asked to do and lets the test
//! fire the observer callbacks by hand.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::color::{ColorProcessor, ToneMapper};
use crate::engine::{
    EngineImage, ModelHandle, ModelInfo, ModelScene, RenderEngine, RenderObserver, RenderRequest,
};
use crate::Float;

#[derive(Default)]
pub(crate) struct MockState {
    pub loaded: Vec<ModelHandle>,
    pub freed: Vec<ModelHandle>,
    pub starts: Vec<RenderRequest>,
    pub stops: usize,
    pub observer: Option<Arc<dyn RenderObserver>>,
    /// Answer for the next start requests.
    pub accept: bool,
    pub fail_start: bool,
    pub panic_start: bool,
    pub fail_load: bool,
}

pub(crate) struct MockEngine {
    pub state: Mutex<MockState>,
    pub info: ModelInfo,
    colors: Arc<ToneMapper>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                accept: true,
                ..MockState::default()
            }),
            info: ModelInfo {
                scenes: vec![
                    ModelScene {
                        name: "Studio".to_string(),
                        cameras: vec![],
                    },
                    ModelScene::default(),
                ],
                material_variants: vec![String::new(), "Gloss".to_string()],
            },
            colors: Arc::new(ToneMapper::default()),
        })
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().starts.len()
    }

    pub fn last_start(&self) -> Option<RenderRequest> {
        self.state.lock().starts.last().cloned()
    }

    fn observer(&self) -> Arc<dyn RenderObserver> {
        self.state.lock().observer.clone().expect("no render was started")
    }

    pub fn emit_updated(&self, width: u32, height: u32, value: Float) {
        let pixels = vec![value; (width * height * 4) as usize];
        self.observer().on_updated(&EngineImage::float_rgba(width, height, &pixels));
    }

    pub fn emit_progress(&self, fraction: Float, status: &str) {
        self.observer().on_progress(fraction, status);
    }

    pub fn emit_finished(&self, width: u32, height: u32, original: Option<Float>, denoised: Option<Float>) {
        let len = (width * height * 4) as usize;
        let original = original.map(|v| vec![v; len]);
        let denoised = denoised.map(|v| vec![v; len]);
        let original = original.as_deref().map(|p| EngineImage::float_rgba(width, height, p));
        let denoised = denoised.as_deref().map(|p| EngineImage::float_rgba(width, height, p));
        self.observer().on_finished(original.as_ref(), denoised.as_ref());
    }
}

impl RenderEngine for MockEngine {
    fn load_model(&self, path: &Path) -> anyhow::Result<ModelHandle> {
        let mut state = self.state.lock();
        if state.fail_load {
            anyhow::bail!("cannot open {}", path.display());
        }
        let handle = ModelHandle(state.loaded.len() as u64 + 1);
        state.loaded.push(handle);
        Ok(handle)
    }

    fn model_info(&self, _model: ModelHandle) -> ModelInfo {
        self.info.clone()
    }

    fn start_render(
        &self,
        _model: ModelHandle,
        request: &RenderRequest,
        observer: Arc<dyn RenderObserver>,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        if state.panic_start {
            drop(state);
            panic!("engine crashed");
        }
        if state.fail_start {
            anyhow::bail!("engine refused to start");
        }
        state.starts.push(request.clone());
        state.observer = Some(observer);
        Ok(state.accept)
    }

    fn stop_render(&self, _model: ModelHandle) {
        self.state.lock().stops += 1;
    }

    fn free_model(&self, model: ModelHandle) {
        self.state.lock().freed.push(model);
    }

    fn color_processor(&self) -> Arc<dyn ColorProcessor> {
        self.colors.clone()
    }
}
