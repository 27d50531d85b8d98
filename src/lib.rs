pub mod camera;
pub mod color;
pub mod coordinator;
pub mod engine;
pub mod image;
pub mod present;
pub mod session;
pub mod settings;

pub use camera::{CameraState, EngineCamera, Projection};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use engine::{RenderEngine, RenderObserver};
pub use image::{AlphaPolicy, DisplayImage, RenderImage};
pub use present::Presenter;
pub use session::{RenderEvent, RenderSession};

pub type Float = f32;
