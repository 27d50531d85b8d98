//! The display side: whatever shows converted images to the user.

use crate::image::DisplayImage;

/// A display surface plus the few status widgets around it.
///
/// Called from the coordinator's threads, never with its lock held.
pub trait Presenter: Send + Sync {
    /// Whether the host currently shows the surface at all (e.g. the window is not
    /// minimised). Renders are only started for visible surfaces.
    fn is_visible(&self) -> bool {
        true
    }

    /// The coordinator hides the surface while the interactive view is more current
    /// than anything rendered.
    fn set_visible(&self, _visible: bool) {}

    fn present(&self, image: &DisplayImage);

    fn set_denoised_available(&self, _available: bool) {}

    fn show_status(&self, _status: &str) {}

    /// A render finished and its final image has been handed over.
    fn render_finished(&self) {}
}

/// Discards everything.
pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn present(&self, _image: &DisplayImage) {}
}
