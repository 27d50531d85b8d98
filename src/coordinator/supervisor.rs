//! The only thread that starts renders.

use std::time::Duration;

use crossbeam_channel::{select, Receiver};

use crate::coordinator::shared::Shared;

/// Stops renders when asked to and, whenever the preview is ahead of the render,
/// starts a new one. Returns once `cancel` disconnects.
pub(crate) fn run(shared: &Shared, cancel: &Receiver<()>, stop: &Receiver<()>, period: Duration) {
    let span = tracing::debug_span!("render_supervisor");
    let _enter = span.enter();

    loop {
        select! {
            recv(cancel) -> _ => break,
            recv(stop) -> signal => {
                if signal.is_err() {
                    break;
                }
                shared.handle_stop_signal(stop);
            }
            default(period) => shared.handle_tick(),
        }
    }
    tracing::debug!("render supervisor exiting");
}
