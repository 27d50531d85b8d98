//! Turns render output into what the presenter shows.

use crossbeam_channel::{select, Receiver};

use crate::coordinator::shared::Shared;
use crate::session::RenderEvent;

/// Consumes render events and redraw requests until `cancel` disconnects. Whatever
/// is queued is handled before converting, so a burst of updates costs one
/// conversion.
pub(crate) fn run(shared: &Shared, cancel: &Receiver<()>, events: &Receiver<RenderEvent>, dirty: &Receiver<()>) {
    let span = tracing::debug_span!("display_update");
    let _enter = span.enter();

    loop {
        let mut needs_refresh = select! {
            recv(cancel) -> _ => break,
            recv(events) -> event => match event {
                Ok(event) => shared.handle_render_event(event),
                Err(_) => break,
            },
            recv(dirty) -> signal => {
                if signal.is_err() {
                    break;
                }
                true
            }
        };

        for event in events.try_iter() {
            needs_refresh |= shared.handle_render_event(event);
        }
        if dirty.try_iter().count() > 0 {
            needs_refresh = true;
        }

        if needs_refresh {
            shared.refresh_display();
        }
    }
    tracing::debug!("display loop exiting");
}
