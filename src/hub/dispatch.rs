//! Hub dispatch: the trait every hub service implements.
//!
//! Each service registers under a [`BusHandler::prefix`]. The hub extracts
//! the first `/`-delimited segment of a method and hands the whole method
//! string to the matching handler, which does its own secondary routing.

use tokio::sync::oneshot;

use super::bus::{BusPayload, BusResult};

/// A hub service that handles [`super::bus::BusMessage`]s.
pub trait BusHandler: Send + Sync {
    /// The method prefix this handler owns (e.g. `"registry"`).
    ///
    /// Must be unique across all registered handlers.
    fn prefix(&self) -> &str;

    /// Handle an incoming request, taking ownership of `reply_tx`.
    ///
    /// Implementations **must not block** the hub loop: resolve `reply_tx`
    /// synchronously or move it into a spawned task.
    fn handle_request(&self, method: &str, payload: BusPayload, reply_tx: oneshot::Sender<BusResult>);

    /// Handle a fire-and-forget notification. Default: ignore.
    fn handle_notification(&self, _method: &str, _payload: BusPayload) {}
}

/// Split `"prefix/action"` into its action, checking the prefix.
/// A bare `"prefix"` yields an empty action.
pub fn action<'a>(prefix: &str, method: &'a str) -> Option<&'a str> {
    let mut parts = method.splitn(2, '/');
    if parts.next()? != prefix {
        return None;
    }
    Some(parts.next().unwrap_or(""))
}
