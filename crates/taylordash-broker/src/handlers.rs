//! Subscriber callback types and per-callback failure isolation.

use std::panic::AssertUnwindSafe;

/// Error a subscriber callback may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a subscriber callback.
pub type HandlerResult = Result<(), HandlerError>;

/// Run one subscriber callback so that neither an error nor a panic escapes.
///
/// Returns `true` when the callback completed successfully.
pub fn run_isolated<F>(subscriber: &str, topic: &str, callback: F) -> bool
where
    F: FnOnce() -> HandlerResult,
{
    match std::panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(subscriber = %subscriber, topic = %topic, "event handler failed: {e}");
            false
        }
        Err(panic) => {
            let info = if let Some(msg) = panic.downcast_ref::<&'static str>() {
                (*msg).to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "unknown panic".to_string()
            };
            tracing::error!(subscriber = %subscriber, topic = %topic, "event handler panicked: {info}");
            false
        }
    }
}
