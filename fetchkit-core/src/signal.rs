//! Cancellation token composition
//!
//! Every user call has a root token (the caller's, or a synthetic one) and a
//! per-attempt child controller. Cancelling the root cancels the attempt,
//! pending retry sleeps, hedges, debounce timers, and queue waits; cancelling
//! a child controller affects only its attempt.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The root token for a call: the caller's token when supplied, otherwise a
/// fresh standalone one.
pub fn root_signal(user: Option<&CancellationToken>) -> CancellationToken {
    match user {
        Some(token) => token.clone(),
        None => CancellationToken::new(),
    }
}

/// A fresh per-attempt controller, cancelled whenever its parent is.
pub fn attempt_controller(root: &CancellationToken) -> CancellationToken {
    root.child_token()
}

/// Sleep that wakes early when the token fires.
///
/// Returns `true` when the full duration elapsed and `false` when the sleep
/// was cancelled.
pub async fn cancellable_sleep(duration_ms: u64, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => true,
        _ = token.cancelled() => false,
    }
}
