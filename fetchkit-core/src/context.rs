//! The shared per-call context threaded through the request lifecycle

use crate::config::ResolvedRequest;
use crate::error::FetchError;
use crate::response::FetchResponse;
use crate::signal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Mutable state shared by plugins, the driver, and the retry orchestrator
/// for one user call.
///
/// Exactly one of `res` and `error` is set when the pipeline exits an
/// attempt. `attempt` is 1-based and never decremented; `controller` is
/// replaced on each retry after the prior one is aborted.
#[derive(Debug)]
pub struct Context {
    /// The resolved request; plugins may mutate it.
    pub req: ResolvedRequest,

    /// The response of the current attempt, when it succeeded.
    pub res: Option<FetchResponse>,

    /// The error of the current attempt, when it failed.
    pub error: Option<FetchError>,

    /// Cancellation controller for the current attempt.
    pub controller: CancellationToken,

    /// 1-based attempt counter.
    pub attempt: u32,

    /// Free-form mutable state owned by plugins.
    pub meta: HashMap<String, Value>,

    /// Stable identifier for this call, for log correlation.
    pub request_id: Uuid,

    /// When the call entered the pipeline.
    pub started_at: Instant,

    root: CancellationToken,
}

impl Context {
    /// Build a context for a resolved request, deriving the root token from
    /// the caller's signal.
    pub fn new(req: ResolvedRequest) -> Self {
        let root = signal::root_signal(req.signal.as_ref());
        Self::with_root(req, root)
    }

    /// Build a context sharing an already-derived root token. Used when an
    /// outer layer (debounce, rate limiting) has begun watching the same
    /// signal.
    pub fn with_root(req: ResolvedRequest, root: CancellationToken) -> Self {
        let controller = signal::attempt_controller(&root);
        Self {
            req,
            res: None,
            error: None,
            controller,
            attempt: 1,
            meta: HashMap::new(),
            request_id: Uuid::new_v4(),
            started_at: Instant::now(),
            root,
        }
    }

    /// The root cancellation token for the whole call.
    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    /// Reset per-attempt state for a retry: abort the old controller, mint a
    /// fresh one, clear the outcome, and advance the counter.
    pub(crate) fn next_attempt(&mut self) {
        self.controller.cancel();
        self.controller = signal::attempt_controller(&self.root);
        self.res = None;
        self.error = None;
        self.attempt += 1;
    }

    /// Snapshot of the request options for error contexts.
    pub fn options(&self) -> Arc<ResolvedRequest> {
        Arc::new(self.req.clone())
    }

    /// Build an abort error carrying this context's request and attempt.
    pub fn abort_error(&self, reason: Option<&str>) -> FetchError {
        FetchError::abort(reason.map(str::to_string), self.options(), self.attempt)
    }

    /// Build a network error carrying this context's request and attempt.
    pub fn network_error(&self, message: impl Into<String>) -> FetchError {
        FetchError::network(message.into(), self.options(), self.attempt)
    }
}
