//! The normalized error taxonomy surfaced by the driver and propagated
//! through the pipeline.
//!
//! Every error carries the resolved request options it was produced for, the
//! final attempt number, and optionally the underlying cause. Errors are
//! cloneable so the deduplicator can hand the identical outcome to every
//! coalesced caller. An attempt of 0 means the request never reached the
//! network (composition failure, debounce cancellation, rate-limit drop).

use crate::config::ResolvedRequest;
use crate::response::ResponseData;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Context shared by every error kind.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// The resolved request options in use when the error was produced.
    pub options: Arc<ResolvedRequest>,

    /// Final 1-based attempt number; 0 when no attempt was made.
    pub attempt: u32,

    /// Underlying cause, when one exists.
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ErrorContext {
    fn new(options: Arc<ResolvedRequest>, attempt: u32) -> Self {
        Self {
            options,
            attempt,
            cause: None,
        }
    }
}

/// The single error shape surfaced by the client.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// A non-2xx response.
    #[error("[{status}] {status_text}")]
    Http {
        status: u16,
        status_text: String,
        /// Decoded error body.
        data: ResponseData,
        /// Response headers; names are lowercased.
        headers: HashMap<String, String>,
        ctx: ErrorContext,
    },

    /// The per-attempt timeout fired.
    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64, ctx: ErrorContext },

    /// The request was aborted by a cancellation token or a coalescing
    /// layer.
    #[error("request aborted{}", fmt_reason(.reason))]
    Abort {
        reason: Option<String>,
        ctx: ErrorContext,
    },

    /// No response was obtained.
    #[error("network error: {message}")]
    Network { message: String, ctx: ErrorContext },

    /// A response body could not be decoded.
    #[error("failed to decode response body: {message}")]
    Parse {
        message: String,
        /// As much of the raw body as was read.
        raw: Option<String>,
        ctx: ErrorContext,
    },

    /// Every hedged attempt failed.
    #[error("all {} hedged attempts failed", .errors.len())]
    Hedging {
        /// Per-attempt errors, in launch order.
        errors: Vec<FetchError>,
        ctx: ErrorContext,
    },

    /// The rate-limiter queue was full.
    #[error("rate limit queue full for '{scope_key}'")]
    RateLimit { scope_key: String, ctx: ErrorContext },
}

fn fmt_reason(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(" ({})", r),
        None => String::new(),
    }
}

impl FetchError {
    pub fn http(
        status: u16,
        status_text: impl Into<String>,
        data: ResponseData,
        headers: HashMap<String, String>,
        options: Arc<ResolvedRequest>,
        attempt: u32,
    ) -> Self {
        Self::Http {
            status,
            status_text: status_text.into(),
            data,
            headers,
            ctx: ErrorContext::new(options, attempt),
        }
    }

    pub fn timeout(timeout_ms: u64, options: Arc<ResolvedRequest>, attempt: u32) -> Self {
        Self::Timeout {
            timeout_ms,
            ctx: ErrorContext::new(options, attempt),
        }
    }

    pub fn abort(reason: Option<String>, options: Arc<ResolvedRequest>, attempt: u32) -> Self {
        Self::Abort {
            reason,
            ctx: ErrorContext::new(options, attempt),
        }
    }

    pub fn network(message: impl Into<String>, options: Arc<ResolvedRequest>, attempt: u32) -> Self {
        Self::Network {
            message: message.into(),
            ctx: ErrorContext::new(options, attempt),
        }
    }

    pub fn parse(
        message: impl Into<String>,
        raw: Option<String>,
        options: Arc<ResolvedRequest>,
        attempt: u32,
    ) -> Self {
        Self::Parse {
            message: message.into(),
            raw,
            ctx: ErrorContext::new(options, attempt),
        }
    }

    pub fn hedging(errors: Vec<FetchError>, options: Arc<ResolvedRequest>, attempt: u32) -> Self {
        Self::Hedging {
            errors,
            ctx: ErrorContext::new(options, attempt),
        }
    }

    pub fn rate_limit(
        scope_key: impl Into<String>,
        options: Arc<ResolvedRequest>,
        attempt: u32,
    ) -> Self {
        Self::RateLimit {
            scope_key: scope_key.into(),
            ctx: ErrorContext::new(options, attempt),
        }
    }

    /// Attach the underlying cause.
    pub fn with_cause(mut self, cause: Arc<dyn std::error::Error + Send + Sync>) -> Self {
        self.ctx_mut().cause = Some(cause);
        self
    }

    /// Stamp the final attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.ctx_mut().attempt = attempt;
        self
    }

    fn ctx_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Http { ctx, .. }
            | Self::Timeout { ctx, .. }
            | Self::Abort { ctx, .. }
            | Self::Network { ctx, .. }
            | Self::Parse { ctx, .. }
            | Self::Hedging { ctx, .. }
            | Self::RateLimit { ctx, .. } => ctx,
        }
    }

    fn ctx(&self) -> &ErrorContext {
        match self {
            Self::Http { ctx, .. }
            | Self::Timeout { ctx, .. }
            | Self::Abort { ctx, .. }
            | Self::Network { ctx, .. }
            | Self::Parse { ctx, .. }
            | Self::Hedging { ctx, .. }
            | Self::RateLimit { ctx, .. } => ctx,
        }
    }

    /// The error name surfaced to users, matching the familiar string tags.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "HttpError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Abort { .. } => "AbortError",
            Self::Network { .. } => "NetworkError",
            Self::Parse { .. } => "ParseError",
            Self::Hedging { .. } => "HedgingError",
            Self::RateLimit { .. } => "RateLimitError",
        }
    }

    /// The HTTP status, for errors that carry one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Final attempt number; 0 when no attempt was made.
    pub fn attempt(&self) -> u32 {
        self.ctx().attempt
    }

    /// The resolved request options the failed call used.
    pub fn options(&self) -> &Arc<ResolvedRequest> {
        &self.ctx().options
    }

    /// The underlying cause, when one exists.
    pub fn cause(&self) -> Option<&Arc<dyn std::error::Error + Send + Sync>> {
        self.ctx().cause.as_ref()
    }

    /// `Retry-After` from the response headers in milliseconds, for HTTP
    /// errors that carried one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Http { headers, .. } => headers
                .get("retry-after")
                .and_then(|v| parse_retry_after(v)),
            _ => None,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Parse a `Retry-After` header value into milliseconds.
///
/// Accepts integer seconds or an HTTP-date; dates in the past yield 0.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds.saturating_mul(1000));
    }

    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta_ms = when
        .signed_duration_since(chrono::Utc::now())
        .num_milliseconds();
    Some(delta_ms.max(0) as u64)
}
