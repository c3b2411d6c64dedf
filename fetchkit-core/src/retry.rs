//! Retry policy and the attempt-loop orchestrator
//!
//! The orchestrator drives the full per-attempt cycle: request chain,
//! driver (or hedger), response chains, the retry decision, and the
//! inter-attempt delay. Attempts of a single request are strictly
//! sequential.

use crate::backoff;
use crate::context::Context;
use crate::driver::Driver;
use crate::error::FetchError;
use crate::hedge;
use crate::plugin::PluginPipeline;
use crate::response::FetchResponse;
use crate::signal;
use crate::stats::{StatsEvent, StatsHub};
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info};

/// Methods whose repeated execution yields the same server state.
pub const IDEMPOTENT_METHODS: [&str; 6] = ["GET", "HEAD", "OPTIONS", "PUT", "DELETE", "TRACE"];

pub fn is_idempotent(method: &Method) -> bool {
    IDEMPOTENT_METHODS.contains(&method.as_str())
}

/// The default retry decision.
///
/// Network and timeout errors retry only on idempotent methods (the server
/// may have acted on the request). HTTP errors retry on any method when the
/// status is in the configured retryable set, since those statuses indicate
/// the server did not act. Aborts never retry.
pub fn default_should_retry(ctx: &Context) -> bool {
    let Some(error) = &ctx.error else {
        return false;
    };
    match error {
        FetchError::Abort { .. } => false,
        FetchError::Http { status, .. } => ctx.req.retry.retry_status_codes.contains(status),
        FetchError::Timeout { .. } | FetchError::Network { .. } => is_idempotent(&ctx.req.method),
        FetchError::Parse { .. }
        | FetchError::Hedging { .. }
        | FetchError::RateLimit { .. } => false,
    }
}

/// Delay in milliseconds before the attempt that follows the current one.
///
/// Precedence: a `retry_delay_fn` beats the named strategy; `initial_delay`
/// replaces the first retry's delay; a `Retry-After` header beats both.
pub(crate) fn delay_before_next(ctx: &Context) -> u64 {
    let retry = &ctx.req.retry;

    let mut delay = match &retry.retry_delay_fn {
        Some(compute) => compute(ctx),
        None => backoff::compute_delay(
            retry.backoff_type,
            retry.retry_delay_ms,
            retry.backoff_max_delay_ms,
            &retry.backoff_delays_ms,
            ctx.attempt,
        ),
    };

    if ctx.attempt == 1 {
        if let Some(initial) = retry.initial_delay_ms {
            delay = initial;
        }
    }

    if retry.respect_retry_after {
        if let Some(retry_after) = ctx.error.as_ref().and_then(FetchError::retry_after_ms) {
            delay = retry_after;
        }
    }

    delay
}

/// Runs the attempt loop for one user call.
pub(crate) struct RetryOrchestrator {
    pub driver: Arc<dyn Driver>,
    pub pipeline: Arc<PluginPipeline>,
    pub stats: Arc<StatsHub>,
}

impl RetryOrchestrator {
    pub async fn run(&self, ctx: &mut Context) -> Result<FetchResponse, FetchError> {
        loop {
            self.stats.event(StatsEvent::Started);

            match self.pipeline.run_request(ctx).await {
                Err(e) => ctx.error = Some(e),
                Ok(()) => {
                    let hedging = ctx
                        .req
                        .hedging
                        .clone()
                        .filter(|cfg| hedge::hedge_eligible(cfg, &ctx.req.method));
                    let outcome = match hedging {
                        Some(cfg) => {
                            hedge::run_hedged(
                                &self.driver,
                                &cfg,
                                &ctx.req,
                                &ctx.controller,
                                ctx.attempt,
                            )
                            .await
                        }
                        None => {
                            self.driver
                                .perform(&ctx.req, &ctx.controller, ctx.attempt)
                                .await
                        }
                    };
                    match outcome {
                        Ok(res) => ctx.res = Some(res),
                        Err(e) => ctx.error = Some(e),
                    }

                    if ctx.res.is_some() {
                        if let Err(e) = self.pipeline.run_response(ctx).await {
                            ctx.res = None;
                            ctx.error = Some(e);
                        }
                    }
                }
            }

            if ctx.error.is_some() {
                self.pipeline.run_response_error(ctx).await;
            }

            if let Some(res) = ctx.res.take() {
                return Ok(res);
            }
            if ctx.error.is_none() {
                ctx.error = Some(ctx.network_error("attempt produced neither response nor error"));
            }

            let budget_left = ctx.attempt <= ctx.req.retry.retry;
            let retryable = budget_left && self.should_retry(ctx);
            if !retryable {
                let err = match ctx.error.take() {
                    Some(e) => e,
                    None => ctx.network_error("attempt produced neither response nor error"),
                };
                return Err(err.with_attempt(ctx.attempt));
            }

            let delay_ms = delay_before_next(ctx);
            self.stats.event(StatsEvent::Retried);
            if ctx.req.verbose {
                info!(
                    "retrying {} {} in {} ms (attempt {} of {}) [request_id: {}]",
                    ctx.req.method,
                    ctx.req.url,
                    delay_ms,
                    ctx.attempt + 1,
                    ctx.req.retry.retry + 1,
                    ctx.request_id
                );
            } else {
                debug!(
                    "retrying {} {} in {} ms (attempt {} of {}) [request_id: {}]",
                    ctx.req.method,
                    ctx.req.url,
                    delay_ms,
                    ctx.attempt + 1,
                    ctx.req.retry.retry + 1,
                    ctx.request_id
                );
            }

            // The retry sleep never counts against the per-attempt timeout,
            // but cancelling the user token wakes it immediately.
            if !signal::cancellable_sleep(delay_ms, ctx.root()).await {
                return Err(ctx.abort_error(None).with_attempt(ctx.attempt));
            }

            ctx.next_attempt();
        }
    }

    fn should_retry(&self, ctx: &Context) -> bool {
        match &ctx.req.retry.should_retry {
            Some(predicate) => predicate(ctx),
            None => default_should_retry(ctx),
        }
    }
}
