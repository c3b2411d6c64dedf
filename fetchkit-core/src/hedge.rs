//! Speculative request hedging
//!
//! Hedging wraps the driver inside the retry orchestrator: one hedged call
//! is one attempt from the orchestrator's perspective. The primary launches
//! immediately; additional attempts launch on the hedge schedule until one
//! succeeds or every attempt has failed.

use crate::config::ResolvedRequest;
use crate::driver::Driver;
use crate::error::FetchError;
use crate::response::FetchResponse;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How concurrent hedged attempts are coordinated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HedgePolicy {
    /// All launched attempts run in parallel; the first success wins and the
    /// losers are cancelled.
    Race,
    /// The hedge timer cancels the in-flight attempt before the next one
    /// starts.
    CancelAndRetry,
}

impl Default for HedgePolicy {
    fn default() -> Self {
        Self::Race
    }
}

fn default_hedge_delay_ms() -> u64 {
    100
}

fn default_max_hedges() -> u32 {
    2
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_hedge_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string(), "OPTIONS".to_string()]
}

/// Hedging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgingConfig {
    #[serde(default)]
    pub policy: HedgePolicy,

    /// Delay before the first hedge; later hedges follow the multiplier.
    #[serde(default = "default_hedge_delay_ms")]
    pub hedge_delay_ms: u64,

    /// Maximum additional attempts beyond the primary.
    #[serde(default = "default_max_hedges")]
    pub max_hedges: u32,

    /// Growth factor for successive hedge delays; 1.0 keeps them evenly
    /// spaced.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Apply equal jitter to each hedge delay.
    #[serde(default)]
    pub jitter: bool,

    /// Methods eligible for hedging.
    #[serde(default = "default_hedge_methods")]
    pub methods: Vec<String>,
}

impl Default for HedgingConfig {
    fn default() -> Self {
        Self {
            policy: HedgePolicy::default(),
            hedge_delay_ms: default_hedge_delay_ms(),
            max_hedges: default_max_hedges(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
            methods: default_hedge_methods(),
        }
    }
}

/// Metadata attached to a response produced by a hedged call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HedgeOutcome {
    /// Index of the winning attempt; 0 is the primary.
    pub winner: u32,

    /// Total attempts launched.
    pub attempts: u32,

    /// Estimated time the primary would have still needed, clamped to zero.
    pub latency_saved_ms: u64,
}

pub(crate) fn hedge_eligible(cfg: &HedgingConfig, method: &reqwest::Method) -> bool {
    cfg.methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str()))
}

/// Delay before hedge number `n` (1-based), following the multiplier and
/// optional equal jitter.
fn delay_for_hedge(cfg: &HedgingConfig, n: u32) -> u64 {
    let base = cfg.hedge_delay_ms as f64 * cfg.backoff_multiplier.powi(n.saturating_sub(1) as i32);
    let base = base.max(0.0).min(u64::MAX as f64);
    if cfg.jitter && base >= 2.0 {
        let half = base / 2.0;
        let jittered = half + rand::thread_rng().gen_range(0.0..=half);
        jittered as u64
    } else {
        base as u64
    }
}

type AttemptResult = (u32, Instant, Result<FetchResponse, FetchError>);

pub(crate) async fn run_hedged(
    driver: &Arc<dyn Driver>,
    cfg: &HedgingConfig,
    req: &ResolvedRequest,
    parent: &CancellationToken,
    attempt: u32,
) -> Result<FetchResponse, FetchError> {
    match cfg.policy {
        HedgePolicy::Race => race(driver, cfg, req, parent, attempt).await,
        HedgePolicy::CancelAndRetry => cancel_and_retry(driver, cfg, req, parent, attempt).await,
    }
}

/// Attempts run as spawned tasks so that losers keep being driven after the
/// winner returns and actually observe their cancellation tokens.
fn spawn_attempt(
    driver: &Arc<dyn Driver>,
    req: &ResolvedRequest,
    parent: &CancellationToken,
    attempt: u32,
    index: u32,
    tokens: &mut Vec<CancellationToken>,
    inflight: &mut FuturesUnordered<JoinHandle<AttemptResult>>,
) {
    let token = parent.child_token();
    tokens.push(token.clone());
    let driver = Arc::clone(driver);
    let req = req.clone();
    inflight.push(tokio::spawn(async move {
        let started = Instant::now();
        let result = driver.perform(&req, &token, attempt).await;
        (index, started, result)
    }));
}

fn win(
    mut res: FetchResponse,
    winner: u32,
    attempts: u32,
    primary_start: Instant,
    winner_start: Instant,
) -> FetchResponse {
    let primary_elapsed = primary_start.elapsed().as_millis() as u64;
    let winner_elapsed = winner_start.elapsed().as_millis() as u64;
    res.hedging = Some(HedgeOutcome {
        winner,
        attempts,
        latency_saved_ms: primary_elapsed.saturating_sub(winner_elapsed),
    });
    res
}

async fn race(
    driver: &Arc<dyn Driver>,
    cfg: &HedgingConfig,
    req: &ResolvedRequest,
    parent: &CancellationToken,
    attempt: u32,
) -> Result<FetchResponse, FetchError> {
    let options = Arc::new(req.clone());
    let max_total = cfg.max_hedges + 1;
    let primary_start = Instant::now();

    let mut tokens: Vec<CancellationToken> = Vec::new();
    let mut inflight: FuturesUnordered<JoinHandle<AttemptResult>> = FuturesUnordered::new();
    let mut errors: Vec<FetchError> = Vec::new();

    spawn_attempt(driver, req, parent, attempt, 0, &mut tokens, &mut inflight);
    let mut launched: u32 = 1;
    let mut next_deadline = Instant::now() + Duration::from_millis(delay_for_hedge(cfg, 1));

    loop {
        tokio::select! {
            Some(joined) = inflight.next() => {
                let (index, started, result) = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        errors.push(
                            FetchError::network(
                                format!("hedged attempt task failed: {}", e),
                                Arc::clone(&options),
                                attempt,
                            ),
                        );
                        if errors.len() as u32 == max_total {
                            return Err(FetchError::hedging(errors, options, attempt));
                        }
                        continue;
                    }
                };
                match result {
                    Ok(res) => {
                        for token in &tokens {
                            token.cancel();
                        }
                        drain_losers(std::mem::take(&mut inflight));
                        debug!(
                            "hedge {} of {} won for {} {}",
                            index, launched, req.method, req.url
                        );
                        return Ok(win(res, index, launched, primary_start, started));
                    }
                    Err(e) => {
                        errors.push(e);
                        if errors.len() as u32 == max_total {
                            return Err(FetchError::hedging(errors, options, attempt));
                        }
                    }
                }
            }
            _ = tokio::time::sleep_until(next_deadline), if launched < max_total => {
                spawn_attempt(driver, req, parent, attempt, launched, &mut tokens, &mut inflight);
                launched += 1;
                if launched < max_total {
                    next_deadline += Duration::from_millis(delay_for_hedge(cfg, launched));
                }
            }
            _ = parent.cancelled() => {
                for token in &tokens {
                    token.cancel();
                }
                drain_losers(std::mem::take(&mut inflight));
                return Err(FetchError::abort(None, options, attempt));
            }
        }
    }
}

/// Await the cancelled losers off to the side so they settle promptly
/// without delaying the winner.
fn drain_losers(mut inflight: FuturesUnordered<JoinHandle<AttemptResult>>) {
    if !inflight.is_empty() {
        tokio::spawn(async move { while inflight.next().await.is_some() {} });
    }
}

async fn cancel_and_retry(
    driver: &Arc<dyn Driver>,
    cfg: &HedgingConfig,
    req: &ResolvedRequest,
    parent: &CancellationToken,
    attempt: u32,
) -> Result<FetchResponse, FetchError> {
    let options = Arc::new(req.clone());
    let max_total = cfg.max_hedges + 1;
    let primary_start = Instant::now();
    let mut errors: Vec<FetchError> = Vec::new();

    for index in 0..max_total {
        let token = parent.child_token();
        let started = Instant::now();
        let handle = {
            let driver = Arc::clone(driver);
            let req = req.clone();
            let token = token.clone();
            tokio::spawn(async move { driver.perform(&req, &token, attempt).await })
        };
        let is_last = index + 1 == max_total;

        if is_last {
            tokio::select! {
                joined = handle => match flatten_joined(joined, &options, attempt) {
                    Ok(res) => return Ok(win(res, index, index + 1, primary_start, started)),
                    Err(e) => {
                        errors.push(e);
                        return Err(FetchError::hedging(errors, options, attempt));
                    }
                },
                _ = parent.cancelled() => {
                    token.cancel();
                    return Err(FetchError::abort(None, options, attempt));
                }
            }
        }

        let delay = delay_for_hedge(cfg, index + 1);
        tokio::select! {
            joined = handle => match flatten_joined(joined, &options, attempt) {
                Ok(res) => return Ok(win(res, index, index + 1, primary_start, started)),
                Err(e) => errors.push(e),
            },
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                // The detached task ends once it observes the cancellation.
                token.cancel();
                errors.push(FetchError::abort(
                    Some("hedged".to_string()),
                    Arc::clone(&options),
                    attempt,
                ));
            }
            _ = parent.cancelled() => {
                token.cancel();
                return Err(FetchError::abort(None, options, attempt));
            }
        }
    }

    Err(FetchError::hedging(errors, options, attempt))
}

fn flatten_joined(
    joined: Result<Result<FetchResponse, FetchError>, tokio::task::JoinError>,
    options: &Arc<ResolvedRequest>,
    attempt: u32,
) -> Result<FetchResponse, FetchError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(FetchError::network(
            format!("hedged attempt task failed: {}", e),
            Arc::clone(options),
            attempt,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseData;
    use async_trait::async_trait;
    use reqwest::Method;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ok_response() -> FetchResponse {
        FetchResponse {
            status: 200,
            status_text: "OK".to_string(),
            headers: HashMap::new(),
            data: ResponseData::Empty,
            hedging: None,
        }
    }

    /// Driver whose Nth call (0-based) sleeps `delays[n]` ms, then succeeds
    /// or fails per `fail[n]`. Sleeps respect the attempt token.
    struct ScriptedDriver {
        calls: AtomicU32,
        delays_ms: Vec<u64>,
        fail: Vec<bool>,
        cancelled: AtomicU32,
    }

    impl ScriptedDriver {
        fn new(delays_ms: Vec<u64>, fail: Vec<bool>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                delays_ms,
                fail,
                cancelled: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn perform(
            &self,
            req: &ResolvedRequest,
            cancel: &CancellationToken,
            attempt: u32,
        ) -> Result<FetchResponse, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let delay = self.delays_ms.get(call).copied().unwrap_or(0);
            let options = Arc::new(req.clone());

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                    if self.fail.get(call).copied().unwrap_or(false) {
                        Err(FetchError::network("scripted failure", options, attempt))
                    } else {
                        Ok(ok_response())
                    }
                }
                _ = cancel.cancelled() => {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::abort(None, options, attempt))
                }
            }
        }
    }

    fn request() -> ResolvedRequest {
        ResolvedRequest::minimal(Method::GET, "https://api.test/x")
    }

    #[test]
    fn test_eligibility_uses_method_list() {
        let cfg = HedgingConfig::default();
        assert!(hedge_eligible(&cfg, &Method::GET));
        assert!(hedge_eligible(&cfg, &Method::HEAD));
        assert!(!hedge_eligible(&cfg, &Method::POST));
    }

    #[test]
    fn test_delay_schedule_follows_multiplier() {
        let cfg = HedgingConfig {
            hedge_delay_ms: 50,
            backoff_multiplier: 2.0,
            jitter: false,
            ..HedgingConfig::default()
        };
        assert_eq!(delay_for_hedge(&cfg, 1), 50);
        assert_eq!(delay_for_hedge(&cfg, 2), 100);
        assert_eq!(delay_for_hedge(&cfg, 3), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_hedge_wins_and_primary_is_cancelled() {
        // Primary hangs 500 ms; hedge #1 launches at 50 ms and wins at 80 ms.
        let driver: Arc<ScriptedDriver> =
            Arc::new(ScriptedDriver::new(vec![500, 30], vec![false, false]));
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        let cfg = HedgingConfig {
            policy: HedgePolicy::Race,
            hedge_delay_ms: 50,
            max_hedges: 2,
            ..HedgingConfig::default()
        };
        let parent = CancellationToken::new();

        let res = run_hedged(&dyn_driver, &cfg, &request(), &parent, 1)
            .await
            .unwrap();
        let outcome = res.hedging.unwrap();
        assert_eq!(outcome.winner, 1);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.latency_saved_ms >= 50);

        // Give the detached loser a scheduler turn to observe its token.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(driver.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_primary_win_saves_nothing() {
        let driver: Arc<dyn Driver> = Arc::new(ScriptedDriver::new(vec![10], vec![false]));
        let cfg = HedgingConfig {
            policy: HedgePolicy::Race,
            hedge_delay_ms: 50,
            ..HedgingConfig::default()
        };
        let parent = CancellationToken::new();

        let res = run_hedged(&driver, &cfg, &request(), &parent, 1).await.unwrap();
        let outcome = res.hedging.unwrap();
        assert_eq!(outcome.winner, 0);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.latency_saved_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_all_fail_aggregates_errors() {
        let driver: Arc<dyn Driver> =
            Arc::new(ScriptedDriver::new(vec![10, 10, 10], vec![true, true, true]));
        let cfg = HedgingConfig {
            policy: HedgePolicy::Race,
            hedge_delay_ms: 20,
            max_hedges: 2,
            ..HedgingConfig::default()
        };
        let parent = CancellationToken::new();

        let err = run_hedged(&driver, &cfg, &request(), &parent, 1)
            .await
            .unwrap_err();
        match err {
            FetchError::Hedging { errors, .. } => assert_eq!(errors.len(), 3),
            other => panic!("expected HedgingError, got {}", other.kind()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_retry_cancels_slow_primary() {
        let driver: Arc<ScriptedDriver> =
            Arc::new(ScriptedDriver::new(vec![10_000, 10], vec![false, false]));
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        let cfg = HedgingConfig {
            policy: HedgePolicy::CancelAndRetry,
            hedge_delay_ms: 100,
            max_hedges: 1,
            ..HedgingConfig::default()
        };
        let parent = CancellationToken::new();

        let res = run_hedged(&dyn_driver, &cfg, &request(), &parent, 1)
            .await
            .unwrap();
        let outcome = res.hedging.unwrap();
        assert_eq!(outcome.winner, 1);
        assert_eq!(outcome.attempts, 2);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(driver.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_reaches_all_hedges() {
        let driver: Arc<ScriptedDriver> =
            Arc::new(ScriptedDriver::new(vec![10_000, 10_000], vec![false, false]));
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        let cfg = HedgingConfig {
            policy: HedgePolicy::Race,
            hedge_delay_ms: 10,
            max_hedges: 1,
            ..HedgingConfig::default()
        };
        let parent = CancellationToken::new();

        let handle = {
            let parent = parent.clone();
            let req = request();
            tokio::spawn(async move { run_hedged(&dyn_driver, &cfg, &req, &parent, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        parent.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_abort());
    }
}
