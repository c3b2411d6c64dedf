//! Token-bucket rate limiting with bounded queueing and scoping
//!
//! One bucket per scope key. Tokens refill continuously at
//! `limit / window_ms` per millisecond, clamped to the burst capacity.
//! Contended requests wait in a bounded FIFO queue drained by a periodic
//! ticker and nudged on every release; a full queue drops the request.

use regex::Regex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

fn default_window_ms() -> u64 {
    60_000
}

fn default_tick_ms() -> u64 {
    100
}

/// The granularity at which buckets are partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    /// One bucket for everything.
    Global,
    /// One bucket per URL host.
    Domain,
    /// One bucket per method + host + path.
    Endpoint,
}

impl Default for RateLimitScope {
    fn default() -> Self {
        Self::Global
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens granted per window.
    pub limit: u32,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Bucket capacity; defaults to `limit`.
    #[serde(default)]
    pub burst: Option<u32>,

    /// Cap on concurrently in-flight admitted requests.
    #[serde(default)]
    pub max_concurrent: Option<u32>,

    /// Queue bound; `None` is unbounded, 0 drops every contended request.
    #[serde(default)]
    pub queue_limit: Option<usize>,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default)]
    pub scope: RateLimitScope,

    /// URL patterns that participate; empty means all. `*` wildcards match
    /// any run of characters, plain patterns match as substrings.
    #[serde(default)]
    pub include: Vec<String>,

    /// URL patterns excluded from limiting; wins over `include`.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Per-request escape hatch.
    #[serde(default)]
    pub disabled: bool,
}

impl RateLimitConfig {
    /// `limit` requests per `window_ms` window with defaults elsewhere.
    pub fn per_window(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            burst: None,
            max_concurrent: None,
            queue_limit: None,
            tick_ms: default_tick_ms(),
            scope: RateLimitScope::default(),
            include: Vec::new(),
            exclude: Vec::new(),
            disabled: false,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = Some(max_concurrent);
        self
    }

    pub fn with_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = Some(queue_limit);
        self
    }

    pub fn with_scope(mut self, scope: RateLimitScope) -> Self {
        self.scope = scope;
        self
    }

    fn burst_capacity(&self) -> f64 {
        f64::from(self.burst.unwrap_or(self.limit))
    }
}

/// Turn user URL patterns into matchers: `*` globs match the whole URL,
/// plain patterns match anywhere in it.
fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| {
            let source = if pattern.contains('*') {
                format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"))
            } else {
                regex::escape(pattern)
            };
            Regex::new(&source).ok()
        })
        .collect()
}

fn patterns_allow(include: &[Regex], exclude: &[Regex], url: &str) -> bool {
    if exclude.iter().any(|re| re.is_match(url)) {
        return false;
    }
    include.is_empty() || include.iter().any(|re| re.is_match(url))
}

/// Derive the bucket key for a URL under the configured scope.
pub(crate) fn scope_key(scope: RateLimitScope, url: &str, method: &Method) -> String {
    match scope {
        RateLimitScope::Global => "global".to_string(),
        RateLimitScope::Domain => Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string()),
        RateLimitScope::Endpoint => match Url::parse(url) {
            Ok(u) => format!("{} {}{}", method, u.host_str().unwrap_or(""), u.path()),
            Err(_) => format!("{} {}", method, url),
        },
    }
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    in_flight: u32,
    queue: VecDeque<Waiter>,
}

impl Bucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            in_flight: 0,
            queue: VecDeque::new(),
        }
    }

    fn refill(&mut self, cfg: &RateLimitConfig) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;
        if cfg.window_ms > 0 {
            let rate = f64::from(cfg.limit) / cfg.window_ms as f64;
            self.tokens = (self.tokens + elapsed_ms * rate).min(cfg.burst_capacity());
        }
        self.last_refill = now;
    }

    fn can_admit(&self, cfg: &RateLimitConfig) -> bool {
        self.tokens >= 1.0 && self.in_flight < cfg.max_concurrent.unwrap_or(u32::MAX)
    }

    fn admit(&mut self) {
        self.tokens -= 1.0;
        self.in_flight += 1;
    }

    /// Grant queued waiters while tokens and concurrency allow, preserving
    /// FIFO order. A send failure means the waiter cancelled; its grant is
    /// reverted.
    fn grant_waiters(&mut self, cfg: &RateLimitConfig) {
        while !self.queue.is_empty() && self.can_admit(cfg) {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.admit();
            if waiter.tx.send(()).is_err() {
                self.tokens += 1.0;
                self.in_flight -= 1;
            }
        }
    }

    fn idle(&self, cfg: &RateLimitConfig) -> bool {
        self.queue.is_empty() && self.in_flight == 0 && self.tokens >= cfg.burst_capacity()
    }
}

#[derive(Debug)]
struct LimiterState {
    cfg: RateLimitConfig,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    buckets: HashMap<String, Bucket>,
    next_waiter_id: u64,
}

impl LimiterState {
    fn new(cfg: RateLimitConfig) -> Self {
        let include = compile_patterns(&cfg.include);
        let exclude = compile_patterns(&cfg.exclude);
        Self {
            cfg,
            include,
            exclude,
            buckets: HashMap::new(),
            next_waiter_id: 0,
        }
    }
}

#[derive(Debug)]
struct LimiterShared {
    state: Mutex<LimiterState>,
    ticker_started: AtomicBool,
}

impl LimiterShared {
    fn drain_all(&self) {
        let mut state = self.state.lock().unwrap();
        let cfg = state.cfg.clone();
        state.buckets.retain(|_, bucket| {
            bucket.refill(&cfg);
            bucket.grant_waiters(&cfg);
            !bucket.idle(&cfg)
        });
    }

    fn release(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        let cfg = state.cfg.clone();
        let mut remove = false;
        if let Some(bucket) = state.buckets.get_mut(key) {
            bucket.in_flight = bucket.in_flight.saturating_sub(1);
            bucket.refill(&cfg);
            bucket.grant_waiters(&cfg);
            remove = bucket.idle(&cfg);
        }
        if remove {
            state.buckets.remove(key);
        }
    }
}

/// Why an admission attempt did not produce a permit.
#[derive(Debug)]
pub(crate) enum AcquireError {
    QueueFull { scope_key: String },
    Aborted,
}

/// A successful admission; releasing it (on drop) frees the concurrency
/// slot and nudges the queue.
#[derive(Debug)]
pub(crate) struct RatePermit {
    shared: Arc<LimiterShared>,
    key: String,
    /// Whether this admission had to wait in the queue.
    pub waited: bool,
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        self.shared.release(&self.key);
    }
}

/// Token-bucket admission control shared by all requests of one client.
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<LimiterShared>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            shared: Arc::new(LimiterShared {
                state: Mutex::new(LimiterState::new(cfg)),
                ticker_started: AtomicBool::new(false),
            }),
        }
    }

    /// Swap in a new configuration, keeping buckets and queued waiters.
    pub fn reconfigure(&self, cfg: RateLimitConfig) {
        let mut state = self.shared.state.lock().unwrap();
        state.include = compile_patterns(&cfg.include);
        state.exclude = compile_patterns(&cfg.exclude);
        state.cfg = cfg;
    }

    /// The ticker is started lazily so a limiter can be built outside a
    /// runtime.
    fn ensure_ticker(&self) {
        if self
            .shared
            .ticker_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let weak = Arc::downgrade(&self.shared);
            tokio::spawn(ticker(weak));
        }
    }

    /// Admit a request, waiting in the FIFO queue when contended.
    ///
    /// `participation` carries the per-request view of the config (it may
    /// disable the limiter or adjust the pattern lists); bucket discipline
    /// always follows the limiter's own config. Returns `None` when the
    /// request does not participate.
    pub(crate) async fn acquire(
        &self,
        participation: &RateLimitConfig,
        url: &str,
        method: &Method,
        cancel: &CancellationToken,
    ) -> Result<Option<RatePermit>, AcquireError> {
        self.ensure_ticker();

        let (key, rx, waiter_id) = {
            let mut state = self.shared.state.lock().unwrap();
            let cfg = state.cfg.clone();

            if participation.disabled {
                return Ok(None);
            }
            let allowed = if participation.include == cfg.include
                && participation.exclude == cfg.exclude
            {
                patterns_allow(&state.include, &state.exclude, url)
            } else {
                let include = compile_patterns(&participation.include);
                let exclude = compile_patterns(&participation.exclude);
                patterns_allow(&include, &exclude, url)
            };
            if !allowed {
                return Ok(None);
            }

            let key = scope_key(cfg.scope, url, method);
            let bucket = state
                .buckets
                .entry(key.clone())
                .or_insert_with(|| Bucket::new(cfg.burst_capacity()));
            bucket.refill(&cfg);

            // Direct admission only when no earlier waiter is pending.
            if bucket.queue.is_empty() && bucket.can_admit(&cfg) {
                bucket.admit();
                return Ok(Some(RatePermit {
                    shared: Arc::clone(&self.shared),
                    key,
                    waited: false,
                }));
            }

            if let Some(limit) = cfg.queue_limit {
                if bucket.queue.len() >= limit {
                    debug!("rate limit queue full for '{}'", key);
                    return Err(AcquireError::QueueFull { scope_key: key });
                }
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            if let Some(bucket) = state.buckets.get_mut(&key) {
                bucket.queue.push_back(Waiter { id, tx });
            }
            (key, rx, id)
        };

        tokio::select! {
            granted = rx => match granted {
                Ok(()) => Ok(Some(RatePermit {
                    shared: Arc::clone(&self.shared),
                    key,
                    waited: true,
                })),
                Err(_) => Err(AcquireError::Aborted),
            },
            _ = cancel.cancelled() => {
                let mut state = self.shared.state.lock().unwrap();
                let cfg = state.cfg.clone();
                if let Some(bucket) = state.buckets.get_mut(&key) {
                    let before = bucket.queue.len();
                    bucket.queue.retain(|w| w.id != waiter_id);
                    if bucket.queue.len() == before {
                        // The grant raced the cancellation; give the slot back.
                        bucket.in_flight = bucket.in_flight.saturating_sub(1);
                        bucket.grant_waiters(&cfg);
                    }
                }
                Err(AcquireError::Aborted)
            }
        }
    }
}

async fn ticker(weak: Weak<LimiterShared>) {
    loop {
        let tick_ms = match weak.upgrade() {
            Some(shared) => shared.state.lock().unwrap().cfg.tick_ms,
            None => return,
        };
        tokio::time::sleep(Duration::from_millis(tick_ms.max(10))).await;
        match weak.upgrade() {
            Some(shared) => shared.drain_all(),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(limit: u32, window_ms: u64) -> RateLimitConfig {
        RateLimitConfig::per_window(limit, window_ms)
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_admits_up_to_burst_immediately() {
        let limiter = RateLimiter::new(cfg(3, 60_000));
        let config = cfg(3, 60_000);
        let cancel = token();

        let mut permits = Vec::new();
        for _ in 0..3 {
            let permit = limiter
                .acquire(&config, "https://api.test/x", &Method::GET, &cancel)
                .await
                .unwrap()
                .unwrap();
            assert!(!permit.waited);
            permits.push(permit);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_request_waits_for_refill() {
        let limiter = RateLimiter::new(cfg(1, 100));
        let config = cfg(1, 100);
        let cancel = token();

        let first = limiter
            .acquire(&config, "https://api.test/x", &Method::GET, &cancel)
            .await
            .unwrap()
            .unwrap();
        drop(first);

        // Bucket is empty; the next admission needs ~100 ms of refill.
        let started = Instant::now();
        let second = limiter
            .acquire(&config, "https://api.test/x", &Method::GET, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(second.waited);
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_queue_limit_zero_drops_immediately() {
        let limiter = RateLimiter::new(cfg(1, 60_000).with_queue_limit(0));
        let config = cfg(1, 60_000).with_queue_limit(0);
        let cancel = token();

        let _held = limiter
            .acquire(&config, "https://api.test/x", &Method::GET, &cancel)
            .await
            .unwrap()
            .unwrap();

        let err = limiter
            .acquire(&config, "https://api.test/x", &Method::GET, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::QueueFull { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_while_queued_removes_waiter() {
        let limiter = RateLimiter::new(cfg(1, 60_000));
        let config = cfg(1, 60_000);

        let _held = limiter
            .acquire(&config, "https://api.test/x", &Method::GET, &token())
            .await
            .unwrap()
            .unwrap();

        let cancel = token();
        let waiter = {
            let limiter = limiter.clone();
            let config = config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                limiter
                    .acquire(&config, "https://api.test/x", &Method::GET, &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AcquireError::Aborted)));

        let state = limiter.shared.state.lock().unwrap();
        let bucket = state.buckets.get("global").unwrap();
        assert!(bucket.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order_preserved() {
        let limiter = RateLimiter::new(cfg(1, 50));
        let config = cfg(1, 50);

        let _held = limiter
            .acquire(&config, "https://api.test/x", &Method::GET, &token())
            .await
            .unwrap()
            .unwrap();
        drop(_held);

        // Drain the bucket so both spawned waiters queue.
        let _drain = limiter
            .acquire(&config, "https://api.test/x", &Method::GET, &token())
            .await
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for label in [1u32, 2] {
            let limiter = limiter.clone();
            let config = config.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let permit = limiter
                    .acquire(&config, "https://api.test/x", &Method::GET, &token())
                    .await
                    .unwrap()
                    .unwrap();
                order.lock().unwrap().push(label);
                drop(permit);
            }));
            // Ensure deterministic enqueue order.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_exclude_pattern_bypasses() {
        let mut config = cfg(1, 60_000);
        config.exclude = vec!["/health".to_string()];
        let limiter = RateLimiter::new(config.clone());
        let cancel = token();

        for _ in 0..5 {
            let outcome = limiter
                .acquire(&config, "https://api.test/health", &Method::GET, &cancel)
                .await
                .unwrap();
            assert!(outcome.is_none());
        }
    }

    #[tokio::test]
    async fn test_disabled_override_bypasses() {
        let config = cfg(1, 60_000);
        let limiter = RateLimiter::new(config.clone());
        let mut request_view = config.clone();
        request_view.disabled = true;

        let outcome = limiter
            .acquire(&request_view, "https://api.test/x", &Method::GET, &token())
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_scope_keys() {
        assert_eq!(
            scope_key(RateLimitScope::Global, "https://a.test/x", &Method::GET),
            "global"
        );
        assert_eq!(
            scope_key(RateLimitScope::Domain, "https://a.test/x?q=1", &Method::GET),
            "a.test"
        );
        assert_eq!(
            scope_key(RateLimitScope::Endpoint, "https://a.test/x/y", &Method::POST),
            "POST a.test/x/y"
        );
    }

    #[test]
    fn test_glob_patterns_match_whole_url() {
        let patterns = compile_patterns(&["https://*.test/admin/*".to_string()]);
        assert!(patterns[0].is_match("https://api.test/admin/users"));
        assert!(!patterns[0].is_match("https://api.test/public"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_concurrent_caps_in_flight() {
        let config = cfg(100, 1_000).with_max_concurrent(1);
        let limiter = RateLimiter::new(config.clone());

        let first = limiter
            .acquire(&config, "https://api.test/x", &Method::GET, &token())
            .await
            .unwrap()
            .unwrap();

        let second = {
            let limiter = limiter.clone();
            let config = config.clone();
            tokio::spawn(async move {
                limiter
                    .acquire(&config, "https://api.test/x", &Method::GET, &token())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        drop(first);
        let permit = second.await.unwrap().unwrap().unwrap();
        assert!(permit.waited);
    }
}
