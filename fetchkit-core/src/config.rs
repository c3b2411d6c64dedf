//! Client configuration, per-request overrides, and the merge that produces
//! the resolved request the driver sees.

use crate::backoff::BackoffType;
use crate::body::RequestBody;
use crate::debounce::DebounceConfig;
use crate::dedup::DedupConfig;
use crate::driver::{compose_url, Driver};
use crate::error::FetchError;
use crate::hedge::HedgingConfig;
use crate::ratelimit::RateLimitConfig;
use crate::response::{ResponseData, ResponseParts, ResponseType};
use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Status codes retried by the default policy. These indicate the server did
/// not act on the request, so they are safe to retry regardless of method.
pub const DEFAULT_RETRY_STATUS_CODES: [u16; 8] = [408, 409, 425, 429, 500, 502, 503, 504];

/// Default per-attempt timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Predicate that fully replaces the default retry decision.
pub type ShouldRetryFn = Arc<dyn Fn(&crate::context::Context) -> bool + Send + Sync>;

/// Computes the delay before the next retry from the current context.
pub type RetryDelayFn = Arc<dyn Fn(&crate::context::Context) -> u64 + Send + Sync>;

/// Custom response decoder; receives the undecoded body and the raw status
/// line and headers. Overrides the response-type directive.
pub type ParseResponseFn =
    Arc<dyn Fn(&Bytes, &ResponseParts) -> Result<ResponseData, String> + Send + Sync>;

/// A query-parameter value: a single value or one occurrence per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for QueryValue {
    fn from(s: &str) -> Self {
        Self::One(s.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(s: String) -> Self {
        Self::One(s)
    }
}

impl From<Vec<String>> for QueryValue {
    fn from(v: Vec<String>) -> Self {
        Self::Many(v)
    }
}

impl From<&[&str]> for QueryValue {
    fn from(v: &[&str]) -> Self {
        Self::Many(v.iter().map(|s| s.to_string()).collect())
    }
}

/// Retry and backoff settings.
#[derive(Clone)]
pub struct RetrySettings {
    /// Maximum retry attempts; 0 disables. Total calls = 1 + `retry`.
    pub retry: u32,

    /// Base delay in milliseconds fed to the backoff strategy.
    pub retry_delay_ms: u64,

    /// When set, called with the context to compute each delay; takes
    /// precedence over the named strategy.
    pub retry_delay_fn: Option<RetryDelayFn>,

    /// Status codes considered retryable.
    pub retry_status_codes: Vec<u16>,

    /// Named backoff strategy.
    pub backoff_type: BackoffType,

    /// Cap applied to computed delays by the capped strategies.
    pub backoff_max_delay_ms: u64,

    /// Explicit delay sequence for [`BackoffType::Custom`].
    pub backoff_delays_ms: Vec<u64>,

    /// Replaces the first retry's delay specifically.
    pub initial_delay_ms: Option<u64>,

    /// Predicate override; fully replaces the default retry decision.
    pub should_retry: Option<ShouldRetryFn>,

    /// Whether a `Retry-After` response header takes precedence over the
    /// computed delay.
    pub respect_retry_after: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::none()
    }
}

impl RetrySettings {
    /// No retries.
    pub fn none() -> Self {
        Self {
            retry: 0,
            retry_delay_ms: 0,
            retry_delay_fn: None,
            retry_status_codes: DEFAULT_RETRY_STATUS_CODES.to_vec(),
            backoff_type: BackoffType::Linear,
            backoff_max_delay_ms: 30_000,
            backoff_delays_ms: Vec::new(),
            initial_delay_ms: None,
            should_retry: None,
            respect_retry_after: true,
        }
    }

    /// Sensible defaults for flaky upstreams: 3 retries, 250 ms base,
    /// capped exponential growth.
    pub fn standard() -> Self {
        Self {
            retry: 3,
            retry_delay_ms: 250,
            backoff_type: BackoffType::ExponentialCapped,
            backoff_max_delay_ms: 10_000,
            ..Self::none()
        }
    }

    /// Aggressive retry for critical operations: 5 retries, short jittered
    /// delays.
    pub fn aggressive() -> Self {
        Self {
            retry: 5,
            retry_delay_ms: 100,
            backoff_type: BackoffType::ExponentialJitter,
            backoff_max_delay_ms: 5_000,
            ..Self::none()
        }
    }

    /// Conservative retry to minimize load: 2 retries, long delays.
    pub fn conservative() -> Self {
        Self {
            retry: 2,
            retry_delay_ms: 500,
            backoff_type: BackoffType::ExponentialCapped,
            backoff_max_delay_ms: 15_000,
            ..Self::none()
        }
    }
}

impl fmt::Debug for RetrySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrySettings")
            .field("retry", &self.retry)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("retry_delay_fn", &self.retry_delay_fn.as_ref().map(|_| "<fn>"))
            .field("retry_status_codes", &self.retry_status_codes)
            .field("backoff_type", &self.backoff_type)
            .field("backoff_max_delay_ms", &self.backoff_max_delay_ms)
            .field("backoff_delays_ms", &self.backoff_delays_ms)
            .field("initial_delay_ms", &self.initial_delay_ms)
            .field("should_retry", &self.should_retry.as_ref().map(|_| "<fn>"))
            .field("respect_retry_after", &self.respect_retry_after)
            .finish()
    }
}

/// Long-lived settings for a client instance.
///
/// Created at construction, updatable at runtime through
/// [`Client::update_config`](crate::client::Client::update_config), never
/// mutated by request handling.
#[derive(Clone)]
pub struct ClientConfig {
    /// Prefix for relative request paths.
    pub base_url: Option<String>,

    /// Default headers merged beneath per-request headers.
    pub headers: HashMap<String, String>,

    /// Default query parameters merged beneath per-request query.
    pub query: HashMap<String, QueryValue>,

    /// Per-attempt deadline in milliseconds; 0 disables.
    pub timeout_ms: u64,

    /// Retry and backoff settings.
    pub retry: RetrySettings,

    /// Response decoding directive.
    pub response_type: ResponseType,

    /// Custom decoder; overrides `response_type`.
    pub parse_response: Option<ParseResponseFn>,

    /// If true, non-2xx responses resolve instead of erroring.
    pub ignore_response_error: bool,

    /// Rate limiter configuration; `None` disables the limiter.
    pub rate_limit: Option<RateLimitConfig>,

    /// Debouncer configuration; `None` disables debouncing.
    pub debounce: Option<DebounceConfig>,

    /// Deduplicator configuration; `None` disables deduplication.
    pub deduplicate: Option<DedupConfig>,

    /// Hedging configuration; `None` disables hedging.
    pub hedging: Option<HedgingConfig>,

    /// Whether the stats hub records events.
    pub stats_enabled: bool,

    /// Raises per-attempt diagnostics from `debug` to `info`.
    pub verbose: bool,

    /// Driver override; `None` uses the native driver.
    pub driver: Option<Arc<dyn Driver>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            headers: HashMap::new(),
            query: HashMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry: RetrySettings::default(),
            response_type: ResponseType::Auto,
            parse_response: None,
            ignore_response_error: false,
            rate_limit: None,
            debounce: None,
            deduplicate: None,
            hedging: None,
            stats_enabled: true,
            verbose: false,
            driver: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base URL for relative request paths.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Add a default header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Add a default query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Set the per-attempt timeout in milliseconds; 0 disables.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the retry settings.
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Set the response decoding directive.
    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Resolve non-2xx responses instead of erroring.
    pub fn with_ignore_response_error(mut self, ignore: bool) -> Self {
        self.ignore_response_error = ignore;
        self
    }

    /// Enable the rate limiter.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Enable the debouncer.
    pub fn with_debounce(mut self, debounce: DebounceConfig) -> Self {
        self.debounce = Some(debounce);
        self
    }

    /// Enable the deduplicator.
    pub fn with_deduplicate(mut self, deduplicate: DedupConfig) -> Self {
        self.deduplicate = Some(deduplicate);
        self
    }

    /// Enable hedging.
    pub fn with_hedging(mut self, hedging: HedgingConfig) -> Self {
        self.hedging = Some(hedging);
        self
    }

    /// Enable or disable stats collection.
    pub fn with_stats_enabled(mut self, enabled: bool) -> Self {
        self.stats_enabled = enabled;
        self
    }

    /// Enable verbose diagnostics.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Override the driver.
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Merge this config with per-request overrides into the flattened
    /// request the driver sees. Overrides win field-by-field.
    pub fn resolve(
        &self,
        method: Method,
        url: &str,
        opts: RequestOptions,
    ) -> Result<ResolvedRequest, FetchError> {
        // Header names are lowercased so seeding checks and merges are
        // case-insensitive.
        let mut headers: HashMap<String, String> = self
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        if let Some(request_headers) = &opts.headers {
            for (k, v) in request_headers {
                headers.insert(k.to_ascii_lowercase(), v.clone());
            }
        }

        let mut retry = self.retry.clone();
        if let Some(n) = opts.retry {
            retry.retry = n;
        }
        if let Some(ms) = opts.retry_delay_ms {
            retry.retry_delay_ms = ms;
        }
        if let Some(f) = opts.retry_delay_fn {
            retry.retry_delay_fn = Some(f);
        }
        if let Some(codes) = opts.retry_status_codes {
            retry.retry_status_codes = codes;
        }
        if let Some(b) = opts.backoff_type {
            retry.backoff_type = b;
        }
        if let Some(ms) = opts.backoff_max_delay_ms {
            retry.backoff_max_delay_ms = ms;
        }
        if let Some(delays) = opts.backoff_delays_ms {
            retry.backoff_delays_ms = delays;
        }
        if let Some(ms) = opts.initial_delay_ms {
            retry.initial_delay_ms = Some(ms);
        }
        if let Some(f) = opts.should_retry {
            retry.should_retry = Some(f);
        }

        let mut resolved = ResolvedRequest {
            url: url.to_string(),
            method,
            headers,
            body: opts.body,
            response_type: opts.response_type.unwrap_or(self.response_type),
            parse_response: opts.parse_response.or_else(|| self.parse_response.clone()),
            ignore_response_error: opts
                .ignore_response_error
                .unwrap_or(self.ignore_response_error),
            timeout_ms: opts.timeout_ms.unwrap_or(self.timeout_ms),
            retry,
            rate_limit: opts.rate_limit.or_else(|| self.rate_limit.clone()),
            debounce: opts.debounce.or_else(|| self.debounce.clone()),
            deduplicate: opts.deduplicate.or_else(|| self.deduplicate.clone()),
            hedging: opts.hedging.or_else(|| self.hedging.clone()),
            signal: opts.signal,
            driver: self.driver.clone(),
            verbose: self.verbose,
        };

        match compose_url(
            self.base_url.as_deref(),
            url,
            &self.query,
            opts.query.as_ref(),
        ) {
            Ok(composed) => {
                resolved.url = composed;
                Ok(resolved)
            }
            Err(message) => Err(FetchError::network(message, Arc::new(resolved), 0)),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("headers", &self.headers)
            .field("query", &self.query)
            .field("timeout_ms", &self.timeout_ms)
            .field("retry", &self.retry)
            .field("response_type", &self.response_type)
            .field("parse_response", &self.parse_response.as_ref().map(|_| "<fn>"))
            .field("ignore_response_error", &self.ignore_response_error)
            .field("rate_limit", &self.rate_limit)
            .field("debounce", &self.debounce)
            .field("deduplicate", &self.deduplicate)
            .field("hedging", &self.hedging)
            .field("stats_enabled", &self.stats_enabled)
            .field("verbose", &self.verbose)
            .field("driver", &self.driver.as_ref().map(|d| d.name()))
            .finish()
    }
}

/// Per-request overrides; every field is optional and wins over the client
/// config when present.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub headers: Option<HashMap<String, String>>,
    pub query: Option<HashMap<String, QueryValue>>,
    pub body: Option<RequestBody>,
    pub timeout_ms: Option<u64>,
    pub retry: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub retry_delay_fn: Option<RetryDelayFn>,
    pub retry_status_codes: Option<Vec<u16>>,
    pub backoff_type: Option<BackoffType>,
    pub backoff_max_delay_ms: Option<u64>,
    pub backoff_delays_ms: Option<Vec<u64>>,
    pub initial_delay_ms: Option<u64>,
    pub should_retry: Option<ShouldRetryFn>,
    pub response_type: Option<ResponseType>,
    pub parse_response: Option<ParseResponseFn>,
    pub ignore_response_error: Option<bool>,
    pub rate_limit: Option<RateLimitConfig>,
    pub debounce: Option<DebounceConfig>,
    pub deduplicate: Option<DedupConfig>,
    pub hedging: Option<HedgingConfig>,
    /// User cancellation token for this call.
    pub signal: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = Some(delay_ms);
        self
    }

    pub fn with_backoff_type(mut self, backoff_type: BackoffType) -> Self {
        self.backoff_type = Some(backoff_type);
        self
    }

    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = Some(response_type);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_debounce(mut self, debounce: DebounceConfig) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn with_deduplicate(mut self, deduplicate: DedupConfig) -> Self {
        self.deduplicate = Some(deduplicate);
        self
    }

    pub fn with_hedging(mut self, hedging: HedgingConfig) -> Self {
        self.hedging = Some(hedging);
        self
    }

    /// Seed a header only when the caller has not set it.
    pub(crate) fn seed_header(&mut self, name: &str, value: &str) {
        let headers = self.headers.get_or_insert_with(HashMap::new);
        let key = name.to_ascii_lowercase();
        headers.entry(key).or_insert_with(|| value.to_string());
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("headers", &self.headers)
            .field("query", &self.query)
            .field("body", &self.body)
            .field("timeout_ms", &self.timeout_ms)
            .field("retry", &self.retry)
            .field("response_type", &self.response_type)
            .field("ignore_response_error", &self.ignore_response_error)
            .finish_non_exhaustive()
    }
}

/// What the driver sees: fully composed URL, finalized headers, encoded body
/// directive, and all resilience parameters flattened.
#[derive(Clone)]
pub struct ResolvedRequest {
    /// Fully composed URL.
    pub url: String,
    pub method: Method,
    /// Finalized headers; names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: Option<RequestBody>,
    pub response_type: ResponseType,
    pub parse_response: Option<ParseResponseFn>,
    pub ignore_response_error: bool,
    pub timeout_ms: u64,
    pub retry: RetrySettings,
    pub rate_limit: Option<RateLimitConfig>,
    pub debounce: Option<DebounceConfig>,
    pub deduplicate: Option<DedupConfig>,
    pub hedging: Option<HedgingConfig>,
    pub signal: Option<CancellationToken>,
    pub driver: Option<Arc<dyn Driver>>,
    pub verbose: bool,
}

impl ResolvedRequest {
    /// A bare resolved request, used for error contexts created before or
    /// after the full resolution pipeline ran.
    pub fn minimal(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: HashMap::new(),
            body: None,
            response_type: ResponseType::Auto,
            parse_response: None,
            ignore_response_error: false,
            timeout_ms: 0,
            retry: RetrySettings::none(),
            rate_limit: None,
            debounce: None,
            deduplicate: None,
            hedging: None,
            signal: None,
            driver: None,
            verbose: false,
        }
    }

    /// Host + path of the composed URL, used as the stats endpoint label.
    pub fn endpoint(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(u) => format!("{}{}", u.host_str().unwrap_or(""), u.path()),
            Err(_) => self.url.clone(),
        }
    }
}

impl fmt::Debug for ResolvedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedRequest")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("response_type", &self.response_type)
            .field("ignore_response_error", &self.ignore_response_error)
            .field("timeout_ms", &self.timeout_ms)
            .field("retry", &self.retry)
            .field("rate_limit", &self.rate_limit)
            .field("debounce", &self.debounce)
            .field("deduplicate", &self.deduplicate)
            .field("hedging", &self.hedging)
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers_win_over_config() {
        let config = ClientConfig::new()
            .with_base_url("https://api.test")
            .with_header("X-Env", "prod")
            .with_header("X-Shared", "config");
        let opts = RequestOptions::new().with_header("x-shared", "request");

        let resolved = config.resolve(Method::GET, "/x", opts).unwrap();
        assert_eq!(resolved.headers.get("x-env").map(String::as_str), Some("prod"));
        assert_eq!(
            resolved.headers.get("x-shared").map(String::as_str),
            Some("request")
        );
    }

    #[test]
    fn test_per_request_timeout_and_retry_win() {
        let config = ClientConfig::new()
            .with_base_url("https://api.test")
            .with_timeout_ms(5_000)
            .with_retry(RetrySettings::standard());
        let opts = RequestOptions::new().with_timeout_ms(100).with_retry(7);

        let resolved = config.resolve(Method::GET, "/x", opts).unwrap();
        assert_eq!(resolved.timeout_ms, 100);
        assert_eq!(resolved.retry.retry, 7);
        // Untouched retry fields come from the config.
        assert_eq!(resolved.retry.retry_delay_ms, 250);
    }

    #[test]
    fn test_relative_url_without_base_fails() {
        let config = ClientConfig::new();
        let err = config
            .resolve(Method::GET, "/x", RequestOptions::new())
            .unwrap_err();
        assert_eq!(err.kind(), "NetworkError");
        assert_eq!(err.attempt(), 0);
    }

    #[test]
    fn test_seed_header_does_not_override() {
        let mut opts = RequestOptions::new().with_header("Accept", "text/csv");
        opts.seed_header("accept", "application/json");
        assert_eq!(
            opts.headers.as_ref().unwrap().get("accept").map(String::as_str),
            Some("text/csv")
        );
    }

    #[test]
    fn test_retry_presets() {
        assert_eq!(RetrySettings::none().retry, 0);
        assert_eq!(RetrySettings::standard().retry, 3);
        assert_eq!(RetrySettings::aggressive().retry, 5);
        assert_eq!(RetrySettings::conservative().retry, 2);
    }
}
