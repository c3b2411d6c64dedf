//! Fetchkit Core Library
//!
//! A universal HTTP client: one ergonomic API over reqwest, augmented with a
//! pipeline of cross-cutting resilience and observability features — retry
//! with pluggable backoff, per-attempt timeouts, token-bucket rate limiting,
//! deduplication of in-flight identical requests, trailing-edge debouncing,
//! speculative request hedging, and structured statistics.
//!
//! ```no_run
//! use fetchkit_core::{Client, ClientConfig, RequestOptions, RetrySettings};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(
//!     ClientConfig::new()
//!         .with_base_url("https://api.example.com")
//!         .with_retry(RetrySettings::standard()),
//! )?;
//!
//! let user: serde_json::Value = client
//!     .get_json("/users/1", RequestOptions::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod body;
pub mod client;
pub mod config;
pub mod context;
pub mod debounce;
pub mod dedup;
pub mod driver;
pub mod error;
pub mod hedge;
pub mod plugin;
pub mod ratelimit;
pub mod response;
pub mod retry;
pub mod signal;
pub mod stats;

pub use backoff::BackoffType;
pub use body::{MultipartPart, RequestBody};
pub use client::{create_client, Client};
pub use config::{
    ClientConfig, QueryValue, RequestOptions, ResolvedRequest, RetrySettings,
    DEFAULT_RETRY_STATUS_CODES,
};
pub use context::Context;
pub use debounce::{DebounceConfig, DebounceKeyMode};
pub use dedup::{DedupConfig, DedupKeyMode};
pub use driver::{Driver, NativeDriver};
pub use error::{parse_retry_after, FetchError};
pub use hedge::{HedgeOutcome, HedgePolicy, HedgingConfig};
pub use plugin::{HookPlugin, LegacyPlugin, LoggingPlugin, Plugin, PluginPipeline};
pub use ratelimit::{RateLimitConfig, RateLimitScope, RateLimiter};
pub use response::{FetchResponse, ResponseData, ResponseParts, ResponseType};
pub use retry::{default_should_retry, is_idempotent, IDEMPOTENT_METHODS};
pub use stats::{
    StatsCounters, StatsDimension, StatsEvent, StatsFilter, StatsHub, StatsMetric, StatsQuery,
    StatsReport, StatsSnapshot, TimeWindow,
};

// HTTP methods are reqwest's; re-exported so callers need no direct
// dependency for the common case.
pub use reqwest::Method;

/// The version of the fetchkit core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
