//! Deduplication of concurrent identical requests
//!
//! All callers presenting the same key while a request is in flight await
//! one shared future and receive clones of the same outcome. Successful
//! outcomes stay cached for a short burst window; failures evict
//! immediately so the next caller retries.

use crate::config::ResolvedRequest;
use crate::error::FetchError;
use crate::response::FetchResponse;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

fn default_cache_ttl_ms() -> u64 {
    1_000
}

fn default_max_cache_size() -> usize {
    100
}

fn default_exclude_methods() -> Vec<String> {
    vec![
        "POST".to_string(),
        "PUT".to_string(),
        "PATCH".to_string(),
        "DELETE".to_string(),
    ]
}

/// How dedup keys are derived from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DedupKeyMode {
    Url,
    UrlMethod,
    /// Bodies are canonicalized (JSON keys sorted) before keying.
    UrlMethodBody,
}

impl Default for DedupKeyMode {
    fn default() -> Self {
        Self::UrlMethod
    }
}

/// User-supplied key derivation.
pub type DedupKeyFn = Arc<dyn Fn(&ResolvedRequest) -> String + Send + Sync>;

/// Deduplicator configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub key: DedupKeyMode,

    /// Custom key function; overrides `key`.
    #[serde(skip)]
    pub key_fn: Option<DedupKeyFn>,

    /// How long a successful outcome stays shareable after settling.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Bound on completed cached entries; oldest are evicted first.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Methods deduplicated even though the exclude list names them.
    #[serde(default)]
    pub allow_methods: Vec<String>,

    /// Methods that bypass dedup.
    #[serde(default = "default_exclude_methods")]
    pub exclude_methods: Vec<String>,

    /// Per-request escape hatch.
    #[serde(default)]
    pub disabled: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            key: DedupKeyMode::default(),
            key_fn: None,
            cache_ttl_ms: default_cache_ttl_ms(),
            max_cache_size: default_max_cache_size(),
            allow_methods: Vec::new(),
            exclude_methods: default_exclude_methods(),
            disabled: false,
        }
    }
}

impl fmt::Debug for DedupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupConfig")
            .field("key", &self.key)
            .field("key_fn", &self.key_fn.as_ref().map(|_| "<fn>"))
            .field("cache_ttl_ms", &self.cache_ttl_ms)
            .field("max_cache_size", &self.max_cache_size)
            .field("allow_methods", &self.allow_methods)
            .field("exclude_methods", &self.exclude_methods)
            .field("disabled", &self.disabled)
            .finish()
    }
}

/// Whether a request participates in deduplication.
pub(crate) fn dedup_applies(cfg: &DedupConfig, method: &Method) -> bool {
    if cfg.disabled {
        return false;
    }
    let name = method.as_str();
    if cfg.allow_methods.iter().any(|m| m.eq_ignore_ascii_case(name)) {
        return true;
    }
    !cfg
        .exclude_methods
        .iter()
        .any(|m| m.eq_ignore_ascii_case(name))
}

/// Derive the dedup key for a request.
pub(crate) fn dedup_key(cfg: &DedupConfig, req: &ResolvedRequest) -> String {
    if let Some(key_fn) = &cfg.key_fn {
        return key_fn(req);
    }
    match cfg.key {
        DedupKeyMode::Url => req.url.clone(),
        DedupKeyMode::UrlMethod => format!("{} {}", req.method, req.url),
        DedupKeyMode::UrlMethodBody => format!(
            "{} {} {}",
            req.method,
            req.url,
            req.body
                .as_ref()
                .map(|b| b.fingerprint())
                .unwrap_or_default()
        ),
    }
}

/// The future every coalesced caller awaits. Output is cloneable, so all
/// callers observe the identical outcome.
pub(crate) type SharedOutcome = Shared<BoxFuture<'static, Result<FetchResponse, FetchError>>>;

struct DedupEntry {
    future: SharedOutcome,
    settled_at: Option<Instant>,
    ttl_ms: u64,
    lru: u64,
}

#[derive(Default)]
struct DedupState {
    entries: HashMap<String, DedupEntry>,
    lru_counter: u64,
}

impl DedupState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| match entry.settled_at {
            Some(at) => (now.duration_since(at).as_millis() as u64) < entry.ttl_ms,
            None => true,
        });
    }

    fn evict_over_capacity(&mut self, max_cache_size: usize) {
        loop {
            let completed = self
                .entries
                .iter()
                .filter(|(_, e)| e.settled_at.is_some())
                .count();
            if completed <= max_cache_size {
                return;
            }
            let oldest = self
                .entries
                .iter()
                .filter(|(_, e)| e.settled_at.is_some())
                .min_by_key(|(_, e)| e.lru)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => return,
            }
        }
    }
}

/// Per-client dedup map from key to in-flight (or recently settled) shared
/// outcome.
#[derive(Default)]
pub struct Deduplicator {
    state: Arc<Mutex<DedupState>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight outcome under `key`, or start a new one built by
    /// `make`. Returns the shared outcome and whether this caller joined an
    /// existing one.
    pub(crate) fn join_or_create<F>(
        &self,
        key: &str,
        cfg: &DedupConfig,
        make: F,
    ) -> (SharedOutcome, bool)
    where
        F: FnOnce() -> BoxFuture<'static, Result<FetchResponse, FetchError>>,
    {
        {
            let mut state = self.state.lock().unwrap();
            state.purge_expired();
            state.lru_counter += 1;
            let stamp = state.lru_counter;
            if let Some(entry) = state.entries.get_mut(key) {
                entry.lru = stamp;
                return (entry.future.clone(), true);
            }
        }

        // Build the wrapper outside the lock; the settle hook evicts
        // failures and stamps successes for the TTL window.
        let settle_state = Arc::clone(&self.state);
        let settle_key = key.to_string();
        let inner = make();
        let wrapped: SharedOutcome = async move {
            let outcome = inner.await;
            let mut state = settle_state.lock().unwrap();
            match &outcome {
                Ok(_) => {
                    if let Some(entry) = state.entries.get_mut(&settle_key) {
                        entry.settled_at = Some(Instant::now());
                    }
                }
                Err(_) => {
                    state.entries.remove(&settle_key);
                }
            }
            outcome
        }
        .boxed()
        .shared();

        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(key) {
            // Another caller created the entry while we were building ours.
            return (entry.future.clone(), true);
        }
        state.lru_counter += 1;
        let lru = state.lru_counter;
        state.entries.insert(
            key.to_string(),
            DedupEntry {
                future: wrapped.clone(),
                settled_at: None,
                ttl_ms: cfg.cache_ttl_ms,
                lru,
            },
        );
        state.evict_over_capacity(cfg.max_cache_size);
        (wrapped, false)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }
}
