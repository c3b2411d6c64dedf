//! Trailing-edge debouncing of rapid identical requests
//!
//! Each incoming request arms a timer under its key and supersedes any
//! request already waiting there; the superseded caller settles with a
//! debounce-cancel abort. Only the request that survives the trailing delay
//! proceeds to the rest of the pipeline, so cancelled requests never enter
//! the retry loop. Distinct keys are independent.

use crate::config::ResolvedRequest;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn default_delay_ms() -> u64 {
    200
}

/// How debounce keys are derived from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DebounceKeyMode {
    Url,
    MethodUrl,
    MethodUrlBody,
}

impl Default for DebounceKeyMode {
    fn default() -> Self {
        Self::MethodUrl
    }
}

/// User-supplied key derivation.
pub type DebounceKeyFn = Arc<dyn Fn(&ResolvedRequest) -> String + Send + Sync>;

/// Debouncer configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Trailing-edge delay.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default)]
    pub key: DebounceKeyMode,

    /// Custom key function; overrides `key`.
    #[serde(skip)]
    pub key_fn: Option<DebounceKeyFn>,

    /// Methods that bypass the debouncer.
    #[serde(default)]
    pub exclude_methods: Vec<String>,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            key: DebounceKeyMode::default(),
            key_fn: None,
            exclude_methods: Vec::new(),
        }
    }
}

impl DebounceConfig {
    pub fn with_delay_ms(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::default()
        }
    }
}

impl fmt::Debug for DebounceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebounceConfig")
            .field("delay_ms", &self.delay_ms)
            .field("key", &self.key)
            .field("key_fn", &self.key_fn.as_ref().map(|_| "<fn>"))
            .field("exclude_methods", &self.exclude_methods)
            .finish()
    }
}

pub(crate) fn debounce_applies(cfg: &DebounceConfig, method: &Method) -> bool {
    !cfg
        .exclude_methods
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method.as_str()))
}

pub(crate) fn debounce_key(cfg: &DebounceConfig, req: &ResolvedRequest) -> String {
    if let Some(key_fn) = &cfg.key_fn {
        return key_fn(req);
    }
    match cfg.key {
        DebounceKeyMode::Url => req.url.clone(),
        DebounceKeyMode::MethodUrl => format!("{} {}", req.method, req.url),
        DebounceKeyMode::MethodUrlBody => format!(
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

/// How a debounced wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DebounceOutcome {
    /// The trailing delay elapsed; this request proceeds.
    Proceed,
    /// A newer identical request replaced this one.
    Superseded,
    /// The caller's own token fired.
    Aborted,
}

struct Slot {
    generation: u64,
    supersede: CancellationToken,
}

/// Per-client debounce map from key to the currently armed wait.
#[derive(Default)]
pub struct Debouncer {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    generations: AtomicU64,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the trailing-edge wait for `key`, superseding any wait already
    /// armed there.
    pub(crate) async fn pass(
        &self,
        key: String,
        delay_ms: u64,
        root: &CancellationToken,
    ) -> DebounceOutcome {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let supersede = CancellationToken::new();
        {
            let mut slots = self.slots.lock().unwrap();
            if let Some(prior) = slots.insert(
                key.clone(),
                Slot {
                    generation,
                    supersede: supersede.clone(),
                },
            ) {
                prior.supersede.cancel();
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                self.evict_if_current(&key, generation);
                DebounceOutcome::Proceed
            }
            _ = supersede.cancelled() => DebounceOutcome::Superseded,
            _ = root.cancelled() => {
                self.evict_if_current(&key, generation);
                DebounceOutcome::Aborted
            }
        }
    }

    /// Remove the slot only if it still belongs to this wait; a newer
    /// request may have replaced it already.
    fn evict_if_current(&self, key: &str, generation: u64) {
        let mut slots = self.slots.lock().unwrap();
        if slots.get(key).map(|s| s.generation) == Some(generation) {
            slots.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
