//! The driver abstraction: URL composition and the network call itself
//!
//! A driver turns a resolved request into a response or a normalized error.
//! The native driver wraps reqwest; alternatives may be supplied through the
//! `driver` config override but must leave retry timing entirely to the
//! orchestrator.

pub mod native;

pub use native::NativeDriver;

use crate::config::{QueryValue, ResolvedRequest};
use crate::error::FetchError;
use crate::response::FetchResponse;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Performs one network attempt.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Execute the request, honoring the attempt's cancellation token and
    /// the per-attempt timeout carried by the request.
    async fn perform(
        &self,
        req: &ResolvedRequest,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<FetchResponse, FetchError>;
}

/// Compose the final URL from an optional base, the request target, and the
/// merged query parameters.
///
/// Absolute targets are used unchanged; relative targets join the base with
/// exactly one `/` between them. Query parameters from config and request
/// are merged (request wins on key conflicts) and appended in sorted key
/// order so identical requests compose identical URLs. Array values produce
/// one occurrence per element.
pub fn compose_url(
    base: Option<&str>,
    target: &str,
    config_query: &HashMap<String, QueryValue>,
    request_query: Option<&HashMap<String, QueryValue>>,
) -> Result<String, String> {
    let mut url = match Url::parse(target) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base =
                base.ok_or_else(|| format!("relative URL '{}' requires a base_url", target))?;
            let joined = format!(
                "{}/{}",
                base.trim_end_matches('/'),
                target.trim_start_matches('/')
            );
            Url::parse(&joined).map_err(|e| format!("invalid URL '{}': {}", joined, e))?
        }
        Err(e) => return Err(format!("invalid URL '{}': {}", target, e)),
    };

    let mut merged: BTreeMap<&str, &QueryValue> = config_query
        .iter()
        .map(|(k, v)| (k.as_str(), v))
        .collect();
    if let Some(request_query) = request_query {
        for (k, v) in request_query {
            merged.insert(k.as_str(), v);
        }
    }

    if !merged.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in merged {
            match value {
                QueryValue::One(v) => {
                    pairs.append_pair(key, v);
                }
                QueryValue::Many(values) => {
                    for v in values {
                        pairs.append_pair(key, v);
                    }
                }
            }
        }
    }

    Ok(url.to_string())
}
