//! The client façade: verb helpers, typed helpers, plugin registration,
//! runtime reconfiguration, and the wiring of the resilience layers.
//!
//! Per request, control flows: config merge -> debouncer -> deduplicator ->
//! rate limiter -> retry orchestrator (plugins -> driver or hedger ->
//! plugins) -> caller.

use crate::body::{MultipartPart, RequestBody};
use crate::config::{ClientConfig, RequestOptions, ResolvedRequest};
use crate::context::Context;
use crate::debounce::{self, DebounceOutcome, Debouncer};
use crate::dedup::{self, Deduplicator};
use crate::driver::{Driver, NativeDriver};
use crate::error::FetchError;
use crate::plugin::{Plugin, PluginPipeline};
use crate::ratelimit::{AcquireError, RateLimiter};
use crate::response::{FetchResponse, ResponseType};
use crate::retry::RetryOrchestrator;
use crate::signal;
use crate::stats::{RequestSample, StatsEvent, StatsHub};
use bytes::Bytes;
use futures::FutureExt;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Create a client from a config; the factory form of [`Client::new`].
pub fn create_client(config: ClientConfig) -> Result<Client, String> {
    Client::new(config)
}

/// A universal HTTP client with a resilience pipeline.
///
/// Cheap to clone; clones share configuration, plugins, the rate limiter's
/// buckets, the dedup map, the debounce map, and the stats hub.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: RwLock<ClientConfig>,
    pipeline: RwLock<Arc<PluginPipeline>>,
    native: Arc<dyn Driver>,
    limiter: RwLock<Option<RateLimiter>>,
    dedup: Deduplicator,
    debouncer: Debouncer,
    stats: Arc<StatsHub>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, String> {
        let native: Arc<dyn Driver> = Arc::new(NativeDriver::new()?);
        let limiter = config.rate_limit.clone().map(RateLimiter::new);
        let stats = Arc::new(StatsHub::new(config.stats_enabled));
        Ok(Self {
            inner: Arc::new(ClientInner {
                config: RwLock::new(config),
                pipeline: RwLock::new(Arc::new(PluginPipeline::new())),
                native,
                limiter: RwLock::new(limiter),
                dedup: Deduplicator::new(),
                debouncer: Debouncer::new(),
                stats,
            }),
        })
    }

    pub fn with_defaults() -> Result<Self, String> {
        Self::new(ClientConfig::default())
    }

    /// Register a plugin. Plugins run in registration order on the request
    /// side and reverse registration order on the response side.
    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> &Self {
        let mut pipeline = self.inner.pipeline.write().unwrap();
        let mut plugins = pipeline.plugins().to_vec();
        plugins.push(plugin);
        *pipeline = Arc::new(PluginPipeline::with_plugins(plugins));
        self
    }

    /// A snapshot of the current configuration.
    pub fn config(&self) -> ClientConfig {
        self.inner.config.read().unwrap().clone()
    }

    /// Replace the configuration, reconfiguring the resilience features in
    /// place. `update_config(client.config())` changes nothing.
    pub fn update_config(&self, config: ClientConfig) {
        {
            let mut limiter = self.inner.limiter.write().unwrap();
            match (&*limiter, &config.rate_limit) {
                (Some(existing), Some(cfg)) => existing.reconfigure(cfg.clone()),
                (None, Some(cfg)) => *limiter = Some(RateLimiter::new(cfg.clone())),
                (Some(_), None) => *limiter = None,
                (None, None) => {}
            }
        }
        self.inner.stats.set_enabled(config.stats_enabled);
        *self.inner.config.write().unwrap() = config;
    }

    /// Edit the configuration through a closure and apply the result.
    pub fn configure(&self, edit: impl FnOnce(&mut ClientConfig)) {
        let mut config = self.config();
        edit(&mut config);
        self.update_config(config);
    }

    /// The stats hub for this client.
    pub fn stats(&self) -> Arc<StatsHub> {
        Arc::clone(&self.inner.stats)
    }

    /// Dispatch a request through the full pipeline.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        opts: RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        Arc::clone(&self.inner)
            .dispatch(method, url.to_string(), opts)
            .await
    }

    pub async fn get(&self, url: &str, opts: RequestOptions) -> Result<FetchResponse, FetchError> {
        self.request(Method::GET, url, opts).await
    }

    pub async fn post(
        &self,
        url: &str,
        body: impl Into<RequestBody>,
        mut opts: RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        opts.body = Some(body.into());
        self.request(Method::POST, url, opts).await
    }

    pub async fn put(
        &self,
        url: &str,
        body: impl Into<RequestBody>,
        mut opts: RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        opts.body = Some(body.into());
        self.request(Method::PUT, url, opts).await
    }

    pub async fn patch(
        &self,
        url: &str,
        body: impl Into<RequestBody>,
        mut opts: RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        opts.body = Some(body.into());
        self.request(Method::PATCH, url, opts).await
    }

    pub async fn delete(
        &self,
        url: &str,
        opts: RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        self.request(Method::DELETE, url, opts).await
    }

    pub async fn head(&self, url: &str, opts: RequestOptions) -> Result<FetchResponse, FetchError> {
        self.request(Method::HEAD, url, opts).await
    }

    pub async fn options(
        &self,
        url: &str,
        opts: RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        self.request(Method::OPTIONS, url, opts).await
    }

    /// GET and deserialize the JSON body. Seeds `Accept: application/json`
    /// and the JSON response type unless already set.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        mut opts: RequestOptions,
    ) -> Result<T, FetchError> {
        opts.seed_header("accept", "application/json");
        if opts.response_type.is_none() {
            opts.response_type = Some(ResponseType::Json);
        }
        let res = self.request(Method::GET, url, opts).await?;
        res.json::<T>().map_err(|e| {
            FetchError::parse(
                e.to_string(),
                None,
                Arc::new(ResolvedRequest::minimal(Method::GET, url)),
                1,
            )
        })
    }

    /// GET and return the body as text.
    pub async fn get_text(&self, url: &str, mut opts: RequestOptions) -> Result<String, FetchError> {
        if opts.response_type.is_none() {
            opts.response_type = Some(ResponseType::Text);
        }
        let res = self.request(Method::GET, url, opts).await?;
        Ok(res.data.as_text().unwrap_or_default().to_string())
    }

    /// GET and return the raw body bytes.
    pub async fn get_bytes(&self, url: &str, mut opts: RequestOptions) -> Result<Bytes, FetchError> {
        if opts.response_type.is_none() {
            opts.response_type = Some(ResponseType::Blob);
        }
        let res = self.request(Method::GET, url, opts).await?;
        Ok(res.data.as_bytes().cloned().unwrap_or_default())
    }

    /// GET an XML document as text. Seeds `Accept: application/xml`.
    pub async fn get_xml(&self, url: &str, mut opts: RequestOptions) -> Result<String, FetchError> {
        opts.seed_header("accept", "application/xml");
        if opts.response_type.is_none() {
            opts.response_type = Some(ResponseType::Xml);
        }
        let res = self.request(Method::GET, url, opts).await?;
        Ok(res.data.as_text().unwrap_or_default().to_string())
    }

    /// GET an HTML document as text. Seeds `Accept: text/html`.
    pub async fn get_html(&self, url: &str, mut opts: RequestOptions) -> Result<String, FetchError> {
        opts.seed_header("accept", "text/html");
        if opts.response_type.is_none() {
            opts.response_type = Some(ResponseType::Html);
        }
        let res = self.request(Method::GET, url, opts).await?;
        Ok(res.data.as_text().unwrap_or_default().to_string())
    }

    /// GET newline-delimited JSON as text; the caller splits lines. Seeds
    /// `Accept: application/x-ndjson`.
    pub async fn get_ndjson(
        &self,
        url: &str,
        mut opts: RequestOptions,
    ) -> Result<String, FetchError> {
        opts.seed_header("accept", "application/x-ndjson");
        if opts.response_type.is_none() {
            opts.response_type = Some(ResponseType::Ndjson);
        }
        let res = self.request(Method::GET, url, opts).await?;
        Ok(res.data.as_text().unwrap_or_default().to_string())
    }

    /// POST a JSON-serializable value.
    pub async fn post_json(
        &self,
        url: &str,
        body: impl Serialize,
        mut opts: RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        let value = serde_json::to_value(body).map_err(|e| {
            FetchError::parse(
                format!("failed to serialize request body: {}", e),
                None,
                Arc::new(ResolvedRequest::minimal(Method::POST, url)),
                0,
            )
        })?;
        opts.seed_header("accept", "application/json");
        opts.body = Some(RequestBody::Json(value));
        self.request(Method::POST, url, opts).await
    }

    /// POST a URL-encoded form.
    pub async fn post_form(
        &self,
        url: &str,
        fields: Vec<(String, String)>,
        mut opts: RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        opts.body = Some(RequestBody::Form(fields));
        self.request(Method::POST, url, opts).await
    }

    /// POST a multipart form.
    pub async fn post_multipart(
        &self,
        url: &str,
        parts: Vec<MultipartPart>,
        mut opts: RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        opts.body = Some(RequestBody::Multipart(parts));
        self.request(Method::POST, url, opts).await
    }

    /// POST a SOAP envelope. Seeds `Content-Type: text/xml` and the XML
    /// response type.
    pub async fn post_soap(
        &self,
        url: &str,
        envelope: impl Into<String>,
        mut opts: RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        opts.seed_header("content-type", "text/xml; charset=utf-8");
        opts.seed_header("accept", "text/xml");
        if opts.response_type.is_none() {
            opts.response_type = Some(ResponseType::Xml);
        }
        opts.body = Some(RequestBody::Text(envelope.into()));
        self.request(Method::POST, url, opts).await
    }
}

impl ClientInner {
    async fn dispatch(
        self: Arc<Self>,
        method: Method,
        url: String,
        opts: RequestOptions,
    ) -> Result<FetchResponse, FetchError> {
        let config = self.config.read().unwrap().clone();
        let resolved = config.resolve(method, &url, opts)?;
        self.stats.event(StatsEvent::Enqueued);
        debug!("{} {} enqueued", resolved.method, resolved.url);

        let root = signal::root_signal(resolved.signal.as_ref());

        if let Some(db) = resolved.debounce.clone() {
            if debounce::debounce_applies(&db, &resolved.method) {
                let key = debounce::debounce_key(&db, &resolved);
                match self.debouncer.pass(key, db.delay_ms, &root).await {
                    DebounceOutcome::Proceed => {}
                    DebounceOutcome::Superseded => {
                        self.stats.event(StatsEvent::Debounced);
                        return Err(FetchError::abort(
                            Some("debounced".to_string()),
                            Arc::new(resolved),
                            0,
                        ));
                    }
                    DebounceOutcome::Aborted => {
                        return Err(FetchError::abort(None, Arc::new(resolved), 0));
                    }
                }
            }
        }

        if let Some(dd) = resolved.deduplicate.clone() {
            if dedup::dedup_applies(&dd, &resolved.method) {
                let key = dedup::dedup_key(&dd, &resolved);
                let leader = Arc::clone(&self);
                let leader_req = resolved.clone();
                let leader_root = root.clone();
                let (shared, joined) = self.dedup.join_or_create(&key, &dd, move || {
                    leader.admit_and_run(leader_req, leader_root).boxed()
                });
                if joined {
                    self.stats.event(StatsEvent::Deduplicated);
                }
                return shared.await;
            }
        }

        self.admit_and_run(resolved, root).await
    }

    async fn admit_and_run(
        self: Arc<Self>,
        resolved: ResolvedRequest,
        root: CancellationToken,
    ) -> Result<FetchResponse, FetchError> {
        let began = Instant::now();

        let limiter = self.limiter.read().unwrap().clone();
        let permit = match (&limiter, &resolved.rate_limit) {
            (Some(limiter), Some(participation)) => {
                match limiter
                    .acquire(participation, &resolved.url, &resolved.method, &root)
                    .await
                {
                    Ok(Some(permit)) => {
                        if permit.waited {
                            self.stats.event(StatsEvent::RateLimited);
                        }
                        Some(permit)
                    }
                    Ok(None) => None,
                    Err(AcquireError::QueueFull { scope_key }) => {
                        self.stats.event(StatsEvent::RateLimited);
                        self.stats.event(StatsEvent::Failed);
                        return Err(FetchError::rate_limit(scope_key, Arc::new(resolved), 0));
                    }
                    Err(AcquireError::Aborted) => {
                        return Err(FetchError::abort(None, Arc::new(resolved), 0));
                    }
                }
            }
            _ => None,
        };

        let driver = resolved
            .driver
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.native));
        let pipeline = Arc::clone(&*self.pipeline.read().unwrap());
        let orchestrator = RetryOrchestrator {
            driver,
            pipeline,
            stats: Arc::clone(&self.stats),
        };

        let endpoint = resolved.endpoint();
        let method_label = resolved.method.to_string();
        let mut ctx = Context::with_root(resolved, root);
        let result = orchestrator.run(&mut ctx).await;
        drop(permit);

        match &result {
            Ok(res) => {
                self.stats.event(StatsEvent::Succeeded);
                if let Some(hedging) = &res.hedging {
                    for _ in 1..hedging.attempts {
                        self.stats.event(StatsEvent::HedgeLaunched);
                    }
                    if hedging.winner > 0 {
                        self.stats.event(StatsEvent::HedgeWon);
                    }
                }
                self.stats.record_outcome(RequestSample {
                    endpoint,
                    method: method_label,
                    status: Some(res.status),
                    duration_ms: began.elapsed().as_millis() as u64,
                    attempts: ctx.attempt,
                    error_kind: None,
                });
            }
            Err(err) => {
                self.stats.event(StatsEvent::Failed);
                if let FetchError::Hedging { errors, .. } = err {
                    for _ in 1..errors.len() {
                        self.stats.event(StatsEvent::HedgeLaunched);
                    }
                }
                self.stats.record_outcome(RequestSample {
                    endpoint,
                    method: method_label,
                    status: err.status(),
                    duration_ms: began.elapsed().as_millis() as u64,
                    attempts: err.attempt(),
                    error_kind: Some(err.kind().to_string()),
                });
            }
        }

        result
    }
}
