//! Plugin hooks and the ordered pipeline that runs them around each attempt
//!
//! Plugins compose like wrapping middleware: `on_request` runs in
//! registration order, `on_response` and `on_response_error` in reverse
//! registration order, so the first plugin to touch the request is the last
//! to touch the response. The full hook cycle re-runs on every attempt;
//! plugins that mint per-attempt resources must key off `ctx.attempt`.

use crate::config::ResolvedRequest;
use crate::context::Context;
use crate::error::FetchError;
use crate::response::FetchResponse;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// A participant in the request pipeline.
///
/// All hooks are optional; the defaults do nothing. A hook that returns an
/// error causes the remainder of its chain to be skipped; the error becomes
/// `ctx.error` and is handed to the error chain.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str {
        "anonymous"
    }

    /// Runs before the driver, in registration order.
    async fn on_request(&self, _ctx: &mut Context) -> Result<(), FetchError> {
        Ok(())
    }

    /// Runs after a successful attempt, in reverse registration order.
    async fn on_response(&self, _ctx: &mut Context) -> Result<(), FetchError> {
        Ok(())
    }

    /// Runs after a failed attempt, in reverse registration order. Returning
    /// an error replaces `ctx.error`.
    async fn on_response_error(&self, _ctx: &mut Context) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Ordered collection of registered plugins.
#[derive(Default)]
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugins(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub(crate) fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Run the request chain. The first hook error short-circuits the chain
    /// and is returned for the error chain to consume.
    pub async fn run_request(&self, ctx: &mut Context) -> Result<(), FetchError> {
        for plugin in &self.plugins {
            if let Err(e) = plugin.on_request(ctx).await {
                warn!(
                    "plugin '{}' failed in on_request [request_id: {}]: {}",
                    plugin.name(),
                    ctx.request_id,
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run the response chain in reverse order. The first hook error is
    /// returned; the caller clears `ctx.res` and re-enters the error chain.
    pub async fn run_response(&self, ctx: &mut Context) -> Result<(), FetchError> {
        for plugin in self.plugins.iter().rev() {
            if let Err(e) = plugin.on_response(ctx).await {
                warn!(
                    "plugin '{}' failed in on_response [request_id: {}]: {}",
                    plugin.name(),
                    ctx.request_id,
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run the error chain in reverse order. A hook error replaces
    /// `ctx.error` and skips the remainder of the chain.
    pub async fn run_response_error(&self, ctx: &mut Context) {
        for plugin in self.plugins.iter().rev() {
            if let Err(e) = plugin.on_response_error(ctx).await {
                debug!(
                    "plugin '{}' replaced the error [request_id: {}]",
                    plugin.name(),
                    ctx.request_id
                );
                ctx.error = Some(e);
                return;
            }
        }
    }
}

type HookFn = Arc<dyn Fn(&mut Context) -> Result<(), FetchError> + Send + Sync>;

/// A plugin assembled from optional closures, for callers that do not want
/// to implement [`Plugin`] themselves. Closures are synchronous; implement
/// the trait directly when a hook needs to await.
#[derive(Clone, Default)]
pub struct HookPlugin {
    name: String,
    on_request: Option<HookFn>,
    on_response: Option<HookFn>,
    on_response_error: Option<HookFn>,
}

impl HookPlugin {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn on_request(
        mut self,
        f: impl Fn(&mut Context) -> Result<(), FetchError> + Send + Sync + 'static,
    ) -> Self {
        self.on_request = Some(Arc::new(f));
        self
    }

    pub fn on_response(
        mut self,
        f: impl Fn(&mut Context) -> Result<(), FetchError> + Send + Sync + 'static,
    ) -> Self {
        self.on_response = Some(Arc::new(f));
        self
    }

    pub fn on_response_error(
        mut self,
        f: impl Fn(&mut Context) -> Result<(), FetchError> + Send + Sync + 'static,
    ) -> Self {
        self.on_response_error = Some(Arc::new(f));
        self
    }
}

#[async_trait]
impl Plugin for HookPlugin {
    fn name(&self) -> &str {
        if self.name.is_empty() {
            "anonymous"
        } else {
            &self.name
        }
    }

    async fn on_request(&self, ctx: &mut Context) -> Result<(), FetchError> {
        match &self.on_request {
            Some(f) => f(ctx),
            None => Ok(()),
        }
    }

    async fn on_response(&self, ctx: &mut Context) -> Result<(), FetchError> {
        match &self.on_response {
            Some(f) => f(ctx),
            None => Ok(()),
        }
    }

    async fn on_response_error(&self, ctx: &mut Context) -> Result<(), FetchError> {
        match &self.on_response_error {
            Some(f) => f(ctx),
            None => Ok(()),
        }
    }
}

type SuccessHook =
    Arc<dyn Fn(FetchResponse, &ResolvedRequest) -> Result<FetchResponse, FetchError> + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&FetchError, &ResolvedRequest) -> Result<(), FetchError> + Send + Sync>;

/// Backward-compatibility shim for the legacy `on_success` / `on_error`
/// plugin shape.
///
/// `on_success` maps onto `on_response`: its return value replaces
/// `ctx.res`. `on_error` maps onto `on_response_error`: returning an error
/// replaces `ctx.error`.
#[derive(Clone, Default)]
pub struct LegacyPlugin {
    name: String,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
}

impl LegacyPlugin {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn on_success(
        mut self,
        f: impl Fn(FetchResponse, &ResolvedRequest) -> Result<FetchResponse, FetchError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(&FetchError, &ResolvedRequest) -> Result<(), FetchError> + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

#[async_trait]
impl Plugin for LegacyPlugin {
    fn name(&self) -> &str {
        if self.name.is_empty() {
            "legacy"
        } else {
            &self.name
        }
    }

    async fn on_response(&self, ctx: &mut Context) -> Result<(), FetchError> {
        if let Some(hook) = &self.on_success {
            if let Some(res) = ctx.res.take() {
                ctx.res = Some(hook(res, &ctx.req)?);
            }
        }
        Ok(())
    }

    async fn on_response_error(&self, ctx: &mut Context) -> Result<(), FetchError> {
        if let (Some(hook), Some(err)) = (&self.on_error, ctx.error.as_ref()) {
            hook(err, &ctx.req)?;
        }
        Ok(())
    }
}

/// Built-in plugin that logs the lifecycle of every attempt with the
/// request id for correlation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingPlugin;

#[async_trait]
impl Plugin for LoggingPlugin {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_request(&self, ctx: &mut Context) -> Result<(), FetchError> {
        debug!(
            "{} {} attempt {} [request_id: {}]",
            ctx.req.method, ctx.req.url, ctx.attempt, ctx.request_id
        );
        Ok(())
    }

    async fn on_response(&self, ctx: &mut Context) -> Result<(), FetchError> {
        if let Some(res) = &ctx.res {
            debug!(
                "{} {} -> {} [request_id: {}]",
                ctx.req.method, ctx.req.url, res.status, ctx.request_id
            );
        }
        Ok(())
    }

    async fn on_response_error(&self, ctx: &mut Context) -> Result<(), FetchError> {
        if let Some(err) = &ctx.error {
            warn!(
                "{} {} failed with {} on attempt {} [request_id: {}]",
                ctx.req.method,
                ctx.req.url,
                err.kind(),
                ctx.attempt,
                ctx.request_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        async fn on_request(&self, _ctx: &mut Context) -> Result<(), FetchError> {
            self.log.lock().unwrap().push(format!("req:{}", self.label));
            Ok(())
        }

        async fn on_response(&self, _ctx: &mut Context) -> Result<(), FetchError> {
            self.log.lock().unwrap().push(format!("res:{}", self.label));
            Ok(())
        }

        async fn on_response_error(&self, _ctx: &mut Context) -> Result<(), FetchError> {
            self.log.lock().unwrap().push(format!("err:{}", self.label));
            Ok(())
        }
    }

    fn test_context() -> Context {
        Context::new(ResolvedRequest::minimal(Method::GET, "https://api.test/x"))
    }

    fn recording_pipeline(log: &Arc<Mutex<Vec<String>>>) -> PluginPipeline {
        let mut pipeline = PluginPipeline::new();
        for label in ["p1", "p2", "p3"] {
            pipeline.register(Arc::new(Recorder {
                label,
                log: Arc::clone(log),
            }));
        }
        pipeline
    }

    #[tokio::test]
    async fn test_request_chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = recording_pipeline(&log);
        let mut ctx = test_context();

        pipeline.run_request(&mut ctx).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["req:p1", "req:p2", "req:p3"]);
    }

    #[tokio::test]
    async fn test_response_chains_run_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = recording_pipeline(&log);
        let mut ctx = test_context();

        pipeline.run_response(&mut ctx).await.unwrap();
        pipeline.run_response_error(&mut ctx).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["res:p3", "res:p2", "res:p1", "err:p3", "err:p2", "err:p1"]
        );
    }

    #[tokio::test]
    async fn test_request_hook_error_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = PluginPipeline::new();
        let log1 = Arc::clone(&log);
        pipeline.register(Arc::new(
            HookPlugin::named("first").on_request(move |ctx| {
                log1.lock().unwrap().push("first".to_string());
                Err(ctx.network_error("boom"))
            }),
        ));
        let log2 = Arc::clone(&log);
        pipeline.register(Arc::new(HookPlugin::named("second").on_request(
            move |_ctx| {
                log2.lock().unwrap().push("second".to_string());
                Ok(())
            },
        )));

        let mut ctx = test_context();
        let err = pipeline.run_request(&mut ctx).await.unwrap_err();
        assert_eq!(err.kind(), "NetworkError");
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_error_hook_replaces_error_and_stops_chain() {
        let mut pipeline = PluginPipeline::new();
        pipeline.register(Arc::new(HookPlugin::named("unreached").on_response_error(
            |_ctx| {
                panic!("chain should have stopped before the first-registered plugin");
            },
        )));
        pipeline.register(Arc::new(HookPlugin::named("replacer").on_response_error(
            |ctx| Err(ctx.network_error("replaced")),
        )));

        let mut ctx = test_context();
        ctx.error = Some(ctx.network_error("original"));
        pipeline.run_response_error(&mut ctx).await;

        let err = ctx.error.unwrap();
        assert!(err.to_string().contains("replaced"));
    }

    #[tokio::test]
    async fn test_legacy_on_success_replaces_response() {
        use crate::response::ResponseData;

        let plugin = LegacyPlugin::named("shim").on_success(|mut res, _req| {
            res.status_text = "Rewritten".to_string();
            Ok(res)
        });

        let mut ctx = test_context();
        ctx.res = Some(FetchResponse {
            status: 200,
            status_text: "OK".to_string(),
            headers: Default::default(),
            data: ResponseData::Empty,
            hedging: None,
        });

        plugin.on_response(&mut ctx).await.unwrap();
        assert_eq!(ctx.res.unwrap().status_text, "Rewritten");
    }
}
