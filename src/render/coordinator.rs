//! The streaming render coordinator: decides buffered vs streamed delivery
//! per request and assembles the overlay pipeline around a streaming body.

use std::sync::Arc;

use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::debug;

use crate::config::StreamSettings;
use crate::http;
use crate::render::scope::{ErrorCallback, RenderScope};
use crate::render::types::{RenderError, RenderRequest, TemplateEngine};
use crate::stream::{
    CacheStore, CapturedError, ErrorRenderer, ErrorSink, StreamingBody, batch_flushes,
    capture_into_cache, default_error_renderer, recover_errors,
};

/// Client attributes that shape streaming behaviour.
#[derive(Debug, Clone, Default)]
pub struct ClientProfile {
    /// Raw User-Agent header, used for padding threshold negotiation.
    pub user_agent: Option<String>,
    /// Trusted clients (e.g. loopback requests) may receive inline error
    /// diagnostics when rendering fails mid-stream.
    pub trusted: bool,
}

/// Callback invoked once per top-level streamed render, after the streaming
/// decision and strictly before the first byte can be sent. Any state that
/// feeds response headers — session cookies, CSRF tokens, flash — must be
/// finalized here, because headers are committed when the first chunk goes
/// out.
pub type StreamingCallback = Arc<dyn Fn(&RenderRequest) + Send + Sync>;

/// Which actions stream by default.
#[derive(Debug, Clone, Default)]
pub enum ActionFilter {
    #[default]
    All,
    Only(Vec<String>),
    Except(Vec<String>),
}

/// Controller-level streaming declaration. An explicit
/// [`RenderRequest::stream`] flag always wins over the policy.
#[derive(Debug, Clone)]
pub struct StreamingPolicy {
    enabled: bool,
    filter: ActionFilter,
}

impl StreamingPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            filter: ActionFilter::All,
        }
    }

    pub fn all() -> Self {
        Self {
            enabled: true,
            filter: ActionFilter::All,
        }
    }

    pub fn only<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: true,
            filter: ActionFilter::Only(actions.into_iter().map(Into::into).collect()),
        }
    }

    pub fn except<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: true,
            filter: ActionFilter::Except(actions.into_iter().map(Into::into).collect()),
        }
    }

    pub fn applies_to(&self, action: &str) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.filter {
            ActionFilter::All => true,
            ActionFilter::Only(names) => names.iter().any(|name| name == action),
            ActionFilter::Except(names) => !names.iter().any(|name| name == action),
        }
    }
}

impl Default for StreamingPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Coordinates one template engine, a streaming policy, and the overlay
/// stack. One coordinator serves many requests; per-request state lives in
/// the [`RenderScope`] and the overlays.
pub struct StreamCoordinator {
    engine: Arc<dyn TemplateEngine>,
    settings: StreamSettings,
    policy: StreamingPolicy,
    streaming_callbacks: Vec<StreamingCallback>,
    error_callbacks: Vec<ErrorCallback>,
    error_renderer: ErrorRenderer,
    cache: Option<Arc<dyn CacheStore>>,
}

impl StreamCoordinator {
    pub fn new(engine: Arc<dyn TemplateEngine>, settings: StreamSettings) -> Self {
        Self {
            engine,
            settings,
            policy: StreamingPolicy::default(),
            streaming_callbacks: Vec::new(),
            error_callbacks: Vec::new(),
            error_renderer: default_error_renderer(),
            cache: None,
        }
    }

    pub fn with_policy(mut self, policy: StreamingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    /// Register a callback run once per top-level streamed render, before the
    /// first byte can leave.
    pub fn on_streaming_render(
        mut self,
        callback: impl Fn(&RenderRequest) + Send + Sync + 'static,
    ) -> Self {
        self.streaming_callbacks.push(Arc::new(callback));
        self
    }

    /// Register a callback run for every captured rendering error. This is
    /// the hook for external error reporting.
    pub fn on_render_error(
        mut self,
        callback: impl Fn(&CapturedError) + Send + Sync + 'static,
    ) -> Self {
        self.error_callbacks.push(Arc::new(callback));
        self
    }

    /// Override the renderer that turns captured errors into the injected
    /// HTML fragment.
    pub fn render_errors_with(
        mut self,
        renderer: impl Fn(&[CapturedError]) -> String + Send + Sync + 'static,
    ) -> Self {
        self.error_renderer = Arc::new(renderer);
        self
    }

    /// Decide whether this top-level request streams. Nested renders never
    /// reach this point; they inherit the in-flight decision through the
    /// scope.
    pub fn should_stream(&self, action: &str, request: &RenderRequest) -> bool {
        if !request.kind.streamable() {
            return false;
        }
        match request.stream {
            Some(explicit) => explicit,
            None => self.policy.applies_to(action),
        }
    }

    /// Render `request` fully buffered.
    pub fn render_buffered(&self, request: &RenderRequest) -> Result<String, RenderError> {
        let mut scope = RenderScope::buffered(self.engine.clone());
        scope.run(request)?;
        Ok(scope.into_output())
    }

    /// Entry point for one controller action: renders the request either
    /// buffered or streamed and assembles the HTTP response. Must run inside
    /// a tokio runtime; the streaming render procedure occupies a blocking
    /// task.
    pub fn respond(&self, action: &str, request: RenderRequest, client: &ClientProfile) -> Response {
        let content_type = request
            .content_type
            .clone()
            .unwrap_or_else(|| request.kind.default_content_type().to_string());

        if !self.should_stream(action, &request) {
            return match self.render_buffered(&request) {
                Ok(body) => http::buffered_response(&content_type, body),
                Err(err) => http::error_response(&err),
            };
        }

        let threshold = self
            .settings
            .padding
            .threshold(client.user_agent.as_deref(), Some(&content_type));
        debug!(
            target: "rivolo::render",
            action,
            threshold,
            "streaming render selected",
        );

        // Header-affecting state must be finalized before the body starts.
        for callback in &self.streaming_callbacks {
            callback(&request);
        }

        let cache_plan = match (&self.cache, &request.cache) {
            (Some(store), Some(directive)) => Some((store.clone(), directive.key.clone())),
            _ => None,
        };

        let errors = ErrorSink::new();
        let engine = self.engine.clone();
        let autoflush = self.settings.autoflush.is_some();
        let recovering = self.settings.recover_errors;
        let error_callbacks = Arc::new(self.error_callbacks.clone());
        let scope_errors = errors.clone();
        let body = StreamingBody::spawn(threshold, move |push| {
            let mut scope = RenderScope::streaming(
                engine,
                autoflush,
                recovering,
                push,
                scope_errors,
                error_callbacks,
            );
            scope.run(&request)
        });

        // Cache capture sees the raw chunk sequence, batching coalesces, and
        // recovery injects last so diagnostics are never cached.
        let mut chunks: BoxStream<'static, Bytes> = body.into_stream().boxed();
        if let Some((store, key)) = cache_plan {
            chunks = capture_into_cache(chunks, store, key).boxed();
        }
        if let Some(interval) = self.settings.autoflush {
            chunks = batch_flushes(chunks, interval).boxed();
        }
        let show_errors =
            self.settings.show_errors.allows(client.trusted) && self.settings.recover_errors;
        let chunks = recover_errors(chunks, errors, self.error_renderer.clone(), show_errors);
        http::streaming_response(&content_type, chunks)
    }
}
