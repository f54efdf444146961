//! Per-request render scope: call-depth tracking, output buffering, the
//! flush/push primitives, and layout yield-point re-sequencing.

use std::sync::Arc;

use metrics::counter;
use tracing::error;

use crate::render::types::{
    Locals, RenderError, RenderKind, RenderRequest, TemplateEngine, TemplateRef,
};
use crate::stream::{CapturedError, ErrorSink, PushHandle};

const METRIC_RENDER_ERRORS: &str = "rivolo_render_errors_total";

/// Callback invoked for every captured rendering error.
pub type ErrorCallback = Arc<dyn Fn(&CapturedError) + Send + Sync>;

/// Where the enclosing layout's yielded content comes from.
#[derive(Debug, Clone)]
enum YieldPoint {
    /// Content already rendered (buffered mode).
    Buffered(String),
    /// Content still to be rendered. Streaming re-sequences the layout in
    /// front of its content so bytes leave in document order.
    Deferred(DeferredContent),
}

#[derive(Debug, Clone)]
struct DeferredContent {
    target: TemplateRef,
    locals: Locals,
}

/// Mutable state threaded through one recursive render. Confined to a single
/// request; never shared across calls.
pub struct RenderScope {
    engine: Arc<dyn TemplateEngine>,
    autoflush: bool,
    recovering: bool,
    sink: Option<PushHandle>,
    errors: Option<ErrorSink>,
    error_callbacks: Arc<Vec<ErrorCallback>>,
    buffer: String,
    depth: usize,
    capture_depth: usize,
    yield_point: Option<YieldPoint>,
}

impl RenderScope {
    pub(crate) fn streaming(
        engine: Arc<dyn TemplateEngine>,
        autoflush: bool,
        recovering: bool,
        sink: PushHandle,
        errors: ErrorSink,
        error_callbacks: Arc<Vec<ErrorCallback>>,
    ) -> Self {
        Self {
            engine,
            autoflush,
            recovering,
            sink: Some(sink),
            errors: Some(errors),
            error_callbacks,
            buffer: String::new(),
            depth: 0,
            capture_depth: 0,
            yield_point: None,
        }
    }

    pub(crate) fn buffered(engine: Arc<dyn TemplateEngine>) -> Self {
        Self {
            engine,
            autoflush: false,
            recovering: false,
            sink: None,
            errors: None,
            error_callbacks: Arc::new(Vec::new()),
            buffer: String::new(),
            depth: 0,
            capture_depth: 0,
            yield_point: None,
        }
    }

    /// True when output is being delivered incrementally.
    pub fn is_streaming(&self) -> bool {
        self.sink.is_some()
    }

    /// Current render call depth. Zero outside any render.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Append template output to the unsent buffer.
    pub fn write(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    /// Force everything buffered but unsent out to the client. A no-op when
    /// not streaming, while capturing for render-to-string, or when the
    /// buffer is empty.
    pub fn flush(&mut self) -> Result<(), RenderError> {
        if self.capture_depth > 0 || self.sink.is_none() || self.buffer.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buffer);
        self.push_raw(&data)
    }

    /// Send literal bytes to the client immediately, bypassing the buffer.
    /// Callers that need ordering relative to buffered output flush first.
    /// A no-op when not streaming.
    pub fn push_raw(&mut self, data: &str) -> Result<(), RenderError> {
        if self.capture_depth > 0 {
            return Ok(());
        }
        match self.sink.as_mut() {
            Some(sink) => sink.push(data),
            None => Ok(()),
        }
    }

    /// Drive one top-level render request to completion. The remaining unsent
    /// buffer is pushed as the final fragment; a rendering failure while
    /// recovery is active is captured so the recovery overlay can close out
    /// the document.
    pub(crate) fn run(&mut self, request: &RenderRequest) -> Result<(), RenderError> {
        let result = self.render_request(request);
        debug_assert_eq!(self.depth, 0);
        match result {
            Ok(()) => {
                let last = std::mem::take(&mut self.buffer);
                if let Some(sink) = self.sink.as_mut() {
                    sink.push(&last)?;
                }
                // Buffered renders keep the body in the buffer for
                // `into_output`.
                if self.sink.is_none() {
                    self.buffer = last;
                }
                Ok(())
            }
            Err(err) if self.captures(&err) => {
                self.buffer.clear();
                self.capture_error(&request_label(request), err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// The fully-rendered body of a buffered render.
    pub(crate) fn into_output(self) -> String {
        self.buffer
    }

    fn render_request(&mut self, request: &RenderRequest) -> Result<(), RenderError> {
        self.enter(|scope| {
            if !request.kind.streamable() {
                if let Some(body) = request.body.as_deref() {
                    scope.write(body);
                }
                return Ok(());
            }
            let target = target_of(request)?;
            match request.layout.as_deref() {
                Some(layout) => scope.render_in_layout(layout, &target, &request.locals),
                None => scope.render_target(&target, &request.locals),
            }
        })
    }

    /// Render a partial template. Errors other than the template-missing
    /// sentinel are captured at this boundary while streaming, so one failing
    /// partial cannot abort its siblings.
    pub fn render_partial(&mut self, name: &str, locals: &Locals) -> Result<(), RenderError> {
        let target = TemplateRef::Partial(name.to_string());
        self.enter(|scope| {
            if scope.autoflush_active() {
                scope.flush()?;
            }
            scope.recover_unit(name, |scope| scope.render_target(&target, locals))?;
            if scope.autoflush_active() {
                scope.flush()?;
            }
            Ok(())
        })
    }

    /// Render a partial wrapped in its own layout. Under streaming the layout
    /// still renders ahead of the deferred partial content.
    pub fn render_with_layout(
        &mut self,
        name: &str,
        layout: &str,
        locals: &Locals,
    ) -> Result<(), RenderError> {
        let target = TemplateRef::Partial(name.to_string());
        self.enter(|scope| {
            scope.recover_unit(name, |scope| scope.render_in_layout(layout, &target, locals))
        })
    }

    /// Render a request to a string without touching the client stream.
    /// Renders nested under this call are never considered top-level and
    /// never flush.
    pub fn render_to_string(&mut self, request: &RenderRequest) -> Result<String, RenderError> {
        self.capture(|scope| scope.render_request(request))
    }

    /// Render the enclosing layout's content at this position. Consumes the
    /// yield point: a layout yields its content at most once.
    pub fn yield_content(&mut self) -> Result<(), RenderError> {
        match self.yield_point.take() {
            None => Ok(()),
            Some(YieldPoint::Buffered(content)) => {
                self.buffer.push_str(&content);
                Ok(())
            }
            Some(YieldPoint::Deferred(content)) => {
                let label = content.target.name().to_string();
                self.enter(|scope| {
                    if scope.autoflush_active() {
                        scope.flush()?;
                    }
                    scope.recover_unit(&label, |scope| {
                        scope.render_target(&content.target, &content.locals)
                    })?;
                    if scope.autoflush_active() {
                        scope.flush()?;
                    }
                    Ok(())
                })
            }
        }
    }

    /// Render `target` wrapped in `layout`. Buffered renders produce the
    /// content first and hand it to the layout's yield point; streaming
    /// renders run the layout first and defer the content render to the
    /// yield point.
    fn render_in_layout(
        &mut self,
        layout: &str,
        target: &TemplateRef,
        locals: &Locals,
    ) -> Result<(), RenderError> {
        let yield_point = if self.is_streaming() && self.capture_depth == 0 {
            YieldPoint::Deferred(DeferredContent {
                target: target.clone(),
                locals: locals.clone(),
            })
        } else {
            let content = self.capture(|scope| scope.render_target(target, locals))?;
            YieldPoint::Buffered(content)
        };
        let layout_ref = TemplateRef::Layout(layout.to_string());
        self.with_yield_point(yield_point, |scope| scope.render_target(&layout_ref, locals))
    }

    fn render_target(&mut self, target: &TemplateRef, locals: &Locals) -> Result<(), RenderError> {
        let engine = self.engine.clone();
        engine.render(self, target, locals)
    }

    fn enter<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, RenderError>,
    ) -> Result<T, RenderError> {
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn capture(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(), RenderError>,
    ) -> Result<String, RenderError> {
        let saved = std::mem::take(&mut self.buffer);
        self.capture_depth += 1;
        let result = f(self);
        self.capture_depth -= 1;
        let captured = std::mem::replace(&mut self.buffer, saved);
        result.map(|()| captured)
    }

    /// Install `yield_point` for the duration of `f`, restoring the previous
    /// one on every exit path so enclosing layout renders keep theirs.
    fn with_yield_point<T>(
        &mut self,
        yield_point: YieldPoint,
        f: impl FnOnce(&mut Self) -> Result<T, RenderError>,
    ) -> Result<T, RenderError> {
        let saved = self.yield_point.replace(yield_point);
        let result = f(self);
        self.yield_point = saved;
        result
    }

    /// Run one render unit with error recovery: a captured error rolls the
    /// unit's unflushed output back and rendering continues without it.
    fn recover_unit(
        &mut self,
        label: &str,
        f: impl FnOnce(&mut Self) -> Result<(), RenderError>,
    ) -> Result<(), RenderError> {
        let mark = self.buffer.len();
        match f(self) {
            Ok(()) => Ok(()),
            Err(err) if self.captures(&err) => {
                self.buffer.truncate(mark);
                self.capture_error(label, err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// The missing-template sentinel always re-propagates (the engine uses it
    /// to fall back to another template source); a disconnect unwinds the
    /// whole render. Everything else is recoverable while streaming.
    fn captures(&self, err: &RenderError) -> bool {
        self.recovering && !err.is_missing() && !matches!(err, RenderError::Disconnected)
    }

    fn capture_error(&mut self, label: &str, err: RenderError) {
        error!(
            target: "rivolo::render",
            template = label,
            error = %err,
            "rendering error captured",
        );
        counter!(METRIC_RENDER_ERRORS).increment(1);
        let captured = CapturedError::new(label, err);
        for callback in self.error_callbacks.iter() {
            callback(&captured);
        }
        if let Some(errors) = self.errors.as_ref() {
            errors.push(captured);
        }
    }

    fn autoflush_active(&self) -> bool {
        self.autoflush && self.sink.is_some() && self.capture_depth == 0
    }
}

fn target_of(request: &RenderRequest) -> Result<TemplateRef, RenderError> {
    match request.kind {
        RenderKind::Template => request
            .template
            .clone()
            .map(TemplateRef::Template)
            .ok_or_else(|| RenderError::engine("render request missing template name")),
        RenderKind::Partial => request
            .template
            .clone()
            .map(TemplateRef::Partial)
            .ok_or_else(|| RenderError::engine("render request missing partial name")),
        RenderKind::Inline => request
            .inline
            .clone()
            .map(TemplateRef::Inline)
            .ok_or_else(|| RenderError::engine("render request missing inline source")),
        _ => Err(RenderError::engine("unstreamable kind has no template")),
    }
}

fn request_label(request: &RenderRequest) -> String {
    request
        .template
        .clone()
        .unwrap_or_else(|| "inline".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records the depth observed at each render boundary.
    struct DepthProbe {
        seen: Mutex<Vec<usize>>,
        fail_in: Option<&'static str>,
    }

    impl DepthProbe {
        fn new(fail_in: Option<&'static str>) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_in,
            }
        }
    }

    impl TemplateEngine for DepthProbe {
        fn render(
            &self,
            scope: &mut RenderScope,
            target: &TemplateRef,
            locals: &Locals,
        ) -> Result<(), RenderError> {
            self.seen
                .lock()
                .expect("probe lock")
                .push(scope.depth());
            if self.fail_in == Some(target.name()) {
                return Err(RenderError::template(target.name(), "boom"));
            }
            match target {
                TemplateRef::Template(name) if name == "outer" => {
                    scope.write("a");
                    scope.render_partial("middle", locals)?;
                    scope.write("d");
                    Ok(())
                }
                TemplateRef::Partial(name) if name == "middle" => {
                    scope.write("b");
                    scope.render_partial("leaf", locals)?;
                    Ok(())
                }
                TemplateRef::Partial(name) if name == "leaf" => {
                    scope.write("c");
                    Ok(())
                }
                other => Err(RenderError::missing(other.name())),
            }
        }
    }

    #[test]
    fn depth_balances_across_nested_renders() {
        let probe = Arc::new(DepthProbe::new(None));
        let mut scope = RenderScope::buffered(probe.clone());
        scope
            .run(&RenderRequest::template("outer"))
            .expect("render");
        assert_eq!(scope.depth(), 0);
        assert_eq!(*probe.seen.lock().expect("probe lock"), vec![1, 2, 3]);
        assert_eq!(scope.into_output(), "abcd");
    }

    #[test]
    fn depth_balances_when_a_nested_render_fails() {
        let probe = Arc::new(DepthProbe::new(Some("leaf")));
        let mut scope = RenderScope::buffered(probe);
        let err = scope
            .run(&RenderRequest::template("outer"))
            .expect_err("leaf failure propagates without recovery");
        assert!(matches!(err, RenderError::Template { .. }));
        assert_eq!(scope.depth(), 0);
    }

    #[test]
    fn flush_is_a_noop_without_a_streaming_body() {
        let probe = Arc::new(DepthProbe::new(None));
        let mut scope = RenderScope::buffered(probe);
        scope.write("kept");
        scope.flush().expect("flush");
        scope.push_raw("ignored").expect("push");
        assert_eq!(scope.into_output(), "kept");
    }

    #[test]
    fn unstreamable_kinds_render_their_literal_body() {
        let probe = Arc::new(DepthProbe::new(None));
        let mut scope = RenderScope::buffered(probe);
        scope
            .run(&RenderRequest::literal(RenderKind::Json, "{\"ok\":true}"))
            .expect("render");
        assert_eq!(scope.into_output(), "{\"ok\":true}");
    }
}
