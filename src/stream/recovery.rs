//! Mid-stream error recovery: buffers rendering errors captured during the
//! render and injects a diagnostic fragment at the latest safe structural
//! position in the already-flowing response.

use std::sync::{Arc, Mutex, MutexGuard};

use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::render::RenderError;
use crate::stream::document::{DocumentState, DocumentTracker};

const METRIC_ERRORS_INJECTED: &str = "rivolo_errors_injected_total";

/// A trailing `</body>` optionally followed by `</html>` at the very end of a
/// chunk is the only place a fragment can be inserted without corrupting the
/// document.
static INSERTION_POINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</body\s*>\s*(?:</html\s*>\s*)?\z").expect("valid regex"));

/// One captured rendering error awaiting injection.
#[derive(Debug, Clone)]
pub struct CapturedError {
    /// The template or partial the error surfaced in.
    pub template: String,
    pub error: RenderError,
}

impl CapturedError {
    pub fn new(template: impl Into<String>, error: RenderError) -> Self {
        Self {
            template: template.into(),
            error,
        }
    }
}

/// Ordered buffer of captured errors, shared between the render task and the
/// recovery overlay. Drained whenever an injection succeeds and once more at
/// end of stream.
#[derive(Clone, Default)]
pub struct ErrorSink {
    inner: Arc<Mutex<Vec<CapturedError>>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, error: CapturedError) {
        self.lock().push(error);
    }

    pub fn drain(&self) -> Vec<CapturedError> {
        std::mem::take(&mut *self.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CapturedError>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            // A panicked render task cannot leave the buffer inconsistent;
            // take the data as-is.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Renders captured errors into an HTML fragment for injection.
pub type ErrorRenderer = Arc<dyn Fn(&[CapturedError]) -> String + Send + Sync>;

/// Default diagnostic fragment: an `#uncaught_exceptions` block listing each
/// error with its message HTML-escaped.
pub fn default_error_renderer() -> ErrorRenderer {
    Arc::new(|errors| {
        let mut html = String::from("<div id=\"uncaught_exceptions\">");
        for error in errors {
            html.push_str("<div class=\"exception\"><h1>Unhandled exception</h1><p>");
            html.push_str(&escape_html(&error.error.to_string()));
            html.push_str("</p></div>");
        }
        html.push_str("</div>");
        html
    })
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Wrap `upstream` with error recovery. Chunks pass through with document
/// position tracking; when errors are pending and `show_errors` holds, the
/// rendered fragment is inserted before a trailing `</body>`, or synthesized
/// together with the missing closing tags once the stream ends. Untrusted
/// clients never see diagnostics, only the drained silence.
pub fn recover_errors<S>(
    upstream: S,
    errors: ErrorSink,
    renderer: ErrorRenderer,
    show_errors: bool,
) -> impl Stream<Item = Bytes> + Send
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    stream! {
        let mut upstream = std::pin::pin!(upstream);
        let mut tracker = DocumentTracker::new();
        while let Some(chunk) = upstream.next().await {
            let text = String::from_utf8_lossy(&chunk);
            tracker.advance(&text);
            if show_errors && !errors.is_empty() {
                if let Some(found) = INSERTION_POINT.find(&text) {
                    let pending = errors.drain();
                    counter!(METRIC_ERRORS_INJECTED).increment(pending.len() as u64);
                    let fragment = renderer(&pending);
                    let mut patched = String::with_capacity(text.len() + fragment.len());
                    patched.push_str(&text[..found.start()]);
                    patched.push_str(&fragment);
                    patched.push_str(&text[found.start()..]);
                    yield Bytes::from(patched);
                    continue;
                }
            }
            yield chunk;
        }

        let pending = errors.drain();
        if pending.is_empty() {
            return;
        }
        if show_errors {
            counter!(METRIC_ERRORS_INJECTED).increment(pending.len() as u64);
            let fragment = renderer(&pending);
            yield Bytes::from(closing_fragment(tracker.state(), &fragment));
        } else {
            debug!(
                target: "rivolo::recovery",
                count = pending.len(),
                "suppressing error diagnostics for untrusted client",
            );
        }
    }
}

/// Close out an incomplete document around the error fragment, based on how
/// far the stream got.
fn closing_fragment(state: DocumentState, errors_html: &str) -> String {
    const SYNTHETIC_HEAD: &str = "<head><title>Unhandled Exception</title></head>";
    match state {
        DocumentState::Start => {
            format!("<!DOCTYPE html><html>{SYNTHETIC_HEAD}<body>{errors_html}</body></html>")
        }
        DocumentState::BeforeHtml => {
            format!("<html>{SYNTHETIC_HEAD}<body>{errors_html}</body></html>")
        }
        DocumentState::BeforeHead => {
            format!("{SYNTHETIC_HEAD}<body>{errors_html}</body></html>")
        }
        DocumentState::InHead => format!("</head><body>{errors_html}</body></html>"),
        DocumentState::BetweenHeadAndBody => format!("<body>{errors_html}</body></html>"),
        DocumentState::InBody => format!("{errors_html}</body></html>"),
        DocumentState::AfterBody => format!("{errors_html}</html>"),
        DocumentState::AfterHtml => errors_html.to_string(),
    }
}
