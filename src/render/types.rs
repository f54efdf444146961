use serde_json::{Map, Value};
use thiserror::Error;

use crate::render::scope::RenderScope;

/// Local variables passed to a template.
pub type Locals = Map<String, Value>;

/// What kind of response body a render call produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderKind {
    /// A named template, optionally wrapped in a layout.
    Template,
    /// A partial template rendered as the top of the response.
    Partial,
    /// Inline template source supplied with the request.
    Inline,
    Text,
    Xml,
    Json,
    Script,
    Nothing,
    Update,
}

impl RenderKind {
    /// Raw, non-HTML, and scripted responses are always buffered; streaming
    /// them has nothing to gain and would defeat the padding negotiation.
    pub fn streamable(self) -> bool {
        matches!(
            self,
            RenderKind::Template | RenderKind::Partial | RenderKind::Inline
        )
    }

    pub fn default_content_type(self) -> &'static str {
        match self {
            RenderKind::Template | RenderKind::Partial | RenderKind::Inline | RenderKind::Nothing => {
                "text/html; charset=utf-8"
            }
            RenderKind::Text => "text/plain; charset=utf-8",
            RenderKind::Xml => "application/xml",
            RenderKind::Json => "application/json",
            RenderKind::Script | RenderKind::Update => "text/javascript",
        }
    }
}

/// Identifies the template a render call targets. The engine resolves
/// partials and layouts through its own lookup conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef {
    Template(String),
    Partial(String),
    Layout(String),
    Inline(String),
}

impl TemplateRef {
    pub fn name(&self) -> &str {
        match self {
            TemplateRef::Template(name)
            | TemplateRef::Partial(name)
            | TemplateRef::Layout(name) => name.as_str(),
            TemplateRef::Inline(_) => "inline",
        }
    }
}

/// Commit the fully-streamed response body under this key once the stream
/// completes, mirroring how the buffered caching path would key it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirective {
    pub key: String,
}

/// One render call as seen by the coordinator. Immutable for the duration of
/// the call.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub kind: RenderKind,
    pub template: Option<String>,
    pub inline: Option<String>,
    /// Literal body for the unstreamable kinds (text, xml, json, script).
    pub body: Option<String>,
    pub layout: Option<String>,
    pub locals: Locals,
    /// Explicit per-call streaming override; `None` defers to the policy.
    pub stream: Option<bool>,
    pub content_type: Option<String>,
    pub cache: Option<CacheDirective>,
}

impl RenderRequest {
    fn base(kind: RenderKind) -> Self {
        Self {
            kind,
            template: None,
            inline: None,
            body: None,
            layout: None,
            locals: Locals::new(),
            stream: None,
            content_type: None,
            cache: None,
        }
    }

    pub fn template(name: impl Into<String>) -> Self {
        let mut request = Self::base(RenderKind::Template);
        request.template = Some(name.into());
        request
    }

    pub fn partial(name: impl Into<String>) -> Self {
        let mut request = Self::base(RenderKind::Partial);
        request.template = Some(name.into());
        request
    }

    pub fn inline(source: impl Into<String>) -> Self {
        let mut request = Self::base(RenderKind::Inline);
        request.inline = Some(source.into());
        request
    }

    /// A raw response of the given unstreamable kind.
    pub fn literal(kind: RenderKind, body: impl Into<String>) -> Self {
        let mut request = Self::base(kind);
        request.body = Some(body.into());
        request
    }

    pub fn with_layout(mut self, layout: impl Into<String>) -> Self {
        self.layout = Some(layout.into());
        self
    }

    pub fn with_locals(mut self, locals: Locals) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache = Some(CacheDirective { key: key.into() });
        self
    }
}

/// Errors surfaced while producing output.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// Sentinel: the engine should fall back to another template source.
    /// Always re-propagated, never captured by error recovery.
    #[error("template `{name}` not found")]
    TemplateMissing { name: String },
    /// A template raised while producing its fragment.
    #[error("template `{template}` failed: {message}")]
    Template { template: String, message: String },
    /// The engine itself failed outside any single template.
    #[error("render engine failure: {message}")]
    Engine { message: String },
    /// The client went away before the response completed.
    #[error("client disconnected mid-stream")]
    Disconnected,
}

impl RenderError {
    pub fn missing(name: impl Into<String>) -> Self {
        Self::TemplateMissing { name: name.into() }
    }

    pub fn template(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::TemplateMissing { .. })
    }
}

/// External template engine boundary. Implementations resolve `target`,
/// evaluate it with `locals`, and write output through the scope. Templates
/// reach the streaming primitives the same way: `scope.flush()`,
/// `scope.render_partial(..)`, `scope.yield_content()`.
pub trait TemplateEngine: Send + Sync {
    fn render(
        &self,
        scope: &mut RenderScope,
        target: &TemplateRef,
        locals: &Locals,
    ) -> Result<(), RenderError>;
}
