//! Scripted template engine for exercising the rendering pipeline without a
//! real template language.

// Not every test binary touches every helper.
#![allow(dead_code)]

use std::collections::HashMap;

use axum::response::Response;
use http_body_util::BodyExt;
use rivolo::render::{Locals, RenderError, RenderRequest, RenderScope, TemplateEngine, TemplateRef};

/// One step of a scripted template.
#[derive(Debug, Clone)]
pub enum Node {
    /// Append literal text to the output buffer.
    Text(&'static str),
    /// Force the buffered output out as a chunk.
    Flush,
    /// Yield the enclosing layout's content here.
    YieldContent,
    /// Render a partial by name.
    Partial(&'static str),
    /// Render a partial wrapped in its own layout.
    PartialInLayout {
        name: &'static str,
        layout: &'static str,
    },
    /// Render a partial to a string and append the result.
    Capture(&'static str),
    /// Append the string value of a local variable.
    Local(&'static str),
    /// Fail with a template error.
    Fail(&'static str),
}

/// Engine that replays scripted node sequences. Templates, partials, and
/// layouts live in separate namespaces, matching how a real engine resolves
/// them through different lookup paths.
#[derive(Default)]
pub struct ScriptEngine {
    scripts: HashMap<String, Vec<Node>>,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn template(mut self, name: &str, nodes: Vec<Node>) -> Self {
        self.scripts.insert(format!("template:{name}"), nodes);
        self
    }

    pub fn partial(mut self, name: &str, nodes: Vec<Node>) -> Self {
        self.scripts.insert(format!("partial:{name}"), nodes);
        self
    }

    pub fn layout(mut self, name: &str, nodes: Vec<Node>) -> Self {
        self.scripts.insert(format!("layout:{name}"), nodes);
        self
    }
}

impl TemplateEngine for ScriptEngine {
    fn render(
        &self,
        scope: &mut RenderScope,
        target: &TemplateRef,
        locals: &Locals,
    ) -> Result<(), RenderError> {
        let key = match target {
            TemplateRef::Template(name) => format!("template:{name}"),
            TemplateRef::Partial(name) => format!("partial:{name}"),
            TemplateRef::Layout(name) => format!("layout:{name}"),
            TemplateRef::Inline(source) => {
                scope.write(source);
                return Ok(());
            }
        };
        let nodes = self
            .scripts
            .get(&key)
            .ok_or_else(|| RenderError::missing(target.name()))?;
        for node in nodes {
            match node {
                Node::Text(text) => scope.write(text),
                Node::Flush => scope.flush()?,
                Node::YieldContent => scope.yield_content()?,
                Node::Partial(name) => scope.render_partial(name, locals)?,
                Node::PartialInLayout { name, layout } => {
                    scope.render_with_layout(name, layout, locals)?;
                }
                Node::Capture(name) => {
                    let captured = scope.render_to_string(&RenderRequest::partial(*name))?;
                    scope.write(&captured);
                }
                Node::Local(key) => {
                    if let Some(value) = locals.get(*key) {
                        match value.as_str() {
                            Some(text) => scope.write(text),
                            None => scope.write(&value.to_string()),
                        }
                    }
                }
                Node::Fail(message) => return Err(RenderError::template(target.name(), *message)),
            }
        }
        Ok(())
    }
}

/// Collects the response body preserving chunk boundaries.
pub async fn body_chunks(response: Response) -> Vec<String> {
    let mut body = response.into_body();
    let mut chunks = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.expect("body stream failed");
        if let Ok(data) = frame.into_data() {
            chunks.push(String::from_utf8(data.to_vec()).expect("non-utf8 chunk"));
        }
    }
    chunks
}

/// The whole response body as one string.
pub async fn body_string(response: Response) -> String {
    body_chunks(response).await.concat()
}
