//! Template rendering, recursive render scopes, and the coordinator that
//! decides how a request leaves the server.

mod coordinator;
mod scope;
mod types;

pub use coordinator::{
    ActionFilter, ClientProfile, StreamCoordinator, StreamingCallback, StreamingPolicy,
};
pub use scope::{ErrorCallback, RenderScope};
pub use types::{
    CacheDirective, Locals, RenderError, RenderKind, RenderRequest, TemplateEngine, TemplateRef,
};
