//! Progressive template streaming for axum services.
//!
//! rivolo turns a tree of nested template and layout renders into an
//! incrementally-delivered chunked HTTP response. The render procedure stays
//! synchronous and recursive; a bounded channel hands each flushed fragment to
//! the transport, so bytes leave the server as soon as a template produces
//! them instead of after the whole page is buffered.
//!
//! The moving parts:
//!
//! - [`render::StreamCoordinator`] decides per request whether to stream or
//!   buffer, and assembles the overlay pipeline around the body.
//! - [`render::RenderScope`] threads flush/push primitives, call-depth
//!   tracking, and layout yield points through the recursive render.
//! - [`stream::StreamingBody`] bridges the blocking render procedure and the
//!   async chunk stream, applying the first-chunk padding policy.
//! - [`stream`] overlays add error recovery (injecting diagnostics at the
//!   latest safe structural position), time-boxed flush batching, and
//!   post-stream response caching.

pub mod config;
pub mod http;
pub mod render;
pub mod stream;
pub mod telemetry;
