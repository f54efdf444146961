//! Streaming primitives: the chunked body, document position tracking, and
//! the overlays applied to the outgoing chunk sequence.

mod autoflush;
mod body;
mod cache;
mod document;
mod recovery;

pub use autoflush::batch_flushes;
pub use body::{PushHandle, StreamingBody};
pub use cache::{CacheStore, MemoryCacheStore, capture_into_cache};
pub use document::{DocumentState, DocumentTracker};
pub use recovery::{
    CapturedError, ErrorRenderer, ErrorSink, default_error_renderer, recover_errors,
};
