//! Response cache capture for streamed bodies.
//!
//! A streamed action cannot go through the buffered caching path, so the
//! overlay shadows the chunk sequence the client receives and commits the
//! concatenation once the stream completes.

use std::{collections::HashMap, sync::Arc};

use async_stream::stream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use metrics::counter;
use tokio::sync::RwLock;
use tracing::debug;

const METRIC_CACHE_COMMITS: &str = "rivolo_cache_commits_total";

/// Store for fully-assembled response bodies, keyed exactly as the buffered
/// caching path would key them.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn write(&self, key: &str, content: Bytes);
    async fn read(&self, key: &str) -> Option<Bytes>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn invalidate_all(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn write(&self, key: &str, content: Bytes) {
        self.entries.write().await.insert(key.to_string(), content);
    }

    async fn read(&self, key: &str) -> Option<Bytes> {
        self.entries.read().await.get(key).cloned()
    }
}

/// Forward `upstream` unmodified while accumulating a copy; commit the
/// concatenation under `key` once the stream completes. Dropping the stream
/// mid-way never writes, so partial content is never cached.
pub fn capture_into_cache<S>(
    upstream: S,
    store: Arc<dyn CacheStore>,
    key: String,
) -> impl Stream<Item = Bytes> + Send
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    stream! {
        let mut upstream = std::pin::pin!(upstream);
        let mut collected = BytesMut::new();
        while let Some(chunk) = upstream.next().await {
            collected.extend_from_slice(&chunk);
            yield chunk;
        }
        let content = collected.freeze();
        debug!(
            target: "rivolo::cache",
            key = %key,
            bytes = content.len(),
            "committing streamed response to cache",
        );
        counter!(METRIC_CACHE_COMMITS).increment(1);
        store.write(&key, content).await;
    }
}
