//! Time-boxed chunk batching for autoflush-heavy renders.

use std::time::Duration;

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use metrics::counter;
use tokio::time::Instant;

const METRIC_BATCHES: &str = "rivolo_autoflush_batches_total";

/// Coalesce chunks arriving within `interval` of the last forwarded batch,
/// bounding per-chunk transport overhead when templates flush at high
/// frequency. A zero interval forwards every chunk as it arrives. Data is
/// never dropped or reordered; the final partial batch is always forwarded
/// when the upstream ends.
pub fn batch_flushes<S>(upstream: S, interval: Duration) -> impl Stream<Item = Bytes> + Send
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    stream! {
        let mut upstream = std::pin::pin!(upstream);
        let mut buffered = BytesMut::new();
        let mut due_at = Instant::now();
        while let Some(chunk) = upstream.next().await {
            buffered.extend_from_slice(&chunk);
            if Instant::now() >= due_at {
                counter!(METRIC_BATCHES).increment(1);
                yield buffered.split().freeze();
                due_at = Instant::now() + interval;
            }
        }
        if !buffered.is_empty() {
            counter!(METRIC_BATCHES).increment(1);
            yield buffered.split().freeze();
        }
    }
}
