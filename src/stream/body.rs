//! Streaming body: a bounded channel between the blocking render procedure
//! and the async chunk stream handed to the transport.

use async_stream::stream;
use bytes::Bytes;
use futures::Stream;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::render::RenderError;

const METRIC_CHUNKS_PUSHED: &str = "rivolo_chunks_pushed_total";
const METRIC_PADDING_BYTES: &str = "rivolo_padding_bytes_total";

// Anything shorter is not worth the 7 bytes of comment syntax.
const MIN_PADDING: usize = 8;

/// The render side of a streaming body. Applies the first-chunk padding
/// policy, then hands chunks to the transport in push order.
pub struct PushHandle {
    tx: mpsc::Sender<Bytes>,
    bytes_to_threshold: usize,
}

impl PushHandle {
    pub fn push(&mut self, data: &str) -> Result<(), RenderError> {
        if data.is_empty() {
            return Ok(());
        }
        let chunk = if self.bytes_to_threshold > 0 {
            let padded = pad(data, self.bytes_to_threshold);
            self.bytes_to_threshold = 0;
            padded
        } else {
            Bytes::copy_from_slice(data.as_bytes())
        };
        counter!(METRIC_CHUNKS_PUSHED).increment(1);
        self.tx
            .blocking_send(chunk)
            .map_err(|_| RenderError::Disconnected)
    }
}

/// Right-pad the first chunk out to the negotiated threshold with an HTML
/// comment so browsers that sniff or buffer small initial responses start
/// rendering immediately.
fn pad(data: &str, threshold: usize) -> Bytes {
    let padding = threshold.saturating_sub(data.len());
    if padding < MIN_PADDING {
        return Bytes::copy_from_slice(data.as_bytes());
    }
    counter!(METRIC_PADDING_BYTES).increment(padding as u64);
    let mut chunk = String::with_capacity(data.len() + padding);
    chunk.push_str(data);
    chunk.push_str("<!--");
    chunk.push_str(&"+".repeat(padding - 7));
    chunk.push_str("-->");
    Bytes::from(chunk)
}

/// One streaming response body. Constructed with the padding threshold and
/// the render procedure; consumed exactly once by the transport.
pub struct StreamingBody {
    rx: mpsc::Receiver<Bytes>,
}

impl StreamingBody {
    /// Spawn `procedure` on a blocking task and return the body reading its
    /// pushes. The channel holds a single chunk, so the producer parks until
    /// the transport consumes the previous one; that handoff is the only
    /// suspension point in the render.
    pub fn spawn<F>(threshold: usize, procedure: F) -> Self
    where
        F: FnOnce(PushHandle) -> Result<(), RenderError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let handle = PushHandle {
            tx,
            bytes_to_threshold: threshold,
        };
        tokio::task::spawn_blocking(move || match procedure(handle) {
            Ok(()) => {}
            Err(RenderError::Disconnected) => {
                debug!(target: "rivolo::stream", "client went away mid-stream");
            }
            Err(err) => {
                error!(
                    target: "rivolo::stream",
                    error = %err,
                    "streaming render procedure failed",
                );
            }
        });
        Self { rx }
    }

    /// Chunk sequence in push order. Ends when the render procedure finishes
    /// and drops its handle.
    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send {
        let mut rx = self.rx;
        stream! {
            while let Some(chunk) = rx.recv().await {
                yield chunk;
            }
        }
    }
}
