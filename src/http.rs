//! Response assembly helpers shared by buffered and streaming delivery.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use tracing::error;

use crate::render::{ClientProfile, RenderError};

/// Default content type for rendered pages.
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Builds a chunked response from a stream of body chunks.
///
/// The body carries no Content-Length, so hyper falls back to chunked
/// transfer encoding and every chunk reaches the wire as produced.
pub fn streaming_response(
    content_type: &str,
    chunks: impl Stream<Item = Bytes> + Send + 'static,
) -> Response {
    let body = Body::from_stream(chunks.map(Ok::<_, Infallible>));
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
    {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "failed to assemble streaming response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Builds a fully buffered response with an explicit Content-Length.
pub fn buffered_response(content_type: &str, output: String) -> Response {
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(output))
    {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "failed to assemble buffered response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Maps a render failure that escaped recovery to a plain 500.
pub fn error_response(err: &RenderError) -> Response {
    error!(error = %err, "render failed");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

/// Extracts the streaming-relevant client attributes from request headers.
pub fn client_profile(headers: &HeaderMap, trusted: bool) -> ClientProfile {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    ClientProfile {
        user_agent,
        trusted,
    }
}
