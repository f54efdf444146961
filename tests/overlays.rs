//! The overlay stack around the raw chunk stream: autoflush batching, cache
//! capture, and delivery through an axum router.

mod support;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, header};
use axum::response::Response;
use axum::routing::get;
use bytes::Bytes;
use rivolo::config::{PaddingRule, PaddingTable, StreamSettings};
use rivolo::render::{ClientProfile, RenderRequest, StreamCoordinator, StreamingPolicy};
use rivolo::stream::{CacheStore, MemoryCacheStore};
use support::{Node, ScriptEngine, body_chunks, body_string};
use tower::ServiceExt;

fn flushing_page() -> ScriptEngine {
    ScriptEngine::new()
        .template(
            "page",
            vec![Node::Text("a"), Node::Partial("inner"), Node::Text("c")],
        )
        .partial("inner", vec![Node::Text("b")])
}

fn coordinator(engine: ScriptEngine, settings: StreamSettings) -> StreamCoordinator {
    StreamCoordinator::new(Arc::new(engine), settings).with_policy(StreamingPolicy::all())
}

#[tokio::test]
async fn autoflush_flushes_around_each_partial() {
    let settings = StreamSettings {
        autoflush: Some(Duration::ZERO),
        ..StreamSettings::default()
    };
    let coordinator = coordinator(flushing_page(), settings);

    let chunks = body_chunks(coordinator.respond(
        "show",
        RenderRequest::template("page"),
        &ClientProfile::default(),
    ))
    .await;
    assert_eq!(
        chunks,
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
}

#[tokio::test]
async fn autoflush_interval_coalesces_the_tail() {
    let settings = StreamSettings {
        autoflush: Some(Duration::from_secs(60)),
        ..StreamSettings::default()
    };
    let coordinator = coordinator(flushing_page(), settings);

    let chunks = body_chunks(coordinator.respond(
        "show",
        RenderRequest::template("page"),
        &ClientProfile::default(),
    ))
    .await;
    // First chunk immediately, the rest batched until the stream ends.
    assert_eq!(chunks, vec!["a".to_string(), "bc".to_string()]);
}

#[tokio::test]
async fn no_autoflush_means_no_intermediate_chunks() {
    let coordinator = coordinator(flushing_page(), StreamSettings::default());

    let chunks = body_chunks(coordinator.respond(
        "show",
        RenderRequest::template("page"),
        &ClientProfile::default(),
    ))
    .await;
    assert_eq!(chunks, vec!["abc".to_string()]);
}

#[tokio::test]
async fn streamed_body_is_committed_under_the_cache_key() {
    let store = Arc::new(MemoryCacheStore::new());
    let coordinator =
        coordinator(flushing_page(), StreamSettings::default()).with_cache(store.clone());
    let request = RenderRequest::template("page").with_cache_key("page:1");

    let body = body_string(coordinator.respond("show", request, &ClientProfile::default())).await;
    assert_eq!(body, "abc");
    assert_eq!(store.read("page:1").await, Some(Bytes::from("abc")));
}

#[tokio::test]
async fn requests_without_a_directive_are_not_cached() {
    let store = Arc::new(MemoryCacheStore::new());
    let coordinator =
        coordinator(flushing_page(), StreamSettings::default()).with_cache(store.clone());

    let body = body_string(coordinator.respond(
        "show",
        RenderRequest::template("page"),
        &ClientProfile::default(),
    ))
    .await;
    assert_eq!(body, "abc");
    assert!(store.read("page:1").await.is_none());
}

#[tokio::test]
async fn injected_diagnostics_never_reach_the_cache() {
    let engine = ScriptEngine::new()
        .template(
            "page",
            vec![
                Node::Text("<html><head></head><body>"),
                Node::Partial("broken"),
                Node::Text("</body></html>"),
            ],
        )
        .partial("broken", vec![Node::Fail("boom")]);
    let store = Arc::new(MemoryCacheStore::new());
    let coordinator = coordinator(engine, StreamSettings::default())
        .with_cache(store.clone())
        .render_errors_with(|errors| format!("({})", errors.len()));
    let request = RenderRequest::template("page").with_cache_key("page:err");
    let client = ClientProfile {
        user_agent: None,
        trusted: true,
    };

    let body = body_string(coordinator.respond("show", request, &client)).await;
    assert_eq!(body, "<html><head></head><body>(1)</body></html>");
    // The cache holds what rendering produced, not the injected fragment.
    assert_eq!(
        store.read("page:err").await,
        Some(Bytes::from("<html><head></head><body></body></html>"))
    );
}

fn demo_router() -> Router {
    let engine = ScriptEngine::new()
        .layout(
            "app",
            vec![
                Node::Text("<html><head></head><body>"),
                Node::Flush,
                Node::YieldContent,
                Node::Text("</body></html>"),
            ],
        )
        .template("page", vec![Node::Text("content")]);
    let settings = StreamSettings {
        padding: PaddingTable::new(vec![PaddingRule {
            contains: "TestUA".to_string(),
            threshold: 100,
        }]),
        ..StreamSettings::default()
    };
    let coordinator = Arc::new(
        StreamCoordinator::new(Arc::new(engine), settings).with_policy(StreamingPolicy::all()),
    );

    async fn show(State(coordinator): State<Arc<StreamCoordinator>>, request: Request<Body>) -> Response {
        let client = rivolo::http::client_profile(request.headers(), false);
        coordinator.respond(
            "show",
            RenderRequest::template("page").with_layout("app"),
            &client,
        )
    }

    Router::new().route("/", get(show)).with_state(coordinator)
}

#[tokio::test]
async fn routed_request_streams_a_padded_html_response() {
    let response = demo_router()
        .oneshot(
            Request::builder()
                .uri("/")
                .header(header::USER_AGENT, "TestUA/1.0")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("router");

    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/html; charset=utf-8"
    );
    assert!(response.headers().get(header::CONTENT_LENGTH).is_none());

    let chunks = body_chunks(response).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].len(), 100);
    assert!(chunks[0].starts_with("<html><head></head><body><!--"));
    assert_eq!(chunks[1], "content</body></html>");
}

#[tokio::test]
async fn routed_request_without_padding_rule_is_untouched() {
    let response = demo_router()
        .oneshot(
            Request::builder()
                .uri("/")
                .header(header::USER_AGENT, "curl/8.0")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("router");

    let chunks = body_chunks(response).await;
    assert_eq!(
        chunks,
        vec![
            "<html><head></head><body>".to_string(),
            "content</body></html>".to_string(),
        ]
    );
}
