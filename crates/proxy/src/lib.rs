//! The protocol-translating core of crossbar.
//!
//! Clients speak the Anthropic Messages API against `POST /v1/messages`; the
//! configured backend speaks its own dialect. Per request the handler parses
//! the body, converts messages and tool schemas, opens the backend stream,
//! and drives the converter either into a buffered JSON envelope or through
//! the backpressure pipeline as SSE.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

mod backend;
mod chunk;
mod convert;
mod error;
mod http_client;
pub mod messages;
mod pipeline;
mod schema;
mod sse;
mod stream;

pub use chunk::{BackendChunk, BackendErrorKind, ChunkStream, ChunkUsage};
pub use convert::{ConvertError, ConvertIssue, ConvertedConversation, TranslateOptions, chat_request, messages_from_openai};
pub use error::{ProxyError, ProxyResult};
pub use schema::{SchemaDialect, SchemaError, adapt_schema, adapt_tool};
pub use stream::{MAX_CONTENT_BLOCKS, StreamConverter};

use backend::{Backend, RequestContext, extract_context};
use backend::{anthropic::AnthropicBackend, cluster::ClusterBackend, openai::OpenAiBackend};
use chunk::BackendChunk as Chunk;
use messages::anthropic::MessagesRequest;
use pipeline::StreamTimeouts;

const DEFAULT_LOCAL_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api";

/// Cancellation handles for the cluster's background tasks, surfaced so the
/// server can stop them in the documented order at shutdown.
pub struct ClusterHandles {
    /// Stops the coordinator consuming node events.
    pub coordinator: CancellationToken,
    /// Stops the health probe loop.
    pub health: CancellationToken,
    /// Stops the discovery refresh loop.
    pub discovery: CancellationToken,
}

/// The assembled proxy: an axum router plus the cluster task handles when
/// the backend is `mlx-cluster`.
pub struct ProxyApp {
    /// The client-facing router.
    pub router: Router,
    /// Present only in cluster mode.
    pub cluster: Option<ClusterHandles>,
}

struct ProxyState {
    backend: Arc<dyn Backend>,
    semaphore: Arc<Semaphore>,
    timeouts: StreamTimeouts,
    default_model: Option<String>,
    max_body_bytes: usize,
}

/// Build the proxy router for the configured backend. In cluster mode this
/// also starts the coordinator, health checker and discovery tasks.
pub fn build(config: &config::Config) -> anyhow::Result<ProxyApp> {
    let mut cluster_handles = None;

    let backend: Arc<dyn Backend> = match config.backend.kind {
        config::BackendKind::Claude => Arc::new(AnthropicBackend::new(&config.backend)),
        config::BackendKind::Local => {
            let url = config.backend.url.as_deref().unwrap_or(DEFAULT_LOCAL_URL);
            Arc::new(OpenAiBackend::new("local", url, &config.backend, true))
        }
        config::BackendKind::Openrouter => {
            let url = config.backend.url.as_deref().unwrap_or(DEFAULT_OPENROUTER_URL);
            Arc::new(OpenAiBackend::new("openrouter", url, &config.backend, false))
        }
        config::BackendKind::MlxCluster => {
            let (router, events_rx) = cluster::ClusterRouter::new(config.cluster.clone());

            let coordinator = CancellationToken::new();
            let health = CancellationToken::new();
            let discovery = CancellationToken::new();

            router.spawn_coordinator(events_rx, coordinator.clone());
            cluster::HealthChecker::new(router.clone()).spawn(health.clone());
            cluster::NodeDiscovery::new(router.clone()).spawn(discovery.clone());

            cluster_handles = Some(ClusterHandles {
                coordinator,
                health,
                discovery,
            });

            Arc::new(ClusterBackend::new(router, config.backend.clone()))
        }
    };

    log::info!("proxy translating for backend '{}'", config.backend.kind);

    let state = Arc::new(ProxyState {
        backend,
        semaphore: Arc::new(Semaphore::new(config.server.max_concurrent_requests)),
        timeouts: StreamTimeouts::from_config(&config.server),
        default_model: config.backend.model.clone(),
        max_body_bytes: config.server.max_body_bytes,
    });

    let router = Router::new()
        .route("/v1/messages", post(messages))
        .route("/v1/models", get(models))
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .with_state(state);

    Ok(ProxyApp {
        router,
        cluster: cluster_handles,
    })
}

/// Handle a Messages request, streaming or buffered.
async fn messages(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    payload: Result<Json<MessagesRequest>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let Json(request) = payload.map_err(|rejection| match rejection {
        JsonRejection::BytesRejection(_) => ProxyError::PayloadTooLarge(state.max_body_bytes),
        other => ProxyError::MalformedRequest(other.body_text()),
    })?;

    let permit = state
        .semaphore
        .clone()
        .try_acquire_owned()
        .map_err(|_| ProxyError::ConcurrencyExceeded)?;

    let context = extract_context(&headers);

    let display_model = request
        .model
        .clone()
        .or_else(|| state.default_model.clone())
        .unwrap_or_else(|| "unknown".to_string());

    log::debug!(
        "messages request: model={display_model}, {} message(s), stream={}",
        request.messages.len(),
        request.wants_stream()
    );

    let converter = StreamConverter::new(display_model.clone());

    if request.wants_stream() {
        // Headers go out immediately; keepalives and errors travel in-band
        // from here on.
        let backend = state.backend.clone();
        let cancel = CancellationToken::new();
        let open = async move { backend.open_stream(&request, &context).await };

        let rx = pipeline::spawn(open, converter, cancel.clone(), state.timeouts);

        Ok(pipeline::sse_response(rx, permit))
    } else {
        let response = buffered_response(&state, request, &context, converter, &display_model).await?;
        drop(permit);
        Ok(Json(response).into_response())
    }
}

/// Non-streaming mode: run the backend stream to completion into a buffer
/// and return one JSON envelope.
async fn buffered_response(
    state: &ProxyState,
    request: MessagesRequest,
    context: &RequestContext,
    mut converter: StreamConverter,
    display_model: &str,
) -> ProxyResult<messages::anthropic::MessagesResponse> {
    let mut chunks = tokio::time::timeout(
        state.timeouts.first_byte,
        state.backend.open_stream(&request, context),
    )
    .await
    .map_err(|_| ProxyError::BackendTimeout("no response from backend".to_string()))??;

    let mut events = vec![converter.open_event()];

    let drive = async {
        while let Some(chunk) = chunks.next().await {
            // Nothing has been written to the client yet, so a backend
            // failure can still become a proper HTTP error.
            if let Chunk::Error { kind, message } = chunk {
                return Err(error_from_chunk(kind, message));
            }

            events.extend(converter.on_chunk(chunk));
            if converter.finished() {
                break;
            }
        }
        Ok(())
    };

    tokio::time::timeout(state.timeouts.total, drive)
        .await
        .map_err(|_| ProxyError::BackendTimeout("total request timeout exceeded".to_string()))??;

    if !converter.finished() {
        events.extend(converter.on_chunk(Chunk::Finish {
            reason: messages::anthropic::StopReason::EndTurn,
            usage: None,
        }));
    }

    Ok(stream::collect_response(events, display_model))
}

fn error_from_chunk(kind: BackendErrorKind, message: String) -> ProxyError {
    match kind {
        BackendErrorKind::Unreachable => ProxyError::BackendUnreachable(message),
        BackendErrorKind::Timeout => ProxyError::BackendTimeout(message),
        BackendErrorKind::Protocol => ProxyError::BackendProtocol(message),
        BackendErrorKind::Canceled => ProxyError::Canceled,
    }
}

/// Health/model surface: the same shape the cluster probes expect from its
/// nodes, so a crossbar instance can sit behind another crossbar.
async fn models(State(state): State<Arc<ProxyState>>) -> Json<serde_json::Value> {
    let id = state.default_model.clone().unwrap_or_else(|| "default".to_string());

    Json(serde_json::json!({
        "object": "list",
        "data": [{"id": id, "object": "model", "created": 0, "owned_by": "crossbar"}]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{address}")
    }

    /// A minimal OpenAI-compatible mock: text then a tool call, as SSE.
    fn mock_openai() -> Router {
        Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let body = concat!(
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hello\"}}]}\n\n",
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" world\"}}]}\n\n",
                    "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
                    "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n",
                    "data: [DONE]\n\n",
                );
                ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
            }),
        )
    }

    async fn app_for(base_url: &str) -> Router {
        let config = config::Config {
            backend: config::BackendConfig {
                kind: config::BackendKind::Local,
                url: Some(base_url.to_string()),
                model: Some("qwen2.5-coder-32b".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        build(&config).unwrap().router
    }

    fn messages_request(stream: bool) -> Request<Body> {
        let body = json!({
            "model": "qwen2.5-coder-32b",
            "max_tokens": 128,
            "stream": stream,
            "messages": [{"role": "user", "content": "hi"}]
        });

        Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn streaming_end_to_end() {
        let base = serve(mock_openai()).await;
        let app = app_for(&base).await;

        let response = app.oneshot(messages_request(true)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = std::str::from_utf8(&body).unwrap();

        let order: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("event: "))
            .collect();
        assert_eq!(
            order,
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert!(text.contains(r#""text":"Hello""#));
        assert!(text.contains(r#""output_tokens":2"#));
    }

    #[tokio::test]
    async fn buffered_end_to_end() {
        let base = serve(mock_openai()).await;
        let app = app_for(&base).await;

        let response = app.oneshot(messages_request(false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let envelope: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(envelope["type"], "message");
        assert_eq!(envelope["role"], "assistant");
        assert_eq!(envelope["model"], "qwen2.5-coder-32b");
        assert_eq!(envelope["stop_reason"], "end_turn");
        assert_eq!(envelope["content"][0]["type"], "text");
        assert_eq!(envelope["content"][0]["text"], "Hello world");
        assert_eq!(envelope["usage"]["output_tokens"], 2);
    }

    #[tokio::test]
    async fn malformed_bodies_get_400() {
        let base = serve(mock_openai()).await;
        let app = app_for(&base).await;

        let request = Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let envelope: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(envelope["type"], "error");
        assert_eq!(envelope["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn unreachable_backend_is_503_when_buffered() {
        let app = app_for("http://127.0.0.1:1").await;

        let response = app.oneshot(messages_request(false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unreachable_backend_degrades_to_sse_error_when_streaming() {
        let app = app_for("http://127.0.0.1:1").await;

        let response = app.oneshot(messages_request(true)).await.unwrap();

        // Headers were already committed as 200; the failure is in-band.
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("event: error\n"));
        assert!(text.contains("event: message_stop\n"));
    }

    #[tokio::test]
    async fn concurrency_limit_returns_429() {
        let base = serve(mock_openai()).await;

        let config = config::Config {
            backend: config::BackendConfig {
                kind: config::BackendKind::Local,
                url: Some(base),
                ..Default::default()
            },
            server: config::ServerConfig {
                max_concurrent_requests: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        let app = build(&config).unwrap().router;

        let response = app.oneshot(messages_request(false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let envelope: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(envelope["error"]["type"], "rate_limit_error");
    }

    #[tokio::test]
    async fn models_surface_matches_the_probe_shape() {
        let base = serve(mock_openai()).await;
        let app = app_for(&base).await;

        let request = Request::builder()
            .method("GET")
            .uri("/v1/models")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let listing: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(listing["object"], "list");
        assert_eq!(listing["data"][0]["id"], "qwen2.5-coder-32b");
    }
}
