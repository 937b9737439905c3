//! Cluster backend: routes each request to one local inference node and
//! retries open-errors on different healthy nodes.

use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;

use super::openai::OpenAiBackend;
use super::{Backend, RequestContext};
use cluster::{ClusterError, ClusterRouter, RouteKey};

use crate::chunk::{BackendChunk, ChunkStream};
use crate::error::{ProxyError, ProxyResult};
use crate::messages::anthropic::{MessagesRequest, SystemPrompt};

pub(crate) struct ClusterBackend {
    router: ClusterRouter,
    translation: config::BackendConfig,
}

impl ClusterBackend {
    pub fn new(router: ClusterRouter, translation: config::BackendConfig) -> Self {
        Self { router, translation }
    }

    fn route_key(&self, request: &MessagesRequest) -> RouteKey {
        let system = match &request.system {
            None => String::new(),
            Some(SystemPrompt::Text(text)) => text.clone(),
            Some(SystemPrompt::Blocks(blocks)) => blocks
                .iter()
                .map(|block| block.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        };

        let tool_names = request
            .tools
            .iter()
            .flatten()
            .map(|tool| tool.name.as_str());

        RouteKey::for_request(&system, tool_names, self.router.config().cache.hash_tools)
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    fn name(&self) -> &str {
        "mlx-cluster"
    }

    async fn open_stream(&self, request: &MessagesRequest, context: &RequestContext) -> ProxyResult<ChunkStream> {
        let routing = self.router.config().routing.clone();
        let route_key = self.route_key(request);

        let mut tried: Vec<String> = Vec::new();
        let mut last_error = None;

        // Open-errors retry on a different node; mid-stream failures do not
        // (the request is not idempotent once tokens flow).
        for attempt in 0..=routing.max_retries {
            if attempt > 0 {
                tokio::time::sleep(routing.retry_delay).await;
            }

            let selected = match self.router.select_node(Some(&route_key), &tried).await {
                Ok(selected) => selected,
                Err(ClusterError::NoHealthyNodes) => {
                    return Err(last_error.unwrap_or(ProxyError::NoHealthyNodes));
                }
            };

            let node = OpenAiBackend::new(
                selected.id.clone(),
                selected.url.as_str().trim_end_matches('/'),
                &self.translation,
                true,
            );

            match node.open_stream(request, context).await {
                Ok(stream) => {
                    return Ok(track_outcome(stream, self.router.clone(), selected));
                }
                Err(error) => {
                    log::warn!(
                        "cluster node '{}' failed to open a stream (attempt {}): {error}",
                        selected.id,
                        attempt + 1
                    );
                    self.router.record_failure(&selected.id).await;
                    tried.push(selected.id.clone());
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or(ProxyError::NoHealthyNodes))
    }
}

/// Wrap the node's chunk stream so the routing guard lives as long as the
/// stream, and the node's metrics see the outcome.
fn track_outcome(stream: ChunkStream, router: ClusterRouter, selected: cluster::SelectedNode) -> ChunkStream {
    let started = Instant::now();
    let node_id = selected.id.clone();
    let guard = selected.guard;

    let tracked = stream.map(move |chunk| {
        // The guard rides in the closure; it drops (and releases the
        // in-flight slot) when the stream does.
        let _held = &guard;

        match &chunk {
            BackendChunk::Finish { usage, .. } => {
                let router = router.clone();
                let id = node_id.clone();
                let latency = started.elapsed();
                let tokens = usage.map(|u| u64::from(u.output_tokens)).unwrap_or(0);
                tokio::spawn(async move {
                    router.record_success(&id, latency, tokens).await;
                });
            }
            BackendChunk::Error { .. } => {
                let router = router.clone();
                let id = node_id.clone();
                tokio::spawn(async move {
                    router.record_failure(&id).await;
                });
            }
            _ => {}
        }

        chunk
    });

    Box::pin(tracked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::{Router, routing::post};
    use cluster::{NodeEvent, ProbeOutcome};
    use config::{ClusterConfig, RoutingStrategy};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{address}")
    }

    fn sse_completion() -> Router {
        Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let body = concat!(
                    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ok\"}}]}\n\n",
                    "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
                    "data: [DONE]\n\n",
                );
                ([(axum::http::header::CONTENT_TYPE, "text/event-stream")], body).into_response()
            }),
        )
    }

    fn failing_completion() -> Router {
        Router::new().route(
            "/v1/chat/completions",
            post(|| async { StatusCode::SERVICE_UNAVAILABLE.into_response() }),
        )
    }

    async fn cluster_router(nodes: &[(&str, &str)]) -> ClusterRouter {
        let config = ClusterConfig {
            routing: config::RoutingConfig {
                strategy: RoutingStrategy::RoundRobin,
                retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
            ..Default::default()
        };

        let (router, _rx) = ClusterRouter::new(config);

        for (id, url) in nodes {
            router
                .apply_event(NodeEvent::Discovered {
                    id: id.to_string(),
                    url: url.parse().unwrap(),
                })
                .await;
            router
                .apply_event(NodeEvent::Probe {
                    id: id.to_string(),
                    outcome: ProbeOutcome::Success {
                        latency: Duration::from_millis(10),
                    },
                })
                .await;
        }

        router
    }

    fn request() -> MessagesRequest {
        serde_json::from_value(serde_json::json!({
            "model": "qwen2.5",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn open_error_retries_on_a_different_node() {
        let bad = serve(failing_completion()).await;
        let good = serve(sse_completion()).await;

        let router = cluster_router(&[("node-bad", &format!("{bad}/")), ("node-good", &format!("{good}/"))]).await;
        let backend = ClusterBackend::new(router.clone(), config::BackendConfig::default());

        let mut stream = backend
            .open_stream(&request(), &RequestContext::default())
            .await
            .expect("the healthy node should serve the request");

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }

        assert!(chunks.contains(&BackendChunk::TextDelta("ok".to_string())));

        // Round-robin tries node-bad first; the failure lands on its record.
        let snapshot = router.snapshot().await;
        let bad_node = snapshot.iter().find(|n| n.id == "node-bad").unwrap();
        assert_eq!(bad_node.metrics.failures, 1);
    }

    #[tokio::test]
    async fn all_nodes_down_is_no_healthy_nodes() {
        let router = cluster_router(&[]).await;
        let backend = ClusterBackend::new(router, config::BackendConfig::default());

        let error = match backend.open_stream(&request(), &RequestContext::default()).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };

        assert!(matches!(error, ProxyError::NoHealthyNodes));
    }

    #[tokio::test]
    async fn in_flight_slot_releases_when_the_stream_ends() {
        let good = serve(sse_completion()).await;
        let router = cluster_router(&[("node-0", &format!("{good}/"))]).await;
        let backend = ClusterBackend::new(router.clone(), config::BackendConfig::default());

        let mut stream = backend
            .open_stream(&request(), &RequestContext::default())
            .await
            .unwrap();

        {
            let snapshot = router.snapshot().await;
            assert_eq!(
                snapshot[0].in_flight.load(std::sync::atomic::Ordering::Relaxed),
                1
            );
        }

        while stream.next().await.is_some() {}
        drop(stream);

        let snapshot = router.snapshot().await;
        assert_eq!(
            snapshot[0].in_flight.load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }
}
