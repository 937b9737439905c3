//! Periodic health probing of known nodes.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::node::ProbeOutcome;
use crate::router::{ClusterRouter, NodeEvent};

/// Probes every known node on a fixed interval and feeds the outcomes to the
/// router. Probes are `GET /v1/models` against each node's OpenAI surface; a
/// node that answers 200 with a JSON body counts as up.
pub struct HealthChecker {
    router: ClusterRouter,
    client: reqwest::Client,
}

impl HealthChecker {
    /// Build a checker against the router's node table.
    pub fn new(router: ClusterRouter) -> Self {
        let timeout = router.config().health.timeout;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self { router, client }
    }

    /// Run the probe loop until canceled.
    pub fn spawn(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.router.config().health.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.probe_all().await,
                }
            }

            log::debug!("health checker stopped");
        });
    }

    async fn probe_all(&self) {
        let nodes = self.router.snapshot().await;
        let events = self.router.events();

        for node in nodes {
            let outcome = probe(&self.client, node.url.as_str()).await;

            if events
                .try_send(NodeEvent::Probe {
                    id: node.id.clone(),
                    outcome,
                })
                .is_err()
            {
                log::warn!("router event channel full, dropping probe result for '{}'", node.id);
            }
        }
    }
}

/// The models-list shape a live OpenAI-style node answers with:
/// `{"object": "list", "data": [{"id": ...}, ...]}`.
#[derive(Debug, serde::Deserialize)]
struct ModelsList {
    object: String,
    data: Vec<ModelEntry>,
}

#[derive(Debug, serde::Deserialize)]
struct ModelEntry {
    #[allow(dead_code)]
    id: String,
}

/// Issue one probe and classify the outcome. A node only counts as up when
/// it answers 200 with a body matching the models-list shape; a reverse
/// proxy serving an HTML error page, or some other service squatting on the
/// port with its own JSON, is not a live node.
pub(crate) async fn probe(client: &reqwest::Client, base_url: &str) -> ProbeOutcome {
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let started = Instant::now();

    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => match response.json::<ModelsList>().await {
            Ok(listing) if listing.object == "list" => ProbeOutcome::Success {
                latency: started.elapsed(),
            },
            Ok(listing) => {
                log::debug!("probe of {url} returned object '{}', not a model list", listing.object);
                ProbeOutcome::Failure
            }
            Err(error) => {
                log::debug!("probe of {url} did not return a models list: {error}");
                ProbeOutcome::Failure
            }
        },
        Ok(response) => {
            log::debug!("probe of {url} returned status {}", response.status());
            ProbeOutcome::Failure
        }
        Err(error) => {
            log::debug!("probe of {url} failed: {error}");
            ProbeOutcome::Failure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::get};
    use std::time::Duration;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{address}")
    }

    #[tokio::test]
    async fn probe_accepts_a_models_listing() {
        let base = serve(Router::new().route(
            "/v1/models",
            get(|| async { Json(json!({"object": "list", "data": [{"id": "qwen2.5"}]})) }),
        ))
        .await;

        let client = reqwest::Client::new();
        let outcome = probe(&client, &base).await;

        assert!(matches!(outcome, ProbeOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn probe_rejects_error_statuses() {
        let base = serve(Router::new().route(
            "/v1/models",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
        ))
        .await;

        let client = reqwest::Client::new();
        assert!(matches!(probe(&client, &base).await, ProbeOutcome::Failure));
    }

    #[tokio::test]
    async fn probe_rejects_json_without_the_list_shape() {
        // Syntactically valid JSON is not enough; the body must look like a
        // models listing.
        for body in [json!({"status": "ok"}), json!(42), json!([]), json!({"object": "error", "data": []})] {
            let base = serve(Router::new().route(
                "/v1/models",
                get(move || {
                    let body = body.clone();
                    async move { Json(body) }
                }),
            ))
            .await;

            let client = reqwest::Client::new();
            assert!(matches!(probe(&client, &base).await, ProbeOutcome::Failure));
        }
    }

    #[tokio::test]
    async fn probe_rejects_non_json_bodies() {
        let base = serve(Router::new().route("/v1/models", get(|| async { "<html>busy</html>" }))).await;

        let client = reqwest::Client::new();
        assert!(matches!(probe(&client, &base).await, ProbeOutcome::Failure));
    }

    #[tokio::test]
    async fn probe_fails_on_unreachable_hosts() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(300))
            .build()
            .unwrap();

        assert!(matches!(
            probe(&client, "http://127.0.0.1:1").await,
            ProbeOutcome::Failure
        ));
    }
}
