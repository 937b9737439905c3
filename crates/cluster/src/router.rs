//! Node selection and the coordinator task.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::node::{ClusterNode, NodeStatus, ProbeOutcome};
use config::{ClusterConfig, RoutingStrategy};

/// Capacity of the event channel between discovery/health and the router.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Routing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// Every known node is out of rotation.
    #[error("no healthy cluster node available")]
    NoHealthyNodes,
}

/// Node lifecycle events, produced by discovery and the health checker and
/// consumed by the router's coordinator task.
#[derive(Debug)]
pub enum NodeEvent {
    /// Discovery validated a new (or re-appearing) node.
    Discovered {
        /// Node id.
        id: String,
        /// Node base URL.
        url: Url,
    },
    /// Discovery no longer sees the node.
    Lost {
        /// Node id.
        id: String,
    },
    /// A health probe completed.
    Probe {
        /// Node id.
        id: String,
        /// What the probe observed.
        outcome: ProbeOutcome,
    },
    /// A discovery sweep failed in aggregate.
    DiscoveryError {
        /// Summary of the sweep's failures.
        message: String,
    },
}

/// Stable hash over the request prefix, for cache-aware routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteKey([u8; 32]);

impl RouteKey {
    /// Hash the system prompt, and the tool names when `hash_tools` is on.
    /// What goes into the hash is explicit here because prefix caches only
    /// hit on exact prefixes: system prompt always, tools configurably.
    pub fn for_request<'a>(system: &str, tool_names: impl Iterator<Item = &'a str>, hash_tools: bool) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(system.as_bytes());

        if hash_tools {
            for name in tool_names {
                hasher.update([0]);
                hasher.update(name.as_bytes());
            }
        }

        Self(hasher.finalize().into())
    }

    fn digest(&self) -> [u8; 32] {
        self.0
    }
}

/// Decrements the node's in-flight counter on drop. Hold it for the full
/// duration of the proxied request, response stream included.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A routing decision.
#[derive(Debug)]
pub struct SelectedNode {
    /// Node id, for recording the outcome.
    pub id: String,
    /// Node base URL.
    pub url: Url,
    /// In-flight accounting guard.
    pub guard: InFlightGuard,
}

struct ClusterState {
    nodes: HashMap<String, ClusterNode>,
    round_robin_cursor: usize,
    last_updated: Option<Instant>,
}

/// The cluster router: owns the node table, applies lifecycle events, and
/// selects a node per request under the configured strategy.
#[derive(Clone)]
pub struct ClusterRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    state: RwLock<ClusterState>,
    config: ClusterConfig,
    events_tx: mpsc::Sender<NodeEvent>,
}

impl ClusterRouter {
    /// Build a router plus the receiving end of its event channel. Pass the
    /// receiver to [`ClusterRouter::spawn_coordinator`].
    pub fn new(config: ClusterConfig) -> (Self, mpsc::Receiver<NodeEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let router = Self {
            inner: Arc::new(RouterInner {
                state: RwLock::new(ClusterState {
                    nodes: HashMap::new(),
                    round_robin_cursor: 0,
                    last_updated: None,
                }),
                config,
                events_tx,
            }),
        };

        (router, events_rx)
    }

    /// Sender half for discovery and health tasks.
    pub fn events(&self) -> mpsc::Sender<NodeEvent> {
        self.inner.events_tx.clone()
    }

    /// Routing configuration this router was built with.
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Run the coordinator: consume node events until canceled. Discovery
    /// and health callbacks never block on this; they enqueue and move on.
    pub fn spawn_coordinator(&self, mut events_rx: mpsc::Receiver<NodeEvent>, cancel: CancellationToken) {
        let router = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => router.apply_event(event).await,
                        None => break,
                    },
                }
            }

            log::debug!("cluster coordinator stopped");
        });
    }

    /// Apply one lifecycle event to the node table. Nodes are replaced
    /// wholesale under the write lock; no I/O happens while it is held.
    pub async fn apply_event(&self, event: NodeEvent) {
        let mut state = self.inner.state.write().await;
        state.last_updated = Some(Instant::now());

        match event {
            NodeEvent::Discovered { id, url } => {
                match state.nodes.get_mut(&id) {
                    Some(node) if node.url != url => {
                        log::info!("cluster node '{id}' moved to {url}");
                        node.url = url;
                    }
                    Some(_) => {}
                    None => {
                        log::info!("cluster node '{id}' discovered at {url}");
                        state.nodes.insert(id.clone(), ClusterNode::new(id, url));
                    }
                }
            }
            NodeEvent::Lost { id } => {
                if state.nodes.remove(&id).is_some() {
                    log::info!("cluster node '{id}' lost");
                }
            }
            NodeEvent::Probe { id, outcome } => {
                if let Some(node) = state.nodes.get(&id) {
                    let updated = self.apply_probe(node.clone(), outcome);
                    state.nodes.insert(id, updated);
                }
            }
            NodeEvent::DiscoveryError { message } => {
                log::warn!("node discovery sweep failed: {message}");
            }
        }
    }

    /// Health-state transition rules.
    fn apply_probe(&self, mut node: ClusterNode, outcome: ProbeOutcome) -> ClusterNode {
        let health_config = &self.inner.config.health;
        node.health.last_check = Some(Instant::now());

        match outcome {
            ProbeOutcome::Success { latency } => {
                node.health.last_latency = Some(latency);
                node.health.consecutive_failures = 0;
                node.health.consecutive_successes += 1;

                let was_out = matches!(node.status, NodeStatus::Unhealthy);
                let promoted = !was_out || node.health.consecutive_successes >= health_config.healthy_threshold;

                if promoted {
                    node.status = if latency > health_config.degraded_latency {
                        NodeStatus::Degraded
                    } else {
                        NodeStatus::Healthy
                    };

                    if was_out {
                        log::info!("cluster node '{}' back in rotation", node.id);
                    }
                }
            }
            ProbeOutcome::Failure => {
                node.health.consecutive_successes = 0;
                node.health.consecutive_failures += 1;

                if node.health.consecutive_failures >= health_config.unhealthy_threshold
                    && node.status != NodeStatus::Unhealthy
                {
                    log::warn!(
                        "cluster node '{}' unhealthy after {} consecutive probe failures",
                        node.id,
                        node.health.consecutive_failures
                    );
                    node.status = NodeStatus::Unhealthy;
                }
            }
        }

        node
    }

    /// Snapshot of the node table, for the health checker and diagnostics.
    pub async fn snapshot(&self) -> Vec<ClusterNode> {
        self.inner.state.read().await.nodes.values().cloned().collect()
    }

    /// Select a node for a request, skipping `exclude` (nodes already tried
    /// during retries). Takes the lock only for the read-modify-write of the
    /// cursor and cache hint.
    pub async fn select_node(&self, route_key: Option<&RouteKey>, exclude: &[String]) -> Result<SelectedNode, ClusterError> {
        let strategy = self.inner.config.routing.strategy;
        let mut state = self.inner.state.write().await;

        let mut candidates: Vec<&ClusterNode> = state
            .nodes
            .values()
            .filter(|node| node.status.routable() && !exclude.contains(&node.id))
            .collect();

        if candidates.is_empty() {
            return Err(ClusterError::NoHealthyNodes);
        }

        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let picked = match strategy {
            RoutingStrategy::RoundRobin => {
                let index = state.round_robin_cursor % candidates.len();
                candidates[index].id.clone()
            }
            RoutingStrategy::LeastLoaded => least_loaded(&candidates, state.round_robin_cursor),
            RoutingStrategy::CacheAware => {
                cache_aware(&candidates, route_key).unwrap_or_else(|| least_loaded(&candidates, state.round_robin_cursor))
            }
            RoutingStrategy::LatencyBased => latency_weighted(&candidates),
        };
        state.round_robin_cursor = state.round_robin_cursor.wrapping_add(1);

        let node = state.nodes.get_mut(&picked).ok_or(ClusterError::NoHealthyNodes)?;

        node.metrics.requests += 1;
        node.in_flight.fetch_add(1, Ordering::Relaxed);

        // This node is about to process this prefix; remember it for the
        // next cache-aware decision.
        if let Some(key) = route_key {
            node.cache_hint.prefix_hash = Some(key.digest());
            node.cache_hint.last_used_at = Some(Instant::now());
        }

        Ok(SelectedNode {
            id: node.id.clone(),
            url: node.url.clone(),
            guard: InFlightGuard {
                counter: node.in_flight.clone(),
            },
        })
    }

    /// Record a completed request against a node.
    pub async fn record_success(&self, id: &str, latency: Duration, tokens_served: u64) {
        let mut state = self.inner.state.write().await;
        if let Some(node) = state.nodes.get_mut(id) {
            node.metrics.record_latency(latency);
            node.metrics.tokens_served += tokens_served;
        }
    }

    /// Record a failed request against a node.
    pub async fn record_failure(&self, id: &str) {
        let mut state = self.inner.state.write().await;
        if let Some(node) = state.nodes.get_mut(id) {
            node.metrics.failures += 1;
        }
    }
}

fn least_loaded(candidates: &[&ClusterNode], cursor: usize) -> String {
    let min_load = candidates
        .iter()
        .map(|node| node.in_flight.load(Ordering::Relaxed))
        .min()
        .unwrap_or(0);

    let ties: Vec<&&ClusterNode> = candidates
        .iter()
        .filter(|node| node.in_flight.load(Ordering::Relaxed) == min_load)
        .collect();

    ties[cursor % ties.len()].id.clone()
}

fn cache_aware(candidates: &[&ClusterNode], route_key: Option<&RouteKey>) -> Option<String> {
    let key = route_key?;

    candidates
        .iter()
        .filter(|node| node.cache_hint.prefix_hash == Some(key.digest()))
        .max_by_key(|node| node.cache_hint.last_used_at)
        .map(|node| node.id.clone())
}

fn latency_weighted(candidates: &[&ClusterNode]) -> String {
    // Unmeasured nodes weigh as 100ms so they still get traffic.
    let weights: Vec<f64> = candidates
        .iter()
        .map(|node| {
            let p50 = node
                .metrics
                .p50_latency
                .unwrap_or(Duration::from_millis(100))
                .as_secs_f64()
                .max(1e-3);
            1.0 / p50
        })
        .collect();

    let total: f64 = weights.iter().sum();
    let mut pick = rand::rng().random_range(0.0..total);

    for (node, weight) in candidates.iter().zip(&weights) {
        if pick < *weight {
            return node.id.clone();
        }
        pick -= weight;
    }

    candidates[candidates.len() - 1].id.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(port: u16) -> Url {
        format!("http://10.0.0.{port}:8080/").parse().unwrap()
    }

    async fn router_with_nodes(strategy: RoutingStrategy, statuses: &[(&str, NodeStatus)]) -> ClusterRouter {
        let config = ClusterConfig {
            routing: config::RoutingConfig {
                strategy,
                ..Default::default()
            },
            ..Default::default()
        };

        let (router, _rx) = ClusterRouter::new(config);

        for (i, (id, status)) in statuses.iter().enumerate() {
            router
                .apply_event(NodeEvent::Discovered {
                    id: id.to_string(),
                    url: url(10 + i as u16),
                })
                .await;

            // Drive the node to the wanted status through probe events.
            match status {
                NodeStatus::Healthy => {
                    router
                        .apply_event(NodeEvent::Probe {
                            id: id.to_string(),
                            outcome: ProbeOutcome::Success {
                                latency: Duration::from_millis(20),
                            },
                        })
                        .await;
                }
                NodeStatus::Unhealthy => {
                    for _ in 0..3 {
                        router
                            .apply_event(NodeEvent::Probe {
                                id: id.to_string(),
                                outcome: ProbeOutcome::Failure,
                            })
                            .await;
                    }
                }
                _ => {}
            }
        }

        router
    }

    #[tokio::test]
    async fn round_robin_skips_the_unhealthy_node() {
        let router = router_with_nodes(
            RoutingStrategy::RoundRobin,
            &[
                ("node-a", NodeStatus::Healthy),
                ("node-b", NodeStatus::Unhealthy),
                ("node-c", NodeStatus::Healthy),
            ],
        )
        .await;

        let mut picks = Vec::new();
        for _ in 0..6 {
            let selected = router.select_node(None, &[]).await.unwrap();
            picks.push(selected.id.clone());
        }

        assert_eq!(picks, ["node-a", "node-c", "node-a", "node-c", "node-a", "node-c"]);
        assert!(!picks.contains(&"node-b".to_string()));
    }

    #[tokio::test]
    async fn unhealthy_node_rejoins_after_enough_successes() {
        let router = router_with_nodes(
            RoutingStrategy::RoundRobin,
            &[
                ("node-a", NodeStatus::Healthy),
                ("node-b", NodeStatus::Unhealthy),
                ("node-c", NodeStatus::Healthy),
            ],
        )
        .await;

        // Two successes: still below the healthy threshold of three.
        for _ in 0..2 {
            router
                .apply_event(NodeEvent::Probe {
                    id: "node-b".to_string(),
                    outcome: ProbeOutcome::Success {
                        latency: Duration::from_millis(15),
                    },
                })
                .await;
        }
        let snapshot = router.snapshot().await;
        let b = snapshot.iter().find(|n| n.id == "node-b").unwrap();
        assert_eq!(b.status, NodeStatus::Unhealthy);

        // The third success promotes it back.
        router
            .apply_event(NodeEvent::Probe {
                id: "node-b".to_string(),
                outcome: ProbeOutcome::Success {
                    latency: Duration::from_millis(15),
                },
            })
            .await;

        let mut picks = Vec::new();
        for _ in 0..3 {
            picks.push(router.select_node(None, &[]).await.unwrap().id);
        }
        assert!(picks.contains(&"node-b".to_string()));
    }

    #[tokio::test]
    async fn no_routable_node_is_an_error() {
        let router = router_with_nodes(RoutingStrategy::RoundRobin, &[("node-a", NodeStatus::Unhealthy)]).await;

        assert_eq!(
            router.select_node(None, &[]).await.unwrap_err(),
            ClusterError::NoHealthyNodes
        );
    }

    #[tokio::test]
    async fn exclusion_forces_a_different_node() {
        let router = router_with_nodes(
            RoutingStrategy::RoundRobin,
            &[("node-a", NodeStatus::Healthy), ("node-b", NodeStatus::Healthy)],
        )
        .await;

        let selected = router
            .select_node(None, &["node-a".to_string()])
            .await
            .unwrap();
        assert_eq!(selected.id, "node-b");
    }

    #[tokio::test]
    async fn least_loaded_prefers_idle_nodes() {
        let router = router_with_nodes(
            RoutingStrategy::LeastLoaded,
            &[("node-a", NodeStatus::Healthy), ("node-b", NodeStatus::Healthy)],
        )
        .await;

        // Keep the first pick's guard alive, loading that node.
        let first = router.select_node(None, &[]).await.unwrap();
        let second = router.select_node(None, &[]).await.unwrap();

        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn in_flight_guard_releases_on_drop() {
        let router = router_with_nodes(RoutingStrategy::LeastLoaded, &[("node-a", NodeStatus::Healthy)]).await;

        let selected = router.select_node(None, &[]).await.unwrap();
        let snapshot = router.snapshot().await;
        assert_eq!(snapshot[0].in_flight.load(Ordering::Relaxed), 1);

        drop(selected);
        let snapshot = router.snapshot().await;
        assert_eq!(snapshot[0].in_flight.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn cache_aware_prefers_the_warm_node() {
        let router = router_with_nodes(
            RoutingStrategy::CacheAware,
            &[("node-a", NodeStatus::Healthy), ("node-b", NodeStatus::Healthy)],
        )
        .await;

        let key = RouteKey::for_request("system prompt", ["Read", "Bash"].into_iter(), true);

        // First request lands somewhere and warms that node's cache.
        let first = router.select_node(Some(&key), &[]).await.unwrap();
        let warm = first.id.clone();
        drop(first);

        // Subsequent requests with the same prefix stick to it.
        for _ in 0..4 {
            let selected = router.select_node(Some(&key), &[]).await.unwrap();
            assert_eq!(selected.id, warm);
        }

        // A different prefix is free to go elsewhere (least-loaded fallback).
        let other_key = RouteKey::for_request("another prompt", std::iter::empty(), true);
        let selected = router.select_node(Some(&other_key), &[]).await.unwrap();
        assert!(selected.id == "node-a" || selected.id == "node-b");
    }

    #[tokio::test]
    async fn latency_based_routes_only_to_routable_nodes() {
        let router = router_with_nodes(
            RoutingStrategy::LatencyBased,
            &[
                ("node-a", NodeStatus::Healthy),
                ("node-b", NodeStatus::Unhealthy),
                ("node-c", NodeStatus::Healthy),
            ],
        )
        .await;

        router.record_success("node-a", Duration::from_millis(10), 100).await;
        router.record_success("node-c", Duration::from_millis(400), 100).await;

        for _ in 0..20 {
            let selected = router.select_node(None, &[]).await.unwrap();
            assert_ne!(selected.id, "node-b");
        }
    }

    #[test]
    fn route_key_is_stable_and_tool_sensitive() {
        let a = RouteKey::for_request("sys", ["Read"].into_iter(), true);
        let b = RouteKey::for_request("sys", ["Read"].into_iter(), true);
        let c = RouteKey::for_request("sys", ["Bash"].into_iter(), true);
        let d = RouteKey::for_request("sys", ["Bash"].into_iter(), false);
        let e = RouteKey::for_request("sys", ["Read"].into_iter(), false);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(d, e, "tool names are ignored when hash_tools is off");
    }
}
