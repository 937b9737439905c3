//! Cluster routing configuration for the `mlx-cluster` backend.

use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;
use url::Url;

/// Complete cluster configuration: discovery, health checking, routing and
/// prefix-cache behavior.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// How the node set is found and refreshed.
    pub discovery: DiscoveryConfig,
    /// Health probing of known nodes.
    pub health: HealthCheckConfig,
    /// Per-request node selection.
    pub routing: RoutingConfig,
    /// Prefix-cache hashing behavior for `cache-aware` routing.
    pub cache: CacheConfig,
}

/// A node listed directly in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticNode {
    /// Stable node identifier.
    pub id: String,
    /// Base URL of the node's OpenAI-compatible endpoint.
    pub url: Url,
}

/// Where candidate nodes come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum DiscoverySource {
    /// A fixed list of nodes from the configuration.
    Static {
        /// The configured nodes.
        nodes: Vec<StaticNode>,
    },
    /// Resolve a DNS name; every A/AAAA record is a candidate node.
    Dns {
        /// The name to resolve.
        name: String,
        /// Port the inference servers listen on.
        port: u16,
    },
    /// Query an orchestrator endpoint returning `[{id, url}]`.
    Orchestrator {
        /// The orchestrator's node-list endpoint.
        url: Url,
    },
}

impl Default for DiscoverySource {
    fn default() -> Self {
        Self::Static { nodes: Vec::new() }
    }
}

/// Node discovery settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Where candidate nodes come from.
    pub source: DiscoverySource,

    /// How often the candidate set is refreshed.
    #[serde(deserialize_with = "deserialize_duration")]
    pub refresh_interval: Duration,

    /// Budget for the per-candidate validation probe.
    #[serde(deserialize_with = "deserialize_duration")]
    pub validation_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            source: DiscoverySource::default(),
            refresh_interval: Duration::from_secs(30),
            validation_timeout: Duration::from_secs(5),
        }
    }
}

/// Health checker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthCheckConfig {
    /// Interval between probe rounds.
    #[serde(deserialize_with = "deserialize_duration")]
    pub check_interval: Duration,

    /// Budget for one probe.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,

    /// Consecutive successes required to promote an unhealthy node.
    pub healthy_threshold: u32,

    /// Consecutive failures required to demote a node.
    pub unhealthy_threshold: u32,

    /// A node responding slower than this is marked degraded.
    #[serde(deserialize_with = "deserialize_duration")]
    pub degraded_latency: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
            degraded_latency: Duration::from_secs(2),
        }
    }
}

/// Per-request node selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Advance a cursor over healthy nodes.
    RoundRobin,
    /// Minimum in-flight requests, round-robin tiebreak.
    LeastLoaded,
    /// Prefer the node whose last prompt prefix matches, else least-loaded.
    CacheAware,
    /// Weighted random by inverse median latency.
    LatencyBased,
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

/// Routing and retry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    /// Node selection strategy.
    pub strategy: RoutingStrategy,

    /// Retries on different healthy nodes after an open-error.
    pub max_retries: u32,

    /// Pause between retry attempts.
    #[serde(deserialize_with = "deserialize_duration")]
    pub retry_delay: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::default(),
            max_retries: 2,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Prefix-cache hashing behavior for `cache-aware` routing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Include the tool list in the prefix hash alongside the system prompt.
    pub hash_tools: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { hash_tools: true }
    }
}
