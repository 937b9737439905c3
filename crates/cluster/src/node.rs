//! The node table's data model.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant};

use url::Url;

/// Lifecycle status of one inference node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Probes pass within budget.
    Healthy,
    /// Responding, but slower than the latency budget.
    Degraded,
    /// Enough consecutive probe failures to leave rotation.
    Unhealthy,
    /// Discovered but not yet probed.
    Unknown,
}

impl NodeStatus {
    /// Whether a node in this status may serve requests.
    pub fn routable(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// Probe bookkeeping for one node.
#[derive(Debug, Clone, Default)]
pub struct NodeHealth {
    /// When the node was last probed.
    pub last_check: Option<Instant>,
    /// Latency of the last successful probe.
    pub last_latency: Option<Duration>,
    /// Probe failures since the last success.
    pub consecutive_failures: u32,
    /// Probe successes since the last failure.
    pub consecutive_successes: u32,
}

/// What the node served most recently, for cache-aware routing.
#[derive(Debug, Clone, Default)]
pub struct CacheHint {
    /// Hash of the last prompt prefix this node processed.
    pub prefix_hash: Option<[u8; 32]>,
    /// When the hint was recorded.
    pub last_used_at: Option<Instant>,
}

/// Rolling request statistics for one node.
#[derive(Debug, Clone, Default)]
pub struct NodeMetrics {
    /// Requests dispatched to this node.
    pub requests: u64,
    /// Requests that failed on this node.
    pub failures: u64,
    /// Median request latency, updated by exponential smoothing.
    pub p50_latency: Option<Duration>,
    /// Completion tokens served by this node.
    pub tokens_served: u64,
}

impl NodeMetrics {
    /// Fold a new latency sample into the median estimate.
    pub(crate) fn record_latency(&mut self, sample: Duration) {
        self.p50_latency = Some(match self.p50_latency {
            // Smoothed toward the sample; cheap and close enough to a
            // median for weighting purposes.
            Some(current) => (current * 7 + sample) / 8,
            None => sample,
        });
    }
}

/// One cluster node. Owned by the router for the node's lifetime; the struct
/// is replaced wholesale on status changes, never shared mutable outside the
/// router's lock. Only the in-flight counter is shared, so request guards
/// survive node replacement.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    /// Stable node identifier.
    pub id: String,
    /// Base URL of the node's OpenAI-compatible endpoint.
    pub url: Url,
    /// Current routing status.
    pub status: NodeStatus,
    /// Probe bookkeeping.
    pub health: NodeHealth,
    /// Prefix-cache hint.
    pub cache_hint: CacheHint,
    /// Rolling request statistics.
    pub metrics: NodeMetrics,
    /// Requests currently running against this node.
    pub in_flight: Arc<AtomicUsize>,
}

impl ClusterNode {
    /// A freshly discovered node, unprobed.
    pub fn new(id: String, url: Url) -> Self {
        Self {
            id,
            url,
            status: NodeStatus::Unknown,
            health: NodeHealth::default(),
            cache_hint: CacheHint::default(),
            metrics: NodeMetrics::default(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Result of one health probe, fed to the router.
#[derive(Debug, Clone, Copy)]
pub enum ProbeOutcome {
    /// The probe succeeded within budget.
    Success {
        /// Observed probe latency.
        latency: Duration,
    },
    /// The probe failed or timed out.
    Failure,
}
