//! Cluster routing for the multi-node local backend.
//!
//! The router owns the node table; the health checker and node discovery run
//! as separate tasks and feed it [`NodeEvent`]s through a channel consumed by
//! one coordinator task. Request paths take a short snapshot read to select a
//! node; nothing holds the table lock across I/O.

#![deny(missing_docs)]

mod discovery;
mod health;
mod node;
mod router;

pub use discovery::{DiscoveryError, NodeDiscovery};
pub use health::HealthChecker;
pub use node::{CacheHint, ClusterNode, NodeHealth, NodeMetrics, NodeStatus, ProbeOutcome};
pub use router::{ClusterError, ClusterRouter, InFlightGuard, NodeEvent, RouteKey, SelectedNode};
