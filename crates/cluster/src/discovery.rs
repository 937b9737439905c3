//! Periodic node discovery: fetch candidates from the configured source,
//! validate each one, and diff against the previously known set.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::health::probe;
use crate::node::ProbeOutcome;
use crate::router::{ClusterRouter, NodeEvent};
use config::{DiscoveryConfig, DiscoverySource};

/// One failed candidate within a sweep. Individual failures never abort the
/// sweep; they aggregate into a single event at the end.
#[derive(Debug)]
pub struct DiscoveryError {
    /// The candidate that failed.
    pub candidate: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Candidate shape returned by an orchestrator endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    id: String,
    url: Url,
}

/// The discovery loop. Runs on its own task; node changes reach the router
/// through its event channel, never by blocking calls.
pub struct NodeDiscovery {
    router: ClusterRouter,
    client: reqwest::Client,
    known: BTreeSet<(String, Url)>,
}

impl NodeDiscovery {
    /// Build a discovery loop against the router's event channel.
    pub fn new(router: ClusterRouter) -> Self {
        let timeout = router.config().discovery.validation_timeout;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            router,
            client,
            known: BTreeSet::new(),
        }
    }

    /// Run the refresh loop until canceled. The first sweep runs immediately
    /// so a static node list is routable at startup.
    pub fn spawn(mut self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.router.config().discovery.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.sweep().await,
                }
            }

            log::debug!("node discovery stopped");
        });
    }

    /// One refresh: fetch, validate, dedup, diff, emit events.
    async fn sweep(&mut self) {
        let discovery = self.router.config().discovery.clone();
        let mut errors = Vec::new();

        let candidates = self.fetch_candidates(&discovery, &mut errors).await;

        // Validate every candidate with a models probe; dedup by (id, url).
        let mut validated = BTreeSet::new();
        for candidate in candidates {
            match probe(&self.client, candidate.url.as_str()).await {
                ProbeOutcome::Success { .. } => {
                    validated.insert((candidate.id, candidate.url));
                }
                ProbeOutcome::Failure => {
                    errors.push(DiscoveryError {
                        candidate: format!("{} ({})", candidate.id, candidate.url),
                        reason: "validation probe failed".to_string(),
                    });
                }
            }
        }

        let events = self.router.events();

        for (id, url) in validated.difference(&self.known) {
            let event = NodeEvent::Discovered {
                id: id.clone(),
                url: url.clone(),
            };
            if events.try_send(event).is_err() {
                log::warn!("router event channel full, dropping discovery of '{id}'");
            }
        }

        for (id, _) in self.known.difference(&validated) {
            if events.try_send(NodeEvent::Lost { id: id.clone() }).is_err() {
                log::warn!("router event channel full, dropping loss of '{id}'");
            }
        }

        self.known = validated;

        if !errors.is_empty() {
            let mut message = format!("{} candidate(s) failed:", errors.len());
            for error in &errors {
                let _ = write!(message, " {}: {};", error.candidate, error.reason);
            }
            let _ = events.try_send(NodeEvent::DiscoveryError { message });
        }
    }

    async fn fetch_candidates(&self, discovery: &DiscoveryConfig, errors: &mut Vec<DiscoveryError>) -> Vec<Candidate> {
        match &discovery.source {
            DiscoverySource::Static { nodes } => nodes
                .iter()
                .map(|node| Candidate {
                    id: node.id.clone(),
                    url: node.url.clone(),
                })
                .collect(),
            DiscoverySource::Dns { name, port } => match tokio::net::lookup_host((name.as_str(), *port)).await {
                Ok(addresses) => addresses
                    .filter_map(|address| {
                        let url = format!("http://{address}/").parse().ok()?;
                        Some(Candidate {
                            id: address.to_string(),
                            url,
                        })
                    })
                    .collect(),
                Err(error) => {
                    errors.push(DiscoveryError {
                        candidate: name.clone(),
                        reason: format!("dns resolution failed: {error}"),
                    });
                    Vec::new()
                }
            },
            DiscoverySource::Orchestrator { url } => match self.fetch_orchestrator(url).await {
                Ok(candidates) => candidates,
                Err(reason) => {
                    errors.push(DiscoveryError {
                        candidate: url.to_string(),
                        reason,
                    });
                    Vec::new()
                }
            },
        }
    }

    async fn fetch_orchestrator(&self, url: &Url) -> Result<Vec<Candidate>, String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|error| format!("orchestrator request failed: {error}"))?;

        if !response.status().is_success() {
            return Err(format!("orchestrator returned status {}", response.status()));
        }

        response
            .json::<Vec<Candidate>>()
            .await
            .map_err(|error| format!("orchestrator response did not match the node-list shape: {error}"))
    }
}
