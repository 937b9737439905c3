//! Crossbar configuration structures to map the crossbar.toml configuration.
//!
//! Every recognized option resolves in priority order: a `CROSSBAR_*`
//! environment variable, else the config file value, else a built-in default.

#![deny(missing_docs)]

mod backend;
mod cluster;
mod loader;
mod server;

use std::path::Path;

pub use backend::{BackendConfig, BackendKind, ToolInstructionStyle, TruncationStrategy};
pub use cluster::{
    CacheConfig, ClusterConfig, DiscoveryConfig, DiscoverySource, HealthCheckConfig, RoutingConfig, RoutingStrategy,
    StaticNode,
};
use serde::Deserialize;
pub use server::ServerConfig;

/// Main configuration structure for the crossbar proxy.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Backend selection and translation settings.
    pub backend: BackendConfig,
    /// HTTP server limits and timeouts.
    pub server: ServerConfig,
    /// Cluster routing configuration, used when the backend is `mlx-cluster`.
    pub cluster: ClusterConfig,
    /// Logging verbosity, 0 (warnings only) to 3 (trace).
    pub debug_level: u8,
}

impl Config {
    /// Load configuration from a file path, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Resolve configuration from environment overrides over built-in defaults,
    /// for running without a config file.
    pub fn from_env() -> anyhow::Result<Config> {
        let mut config = Config::default();
        loader::apply_env_overrides(&mut config)?;
        loader::validate(&config)?;
        Ok(config)
    }

    /// Log filter string derived from `debug_level`.
    pub fn log_filter(&self) -> &'static str {
        match self.debug_level {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.backend.kind, BackendKind::Local);
        assert_eq!(config.debug_level, 0);
        assert_eq!(config.server.max_concurrent_requests, 100);
        assert_eq!(config.cluster.routing.strategy, RoutingStrategy::RoundRobin);
    }

    #[test]
    fn log_filter_maps_debug_levels() {
        let filters: Vec<_> = (0..=4)
            .map(|level| {
                Config {
                    debug_level: level,
                    ..Config::default()
                }
                .log_filter()
            })
            .collect();

        assert_eq!(filters, ["warn", "info", "debug", "trace", "trace"]);
    }
}
