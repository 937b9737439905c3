//! HTTP server limits and timeouts.

use std::net::SocketAddr;
use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;

/// HTTP server configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the proxy should listen on.
    pub listen_address: Option<SocketAddr>,

    /// Upper bound on concurrently served requests. Excess returns 429.
    pub max_concurrent_requests: usize,

    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,

    /// Total budget for one request, streaming included.
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,

    /// Budget for the first byte from the backend, separate from the total.
    #[serde(deserialize_with = "deserialize_duration")]
    pub first_byte_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            max_concurrent_requests: 100,
            max_body_bytes: 100 * 1024 * 1024,
            request_timeout: Duration::from_secs(600),
            first_byte_timeout: Duration::from_secs(120),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();

        assert_eq!(config.max_concurrent_requests, 100);
        assert_eq!(config.max_body_bytes, 100 * 1024 * 1024);
        assert_eq!(config.request_timeout, Duration::from_secs(600));
        assert_eq!(config.first_byte_timeout, Duration::from_secs(120));
    }

    #[test]
    fn humane_durations() {
        let config: ServerConfig = toml::from_str(indoc! {r#"
            listen_address = "127.0.0.1:4000"
            request_timeout = "5m"
            first_byte_timeout = "30s"
        "#})
        .unwrap();

        assert_eq!(config.listen_address.unwrap().port(), 4000);
        assert_eq!(config.request_timeout, Duration::from_secs(300));
        assert_eq!(config.first_byte_timeout, Duration::from_secs(30));
    }
}
