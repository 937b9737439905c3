use std::{sync::OnceLock, time::Duration};

use reqwest::Client;

pub(crate) fn default_http_client_builder() -> reqwest::ClientBuilder {
    Client::builder()
        // Streaming responses can idle between tokens; the per-request
        // deadlines live in the pipeline, not here.
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
}

/// Common HTTP client to re-use upstream connections across requests.
pub(crate) fn http_client() -> reqwest::Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();

    CLIENT
        .get_or_init(|| {
            default_http_client_builder()
                .build()
                .expect("Failed to build default HTTP client")
        })
        .clone()
}
