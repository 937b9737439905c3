//! Crossbar server library.
//!
//! Provides a reusable serve function used by the binary and by integration
//! tests alike.

#![deny(missing_docs)]

mod logger;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use config::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// How long in-flight requests get to drain after the shutdown signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Configuration for serving crossbar.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to.
    pub listen_address: SocketAddr,
    /// The resolved crossbar configuration.
    pub config: Config,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
    /// Log filter string (e.g. "info" or "proxy=debug,cluster=debug").
    pub log_filter: String,
    /// The version string to log on startup.
    pub version: String,
    /// Optional oneshot sender to send back the bound address (useful if
    /// port 0 was specified).
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

/// Starts and runs the crossbar proxy with the provided configuration.
///
/// Shutdown proceeds in a fixed order: the listener stops accepting,
/// in-flight requests drain within [`DRAIN_DEADLINE`], then the cluster
/// coordinator stops, then discovery.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        log_filter,
        version,
        bound_addr_sender,
    }: ServeConfig,
) -> anyhow::Result<()> {
    logger::init(&log_filter);

    log::info!("Crossbar {version}");

    let app = proxy::build(&config)?;

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    let bound = listener.local_addr()?;

    if let Some(sender) = bound_addr_sender
        && sender.send(bound).is_err()
    {
        log::warn!("nobody is listening for the bound address");
    }

    log::info!("Messages endpoint: http://{bound}/v1/messages");

    let graceful = axum::serve(listener, app.router.into_make_service())
        .with_graceful_shutdown(shutdown_signal.clone().cancelled_owned());

    tokio::select! {
        result = graceful => {
            result.map_err(|e| anyhow!("Failed to run HTTP server: {e}"))?;
            log::info!("Received shutdown signal, shutting down gracefully...");
        }
        _ = async {
            shutdown_signal.cancelled().await;
            tokio::time::sleep(DRAIN_DEADLINE).await;
        } => {
            log::warn!("in-flight requests did not drain within {DRAIN_DEADLINE:?}, shutting down anyway");
        }
    }

    if let Some(cluster) = app.cluster {
        cluster.health.cancel();
        cluster.coordinator.cancel();
        cluster.discovery.cancel();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_and_shuts_down_cleanly() {
        let shutdown = CancellationToken::new();
        let (addr_tx, addr_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(serve(ServeConfig {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            config: Config::default(),
            shutdown_signal: shutdown.clone(),
            log_filter: "warn".to_string(),
            version: "test".to_string(),
            bound_addr_sender: Some(addr_tx),
        }));

        let bound = addr_rx.await.unwrap();

        // The model surface answers while the server runs.
        let listing: serde_json::Value = reqwest::get(format!("http://{bound}/v1/models"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing["object"], "list");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop after the shutdown signal")
            .unwrap()
            .unwrap();
    }
}
