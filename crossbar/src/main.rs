use args::Args;
use clap::Parser;
use config::Config;
use tokio_util::sync::CancellationToken;

mod args;

const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:4000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    let listen_address = args
        .listen
        .or(config.server.listen_address)
        .unwrap_or_else(|| {
            DEFAULT_LISTEN_ADDRESS
                .parse()
                .expect("default listen address is valid")
        });

    let log_filter = args.log_filter.clone().unwrap_or_else(|| config.log_filter().to_string());

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    server::serve(server::ServeConfig {
        listen_address,
        config,
        shutdown_signal: shutdown,
        log_filter,
        version: env!("CARGO_PKG_VERSION").to_string(),
        bound_addr_sender: None,
    })
    .await
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                log::error!("failed to listen for ctrl-c: {error}");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => log::error!("failed to listen for SIGTERM: {error}"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        shutdown.cancel();
    });
}
