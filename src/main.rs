// whatsignal: Bridges messages between a WhatsApp gateway and a Signal
// daemon, per configured channel.
//
// Exit codes: 0 clean shutdown, 1 configuration error, 2 fatal runtime
// error.

use std::path::PathBuf;
use tracing::{error, info};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "whatsignal starting");

    let config_path = config_path();
    let config = match whatsignal::config::load_config_from_path(&config_path) {
        Ok(config) => {
            info!(
                path = %config_path.display(),
                channels = config.channels.len(),
                "config loaded"
            );
            config
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    let result = runtime.block_on(async {
        let supervisor = whatsignal::supervisor::build(Some(config_path), config)?;
        supervisor.run(shutdown_signal()).await
    });

    match result {
        Ok(()) => info!("whatsignal shut down cleanly"),
        Err(e @ whatsignal::error::BridgeError::InvalidConfig(_)) => {
            error!(error = %e, "configuration error");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "fatal runtime error");
            std::process::exit(2);
        }
    }
}

/// `--config <path>`, else `WHATSIGNAL_CONFIG`, else `whatsignal.json`.
fn config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    if let Ok(path) = std::env::var("WHATSIGNAL_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("whatsignal.json")
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
