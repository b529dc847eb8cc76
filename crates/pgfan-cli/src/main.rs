mod cli;
mod http;
mod runner;

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    // Optional .env; absence is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    let code = match cli.command {
        Commands::Pipeline { config } => runner::run_pipeline(&config, token).await,
        Commands::Stream { config } => runner::run_stream(&config, token).await,
    };

    ExitCode::from(code as u8)
}

/// SIGINT and SIGTERM trigger one graceful shutdown via the root token.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Shutdown signal received");
        token.cancel();
    });
}
