//! Wires configuration to the pipeline manager and supervises the run.
//!
//! Transient stream failures restart the whole run with exponential
//! backoff; each restart resumes from the slot's confirmed_flush_lsn, so
//! the server replays everything after the last acknowledged position.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pgfan_config::{Config, PostgresPeerConfig};
use pgfan_pipeline::{ConnectorRegistry, Metrics, PipelineError, PipelineManager};

use crate::http;

/// Exit code for configuration or peer-connect failures.
pub const EXIT_CONFIG: i32 = 1;
/// Exit code for a fatal stream error after the configured retries.
pub const EXIT_STREAM: i32 = 2;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Run the configured pipelines until a shutdown signal. Returns the
/// process exit code.
pub async fn run_pipeline(config_path: &Path, token: CancellationToken) -> i32 {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "Invalid configuration");
            return EXIT_CONFIG;
        }
    };

    let registry = prometheus::Registry::new();
    let metrics = match Metrics::register(&registry) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!(error = %e, "Metrics setup failed");
            return EXIT_CONFIG;
        }
    };

    if let Some(metrics_config) = &config.metrics {
        let listen = metrics_config.listen.clone();
        let registry = registry.clone();
        let http_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(listen, registry, http_token).await {
                warn!(error = %e, "Metrics endpoint stopped");
            }
        });
    }

    let manager = PipelineManager::new(ConnectorRegistry::with_defaults(), metrics);
    let max_retries = max_retries(&config);

    let mut attempts = 0u32;
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match manager.run(&config, token.clone()).await {
            Ok(()) => {
                info!("Pipelines stopped");
                return 0;
            }
            Err(e @ PipelineError::Config(_)) => {
                error!(error = %e, "Fatal configuration error");
                return EXIT_CONFIG;
            }
            Err(e) => {
                if token.is_cancelled() {
                    return 0;
                }

                attempts += 1;
                if attempts > max_retries {
                    error!(attempts, error = %e, "Giving up after configured retries");
                    return match e {
                        PipelineError::Connect { .. } => EXIT_CONFIG,
                        _ => EXIT_STREAM,
                    };
                }

                warn!(
                    attempt = attempts,
                    backoff_secs = backoff.as_secs(),
                    error = %e,
                    "Pipeline run failed; reconnecting from confirmed_flush_lsn"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = token.cancelled() => return 0,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// One-shot demo: stream normalized events from the first postgres peer to
/// stdout as JSON lines.
pub async fn run_stream(config_path: &Path, token: CancellationToken) -> i32 {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "Invalid configuration");
            return EXIT_CONFIG;
        }
    };

    let Some(peer) = config
        .pipeline
        .peers
        .iter()
        .find(|p| p.connector == "postgres")
    else {
        error!("No postgres peer configured");
        return EXIT_CONFIG;
    };

    let pg = match PostgresPeerConfig::from_peer(peer) {
        Ok(pg) => pg,
        Err(e) => {
            error!(error = %e, "Invalid postgres peer config");
            return EXIT_CONFIG;
        }
    };

    match stream_to_stdout(&peer.name, &pg, token).await {
        Ok(()) => 0,
        Err(PipelineError::Connect { peer, message }) => {
            error!(peer = %peer, error = %message, "Connect failed");
            EXIT_CONFIG
        }
        Err(e) => {
            error!(error = %e, "Stream failed");
            EXIT_STREAM
        }
    }
}

async fn stream_to_stdout(
    peer_name: &str,
    pg: &PostgresPeerConfig,
    token: CancellationToken,
) -> Result<(), PipelineError> {
    let mut session =
        pgfan_pg::ReplicationSession::connect(session_config_for_demo(peer_name, pg))
            .await
            .map_err(|e| PipelineError::Connect {
                peer: peer_name.to_string(),
                message: e.to_string(),
            })?;
    session.ensure_publication().await?;
    session.ensure_slot().await?;

    // The demo acknowledges at receive time; there is no sink to wait for.
    let ack = session.ack_handle();
    let (event_tx, mut event_rx) = mpsc::channel(pg.replication.buffer_size);

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            }
            ack.ack(event.source.lsn.into());
        }
    });

    let result = session.run(token, event_tx).await;
    let _ = printer.await;
    result.map_err(PipelineError::Source)
}

fn session_config_for_demo(peer_name: &str, pg: &PostgresPeerConfig) -> pgfan_pg::SessionConfig {
    let mut config = pgfan_pg::SessionConfig::new(pg.conn_string.clone());
    if let Some(slot) = &pg.replication.slot {
        config.slot = slot.clone();
    }
    if let Some(publication) = &pg.replication.publication {
        config.publication = publication.clone();
    }
    config.tables = pg.replication.tables.clone();
    config.standby_interval = Duration::from_secs(pg.replication.standby_update_interval);
    config
}

/// The most generous maxRetries among the configured postgres peers.
fn max_retries(config: &Config) -> u32 {
    config
        .pipeline
        .peers
        .iter()
        .filter(|p| p.connector == "postgres")
        .filter_map(|p| PostgresPeerConfig::from_peer(p).ok())
        .map(|pg| pg.replication.max_retries)
        .max()
        .unwrap_or(5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_run_pipeline_rejects_bad_config() {
        let file = write_config("pipeline: [");
        let code = run_pipeline(file.path(), CancellationToken::new()).await;
        assert_eq!(code, EXIT_CONFIG);
    }

    #[tokio::test]
    async fn test_run_stream_requires_postgres_peer() {
        let file = write_config(
            r#"
pipeline:
  peers:
    - name: out
      connector: debug
"#,
        );
        let code = run_stream(file.path(), CancellationToken::new()).await;
        assert_eq!(code, EXIT_CONFIG);
    }

    #[test]
    fn test_max_retries_uses_most_generous_peer() {
        let config = Config::parse(
            r#"
pipeline:
  peers:
    - name: a
      connector: postgres
      config:
        connString: "host=a"
        replication: { maxRetries: 2 }
    - name: b
      connector: postgres
      config:
        connString: "host=b"
        replication: { maxRetries: 9 }
"#,
        )
        .unwrap();
        assert_eq!(max_retries(&config), 9);
    }
}
