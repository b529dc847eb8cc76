//! The pipeline manager: peers, fan-out, sink workers, and acknowledgement.
//!
//! Startup connects every sink peer sequentially (aborting on the first
//! failure), builds one replication session per postgres source peer, and
//! launches one worker task per sink binding. Events flow from the session
//! through the source chain into per-sink queues, where each worker applies
//! the sink chain and publishes.
//!
//! Sink errors are logged and counted but never propagate upstream: a
//! misbehaving sink must not halt replication. Delivery is at-least-once,
//! with drops on persistent sink failure.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pgfan_config::{AckPolicyConfig, Config, OverflowMode, PipelineConfig, PostgresPeerConfig};
use pgfan_core::{apply_chain, compile_chain, CdcEvent, Op, Transformation};
use pgfan_pg::{AckHandle, AckPolicy, Lsn, ReplicationSession, SessionConfig};

use crate::bus::{EventBus, OverflowPolicy, Subscription};
use crate::connector::{Connector, ConnectorKind, ConnectorRegistry, Delivery};
use crate::error::PipelineError;
use crate::metrics::Metrics;

/// How long a sink worker may keep draining its queue after shutdown began.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// A connected sink peer shared by its workers.
struct SinkPeer {
    name: String,
    delivery: Delivery,
    connector: Mutex<Box<dyn Connector>>,
}

/// Tracks the lowest LSN every acknowledging sink has delivered and feeds it
/// back to the session's standby status.
struct AckTracker {
    ack: AckHandle,
    acking: Vec<Arc<AtomicU64>>,
}

impl AckTracker {
    /// Called by workers of acknowledging sinks after handling an event.
    fn sink_delivered(&self) {
        let min = self
            .acking
            .iter()
            .map(|lsn| lsn.load(Ordering::Acquire))
            .min();
        if let Some(min) = min {
            if min > 0 {
                self.ack.ack(Lsn::from(min));
            }
        }
    }

    /// Called by the source pump. With no acknowledging sinks the advance
    /// is immediate.
    fn immediate(&self, lsn: u64) {
        if self.acking.is_empty() {
            self.ack.ack(Lsn::from(lsn));
        }
    }
}

/// One pipeline's view of a source: its source-level chain and its sinks'
/// queues.
struct Fanout {
    source_chain: Vec<Transformation>,
    bus: EventBus,
}

/// Builds and runs the configured pipelines until cancellation or a fatal
/// source error.
pub struct PipelineManager {
    registry: ConnectorRegistry,
    metrics: Metrics,
}

impl PipelineManager {
    pub fn new(registry: ConnectorRegistry, metrics: Metrics) -> Self {
        Self { registry, metrics }
    }

    /// Run until the token is cancelled (returns `Ok`) or a source fails
    /// (returns the error; the caller may reconnect with backoff).
    pub async fn run(&self, config: &Config, token: CancellationToken) -> Result<(), PipelineError> {
        let sink_peers = self.connect_sink_peers(config).await?;

        // Everything spawned below stops on this child token, so a failing
        // source can halt its siblings without cancelling the caller's.
        let run_token = token.child_token();

        let mut source_tasks: Vec<JoinHandle<Result<(), PipelineError>>> = Vec::new();
        let mut worker_tasks: Vec<JoinHandle<()>> = Vec::new();

        for (source_name, pipelines) in group_by_source(config) {
            let peer = config.peer(source_name).ok_or_else(|| {
                PipelineError::Config(format!("unknown source peer '{}'", source_name))
            })?;
            let pg = PostgresPeerConfig::from_peer(peer)
                .map_err(|e| PipelineError::Config(e.to_string()))?;

            let mut session = ReplicationSession::connect(session_config(source_name, &pg))
                .await
                .map_err(|e| PipelineError::Connect {
                    peer: source_name.to_string(),
                    message: e.to_string(),
                })?;
            session.ensure_publication().await?;
            session.ensure_slot().await?;

            let mut tracker = AckTracker {
                ack: session.ack_handle(),
                acking: Vec::new(),
            };

            let mut fanouts = Vec::new();
            let mut pending_workers = Vec::new();
            for pipeline in &pipelines {
                let (fanout, workers) =
                    self.build_fanout(pipeline, source_name, &pg, &sink_peers, &mut tracker)?;
                fanouts.push(fanout);
                pending_workers.extend(workers);
            }

            // Workers spawn only once the tracker knows every acknowledging
            // sink, so no ack can race past a late-registered sink.
            let tracker = Arc::new(tracker);
            for (mut worker, subscription) in pending_workers {
                if worker.peer.delivery == Delivery::Acknowledged {
                    worker.tracker = Some(tracker.clone());
                }
                worker_tasks.push(tokio::spawn(worker.run(subscription)));
            }

            info!(
                source = source_name,
                pipelines = pipelines.len(),
                "Source wired to pipelines"
            );

            let (event_tx, event_rx) = mpsc::channel(pg.replication.buffer_size);
            let session_token = run_token.clone();
            source_tasks.push(tokio::spawn(async move {
                session
                    .run(session_token, event_tx)
                    .await
                    .map_err(PipelineError::Source)
            }));
            source_tasks.push(tokio::spawn(source_pump(event_rx, fanouts, tracker)));
        }

        // Sources run until cancellation or failure. The first failure
        // cancels the rest so the whole run tears down coherently.
        let mut result: Result<(), PipelineError> = Ok(());
        for task in source_tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Source task failed");
                    run_token.cancel();
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) => {
                    run_token.cancel();
                    if result.is_ok() {
                        result = Err(PipelineError::Transport(format!(
                            "source task panicked: {}",
                            e
                        )));
                    }
                }
            }
        }

        // Buses dropped with the pumps; workers drain what is queued, up to
        // the deadline.
        for task in worker_tasks {
            let mut task = task;
            if tokio::time::timeout(DRAIN_DEADLINE, &mut task).await.is_err() {
                warn!("Sink worker exceeded drain deadline; aborting");
                task.abort();
            }
        }

        for peer in sink_peers.values() {
            if let Err(e) = peer.connector.lock().await.disconnect().await {
                warn!(peer = %peer.name, error = %e, "Peer disconnect failed");
            }
        }

        result
    }

    /// Instantiate and connect every non-postgres peer, in declaration
    /// order, aborting on the first failure.
    async fn connect_sink_peers(
        &self,
        config: &Config,
    ) -> Result<HashMap<String, Arc<SinkPeer>>, PipelineError> {
        let mut peers = HashMap::new();

        for peer in &config.pipeline.peers {
            let kind = ConnectorKind::from_str(&peer.connector)?;
            if kind == ConnectorKind::Postgres {
                continue;
            }

            let mut connector = self.registry.create(kind)?;
            let peer_config = peer
                .config_json()
                .map_err(|e| PipelineError::Config(e.to_string()))?;

            connector
                .connect(&peer_config)
                .await
                .map_err(|e| PipelineError::Connect {
                    peer: peer.name.clone(),
                    message: e.to_string(),
                })?;

            info!(peer = %peer.name, kind = %kind, "Peer connected");
            peers.insert(
                peer.name.clone(),
                Arc::new(SinkPeer {
                    name: peer.name.clone(),
                    delivery: connector.delivery(),
                    connector: Mutex::new(connector),
                }),
            );
        }

        Ok(peers)
    }

    /// Wire one pipeline's sinks onto a fresh bus. Workers are returned
    /// unspawned; the caller attaches the source's ack tracker first.
    fn build_fanout(
        &self,
        pipeline: &PipelineConfig,
        source_name: &str,
        pg: &PostgresPeerConfig,
        sink_peers: &HashMap<String, Arc<SinkPeer>>,
        tracker: &mut AckTracker,
    ) -> Result<(Fanout, Vec<(SinkWorker, Subscription)>), PipelineError> {
        let source_chain = compile_chain(&pipeline.transformations)
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        let mut bus = EventBus::new();
        let mut workers = Vec::new();
        for sink in &pipeline.sinks {
            let peer = sink_peers
                .get(&sink.name)
                .cloned()
                .ok_or_else(|| PipelineError::Config(format!("unknown sink '{}'", sink.name)))?;

            let capacity = sink.buffer_size.unwrap_or(pg.replication.buffer_size);
            let policy = match sink.overflow {
                OverflowMode::Block => OverflowPolicy::Block,
                OverflowMode::DropOldest => OverflowPolicy::DropOldest,
            };
            let subscription = bus.subscribe(&sink.name, capacity, policy);

            let chain = compile_chain(&sink.transformations)
                .map_err(|e| PipelineError::Config(e.to_string()))?;

            let delivered = Arc::new(AtomicU64::new(0));
            if peer.delivery == Delivery::Acknowledged {
                tracker.acking.push(delivered.clone());
            }

            let worker = SinkWorker {
                pipeline: pipeline.name.clone(),
                source: source_name.to_string(),
                chain,
                peer,
                delivered,
                tracker: None,
                metrics: self.metrics.clone(),
            };
            workers.push((worker, subscription));
        }

        Ok((Fanout { source_chain, bus }, workers))
    }
}

/// Group the configured pipelines by the source peers they reference; one
/// replication session is created per source peer regardless of how many
/// pipelines consume it (the slot allows a single consumer).
fn group_by_source(config: &Config) -> Vec<(&str, Vec<&PipelineConfig>)> {
    let mut by_source: Vec<(&str, Vec<&PipelineConfig>)> = Vec::new();
    for pipeline in &config.pipeline.pipelines {
        for source in &pipeline.sources {
            match by_source.iter_mut().find(|(name, _)| *name == source.name) {
                Some((_, list)) => list.push(pipeline),
                None => by_source.push((source.name.as_str(), vec![pipeline])),
            }
        }
    }
    by_source
}

fn session_config(source_name: &str, pg: &PostgresPeerConfig) -> SessionConfig {
    let mut config = SessionConfig::new(pg.conn_string.clone());
    config.slot = pg
        .replication
        .slot
        .clone()
        .unwrap_or_else(|| format!("pgfan_{}", sanitize_ident(source_name)));
    config.publication = pg
        .replication
        .publication
        .clone()
        .unwrap_or_else(|| format!("pgfan_{}_pub", sanitize_ident(source_name)));
    config.tables = pg.replication.tables.clone();
    config.ops = pg
        .replication
        .ops
        .iter()
        .filter_map(|code| Op::from_code(code).ok())
        .collect();
    config.standby_interval = Duration::from_secs(pg.replication.standby_update_interval);
    config.ack_policy = match pg.replication.ack_policy {
        AckPolicyConfig::Acknowledged => AckPolicy::Acknowledged,
        AckPolicyConfig::Received => AckPolicy::Received,
    };
    config
}

/// Slot and publication names allow `[a-z0-9_]` only.
fn sanitize_ident(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Reads the source's event channel, applies each pipeline's source chain,
/// and multicasts into the sink queues. Ends when the session closes its
/// channel; dropping the buses closes the sink queues in turn.
async fn source_pump(
    mut events: mpsc::Receiver<CdcEvent>,
    fanouts: Vec<Fanout>,
    tracker: Arc<AckTracker>,
) -> Result<(), PipelineError> {
    while let Some(event) = events.recv().await {
        let lsn = event.source.lsn;
        for fanout in &fanouts {
            match apply_chain(&fanout.source_chain, event.clone()) {
                Some(out) => {
                    fanout.bus.publish(&out).await;
                }
                None => continue,
            }
        }
        tracker.immediate(lsn);
    }
    Ok(())
}

/// One queue consumer per sink binding.
struct SinkWorker {
    pipeline: String,
    source: String,
    chain: Vec<Transformation>,
    peer: Arc<SinkPeer>,
    delivered: Arc<AtomicU64>,
    tracker: Option<Arc<AckTracker>>,
    metrics: Metrics,
}

impl SinkWorker {
    async fn run(self, mut subscription: Subscription) {
        while let Some((event, dropped)) = subscription.recv().await {
            if dropped > 0 {
                warn!(
                    sink = %self.peer.name,
                    dropped,
                    "Sink queue shed events under drop-oldest policy"
                );
                self.metrics
                    .dropped_events
                    .with_label_values(&[&self.peer.name])
                    .inc_by(dropped);
            }
            self.handle(event).await;
        }
    }

    async fn handle(&self, event: CdcEvent) {
        let timer = self
            .metrics
            .processing_duration
            .with_label_values(&[&self.pipeline, &self.source, &self.peer.name])
            .start_timer();

        let lsn = event.source.lsn;
        let outcome = match apply_chain(&self.chain, event) {
            // A filtered event is handled: it must still advance the ack.
            None => Ok(()),
            Some(event) => self.peer.connector.lock().await.publish(&event).await.map(|_| {
                self.metrics
                    .events_processed
                    .with_label_values(&[&self.pipeline, &self.source, &self.peer.name])
                    .inc();
            }),
        };

        if let Err(e) = outcome {
            // At-least-once with drops: log, count, advance.
            error!(
                pipeline = %self.pipeline,
                peer = %self.peer.name,
                kind = e.kind(),
                error = %e,
                "Publish failed; event dropped"
            );
            match e {
                PipelineError::Transform(_) => self
                    .metrics
                    .transformation_errors
                    .with_label_values(&[e.kind(), &self.pipeline, &self.source, &self.peer.name])
                    .inc(),
                _ => self
                    .metrics
                    .publish_errors
                    .with_label_values(&[&self.peer.name])
                    .inc(),
            }
        }

        self.delivered.fetch_max(lsn, Ordering::AcqRel);
        if let Some(tracker) = &self.tracker {
            tracker.sink_delivered();
        }

        timer.observe_duration();
    }
}
