//! The YAML configuration model.
//!
//! ```yaml
//! pipeline:
//!   peers:
//!     - name: source-db
//!       connector: postgres
//!       config:
//!         connString: "host=localhost user=app dbname=app"
//!         replication:
//!           tables: ["public.*"]
//!   pipelines:
//!     - name: main
//!       sources: [{ name: source-db }]
//!       transformations:
//!         - type: filter
//!           tables: ["public.users"]
//!       sinks:
//!         - name: console
//!           transformations:
//!             - type: extract
//!               fields: ["id", "name"]
//! ```

use std::path::Path;

use serde::Deserialize;

use pgfan_core::TransformSpec;

use crate::error::{ConfigError, ConfigResult};
use crate::validation::validate;

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub pipeline: PipelineSection,
    /// Optional Prometheus scrape endpoint.
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    /// Listen address for `/metrics` and `/healthz`, e.g. `127.0.0.1:9187`.
    pub listen: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PipelineSection {
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

/// A named connector instance.
#[derive(Debug, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    /// Connector kind (postgres, mqtt, kafka, clickhouse, nats, grpc,
    /// debug, webhook).
    pub connector: String,
    /// Connector-specific configuration blob.
    #[serde(default)]
    pub config: serde_yaml::Value,
}

impl PeerConfig {
    /// The opaque config blob as JSON, which is what connectors consume.
    pub fn config_json(&self) -> ConfigResult<serde_json::Value> {
        serde_json::to_value(&self.config).map_err(|e| ConfigError::InvalidPeerConfig {
            peer: self.name.clone(),
            message: e.to_string(),
        })
    }
}

/// A declarative binding of source peers to sink peers.
#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub sources: Vec<PeerRef>,
    /// Applied to every event before fan-out.
    #[serde(default)]
    pub transformations: Vec<TransformSpec>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Deserialize)]
pub struct PeerRef {
    pub name: String,
}

/// One sink binding with its per-sink transformation chain and queue
/// settings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkConfig {
    pub name: String,
    #[serde(default)]
    pub transformations: Vec<TransformSpec>,
    /// Queue capacity override; falls back to the source's bufferSize.
    #[serde(default)]
    pub buffer_size: Option<usize>,
    #[serde(default)]
    pub overflow: OverflowMode,
}

/// Queue-full policy for one sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowMode {
    /// Block the producer (end-to-end backpressure).
    #[default]
    Block,
    /// Shed the oldest queued events, keeping a count.
    DropOldest,
}

/// The `config` blob of a postgres peer.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresPeerConfig {
    pub conn_string: String,
    #[serde(default)]
    pub replication: ReplicationSettings,
}

impl PostgresPeerConfig {
    pub fn from_peer(peer: &PeerConfig) -> ConfigResult<Self> {
        serde_yaml::from_value(peer.config.clone()).map_err(|e| {
            ConfigError::InvalidPeerConfig {
                peer: peer.name.clone(),
                message: e.to_string(),
            }
        })
    }
}

fn default_standby_interval() -> u64 {
    10
}

fn default_buffer_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    5
}

/// Replication settings of a postgres source peer.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSettings {
    /// Table patterns (`*`, `schema.*`, `schema.table`, `table`).
    #[serde(default)]
    pub tables: Vec<String>,
    pub publication: Option<String>,
    pub slot: Option<String>,
    /// Seconds between standby status updates.
    #[serde(default = "default_standby_interval")]
    pub standby_update_interval: u64,
    /// Default sink queue capacity.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Operations to publish; empty means all.
    #[serde(default)]
    pub ops: Vec<String>,
    #[serde(default)]
    pub ack_policy: AckPolicyConfig,
    /// Reconnect attempts before the stream error becomes fatal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            tables: vec![],
            publication: None,
            slot: None,
            standby_update_interval: default_standby_interval(),
            buffer_size: default_buffer_size(),
            ops: vec![],
            ack_policy: AckPolicyConfig::default(),
            max_retries: default_max_retries(),
        }
    }
}

/// Standby-status flush policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicyConfig {
    /// Advance flush_lsn only to sink-acknowledged positions.
    #[default]
    Acknowledged,
    /// Advance flush_lsn to everything received (at-most-once on crash).
    Received,
}

impl Config {
    /// Parse and validate a YAML document.
    pub fn parse(input: &str) -> ConfigResult<Self> {
        let config: Config = serde_yaml::from_str(input)?;
        validate(&config)?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&input)
    }

    pub fn peer(&self, name: &str) -> Option<&PeerConfig> {
        self.pipeline.peers.iter().find(|p| p.name == name)
    }
}
