//! The connector contract and the explicit factory registry.
//!
//! A connector is one configured transport for CDC events (a broker, a
//! database, a debug printer). The registry maps connector kinds to
//! factories and is passed to the pipeline manager at construction; there
//! is no process-global registration.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use pgfan_core::CdcEvent;

use crate::error::PipelineError;

/// How a connector's transport reports acceptance of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// `publish` returns once the event is handed to the transport; no
    /// confirmation is awaited. Such sinks never hold back the slot's
    /// confirmed_flush_lsn.
    FireAndForget,
    /// `publish` returns once the transport confirmed acceptance (broker
    /// ack, HTTP 2xx). These sinks gate LSN acknowledgement.
    Acknowledged,
}

/// Callback invoked for each event a source-capable connector ingests.
pub type EventHandler = Box<dyn Fn(CdcEvent) + Send + Sync>;

/// The polymorphic interface every sink (and optional source) satisfies.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish underlying resources. Idempotent; must return before any
    /// publish is accepted.
    async fn connect(&mut self, config: &serde_json::Value) -> Result<(), PipelineError>;

    /// Submit one event. Success means the transport accepted it per this
    /// connector's [`Delivery`] mode.
    async fn publish(&self, event: &CdcEvent) -> Result<(), PipelineError>;

    /// Consume events from the external system, invoking `handler` per
    /// event. Optional; sinks keep the default.
    async fn subscribe(&self, topic: &str, _handler: EventHandler) -> Result<(), PipelineError> {
        Err(PipelineError::Unsupported(format!(
            "connector cannot act as a source (topic '{}')",
            topic
        )))
    }

    /// Flush and close. Must be safe to call after a failed `connect`.
    async fn disconnect(&mut self) -> Result<(), PipelineError>;

    fn delivery(&self) -> Delivery {
        Delivery::Acknowledged
    }
}

/// Known connector kinds. Kinds without a registered factory are rejected
/// at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    Postgres,
    Mqtt,
    Kafka,
    Clickhouse,
    Nats,
    Grpc,
    Debug,
    Webhook,
}

impl ConnectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::Postgres => "postgres",
            ConnectorKind::Mqtt => "mqtt",
            ConnectorKind::Kafka => "kafka",
            ConnectorKind::Clickhouse => "clickhouse",
            ConnectorKind::Nats => "nats",
            ConnectorKind::Grpc => "grpc",
            ConnectorKind::Debug => "debug",
            ConnectorKind::Webhook => "webhook",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(ConnectorKind::Postgres),
            "mqtt" => Ok(ConnectorKind::Mqtt),
            "kafka" => Ok(ConnectorKind::Kafka),
            "clickhouse" => Ok(ConnectorKind::Clickhouse),
            "nats" => Ok(ConnectorKind::Nats),
            "grpc" => Ok(ConnectorKind::Grpc),
            "debug" => Ok(ConnectorKind::Debug),
            "webhook" => Ok(ConnectorKind::Webhook),
            other => Err(PipelineError::Config(format!(
                "unknown connector kind '{}'",
                other
            ))),
        }
    }
}

type Factory = Box<dyn Fn() -> Box<dyn Connector> + Send + Sync>;

/// Explicit name-to-factory registry, injected into the pipeline manager.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: HashMap<ConnectorKind, Factory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in sink connectors.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ConnectorKind::Debug, || {
            Box::new(crate::sinks::DebugConnector::new())
        });
        registry.register(ConnectorKind::Webhook, || {
            Box::new(crate::sinks::WebhookConnector::new())
        });
        registry
    }

    pub fn register<F>(&mut self, kind: ConnectorKind, factory: F)
    where
        F: Fn() -> Box<dyn Connector> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    /// Instantiate a connector of the given kind. A kind without a factory
    /// is a configuration error.
    pub fn create(&self, kind: ConnectorKind) -> Result<Box<dyn Connector>, PipelineError> {
        match self.factories.get(&kind) {
            Some(factory) => Ok(factory()),
            None => Err(PipelineError::Config(format!(
                "no connector registered for kind '{}'",
                kind
            ))),
        }
    }

    pub fn contains(&self, kind: ConnectorKind) -> bool {
        self.factories.contains_key(&kind)
    }
}
