pub mod bus;
pub mod connector;
mod error;
pub mod manager;
pub mod metrics;
pub mod sinks;

pub use bus::{EventBus, OverflowPolicy, Subscription};
pub use connector::{Connector, ConnectorKind, ConnectorRegistry, Delivery, EventHandler};
pub use error::PipelineError;
pub use manager::PipelineManager;
pub use metrics::Metrics;
pub use sinks::{DebugConnector, WebhookConnector};
