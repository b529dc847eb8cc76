//! Built-in sink connectors.

mod debug;
mod webhook;

pub use debug::DebugConnector;
pub use webhook::WebhookConnector;
