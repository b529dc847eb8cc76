//! Debug sink: prints each event as a JSON line on stdout.
//!
//! Fire-and-forget; "accepted" means printed.

use async_trait::async_trait;
use serde::Deserialize;

use pgfan_core::CdcEvent;

use crate::connector::{Connector, Delivery};
use crate::error::PipelineError;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DebugConfig {
    pretty: bool,
}

/// Stdout JSON sink for development and demos.
#[derive(Default)]
pub struct DebugConnector {
    pretty: bool,
}

impl DebugConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for DebugConnector {
    async fn connect(&mut self, config: &serde_json::Value) -> Result<(), PipelineError> {
        let config: DebugConfig = if config.is_null() {
            DebugConfig::default()
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| PipelineError::Config(format!("debug connector config: {}", e)))?
        };
        self.pretty = config.pretty;
        Ok(())
    }

    async fn publish(&self, event: &CdcEvent) -> Result<(), PipelineError> {
        let mut event = event.clone();
        event.strip_unchanged_toast();

        let line = if self.pretty {
            serde_json::to_string_pretty(&event)
        } else {
            serde_json::to_string(&event)
        }
        .map_err(|e| PipelineError::Transform(e.to_string()))?;

        println!("{}", line);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn delivery(&self) -> Delivery {
        Delivery::FireAndForget
    }
}
