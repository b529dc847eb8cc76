//! Webhook sink: POSTs each event as JSON to a configured URL.
//!
//! Acknowledged transport: "accepted" means the endpoint answered 2xx.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use pgfan_core::CdcEvent;

use crate::connector::{Connector, Delivery};
use crate::error::PipelineError;

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookConfig {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

/// HTTP POST sink.
#[derive(Default)]
pub struct WebhookConnector {
    client: Option<reqwest::Client>,
    url: String,
    headers: HashMap<String, String>,
}

impl WebhookConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for WebhookConnector {
    async fn connect(&mut self, config: &serde_json::Value) -> Result<(), PipelineError> {
        let config: WebhookConfig = serde_json::from_value(config.clone())
            .map_err(|e| PipelineError::Config(format!("webhook connector config: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Connect {
                peer: config.url.clone(),
                message: e.to_string(),
            })?;

        self.client = Some(client);
        self.url = config.url;
        self.headers = config.headers;
        Ok(())
    }

    async fn publish(&self, event: &CdcEvent) -> Result<(), PipelineError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| PipelineError::Transport("webhook not connected".to_string()))?;

        let mut event = event.clone();
        event.strip_unchanged_toast();

        let mut request = client.post(&self.url).json(&event);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Transport(format!(
                "webhook returned {}",
                status
            )));
        }

        debug!(url = %self.url, status = %status, "Webhook accepted event");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), PipelineError> {
        self.client = None;
        Ok(())
    }

    fn delivery(&self) -> Delivery {
        Delivery::Acknowledged
    }
}
