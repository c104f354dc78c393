//! HTTP webhook client
//!
//! POSTs `{"name": ..., "data": ...}` to a single configured endpoint.
//! Every call yields a `DeliveryResponse`; transport errors are folded into
//! it with code `-1` rather than surfaced as `Err`.

use std::time::Duration;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::dispatcher::{DeliveryResponse, WebhookSender};

/// HTTP webhook client configuration
#[derive(Debug, Clone)]
pub struct HttpWebhookConfig {
    /// Endpoint every event is POSTed to
    pub url: String,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout
    pub request_timeout: Duration,
}

impl Default for HttpWebhookConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/webhook".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Outbound webhook body
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub name: &'a str,
    pub data: &'a serde_json::Value,
}

pub struct HttpWebhookClient {
    config: HttpWebhookConfig,
    client: reqwest::Client,
}

impl HttpWebhookClient {
    pub fn new(config: HttpWebhookConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookClient {
    async fn deliver(&self, name: &str, data: &serde_json::Value) -> DeliveryResponse {
        let payload = WebhookPayload { name, data };
        debug!("Posting event {} to {}", name, self.config.url);

        match self.client.post(&self.config.url).json(&payload).send().await {
            Ok(response) => {
                let code = i32::from(response.status().as_u16());
                let text = response.text().await.unwrap_or_default();
                DeliveryResponse::new(code, text)
            }
            Err(e) => {
                warn!(error = %e, "Webhook request to {} failed", self.config.url);
                DeliveryResponse::transport_failure(&e)
            }
        }
    }
}
