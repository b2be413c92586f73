//! Webhook delivery
//!
//! Fire-and-forget: a failed delivery is logged and the message is gone.
//! There is no retry; consumers that need stronger guarantees sit behind a
//! queue of their own.

use crate::report::FinalizedReport;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mailhook_common::config::WebhookConfig;
use mailhook_common::{Error, Result};
use reqwest::multipart::Form;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP client delivering finalized reports
pub struct WebhookClient {
    url: String,
    client: Client,
    probe_timeout: Duration,
}

impl WebhookClient {
    /// Create a new client with the configured endpoint and timeout
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Webhook(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: config.url.clone(),
            client,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Startup reachability probe. Only ever logs; an unreachable webhook
    /// must not block startup.
    pub async fn probe(&self) {
        let result = self
            .client
            .head(&self.url)
            .timeout(self.probe_timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!(url = %self.url, "Webhook is up and running");
            }
            Ok(response) => {
                warn!(
                    url = %self.url,
                    status = %response.status(),
                    "Webhook seems invalid or down, double check the webhook url"
                );
            }
            Err(e) => {
                warn!(
                    url = %self.url,
                    error = %e,
                    "Webhook seems invalid or down, double check the webhook url"
                );
            }
        }
    }

    /// POST one report as multipart/form-data.
    ///
    /// The `mailinMsg` field carries the JSON report (attachment content is
    /// never serialized into it); each attachment follows as its own field,
    /// named by its generated filename, base64-encoded.
    pub async fn deliver(&self, report: &FinalizedReport) -> Result<()> {
        info!(url = %self.url, "Sending request to webhook");

        let json = serde_json::to_string(report)
            .map_err(|e| Error::Webhook(format!("Failed to serialize report: {}", e)))?;

        let mut form = Form::new().text("mailinMsg", json);
        for attachment in &report.email.attachments {
            form = form.text(
                attachment.generated_file_name.clone(),
                BASE64.encode(&attachment.content),
            );
        }

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Webhook(format!("Error in posting to webhook: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Webhook(format!(
                "Webhook returned status {}",
                response.status()
            )));
        }

        debug!(url = %self.url, "Successfully posted to webhook");

        Ok(())
    }
}
