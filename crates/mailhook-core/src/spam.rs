//! Spam scoring daemon client
//!
//! Talks to an rspamd-compatible scoring daemon over its HTTP API. The
//! pipeline treats any error here as "scoring unavailable" and substitutes
//! the 0.0 default.

use async_trait::async_trait;
use mailhook_common::config::SpamdConfig;
use mailhook_common::types::SessionSnapshot;
use mailhook_common::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Computes a spam likelihood score for a raw message
#[async_trait]
pub trait SpamScorer: Send + Sync {
    async fn score(&self, raw: &[u8], session: &SessionSnapshot) -> Result<f64>;
}

#[derive(Debug, Deserialize)]
struct SpamdResponse {
    #[serde(default)]
    score: f64,
}

/// HTTP client for the scoring daemon
pub struct SpamdClient {
    url: String,
    client: Client,
}

impl SpamdClient {
    /// Create a new client with the configured endpoint and timeout
    pub fn new(config: &SpamdConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::SpamScore(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: config.url.clone(),
            client,
        })
    }
}

#[async_trait]
impl SpamScorer for SpamdClient {
    async fn score(&self, raw: &[u8], session: &SessionSnapshot) -> Result<f64> {
        let url = format!("{}/checkv2", self.url);

        debug!(url = %url, size = raw.len(), "Scoring message");

        let mut request = self.client.post(&url).body(raw.to_vec());

        if let Some(from) = &session.envelope.from {
            request = request.header("From", from.to_string());
        }
        for rcpt in &session.envelope.to {
            request = request.header("Rcpt", rcpt.to_string());
        }
        request = request.header("IP", session.remote_ip().to_string());
        if let Some(helo) = &session.helo {
            request = request.header("Helo", helo.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::SpamScore(format!("Scoring request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(status = %status, "Scoring daemon returned error status");
            return Err(Error::SpamScore(format!(
                "Scoring daemon returned status {}",
                status
            )));
        }

        let body: SpamdResponse = response
            .json()
            .await
            .map_err(|e| Error::SpamScore(format!("Failed to parse scoring response: {}", e)))?;

        debug!(score = body.score, "Spam score computed");

        Ok(body.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailhook_common::types::{AuthState, Envelope};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            id: "ab12cd34".to_string(),
            remote_address: "192.0.2.7:45123".to_string(),
            helo: Some("mx.example.com".to_string()),
            envelope: Envelope::default(),
            authentication: AuthState::default(),
            received_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_score_parsed_from_daemon() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkv2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "score": 3.3,
                "action": "add header"
            })))
            .mount(&server)
            .await;

        let client = SpamdClient::new(&SpamdConfig {
            url: server.uri(),
            timeout_ms: 1000,
        })
        .unwrap();

        let score = client.score(b"raw message", &snapshot()).await.unwrap();
        assert!((score - 3.3).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_error() {
        let client = SpamdClient::new(&SpamdConfig {
            url: "http://127.0.0.1:1".to_string(),
            timeout_ms: 300,
        })
        .unwrap();

        assert!(client.score(b"raw message", &snapshot()).await.is_err());
    }

    #[tokio::test]
    async fn test_error_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkv2"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = SpamdClient::new(&SpamdConfig {
            url: server.uri(),
            timeout_ms: 1000,
        })
        .unwrap();

        assert!(client.score(b"raw message", &snapshot()).await.is_err());
    }
}
