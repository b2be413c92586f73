//! Finalized message report
//!
//! The report is the wire format consumed by the webhook receiver:
//! the parsed email flattened together with the validation results, the
//! envelope, and the frozen connection snapshot. Constructed once per
//! message, immutable afterwards.

use crate::message::{MailAddr, ParsedEmail};
use mailhook_common::types::SessionSnapshot;
use serde::Serialize;

/// Per-stage enrichment results with their conservative defaults
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub dkim_pass: bool,
    pub spf_pass: bool,
    pub spam_score: f64,
    pub language: String,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            dkim_pass: false,
            spf_pass: false,
            spam_score: 0.0,
            language: String::new(),
        }
    }
}

/// The finalized report delivered to the webhook
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedReport {
    #[serde(flatten)]
    pub email: ParsedEmail,

    /// "pass" or "failed"
    pub dkim: String,

    /// "pass" or "failed"
    pub spf: String,

    pub spam_score: f64,

    pub language: String,

    pub envelope_from: Vec<MailAddr>,

    pub envelope_to: Vec<MailAddr>,

    pub connection: SessionSnapshot,
}

impl FinalizedReport {
    /// Merge every enrichment result into the report.
    ///
    /// `email` is `None` when parsing was disabled or failed; the report
    /// then carries the unparsed sentinel (empty fields, arrays present).
    pub fn new(
        email: Option<ParsedEmail>,
        validation: ValidationResult,
        session: SessionSnapshot,
    ) -> Self {
        let email = email.unwrap_or_default();

        let envelope_from = session
            .envelope
            .from
            .iter()
            .map(|addr| MailAddr::new(addr.to_string(), ""))
            .collect();
        let envelope_to = session
            .envelope
            .to
            .iter()
            .map(|addr| MailAddr::new(addr.to_string(), ""))
            .collect();

        Self {
            email,
            dkim: pass_or_failed(validation.dkim_pass),
            spf: pass_or_failed(validation.spf_pass),
            spam_score: validation.spam_score,
            language: validation.language,
            envelope_from,
            envelope_to,
            connection: session,
        }
    }
}

fn pass_or_failed(pass: bool) -> String {
    if pass { "pass" } else { "failed" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailhook_common::types::{AuthState, EmailAddress, Envelope};
    use pretty_assertions::assert_eq;

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            id: "ab12cd34".to_string(),
            remote_address: "192.0.2.7:45123".to_string(),
            helo: Some("mx.example.com".to_string()),
            envelope: Envelope {
                from: EmailAddress::parse("envelopefrom@jokund.com"),
                to: vec![EmailAddress::parse("envelopeto@jokund.com").unwrap()],
                client_ip: Some("192.0.2.7".to_string()),
                helo: Some("mx.example.com".to_string()),
            },
            authentication: AuthState::default(),
            received_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_defaults_for_unparsed_message() {
        let report = FinalizedReport::new(None, ValidationResult::default(), snapshot());

        assert_eq!(report.dkim, "failed");
        assert_eq!(report.spf, "failed");
        assert_eq!(report.spam_score, 0.0);
        assert_eq!(report.language, "");
        assert_eq!(
            report.envelope_from,
            vec![MailAddr::new("envelopefrom@jokund.com", "")]
        );
        assert_eq!(
            report.envelope_to,
            vec![MailAddr::new("envelopeto@jokund.com", "")]
        );
    }

    #[test]
    fn test_cc_and_attachments_always_arrays() {
        let report = FinalizedReport::new(None, ValidationResult::default(), snapshot());
        let json = serde_json::to_value(&report).unwrap();

        assert!(json["cc"].is_array());
        assert!(json["attachments"].is_array());
        assert!(json["headers"].is_object());
        assert_eq!(json["spamScore"], 0.0);
        assert_eq!(json["envelopeFrom"][0]["address"], "envelopefrom@jokund.com");
        assert_eq!(json["connection"]["id"], "ab12cd34");
    }

    #[test]
    fn test_attachment_content_never_in_json() {
        let email = crate::message::parse_message(
            concat!(
                "From: a@example.com\r\n",
                "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
                "\r\n",
                "--b\r\n",
                "Content-Type: text/plain\r\n",
                "\r\n",
                "hi\r\n",
                "--b\r\n",
                "Content-Disposition: attachment; filename=\"x.bin\"\r\n",
                "Content-Type: application/octet-stream\r\n",
                "\r\n",
                "secret-bytes\r\n",
                "--b--\r\n",
            )
            .as_bytes(),
        )
        .unwrap();

        let report = FinalizedReport::new(Some(email), ValidationResult::default(), snapshot());
        let json = serde_json::to_value(&report).unwrap();

        let attachment = &json["attachments"][0];
        assert_eq!(attachment["generatedFileName"], "x.bin");
        assert!(attachment.get("content").is_none());
        assert!(attachment["checksum"].is_string());
        assert!(attachment["length"].as_u64().unwrap() > 0);
    }
}
