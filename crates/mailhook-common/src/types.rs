//! Common types for Mailhook

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.splitn(2, '@').collect();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            Some(Self::new(parts[0], parts[1]))
        } else {
            None
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// Message envelope (SMTP level)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender (MAIL FROM)
    pub from: Option<EmailAddress>,

    /// Recipients (RCPT TO), in acceptance order
    pub to: Vec<EmailAddress>,

    /// Client IP address
    pub client_ip: Option<String>,

    /// HELO/EHLO hostname
    pub helo: Option<String>,
}

/// Authentication state of a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthState {
    pub authenticated: bool,
    pub username: Option<String>,
}

/// Immutable value copy of a session, taken the moment DATA completes.
///
/// The live session is reused by the protocol layer for the next message on
/// the same connection, so the pipeline must never hold a reference into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Short connection id
    pub id: String,

    /// Remote socket address
    pub remote_address: String,

    /// HELO/EHLO hostname
    pub helo: Option<String>,

    /// Negotiated envelope
    pub envelope: Envelope,

    /// Authentication state
    pub authentication: AuthState,

    /// When the snapshot was taken
    pub received_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Remote IP without the port, as handed to the SPF verifier
    pub fn remote_ip(&self) -> &str {
        self.remote_address
            .rsplit_once(':')
            .map(|(ip, _)| ip)
            .unwrap_or(&self.remote_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_email_address_parse() {
        let email = EmailAddress::parse("user@example.com").unwrap();
        assert_eq!(email.local, "user");
        assert_eq!(email.domain, "example.com");
        assert_eq!(email.to_string(), "user@example.com");
    }

    #[test]
    fn test_email_address_invalid() {
        assert!(EmailAddress::parse("invalid").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
        assert!(EmailAddress::parse("user@").is_none());
    }

    #[test]
    fn test_snapshot_remote_ip() {
        let snapshot = SessionSnapshot {
            id: "ab12cd34".to_string(),
            remote_address: "192.0.2.7:45123".to_string(),
            helo: Some("mx.example.com".to_string()),
            envelope: Envelope::default(),
            authentication: AuthState::default(),
            received_at: Utc::now(),
        };
        assert_eq!(snapshot.remote_ip(), "192.0.2.7");
    }
}
