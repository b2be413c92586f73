//! Capability traits connecting the server to external collaborators
//!
//! Observers and policies are registered once at construction and invoked at
//! defined points; they are never in the critical path of a reply. All
//! methods take `&self` and implementations must tolerate concurrent calls
//! from multiple in-flight sessions.

use crate::report::FinalizedReport;
use async_trait::async_trait;
use mailhook_common::types::{EmailAddress, Envelope, SessionSnapshot};

/// Observes the lifecycle of SMTP sessions.
///
/// Default implementations are no-ops, so an observer only overrides the
/// notifications it cares about.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// DATA was accepted and the spool target opened
    async fn on_start_data(&self, _session: &SessionSnapshot) {}

    /// A message started arriving (envelope negotiated, body incoming)
    async fn on_start_message(&self, _session: &SessionSnapshot) {}

    /// A chunk of body bytes was received
    async fn on_data(&self, _session_id: &str, _chunk: &[u8]) {}

    /// The connection closed
    async fn on_close(&self, _session_id: &str) {}

    /// The session or its pipeline failed
    async fn on_error(&self, _session_id: &str, _error: &str) {}

    /// A MAIL FROM address was rejected
    async fn on_sender_validation_failed(&self, _session_id: &str, _address: &str) {}

    /// A RCPT TO address was rejected
    async fn on_recipient_validation_failed(&self, _session_id: &str, _address: &str) {}
}

/// Receives every finalized report, after webhook delivery and cleanup.
#[async_trait]
pub trait MessageObserver: Send + Sync {
    async fn on_message(&self, session: &SessionSnapshot, report: &FinalizedReport, raw: &[u8]);
}

/// Decides whether to accept addresses and credentials.
///
/// Absent a registered policy, every address and authentication attempt is
/// accepted (subject to DNS validation, which runs independently).
#[async_trait]
pub trait AddressPolicy: Send + Sync {
    /// Accept or deny a MAIL FROM address
    async fn accept_sender(&self, _envelope: &Envelope, _address: &EmailAddress) -> bool {
        true
    }

    /// Accept or deny a RCPT TO address
    async fn accept_recipient(&self, _envelope: &Envelope, _address: &EmailAddress) -> bool {
        true
    }

    /// Accept or deny an AUTH attempt
    async fn authorize(&self, _username: &str, _password: &str) -> bool {
        true
    }
}
