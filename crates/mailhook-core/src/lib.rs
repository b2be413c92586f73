//! Mailhook Core - SMTP reception and message enrichment
//!
//! This crate provides the inbound SMTP server, the per-message enrichment
//! pipeline (DKIM/SPF validation, spam scoring, MIME parsing, language
//! detection), and webhook delivery of the finalized report.

pub mod message;
pub mod observer;
pub mod pipeline;
pub mod report;
pub mod server;
pub mod smtp;
pub mod spam;
pub mod validate;
pub mod verify;
pub mod webhook;

pub use message::{Attachment, MailAddr, ParsedEmail};
pub use observer::{AddressPolicy, MessageObserver, SessionObserver};
pub use report::FinalizedReport;
pub use server::{Mailhook, Server};
pub use spam::{SpamScorer, SpamdClient};
pub use validate::{AddressKind, AddressValidator, Verdict};
pub use verify::{CommandDkimVerifier, CommandSpfVerifier, DkimVerifier, SpfVerifier};
pub use webhook::WebhookClient;
