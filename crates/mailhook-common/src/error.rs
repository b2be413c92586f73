//! Error types for Mailhook

use thiserror::Error;

/// Main error type for Mailhook
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Verifier error: {0}")]
    Verifier(String),

    #[error("Spam scoring error: {0}")]
    SpamScore(String),

    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Mailhook
pub type Result<T> = std::result::Result<T, Error>;
