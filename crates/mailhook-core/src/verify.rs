//! DKIM and SPF verifier clients
//!
//! The pipeline only sees the narrow `verify(..) -> Result<bool>` contract;
//! whether a verifier is an external process, a library, or a network
//! service is an implementation detail. The shipped implementations spawn a
//! configured external command and map exit code zero to a pass.

use async_trait::async_trait;
use mailhook_common::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Verifies the DKIM signature of a raw message
#[async_trait]
pub trait DkimVerifier: Send + Sync {
    async fn verify(&self, raw: &[u8]) -> Result<bool>;
}

/// Verifies SPF for the connection metadata of a message
#[async_trait]
pub trait SpfVerifier: Send + Sync {
    async fn verify(&self, client_ip: &str, sender: &str, helo: &str) -> Result<bool>;
}

/// DKIM verification via an external command fed the raw message on stdin
pub struct CommandDkimVerifier {
    command: PathBuf,
}

impl CommandDkimVerifier {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl DkimVerifier for CommandDkimVerifier {
    async fn verify(&self, raw: &[u8]) -> Result<bool> {
        let mut child = Command::new(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Verifier(format!("Failed to spawn DKIM verifier: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Verifier("DKIM verifier stdin unavailable".to_string()))?;
        stdin
            .write_all(raw)
            .await
            .map_err(|e| Error::Verifier(format!("Failed to feed DKIM verifier: {}", e)))?;
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Verifier(format!("DKIM verifier failed: {}", e)))?;

        debug!(command = %self.command.display(), code = ?status.code(), "DKIM verifier exited");

        Ok(status.success())
    }
}

/// SPF verification via an external command given (ip, sender, helo)
pub struct CommandSpfVerifier {
    command: PathBuf,
}

impl CommandSpfVerifier {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl SpfVerifier for CommandSpfVerifier {
    async fn verify(&self, client_ip: &str, sender: &str, helo: &str) -> Result<bool> {
        let status = Command::new(&self.command)
            .arg(client_ip)
            .arg(sender)
            .arg(helo)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Verifier(format!("Failed to run SPF verifier: {}", e)))?;

        debug!(command = %self.command.display(), code = ?status.code(), "SPF verifier exited");

        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dkim_exit_zero_is_pass() {
        let verifier = CommandDkimVerifier::new("cat");
        assert!(verifier.verify(b"raw message").await.unwrap());
    }

    #[tokio::test]
    async fn test_dkim_exit_nonzero_is_fail() {
        let verifier = CommandDkimVerifier::new("false");
        assert!(!verifier.verify(b"raw message").await.unwrap());
    }

    #[tokio::test]
    async fn test_dkim_missing_command_is_error() {
        let verifier = CommandDkimVerifier::new("/nonexistent/verifydkim");
        assert!(verifier.verify(b"raw message").await.is_err());
    }

    #[tokio::test]
    async fn test_spf_exit_code_convention() {
        let pass = CommandSpfVerifier::new("true");
        assert!(pass
            .verify("192.0.2.1", "a@example.com", "mx.example.com")
            .await
            .unwrap());

        let fail = CommandSpfVerifier::new("false");
        assert!(!fail
            .verify("192.0.2.1", "a@example.com", "mx.example.com")
            .await
            .unwrap());
    }
}
