//! Configuration for Mailhook

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
///
/// Read once at startup (or on restart); immutable afterwards. Every
/// component receives the value it needs at construction time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// SMTP listener configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Message spool configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Enrichment pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Spam scoring daemon configuration
    #[serde(default)]
    pub spamd: SpamdConfig,

    /// Webhook delivery configuration
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Address validation configuration
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// TLS configuration (required when smtp.secure is set)
    pub tls: Option<TlsConfig>,
}

/// SMTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Bind host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// SMTP port
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Banner announced in the 220 greeting
    #[serde(default = "default_banner")]
    pub banner: String,

    /// Commands answered with 502 instead of being executed
    #[serde(default)]
    pub disabled_commands: Vec<String>,

    /// Accept TLS connections (requires [tls] cert/key paths)
    #[serde(default)]
    pub secure: bool,

    /// Maximum message size in bytes
    pub max_message_size: Option<usize>,

    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            banner: default_banner(),
            disabled_commands: Vec::new(),
            secure: false,
            max_message_size: Some(default_max_message_size()),
            max_connections: Some(100),
        }
    }
}

fn default_smtp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_smtp_port() -> u16 {
    2500
}

fn default_banner() -> String {
    "Mailhook SMTP Server".to_string()
}

fn default_max_message_size() -> usize {
    25 * 1024 * 1024 // 25 MB
}

/// Message spool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for in-flight raw messages
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// Keep the spooled file after the pipeline finishes (debugging)
    #[serde(default)]
    pub keep_temp_file: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
            keep_temp_file: false,
        }
    }
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from(".tmp")
}

/// Enrichment pipeline configuration
///
/// Each disabled stage contributes its conservative default to the report
/// instead of running.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub disable_dkim: bool,

    #[serde(default)]
    pub disable_spf: bool,

    #[serde(default)]
    pub disable_spam_score: bool,

    #[serde(default)]
    pub disable_email_parsing: bool,

    #[serde(default)]
    pub disable_language_detection: bool,

    /// External DKIM verifier command (raw message on stdin, exit 0 = pass)
    pub dkim_command: Option<PathBuf>,

    /// External SPF verifier command (ip, sender, helo as arguments)
    pub spf_command: Option<PathBuf>,
}

/// Spam scoring daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamdConfig {
    /// HTTP endpoint of the scoring daemon
    #[serde(default = "default_spamd_url")]
    pub url: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_spamd_timeout")]
    pub timeout_ms: u64,
}

impl Default for SpamdConfig {
    fn default() -> Self {
        Self {
            url: default_spamd_url(),
            timeout_ms: default_spamd_timeout(),
        }
    }
}

fn default_spamd_url() -> String {
    "http://localhost:11333".to_string()
}

fn default_spamd_timeout() -> u64 {
    5000
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Endpoint receiving the finalized reports
    #[serde(default = "default_webhook_url")]
    pub url: String,

    /// Skip delivery entirely
    #[serde(default)]
    pub disabled: bool,

    /// POST timeout in seconds
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,

    /// Startup reachability probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: default_webhook_url(),
            disabled: false,
            timeout_secs: default_webhook_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_webhook_url() -> String {
    "http://localhost:3000/webhook".to_string()
}

fn default_webhook_timeout() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    3
}

/// Address validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Skip the MX lookup on MAIL FROM / RCPT TO domains
    #[serde(default = "default_disable_dns_validation")]
    pub disable_dns_validation: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            disable_dns_validation: default_disable_dns_validation(),
        }
    }
}

fn default_disable_dns_validation() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file
    pub cert_path: PathBuf,

    /// Path to private key file
    pub key_path: PathBuf,
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations, falling back to the
    /// built-in defaults when no file is present
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./mailhook.toml"),
            std::path::PathBuf::from("/etc/mailhook/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Config::default())
    }
}
