//! Mailhook - SMTP-to-webhook server entry point

use anyhow::Result;
use mailhook_common::config::Config;
use mailhook_core::Mailhook;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_logging(&config);

    info!("Starting Mailhook server...");

    let server = Mailhook::new(config).start().await?;
    info!("Mailhook server started on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    server.shutdown();
    info!("Mailhook server shutdown complete");

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mailhook=debug", config.logging.level)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
