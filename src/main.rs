//! Collector entry point: logging, `.env`, CLI, then hand off to the library.

use clap::Parser;
use tracing::error;

use guild_stats::settings::{Args, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise tracing (respects RUST_LOG env, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // .env first so clap's env fallbacks can see it.
    dotenv::dotenv().ok();

    let settings = Settings::from_args(Args::parse()).inspect_err(|e| {
        error!(error = %e, "invalid configuration");
    })?;

    guild_stats::run(settings).await?;
    tracing::info!("exiting");
    Ok(())
}
