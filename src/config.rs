use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser, Clone)]
#[command(name = "fleet-console")]
#[command(about = "Operator console for an agent fleet coordinated over NATS")]
pub struct Config {
    /// Broker URL.
    #[arg(long, default_value = "nats://127.0.0.1:4222")]
    pub broker_url: String,

    /// Name written into durable help-response records.
    #[arg(long, default_value = "operator")]
    pub operator: String,

    /// First reconnect delay, in milliseconds. Doubles per attempt.
    #[arg(long, default_value_t = 1000)]
    pub backoff_base: u64,

    /// Reconnect delay ceiling, in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    pub backoff_ceiling: u64,

    /// Only follow events from this agent.
    #[arg(long)]
    pub agent: Option<String>,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling)
    }
}

pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_new(cfg.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
