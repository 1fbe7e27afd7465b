use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use agent_fleet::config::{init_logging, Config};
use agent_fleet::console::Console;
use agent_fleet::nats::NatsConnector;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;

    let connector = Arc::new(NatsConnector::new(cfg.broker_url.clone()));
    let console = Console::new(
        connector,
        cfg.operator.clone(),
        cfg.backoff_base(),
        cfg.backoff_ceiling(),
    );

    info!(target = "fleet_console", url = %cfg.broker_url, "connecting");
    console.connect().await?;
    for agent in console.agents() {
        info!(
            target = "fleet_console",
            agent_id = %agent.id,
            state = ?agent.state,
            "agent online"
        );
    }

    let mut last_seq = 0u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for event in console.events(cfg.agent.as_deref()) {
                    if event.seq <= last_seq {
                        continue;
                    }
                    last_seq = event.seq;
                    println!(
                        "{} {:?} {} {}",
                        event.at.format("%H:%M:%S"),
                        event.kind,
                        event.agent_id.as_deref().unwrap_or("-"),
                        event.payload,
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!(target = "fleet_console", "shutting down");
    console.shutdown().await;
    Ok(())
}
