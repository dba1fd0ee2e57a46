//! Outreach Engine — timed multi-channel campaign sequences for advisor
//! outreach.
//!
//! `simulate` steps a demo campaign through simulated days and prints fleet
//! analytics. `run` drives the due-step scheduler on the wall clock until
//! interrupted.

mod simulation;

use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use outreach_client::{CampaignStore, EngineCommands, ErrorChannel};
use outreach_core::config::{AppConfig, LoggingConfig};
use outreach_core::event_bus::BroadcastSink;
use outreach_sequences::{CampaignRepository, InMemoryRepository, OutreachEngine, SimulatedDelivery};

use crate::simulation::{demo_definition, SimulationOptions};

#[derive(Parser, Debug)]
#[command(name = "outreach-engine")]
#[command(about = "Timed multi-channel outreach campaigns for advisors")]
#[command(version)]
struct Cli {
    /// Config file (TOML); environment variables still apply on top
    #[arg(long, env = "OUTREACH_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "OUTREACH__NODE_ID")]
    node_id: Option<String>,

    /// Due-step scan interval in milliseconds (overrides config)
    #[arg(long, env = "OUTREACH__SCHEDULER__SCAN_INTERVAL_MS")]
    scan_interval_ms: Option<u64>,

    /// Share of simulated sends that fail (overrides config)
    #[arg(long)]
    failure_rate: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a demo campaign over simulated days and print analytics as JSON
    Simulate {
        #[arg(long, default_value_t = 21)]
        days: u32,

        #[arg(long, default_value_t = 25)]
        leads: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Enroll demo leads and run the scheduler until Ctrl-C
    Run {
        #[arg(long, default_value_t = 10)]
        leads: usize,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.filter.as_str().into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = AppConfig::load(cli.config.as_deref());
    let mut config = loaded.as_ref().cloned().unwrap_or_default();
    init_tracing(&config.logging);
    if let Err(e) = &loaded {
        warn!(error = %e, "Failed to load config, using defaults");
    }

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(interval) = cli.scan_interval_ms {
        config.scheduler.scan_interval_ms = interval;
    }
    if let Some(rate) = cli.failure_rate {
        config.delivery.simulated_failure_rate = rate;
    }

    info!(
        node_id = %config.node_id,
        scan_interval_ms = config.scheduler.scan_interval_ms,
        max_dispatch_per_cycle = config.scheduler.max_dispatch_per_cycle,
        send_timeout_ms = config.delivery.send_timeout_ms,
        "Configuration loaded"
    );

    match cli.command {
        Command::Simulate { days, leads, seed } => {
            let options = SimulationOptions { days, leads, seed };
            let summary = simulation::simulate(&config, &options).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Run { leads } => run(config, leads).await?,
    }

    Ok(())
}

async fn run(config: AppConfig, leads: usize) -> anyhow::Result<()> {
    let repository = Arc::new(InMemoryRepository::new());
    let sink = Arc::new(BroadcastSink::new(1024));
    let mut events = sink.subscribe();
    let engine = OutreachEngine::new(
        repository.clone(),
        Arc::new(SimulatedDelivery::new(&config.delivery)),
    )
    .with_config(&config.scheduler, &config.delivery)
    .with_event_sink(sink);

    let def_id = engine.register_definition(demo_definition()).await?;
    let now = Utc::now();
    for n in 0..leads {
        let start = now + Duration::minutes(n as i64);
        engine
            .enroll(def_id, &format!("lead-{:04}", n + 1), "adv-1", start)
            .await?;
    }

    let store = Arc::new(CampaignStore::new(
        Arc::new(EngineCommands::new(engine.clone())),
        Arc::new(ErrorChannel::new()),
    ));
    store.refresh(&repository.list_instances(Some(def_id)).await?);

    // Keep the client view in step with the engine.
    let feed_store = store.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    feed_store.apply_event(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event feed lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(leads, definition_id = %def_id, "Outreach engine is running");

    let mut interval = tokio::time::interval(std::time::Duration::from_millis(
        config.scheduler.scan_interval_ms.max(1),
    ));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = engine.run_due_cycle(Utc::now()).await {
                    error!(error = %e, "Due-step cycle failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let fleet = engine.get_fleet_analytics(def_id).await?;
    println!("{}", serde_json::to_string_pretty(&fleet)?);
    Ok(())
}
