//! notegate — offline-tolerant LoRa mesh → OpenStreetMap notes gateway.
//!
//! Ingests `#osmnote` reports from a Meshtastic-style mesh over a serial
//! modem, geolocates them from cached position packets, and publishes them
//! as OSM notes with a durable store-and-forward queue in between.
//! Run `notegate --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod run;
mod status;

use cli::{Cli, Commands};
use config::GatewayConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Run => run::run(&config),
        Commands::Status { limit } => status::run(&config, limit),
        Commands::Queue { limit } => status::queue(&config, limit),
        Commands::Init => {
            print!("{}", config::example_env());
            Ok(())
        }
    }
}
