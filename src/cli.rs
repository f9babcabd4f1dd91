//! CLI definitions for notegate.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(
    name = "notegate",
    version,
    about = "LoRa mesh → OpenStreetMap notes gateway\n\nReceives #osmnote reports over a Meshtastic-style mesh, geolocates them from cached positions, and publishes them as OSM notes — store-and-forward while the uplink is down.",
    long_about = None
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway daemon (Ctrl-C or SIGTERM to stop)
    Run,

    /// One-shot view of the report store: totals, queue depth, recent rows
    Status {
        /// How many recent rows to print
        #[clap(long, default_value = "10")]
        limit: usize,
    },

    /// List PENDING reports oldest-first, with their last upstream error
    Queue {
        /// Maximum rows to print
        #[clap(long, default_value = "20")]
        limit: usize,
    },

    /// Print an example environment file to stdout
    Init,
}
