//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the identity seed and connection records
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Display name to advertise, overriding the configuration
    #[arg(short, long, global = true)]
    pub name: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the local identity and its current advertisement
    Identity,
    /// List nearby Tether devices
    Scan {
        /// Seconds to scan before printing results
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
    /// Advertise, scan and answer follow requests until interrupted
    Run {
        /// Hold incoming requests for approval instead of accepting them
        #[arg(long)]
        manual: bool,
    },
    /// Send a follow request to a nearby device
    Follow {
        /// Device id as printed by `scan`
        device_id: String,
        /// Seconds to wait for the device to come into range
        #[arg(short, long, default_value_t = 15)]
        wait: u64,
    },
    /// Approve a pending follow request
    Accept {
        /// User id of the requester
        user_id: String,
    },
    /// Decline a pending follow request
    Reject {
        /// User id of the requester
        user_id: String,
    },
    /// Forget a connection
    Unfollow {
        /// User id of the peer
        user_id: String,
    },
    /// List connection records
    Connections,
    /// Print an example configuration file
    ExampleConfig,
}
