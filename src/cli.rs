use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// fpack - Feature-pack provisioning engine
#[derive(Parser)]
#[command(name = "fpack")]
#[command(about = "Resolve feature packs into a provisioned state and install it")]
#[command(version)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision the request of a configuration file
    Provision {
        /// Path to the provisioning configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Resolve and print the plan without installing anything
        #[arg(long)]
        dry_run: bool,

        /// Print the provisioned state as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Load feature packs and check their descriptors
    Validate {
        /// Root of the local artifact repository
        #[arg(short, long)]
        repository: PathBuf,

        /// Feature-pack coordinates (group:artifact:version)
        #[arg(required = true)]
        coordinates: Vec<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
