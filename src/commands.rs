//! CLI command definitions
//!
//! Defines the clap commands for the harness CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run end-to-end scenarios against the injector and client binaries
    Run {
        /// Scenario to run: tcp, i2p or all
        #[arg(long, short, default_value = "all")]
        scenario: String,

        /// Configuration file (default: platform config dir)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Run the selected scenarios concurrently
        #[arg(long)]
        parallel: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Debug logging, including output of the managed processes
        #[arg(long, short)]
        verbose: bool,
    },

    /// List available scenarios
    List,

    /// Serve the echo endpoint until interrupted
    Echo {
        /// Port to listen on (127.0.0.1)
        #[arg(long, default_value = "7072")]
        port: u16,
    },
}
