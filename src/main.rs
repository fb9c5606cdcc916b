//! Transport harness - end-to-end tests for the injector/client proxy chain
//!
//! Launches the injector and client binaries plus a local echo server,
//! sends a payload through the chain and checks it comes back unchanged.

use clap::Parser;
use commands::Commands;
use harness::{cli, commands};

#[derive(Parser)]
#[command(name = "harness", about = "End-to-end harness for the injector/client proxy chain")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
