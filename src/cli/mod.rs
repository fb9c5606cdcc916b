//! CLI command handling
//!
//! Dispatches CLI commands to the suite and echo server and formats output.

use colored::Colorize;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{logging, Error, Result};
use crate::echo::EchoServer;
use crate::testing::{TestSuite, Transport};

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            scenario,
            config,
            parallel,
            json,
            verbose,
        } => {
            let guard = logging::init(verbose);
            if let Some(path) = &guard.path {
                tracing::debug!("Diagnostic log: {}", path.display());
            }

            let config = Config::load(config.as_deref())?;
            let suite = TestSuite::select(config, &scenario)?;

            if !json {
                let names: Vec<_> = suite.scenarios().iter().map(|t| t.name()).collect();
                println!(
                    "\n{} {}",
                    "Running Scenarios:".blue().bold(),
                    names.join(", ").white().bold()
                );
            }

            let report = suite.run(parallel).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report.to_json())?);
            } else {
                report.print_summary();
                if let Some(path) = &guard.path {
                    println!("  {}", format!("Log: {}", path.display()).dimmed());
                }
            }

            if report.passed() {
                Ok(())
            } else {
                Err(Error::Internal(format!(
                    "{} scenario(s) failed",
                    report.failed()
                )))
            }
        }

        Commands::List => {
            for transport in Transport::ALL {
                println!(
                    "  {:<5} {}",
                    transport.name().white().bold(),
                    transport.description().dimmed()
                );
            }
            Ok(())
        }

        Commands::Echo { port } => {
            logging::init_stdout();
            let server = EchoServer::start(port).await?;
            println!("Echo server listening on http://{}/?content=...", server.addr());

            tokio::signal::ctrl_c().await?;
            println!("\nShutting down...");
            server.stop_listening().await
        }
    }
}
