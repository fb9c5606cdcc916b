//! Transport harness - end-to-end tests for the injector/client proxy chain
//!
//! This library supervises the external binaries, runs the scenarios and
//! provides the echo server they talk to.

pub mod cli;
pub mod commands;
pub mod common;
pub mod echo;
pub mod process;
pub mod testing;

// Re-export commonly used types for tests
pub use common::config::Config;
pub use common::{Error, Result};
pub use process::{ManagedProcess, ProcessSpec};
pub use testing::{ScenarioOutcome, ScenarioRunner, SuiteReport, TestSuite, Transport};
