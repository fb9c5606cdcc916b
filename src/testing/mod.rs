//! End-to-end scenarios
//!
//! A scenario starts an injector, its client(s) and an echo server, sends a
//! random payload through the client's proxy and checks it comes back
//! unchanged. Everything it started is stopped before the outcome is
//! reported, whatever happened on the way.

pub mod fixtures;
pub mod runner;
pub mod suite;

pub use fixtures::{Scenario, Transport};
pub use runner::{ScenarioOutcome, ScenarioRunner, ScenarioState, TimelineEvent, Verdict};
pub use suite::{SuiteReport, TestSuite};
