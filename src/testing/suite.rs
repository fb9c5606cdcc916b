//! Test suite: the fixed set of scenarios and the overall verdict

use colored::Colorize;
use futures_util::future::join_all;

use crate::common::config::Config;
use crate::common::{Error, Result};

use super::fixtures::Transport;
use super::runner::{ScenarioOutcome, ScenarioRunner};

/// Scenario selector that runs every transport
pub const ALL: &str = "all";

/// An ordered selection of scenarios sharing one configuration
#[derive(Debug, Clone)]
pub struct TestSuite {
    config: Config,
    scenarios: Vec<Transport>,
}

impl TestSuite {
    /// Every scenario, in definition order
    pub fn new(config: Config) -> Self {
        Self {
            config,
            scenarios: Transport::ALL.to_vec(),
        }
    }

    /// Scenarios matching `name` (`tcp`, `i2p` or `all`)
    pub fn select(config: Config, name: &str) -> Result<Self> {
        if name == ALL {
            return Ok(Self::new(config));
        }
        let transport = Transport::from_name(name).ok_or_else(|| Error::UnknownScenario {
            name: name.to_string(),
            available: Self::available().join(", "),
        })?;
        Ok(Self {
            config,
            scenarios: vec![transport],
        })
    }

    /// Names accepted by `select`
    pub fn available() -> Vec<&'static str> {
        Transport::ALL
            .iter()
            .map(|t| t.name())
            .chain(std::iter::once(ALL))
            .collect()
    }

    pub fn scenarios(&self) -> &[Transport] {
        &self.scenarios
    }

    /// Run the selected scenarios
    ///
    /// With `parallel`, all scenarios run at once; their ports are disjoint.
    pub async fn run(self, parallel: bool) -> SuiteReport {
        let runners = self
            .scenarios
            .iter()
            .map(|t| ScenarioRunner::new(*t, self.config.clone()));

        let outcomes = if parallel {
            join_all(runners.map(|r| r.run())).await
        } else {
            let mut outcomes = Vec::with_capacity(self.scenarios.len());
            for runner in runners {
                outcomes.push(runner.run().await);
            }
            outcomes
        };

        SuiteReport { outcomes }
    }
}

/// Outcomes of one suite run
#[derive(Debug)]
pub struct SuiteReport {
    pub outcomes: Vec<ScenarioOutcome>,
}

impl SuiteReport {
    /// True only if every scenario passed
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed())
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.passed()).count()
    }

    pub fn print_summary(&self) {
        println!("\n{}", "Results:".cyan());
        for outcome in &self.outcomes {
            let timing = format!("{:.2}s", outcome.duration.as_secs_f64());
            if outcome.passed() {
                println!(
                    "  {} {} {}",
                    "✓".green(),
                    outcome.name.white().bold(),
                    timing.dimmed()
                );
            } else {
                println!(
                    "  {} {} {}",
                    "✗".red(),
                    outcome.name.white().bold(),
                    timing.dimmed()
                );
                if let Some(error) = &outcome.error {
                    for line in error.to_string().lines() {
                        println!("      {}", line.red());
                    }
                }
            }
            if outcome.attempts > 1 {
                println!("      {} request attempts", outcome.attempts);
            }
            for warning in &outcome.warnings {
                println!("      {} {}", "warning:".yellow(), warning);
            }
        }

        let total = self.outcomes.len();
        let failed = self.failed();
        if failed == 0 {
            println!(
                "\n{} {}",
                "✓".green().bold(),
                format!("{} scenario(s) passed", total).green().bold()
            );
        } else {
            println!(
                "\n{} {}",
                "✗".red().bold(),
                format!("{} of {} scenario(s) failed", failed, total).red().bold()
            );
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "passed": self.passed(),
            "scenarios": self.outcomes.iter().map(|o| o.to_json()).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_by_name() {
        let suite = TestSuite::select(Config::default(), "i2p").unwrap();
        assert_eq!(suite.scenarios(), &[Transport::I2p]);

        let suite = TestSuite::select(Config::default(), "all").unwrap();
        assert_eq!(suite.scenarios(), &[Transport::Tcp, Transport::I2p]);
    }

    #[test]
    fn test_unknown_scenario_lists_available() {
        let err = TestSuite::select(Config::default(), "utp").unwrap_err();
        match err {
            Error::UnknownScenario { name, available } => {
                assert_eq!(name, "utp");
                assert_eq!(available, "tcp, i2p, all");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_report_passes() {
        let report = SuiteReport { outcomes: vec![] };
        assert!(report.passed());
        assert_eq!(report.to_json()["passed"], true);
    }
}
