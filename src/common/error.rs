//! Error types for the transport harness
//!
//! Every failure inside a scenario ends up as one of these variants and is
//! converted into a scenario outcome at the runner boundary. Messages name
//! the process or scenario involved so a failed run can be diagnosed from
//! the log alone.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Process Errors ===
    #[error("Process '{name}' did not signal readiness within {:.1}s", .waited.as_secs_f64())]
    ReadinessTimeout { name: String, waited: Duration },

    #[error("Process '{name}' exited early ({exit}). Output tail:\n{tail}")]
    ProcessExitedEarly {
        name: String,
        exit: String,
        tail: String,
    },

    #[error("Failed to spawn process '{name}': {source}")]
    ProcessSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    // === Request Errors ===
    #[error("Request failed after {attempts} attempt(s): {reason}")]
    RequestFailed {
        attempts: u32,
        status: Option<u16>,
        reason: String,
    },

    #[error("Response body did not match the sent payload (expected {expected_len} bytes, got {actual_len}): {preview:?}")]
    AssertionMismatch {
        expected_len: usize,
        actual_len: usize,
        preview: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // === Echo Server Errors ===
    #[error("Echo server error: {0}")]
    EchoServer(String),

    // === Scenario Errors ===
    #[error("Scenario '{scenario}' timed out after {secs} seconds")]
    ScenarioTimeout { scenario: String, secs: u64 },

    #[error("Unknown scenario '{name}'. Available: {available}")]
    UnknownScenario { name: String, available: String },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a readiness timeout error
    pub fn readiness_timeout(name: &str, waited: Duration) -> Self {
        Self::ReadinessTimeout {
            name: name.to_string(),
            waited,
        }
    }

    /// Create an early-exit error carrying the captured output tail
    pub fn exited_early(name: &str, exit: impl ToString, tail: String) -> Self {
        Self::ProcessExitedEarly {
            name: name.to_string(),
            exit: exit.to_string(),
            tail,
        }
    }

    /// Create a request failure with the last observed status
    pub fn request_failed(attempts: u32, status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::RequestFailed {
            attempts,
            status,
            reason: reason.into(),
        }
    }

    /// Short machine-readable code used in JSON reports
    pub fn code(&self) -> &'static str {
        match self {
            Error::ReadinessTimeout { .. } => "READINESS_TIMEOUT",
            Error::ProcessExitedEarly { .. } => "PROCESS_EXITED_EARLY",
            Error::ProcessSpawn { .. } => "PROCESS_SPAWN",
            Error::RequestFailed { .. } | Error::Http(_) => "REQUEST_FAILED",
            Error::AssertionMismatch { .. } => "ASSERTION_MISMATCH",
            Error::ScenarioTimeout { .. } => "SCENARIO_TIMEOUT",
            Error::EchoServer(_) => "ECHO_SERVER",
            Error::Config(_) | Error::ConfigParse(_) | Error::UnknownScenario { .. } => "CONFIG",
            _ => "INTERNAL_ERROR",
        }
    }
}

/// A process that did not exit cleanly during teardown
///
/// Logged and reported, but never turns a passing scenario into a failure.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[error("Process '{name}' did not exit cleanly: {reason}")]
pub struct TeardownWarning {
    pub name: String,
    pub reason: String,
}
