//! Configuration file handling

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Locations of the injector and client executables
    #[serde(default)]
    pub binaries: Binaries,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Fixed ports, disjoint per scenario
    #[serde(default)]
    pub ports: Ports,

    /// Readiness markers matched against process output
    #[serde(default)]
    pub markers: Markers,

    /// Injector identities handed to clients
    #[serde(default)]
    pub identity: Identity,

    /// Request/retry settings
    #[serde(default)]
    pub request: RequestConfig,

    /// Output buffer settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Process launch settings
    #[serde(default)]
    pub process: ProcessConfig,
}

/// Executable locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Binaries {
    /// Injector executable (absolute path or name on PATH)
    #[serde(default = "default_injector_bin")]
    pub injector: PathBuf,

    /// Client executable (absolute path or name on PATH)
    #[serde(default = "default_client_bin")]
    pub client: PathBuf,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            injector: default_injector_bin(),
            client: default_client_bin(),
        }
    }
}

fn default_injector_bin() -> PathBuf {
    PathBuf::from("injector")
}
fn default_client_bin() -> PathBuf {
    PathBuf::from("client")
}

/// Timeout settings in seconds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Timeouts {
    /// Whole-scenario budget for the direct TCP scenario
    #[serde(default = "default_tcp_scenario")]
    pub tcp_scenario_secs: u64,

    /// Whole-scenario budget for the I2P scenario
    #[serde(default = "default_i2p_scenario")]
    pub i2p_scenario_secs: u64,

    /// Per-process readiness budget over TCP
    #[serde(default = "default_tcp_ready")]
    pub tcp_ready_secs: u64,

    /// Per-process readiness budget over I2P (tunnel setup is slow)
    #[serde(default = "default_i2p_ready")]
    pub i2p_ready_secs: u64,

    /// Time between SIGINT and SIGKILL during teardown
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tcp_scenario_secs: default_tcp_scenario(),
            i2p_scenario_secs: default_i2p_scenario(),
            tcp_ready_secs: default_tcp_ready(),
            i2p_ready_secs: default_i2p_ready(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

fn default_tcp_scenario() -> u64 {
    30
}
fn default_i2p_scenario() -> u64 {
    600
}
fn default_tcp_ready() -> u64 {
    20
}
fn default_i2p_ready() -> u64 {
    300
}
fn default_stop_grace() -> u64 {
    10
}

impl Timeouts {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Port assignments
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Ports {
    #[serde(default = "default_tcp_injector_port")]
    pub tcp_injector: u16,
    #[serde(default = "default_tcp_client_port")]
    pub tcp_client: u16,
    #[serde(default = "default_tcp_echo_port")]
    pub tcp_echo: u16,
    #[serde(default = "default_i2p_client_port")]
    pub i2p_client: u16,
    #[serde(default = "default_i2p_echo_port")]
    pub i2p_echo: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            tcp_injector: default_tcp_injector_port(),
            tcp_client: default_tcp_client_port(),
            tcp_echo: default_tcp_echo_port(),
            i2p_client: default_i2p_client_port(),
            i2p_echo: default_i2p_echo_port(),
        }
    }
}

fn default_tcp_injector_port() -> u16 {
    7070
}
fn default_tcp_client_port() -> u16 {
    7071
}
fn default_tcp_echo_port() -> u16 {
    7072
}
fn default_i2p_client_port() -> u16 {
    7081
}
fn default_i2p_echo_port() -> u16 {
    7082
}

/// Readiness markers (regular expressions)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Markers {
    /// Printed once a process listens on its TCP port
    #[serde(default = "default_tcp_marker")]
    pub tcp_ready: String,

    /// Printed once an I2P tunnel is established
    #[serde(default = "default_i2p_marker")]
    pub i2p_ready: String,

    /// Injector announcement of its I2P destination; group 1 is the id
    #[serde(default = "default_i2p_public_id")]
    pub i2p_public_id: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            tcp_ready: default_tcp_marker(),
            i2p_ready: default_i2p_marker(),
            i2p_public_id: default_i2p_public_id(),
        }
    }
}

fn default_tcp_marker() -> String {
    r"\[DEBUG\] Successfully listening on TCP Port".to_string()
}
fn default_i2p_marker() -> String {
    r"\[DEBUG\] I2P Tunnel has been established".to_string()
}
fn default_i2p_public_id() -> String {
    r"I2P Public ID: (\S+)".to_string()
}

/// Injector identities
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Identity {
    /// IPNS peer id of the injector's persistent identity
    #[serde(default = "default_injector_ipns")]
    pub injector_ipns: String,

    /// Fixed I2P destination of the injector; read from its output when unset
    #[serde(default)]
    pub injector_i2p_id: Option<String>,

    /// Trailing front-end URL passed to clients
    #[serde(default = "default_front_end_url")]
    pub front_end_url: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            injector_ipns: default_injector_ipns(),
            injector_i2p_id: None,
            front_end_url: default_front_end_url(),
        }
    }
}

fn default_injector_ipns() -> String {
    "QmYndpLkqVjvNxBwLoqa2zgrFoAvXDoLRmHdomVRMbgMYk".to_string()
}
fn default_front_end_url() -> String {
    "http://localhost/".to_string()
}

/// Request and retry settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestConfig {
    /// Length of the random payload echoed back
    #[serde(default = "default_payload_len")]
    pub payload_len: usize,

    /// Attempts allowed over I2P before giving up
    #[serde(default = "default_i2p_max_attempts")]
    pub i2p_max_attempts: u32,

    /// Pause between I2P attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Bytes of each response body written to the diagnostic log
    #[serde(default = "default_body_preview")]
    pub body_preview_bytes: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            payload_len: default_payload_len(),
            i2p_max_attempts: default_i2p_max_attempts(),
            retry_delay_ms: default_retry_delay(),
            body_preview_bytes: default_body_preview(),
        }
    }
}

fn default_payload_len() -> usize {
    32
}
fn default_i2p_max_attempts() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    500
}
fn default_body_preview() -> usize {
    10 * 1024
}

/// Output buffer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Kilobytes of process output kept per process for diagnostics
    #[serde(default = "default_max_tail_kb")]
    pub max_tail_kb: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_tail_kb: default_max_tail_kb(),
        }
    }
}

fn default_max_tail_kb() -> usize {
    64
}

impl OutputConfig {
    pub fn max_tail_bytes(&self) -> usize {
        self.max_tail_kb * 1024
    }
}

/// Process launch settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessConfig {
    /// Give every process its own `--repo` directory under a scenario tempdir
    #[serde(default = "default_pass_repo_dir")]
    pub pass_repo_dir: bool,

    /// Extra environment per role
    #[serde(default)]
    pub env: RoleEnv,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            pass_repo_dir: default_pass_repo_dir(),
            env: RoleEnv::default(),
        }
    }
}

fn default_pass_repo_dir() -> bool {
    true
}

/// Environment variables added to each role's processes
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RoleEnv {
    #[serde(default)]
    pub injector: HashMap<String, String>,
    #[serde(default)]
    pub client: HashMap<String, String>,
}

impl Config {
    /// Load configuration from an explicit file or the default location
    ///
    /// Returns default configuration if no file exists. An explicit path
    /// that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match config_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    /// Resolve a configured executable
    ///
    /// Paths with a directory component are used as given; bare names are
    /// searched on PATH.
    pub fn resolve_binary(path: &Path) -> Result<PathBuf> {
        if path.components().count() > 1 || path.is_absolute() {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(Error::Config(format!(
                "Executable '{}' does not exist",
                path.display()
            )));
        }

        which::which(path).map_err(|e| {
            Error::Config(format!(
                "Executable '{}' not found on PATH: {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_keep_scenarios_disjoint() {
        let config = Config::default();
        let tcp = [config.ports.tcp_injector, config.ports.tcp_client, config.ports.tcp_echo];
        let i2p = [config.ports.i2p_client, config.ports.i2p_echo];
        assert!(tcp.iter().all(|p| !i2p.contains(p)));
        assert!(config.timeouts.i2p_scenario_secs > config.timeouts.tcp_scenario_secs);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
[binaries]
injector = "/opt/ouinet/injector"

[timeouts]
tcp_scenario_secs = 5

[process.env.client]
RUST_LOG = "debug"
"#,
        )
        .unwrap();

        assert_eq!(config.binaries.injector, PathBuf::from("/opt/ouinet/injector"));
        assert_eq!(config.binaries.client, PathBuf::from("client"));
        assert_eq!(config.timeouts.tcp_scenario_secs, 5);
        assert_eq!(config.timeouts.i2p_scenario_secs, 600);
        assert_eq!(config.process.env.client.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert_eq!(config.request.i2p_max_attempts, 5);
    }

    #[test]
    fn test_invalid_toml_is_config_parse_error() {
        let err = Config::from_toml("timeouts = 3").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/harness.toml"))).unwrap_err();
        assert!(matches!(err, Error::FileRead { .. }));
    }

    #[test]
    fn test_resolve_missing_absolute_binary() {
        let err = Config::resolve_binary(Path::new("/nonexistent/injector")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
