//! Scenario definitions
//!
//! Turns the configuration into the concrete topology of one scenario:
//! which binaries run with which arguments, what marks them ready, and
//! where the echo server listens.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use serde::Serialize;

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::process::ProcessSpec;

/// Name of the client requests enter through
pub const ENTRY_CLIENT: &str = "client_1";

/// Link between client and injector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    I2p,
}

impl Transport {
    pub const ALL: [Transport; 2] = [Transport::Tcp, Transport::I2p];

    pub fn name(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::I2p => "i2p",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Clients depend on the injector's identity and start only once it is ready
    pub fn ordered_start(self) -> bool {
        matches!(self, Transport::I2p)
    }

    pub fn description(self) -> &'static str {
        match self {
            Transport::Tcp => "client --tcp--> injector -> echo server",
            Transport::I2p => "client --i2p--> injector -> echo server",
        }
    }
}

/// How a client learns where the injector is
#[derive(Debug, Clone)]
pub enum InjectorEndpoint {
    /// Known before anything starts
    Fixed(String),
    /// Read from the injector's output once it is ready (group 1)
    FromOutput(Regex),
}

/// Everything about a client except the injector endpoint
#[derive(Debug, Clone)]
pub struct ClientTemplate {
    pub name: String,
    pub program: PathBuf,
    pub listen: SocketAddr,
    pub injector_ipns: String,
    pub front_end_url: String,
    pub env: HashMap<String, String>,
    pub repo: Option<PathBuf>,
    pub ready_pattern: Regex,
    pub ready_timeout: Duration,
    pub output_tail_bytes: usize,
    pub stop_grace: Duration,
}

impl ClientTemplate {
    /// Complete the launch description once the injector endpoint is known
    pub fn spec(&self, injector_ep: &str) -> ProcessSpec {
        ProcessSpec::new(&self.name, &self.program, self.ready_pattern.clone())
            .args([
                "--listen-on-tcp".to_string(),
                self.listen.to_string(),
                "--injector-ipns".to_string(),
                self.injector_ipns.clone(),
                "--injector-ep".to_string(),
                injector_ep.to_string(),
                self.front_end_url.clone(),
            ])
            .env(&self.env)
            .repo(self.repo.clone())
            .ready_timeout(self.ready_timeout)
            .output_tail_bytes(self.output_tail_bytes)
            .stop_grace(self.stop_grace)
    }
}

/// Request policy for a scenario
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn single() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

/// One fully described scenario
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub transport: Transport,
    pub timeout: Duration,
    pub injector: ProcessSpec,
    pub injector_endpoint: InjectorEndpoint,
    pub clients: Vec<ClientTemplate>,
    pub echo_port: u16,
    pub payload: String,
    pub retry: RetryPolicy,
    pub body_preview_bytes: usize,
}

impl Scenario {
    /// Build the scenario for `transport`
    ///
    /// With `workdir` set, every process gets its own repo directory below it.
    pub fn from_config(transport: Transport, config: &Config, workdir: Option<&Path>) -> Result<Self> {
        let injector_bin = Config::resolve_binary(&config.binaries.injector)?;
        let client_bin = Config::resolve_binary(&config.binaries.client)?;

        let tcp_ready = compile(&config.markers.tcp_ready, "markers.tcp_ready")?;
        let i2p_ready = compile(&config.markers.i2p_ready, "markers.i2p_ready")?;

        let repo_for = |name: &str| -> Result<Option<PathBuf>> {
            match workdir {
                Some(dir) => {
                    let repo = dir.join(name);
                    std::fs::create_dir_all(&repo)?;
                    Ok(Some(repo))
                }
                None => Ok(None),
            }
        };

        let timeouts = &config.timeouts;
        let tail_bytes = config.output.max_tail_bytes();
        let grace = timeouts.stop_grace();

        let (timeout, ready_timeout, ready_pattern, client_port, echo_port) = match transport {
            Transport::Tcp => (
                timeouts.tcp_scenario_secs,
                timeouts.tcp_ready_secs,
                tcp_ready,
                config.ports.tcp_client,
                config.ports.tcp_echo,
            ),
            Transport::I2p => (
                timeouts.i2p_scenario_secs,
                timeouts.i2p_ready_secs,
                i2p_ready,
                config.ports.i2p_client,
                config.ports.i2p_echo,
            ),
        };
        let ready_timeout = Duration::from_secs(ready_timeout);

        let (injector_args, injector_endpoint) = match transport {
            Transport::Tcp => {
                let ep = format!("127.0.0.1:{}", config.ports.tcp_injector);
                (
                    vec![
                        "--listen-on-i2p".to_string(),
                        "false".to_string(),
                        "--listen-on-tcp".to_string(),
                        ep.clone(),
                    ],
                    InjectorEndpoint::Fixed(ep),
                )
            }
            Transport::I2p => {
                let endpoint = match &config.identity.injector_i2p_id {
                    Some(id) => InjectorEndpoint::Fixed(id.clone()),
                    None => InjectorEndpoint::FromOutput(compile(
                        &config.markers.i2p_public_id,
                        "markers.i2p_public_id",
                    )?),
                };
                (
                    vec!["--listen-on-i2p".to_string(), "true".to_string()],
                    endpoint,
                )
            }
        };

        let injector = ProcessSpec::new("injector", injector_bin, ready_pattern.clone())
            .args(injector_args)
            .env(&config.process.env.injector)
            .repo(repo_for("injector")?)
            .ready_timeout(ready_timeout)
            .output_tail_bytes(tail_bytes)
            .stop_grace(grace);

        let client = ClientTemplate {
            name: ENTRY_CLIENT.to_string(),
            program: client_bin,
            listen: SocketAddr::from(([127, 0, 0, 1], client_port)),
            injector_ipns: config.identity.injector_ipns.clone(),
            front_end_url: config.identity.front_end_url.clone(),
            env: config.process.env.client.clone(),
            repo: repo_for(ENTRY_CLIENT)?,
            ready_pattern,
            ready_timeout,
            output_tail_bytes: tail_bytes,
            stop_grace: grace,
        };

        let retry = match transport {
            Transport::Tcp => RetryPolicy::single(),
            Transport::I2p => RetryPolicy {
                max_attempts: config.request.i2p_max_attempts.max(1),
                delay: Duration::from_millis(config.request.retry_delay_ms),
            },
        };

        Ok(Self {
            name: transport.name().to_string(),
            transport,
            timeout: Duration::from_secs(timeout),
            injector,
            injector_endpoint,
            clients: vec![client],
            echo_port,
            payload: random_payload(config.request.payload_len),
            retry,
            body_preview_bytes: config.request.body_preview_bytes,
        })
    }

    /// The client requests are sent through
    pub fn entry_client(&self) -> Result<&ClientTemplate> {
        self.clients
            .first()
            .ok_or_else(|| Error::Config(format!("Scenario '{}' has no client", self.name)))
    }
}

fn compile(pattern: &str, key: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("Invalid regex for {}: {}", key, e)))
}

/// Random lowercase payload; a fresh one per run tells a live echo from a cached one
pub fn random_payload(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}
