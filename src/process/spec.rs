//! Launch description of one managed process

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

/// Everything needed to start one process and decide when it is ready
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Name used in logs and errors (e.g. "injector", "client_1")
    pub name: String,
    /// Executable to run
    pub program: PathBuf,
    /// Arguments, in order
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Working/repository directory, passed as `--repo <dir>` when set
    pub repo: Option<PathBuf>,
    /// How long `wait_ready` may take
    pub ready_timeout: Duration,
    /// Readiness marker
    pub ready_pattern: Regex,
    /// Bytes of output kept for diagnostics
    pub output_tail_bytes: usize,
    /// Time between interrupt and kill during `stop`
    pub stop_grace: Duration,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, ready_pattern: Regex) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            repo: None,
            ready_timeout: Duration::from_secs(20),
            ready_pattern,
            output_tail_bytes: 64 * 1024,
            stop_grace: Duration::from_secs(10),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: &HashMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn repo(mut self, repo: Option<PathBuf>) -> Self {
        self.repo = repo;
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn output_tail_bytes(mut self, bytes: usize) -> Self {
        self.output_tail_bytes = bytes;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Full argument vector as handed to the OS
    pub fn command_line(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if let Some(repo) = &self.repo {
            argv.push("--repo".to_string());
            argv.push(repo.display().to_string());
        }
        argv.extend(self.args.iter().cloned());
        argv
    }
}
