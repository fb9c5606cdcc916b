//! Scenario runner
//!
//! Drives one scenario through
//! `Idle -> Launching -> AwaitingReadiness -> Requesting -> Asserting -> TearingDown -> Done`.
//! Every path, including timeouts and failed launches, ends in
//! `TearingDown`, which stops all processes and the echo server together
//! and waits for every one of them before the outcome is reported.

use std::time::{Duration, Instant};

use futures_util::future::{join_all, select_all, try_join_all};
use serde::Serialize;
use tempfile::TempDir;

use crate::common::config::Config;
use crate::common::{truncate_to_bytes, Error, Result, TeardownWarning};
use crate::echo::{EchoRequester, EchoResponse, EchoServer, ProxiedRequester};
use crate::process::{ExitInfo, ManagedProcess, ProcessSpec};

use super::fixtures::{InjectorEndpoint, RetryPolicy, Scenario, Transport};

/// Name used for the echo server in warnings and the timeline
const ECHO_SERVER: &str = "echo_server";

/// Bytes of a mismatching body quoted in the error
const MISMATCH_PREVIEW: usize = 64;

/// How long a failed request waits for a participant's exit to be reported
const EXIT_SETTLE: Duration = Duration::from_secs(1);

/// Where a scenario is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScenarioState {
    Idle,
    Launching,
    AwaitingReadiness,
    Requesting,
    Asserting,
    TearingDown,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelineEvent {
    Launched,
    Ready,
    Stopped,
}

/// A lifecycle event of one participant
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub event: TimelineEvent,
    pub process: String,
    #[serde(skip)]
    pub at: Instant,
    /// Milliseconds since the scenario started
    pub offset_ms: u128,
}

/// Result of one scenario run
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub transport: Transport,
    pub verdict: Verdict,
    pub error: Option<Error>,
    pub attempts: u32,
    pub warnings: Vec<TeardownWarning>,
    pub timeline: Vec<TimelineEntry>,
    pub states: Vec<ScenarioState>,
    pub duration: Duration,
    /// Every launched process had been reaped when the scenario finished
    pub all_stopped: bool,
    pub payload: String,
    pub response: Option<EchoResponse>,
}

impl ScenarioOutcome {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// First timeline entry for `process` and `event`
    pub fn event_time(&self, process: &str, event: TimelineEvent) -> Option<Instant> {
        self.timeline
            .iter()
            .find(|e| e.process == process && e.event == event)
            .map(|e| e.at)
    }

    pub fn launched(&self, process: &str) -> bool {
        self.event_time(process, TimelineEvent::Launched).is_some()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "transport": self.transport,
            "verdict": self.verdict,
            "error": self.error.as_ref().map(|e| serde_json::json!({
                "code": e.code(),
                "message": e.to_string(),
            })),
            "attempts": self.attempts,
            "warnings": self.warnings,
            "timeline": self.timeline,
            "states": self.states,
            "duration_ms": self.duration.as_millis(),
            "all_stopped": self.all_stopped,
        })
    }
}

/// Runs one scenario and owns everything it starts
pub struct ScenarioRunner {
    transport: Transport,
    config: Config,
    state: ScenarioState,
    states: Vec<ScenarioState>,
    started: Instant,
    scenario: Option<Scenario>,
    processes: Vec<ManagedProcess>,
    echo: Option<EchoServer>,
    timeline: Vec<TimelineEntry>,
    attempts: u32,
    response: Option<EchoResponse>,
    workdir: Option<TempDir>,
}

impl ScenarioRunner {
    pub fn new(transport: Transport, config: Config) -> Self {
        Self {
            transport,
            config,
            state: ScenarioState::Idle,
            states: vec![ScenarioState::Idle],
            started: Instant::now(),
            scenario: None,
            processes: Vec::new(),
            echo: None,
            timeline: Vec::new(),
            attempts: 0,
            response: None,
            workdir: None,
        }
    }

    /// Run to completion; never fails, the outcome carries any error
    pub async fn run(mut self) -> ScenarioOutcome {
        self.started = Instant::now();
        let budget = self.scenario_budget();
        let name = self.transport.name().to_string();
        tracing::info!(scenario = %name, "Running scenario ({})", self.transport.description());

        let result = match tokio::time::timeout(budget, self.drive()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ScenarioTimeout {
                scenario: name.clone(),
                secs: budget.as_secs(),
            }),
        };

        if let Err(e) = &result {
            tracing::error!(scenario = %name, state = ?self.state, "Scenario failed: {}", e);
        }

        self.transition(ScenarioState::TearingDown);
        let warnings = self.teardown().await;
        let all_stopped = self.processes.iter().all(|p| !p.is_running());

        let verdict = if result.is_ok() {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
        self.transition(ScenarioState::Done);

        match verdict {
            Verdict::Pass => tracing::info!(
                scenario = %name,
                "Scenario passed in {:?} ({} warning(s))",
                self.started.elapsed(),
                warnings.len()
            ),
            Verdict::Fail => tracing::info!(scenario = %name, "Scenario failed"),
        }

        ScenarioOutcome {
            name,
            transport: self.transport,
            verdict,
            error: result.err(),
            attempts: self.attempts,
            warnings,
            timeline: std::mem::take(&mut self.timeline),
            states: std::mem::take(&mut self.states),
            duration: self.started.elapsed(),
            all_stopped,
            payload: self
                .scenario
                .as_ref()
                .map(|s| s.payload.clone())
                .unwrap_or_default(),
            response: self.response.take(),
        }
    }

    fn scenario_budget(&self) -> Duration {
        let secs = match self.transport {
            Transport::Tcp => self.config.timeouts.tcp_scenario_secs,
            Transport::I2p => self.config.timeouts.i2p_scenario_secs,
        };
        Duration::from_secs(secs)
    }

    fn transition(&mut self, next: ScenarioState) {
        tracing::debug!(scenario = self.transport.name(), "{:?} -> {:?}", self.state, next);
        self.state = next;
        self.states.push(next);
    }

    fn record(&mut self, event: TimelineEvent, process: &str, at: Instant) {
        self.timeline.push(TimelineEntry {
            event,
            process: process.to_string(),
            at,
            offset_ms: at.saturating_duration_since(self.started).as_millis(),
        });
    }

    /// Everything up to the verdict; any error short-circuits to teardown
    async fn drive(&mut self) -> Result<()> {
        self.transition(ScenarioState::Launching);

        if self.config.process.pass_repo_dir {
            self.workdir = Some(
                tempfile::Builder::new()
                    .prefix(&format!("harness-{}-", self.transport.name()))
                    .tempdir()?,
            );
        }
        let scenario = Scenario::from_config(
            self.transport,
            &self.config,
            self.workdir.as_ref().map(|d| d.path()),
        )?;
        let scenario = self.scenario.insert(scenario).clone();

        self.launch(scenario.injector.clone())?;

        if self.transport.ordered_start() {
            // Clients need the injector's identity, so they start only once it is ready
            self.transition(ScenarioState::AwaitingReadiness);
            self.await_ready(0..1).await?;
            let injector_ep = self.injector_endpoint(&scenario.injector_endpoint)?;

            for client in &scenario.clients {
                self.launch(client.spec(&injector_ep))?;
            }
            self.start_echo(scenario.echo_port).await?;
            self.await_ready(1..self.processes.len()).await?;
        } else {
            let injector_ep = self.injector_endpoint(&scenario.injector_endpoint)?;
            for client in &scenario.clients {
                self.launch(client.spec(&injector_ep))?;
            }
            self.start_echo(scenario.echo_port).await?;

            self.transition(ScenarioState::AwaitingReadiness);
            self.await_ready(0..self.processes.len()).await?;
        }

        self.transition(ScenarioState::Requesting);
        let entry = scenario.entry_client()?;
        let origin = self
            .echo
            .as_ref()
            .map(|e| e.addr())
            .ok_or_else(|| Error::Internal("echo server not running".to_string()))?;
        let requester = ProxiedRequester::new(
            entry.listen,
            origin,
            scenario.timeout,
            scenario.body_preview_bytes,
        )?;
        let request =
            request_with_retries(&requester, &scenario.payload, &scenario.retry, &mut self.attempts);
        let response = tokio::select! {
            biased;
            exited = first_exit(&self.processes) => return Err(exited),
            response = request => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                // A participant that exited takes precedence over the request error
                if let Ok(exited) = tokio::time::timeout(EXIT_SETTLE, first_exit(&self.processes)).await {
                    return Err(exited);
                }
                return Err(e);
            }
        };

        self.transition(ScenarioState::Asserting);
        let verdict = assert_echo(&response, &scenario.payload);
        self.response = Some(response);
        verdict
    }

    fn launch(&mut self, spec: ProcessSpec) -> Result<()> {
        let process = ManagedProcess::start(spec)?;
        let (name, at) = (process.name().to_string(), process.started_at());
        self.processes.push(process);
        self.record(TimelineEvent::Launched, &name, at);
        Ok(())
    }

    async fn start_echo(&mut self, port: u16) -> Result<()> {
        let server = EchoServer::start(port).await?;
        self.echo = Some(server);
        self.record(TimelineEvent::Launched, ECHO_SERVER, Instant::now());
        Ok(())
    }

    /// Wait concurrently for the processes in `range` to become ready
    async fn await_ready(&mut self, range: std::ops::Range<usize>) -> Result<()> {
        let deadline = self.started + self.scenario_budget();
        let waits = self.processes[range].iter().map(|process| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout = process.ready_timeout().min(remaining);
            async move {
                let event = process.wait_ready(timeout).await?;
                Ok::<_, Error>((process.name().to_string(), event.at))
            }
        });

        let ready = try_join_all(waits).await?;
        for (name, at) in ready {
            self.record(TimelineEvent::Ready, &name, at);
        }
        Ok(())
    }

    fn injector_endpoint(&self, endpoint: &InjectorEndpoint) -> Result<String> {
        match endpoint {
            InjectorEndpoint::Fixed(ep) => Ok(ep.clone()),
            InjectorEndpoint::FromOutput(pattern) => {
                let injector = self
                    .processes
                    .first()
                    .ok_or_else(|| Error::Internal("injector not launched".to_string()))?;
                let ep = injector.output_capture(pattern).ok_or_else(|| {
                    Error::Config(format!(
                        "Injector is ready but never announced its endpoint (pattern '{}')",
                        pattern.as_str()
                    ))
                })?;
                tracing::info!("Injector endpoint: {}", ep);
                Ok(ep)
            }
        }
    }

    /// Stop everything at once and wait for all of it
    ///
    /// Returns a warning for every participant that was still running and
    /// did not go away cleanly. Processes that had already exited were
    /// reported by the failure that ended the scenario.
    async fn teardown(&mut self) -> Vec<TeardownWarning> {
        let stops = self.processes.iter_mut().map(|process| {
            let was_running = process.is_running();
            let termination = process.stop();
            async move {
                let name = termination.name().to_string();
                let exit = termination.wait().await;
                (name, was_running, exit, Instant::now())
            }
        });

        let echo = self.echo.take();
        let echo_stop = async move {
            match echo {
                Some(server) => Some((server.stop_listening().await, Instant::now())),
                None => None,
            }
        };

        let (exits, echo_result): (Vec<(String, bool, ExitInfo, Instant)>, _) =
            tokio::join!(join_all(stops), echo_stop);

        let mut warnings = Vec::new();
        for (name, was_running, exit, at) in exits {
            self.record(TimelineEvent::Stopped, &name, at);
            if was_running && !exit.is_clean() {
                let warning = TeardownWarning {
                    name,
                    reason: exit.to_string(),
                };
                tracing::warn!("{}", warning);
                warnings.push(warning);
            }
        }

        if let Some((result, at)) = echo_result {
            self.record(TimelineEvent::Stopped, ECHO_SERVER, at);
            if let Err(e) = result {
                let warning = TeardownWarning {
                    name: ECHO_SERVER.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!("{}", warning);
                warnings.push(warning);
            }
        }

        warnings
    }
}

/// Resolves with `ProcessExitedEarly` once any of `processes` has exited
async fn first_exit(processes: &[ManagedProcess]) -> Error {
    let exits = processes.iter().map(|process| {
        Box::pin(async move {
            let exit = process.termination().wait().await;
            (process, exit)
        })
    });
    if processes.is_empty() {
        return std::future::pending().await;
    }

    let ((process, exit), _, _) = select_all(exits).await;
    Error::exited_early(process.name(), exit, process.output_tail())
}

/// Send the echo request, retrying non-success statuses up to the policy's limit
///
/// Transport errors are not retried. `attempts` is updated as requests are made.
pub async fn request_with_retries(
    requester: &dyn EchoRequester,
    content: &str,
    policy: &RetryPolicy,
    attempts: &mut u32,
) -> Result<EchoResponse> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_status = None;

    for attempt in 1..=max_attempts {
        *attempts = attempt;
        let response = requester
            .request_echo(content)
            .await
            .map_err(|e| Error::request_failed(attempt, None, e.to_string()))?;

        if response.is_success() {
            return Ok(response);
        }

        tracing::warn!(
            "Attempt {}/{} returned status {}",
            attempt,
            max_attempts,
            response.status
        );
        last_status = Some(response.status);

        if attempt < max_attempts && !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }
    }

    Err(Error::request_failed(
        max_attempts,
        last_status,
        format!(
            "last status {}",
            last_status.map(|s| s.to_string()).unwrap_or_default()
        ),
    ))
}

/// Status must be 200 and the body exactly the payload
pub fn assert_echo(response: &EchoResponse, payload: &str) -> Result<()> {
    if !response.is_success() {
        return Err(Error::request_failed(
            1,
            Some(response.status),
            format!("status {}", response.status),
        ));
    }
    if response.body != payload {
        return Err(Error::AssertionMismatch {
            expected_len: payload.len(),
            actual_len: response.body.len(),
            preview: truncate_to_bytes(&response.body, MISMATCH_PREVIEW).to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays a fixed list of statuses, echoing the content on 200
    struct ScriptedRequester {
        statuses: Mutex<Vec<u16>>,
        calls: Mutex<u32>,
    }

    impl ScriptedRequester {
        fn new(statuses: &[u16]) -> Self {
            let mut statuses = statuses.to_vec();
            statuses.reverse();
            Self {
                statuses: Mutex::new(statuses),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl EchoRequester for ScriptedRequester {
        async fn request_echo(&self, content: &str) -> Result<EchoResponse> {
            *self.calls.lock().unwrap() += 1;
            let status = self.statuses.lock().unwrap().pop().unwrap_or(200);
            let body = if status == 200 {
                content.to_string()
            } else {
                "circuit not ready".to_string()
            };
            Ok(EchoResponse { status, body })
        }
    }

    struct FailingRequester;

    #[async_trait]
    impl EchoRequester for FailingRequester {
        async fn request_echo(&self, _content: &str) -> Result<EchoResponse> {
            Err(Error::Internal("connection refused".to_string()))
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let requester = ScriptedRequester::new(&[502, 503, 200, 502]);
        let mut attempts = 0;
        let response = request_with_retries(&requester, "abcdefg", &policy(5), &mut attempts)
            .await
            .unwrap();

        assert_eq!(response.body, "abcdefg");
        assert_eq!(attempts, 3);
        assert_eq!(requester.calls(), 3);
    }

    #[tokio::test]
    async fn test_single_attempt_does_not_mask_errors() {
        let requester = ScriptedRequester::new(&[503, 200]);
        let mut attempts = 0;
        let err = request_with_retries(&requester, "abcdefg", &RetryPolicy::single(), &mut attempts)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::RequestFailed { attempts: 1, status: Some(503), .. }
        ));
        assert_eq!(requester.calls(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let requester = ScriptedRequester::new(&[502; 10]);
        let mut attempts = 0;
        let err = request_with_retries(&requester, "x", &policy(4), &mut attempts)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::RequestFailed { attempts: 4, status: Some(502), .. }
        ));
        assert_eq!(requester.calls(), 4);
    }

    #[tokio::test]
    async fn test_transport_error_is_not_retried() {
        let mut attempts = 0;
        let err = request_with_retries(&FailingRequester, "x", &policy(5), &mut attempts)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RequestFailed { attempts: 1, status: None, .. }));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_assert_echo() {
        let ok = EchoResponse {
            status: 200,
            body: "abcdefg".to_string(),
        };
        assert!(assert_echo(&ok, "abcdefg").is_ok());

        let stale = EchoResponse {
            status: 200,
            body: "zzzzzzz".to_string(),
        };
        assert!(matches!(
            assert_echo(&stale, "abcdefg"),
            Err(Error::AssertionMismatch { expected_len: 7, actual_len: 7, .. })
        ));

        let not_found = EchoResponse {
            status: 404,
            body: "abcdefg".to_string(),
        };
        assert!(matches!(
            assert_echo(&not_found, "abcdefg"),
            Err(Error::RequestFailed { status: Some(404), .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_first_exit_names_crashed_process() {
        let shell = |name: &str, script: &str| {
            ProcessSpec::new(name, "/bin/sh", regex::Regex::new("ready").unwrap()).args(["-c", script])
        };
        let mut processes = vec![
            ManagedProcess::start(shell("client_1", "echo ready; exec sleep 30")).unwrap(),
            ManagedProcess::start(shell(
                "injector",
                "echo ready; echo 'fatal: crashed after ready' >&2; exit 7",
            ))
            .unwrap(),
        ];

        let err = tokio::time::timeout(Duration::from_secs(5), first_exit(&processes))
            .await
            .unwrap();
        match err {
            Error::ProcessExitedEarly { name, exit, tail } => {
                assert_eq!(name, "injector");
                assert_eq!(exit, "exit code 7");
                assert!(tail.contains("[stderr] fatal: crashed after ready"), "tail: {tail}");
            }
            other => panic!("unexpected error: {other}"),
        }

        for process in &mut processes {
            process.stop().wait().await;
        }
    }

    #[tokio::test]
    async fn test_missing_binary_fails_and_tears_down() {
        let mut config = Config::default();
        config.binaries.injector = "/nonexistent/injector".into();
        config.process.pass_repo_dir = false;

        let outcome = ScenarioRunner::new(Transport::Tcp, config).run().await;

        assert!(!outcome.passed());
        assert!(matches!(outcome.error, Some(Error::Config(_))));
        assert!(outcome.timeline.is_empty());
        assert!(outcome.all_stopped);
        assert_eq!(
            outcome.states,
            vec![
                ScenarioState::Idle,
                ScenarioState::Launching,
                ScenarioState::TearingDown,
                ScenarioState::Done
            ]
        );
    }
}
