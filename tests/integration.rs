//! End-to-end integration tests for the transport harness
//!
//! These tests run complete scenarios against the `mock_peer` binary, which
//! speaks the injector/client command line and prints the same readiness
//! markers. Every test picks its own free ports so tests can run in parallel.

#![cfg(unix)]

use std::net::TcpListener;
use std::path::PathBuf;

use harness::testing::{ScenarioState, TimelineEvent};
use harness::{Config, Error, ScenarioRunner, TestSuite, Transport};

/// Path to the mock peer built alongside the tests
fn mock_peer() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock_peer"))
}

/// Ports the OS considers free right now
fn free_ports<const N: usize>() -> [u16; N] {
    let listeners: Vec<TcpListener> = (0..N)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("Failed to bind probe port"))
        .collect();
    let mut ports = [0u16; N];
    for (port, listener) in ports.iter_mut().zip(&listeners) {
        *port = listener.local_addr().expect("probe port").port();
    }
    ports
}

/// Configuration pointing both roles at the mock peer, with short budgets
fn test_config() -> Config {
    let [tcp_injector, tcp_client, tcp_echo, i2p_client, i2p_echo] = free_ports::<5>();

    let mut config = Config::default();
    config.binaries.injector = mock_peer();
    config.binaries.client = mock_peer();
    config.ports.tcp_injector = tcp_injector;
    config.ports.tcp_client = tcp_client;
    config.ports.tcp_echo = tcp_echo;
    config.ports.i2p_client = i2p_client;
    config.ports.i2p_echo = i2p_echo;
    config.timeouts.tcp_scenario_secs = 20;
    config.timeouts.i2p_scenario_secs = 20;
    config.timeouts.tcp_ready_secs = 10;
    config.timeouts.i2p_ready_secs = 10;
    config.timeouts.stop_grace_secs = 1;
    config.request.retry_delay_ms = 50;
    config
}

fn set_env(env: &mut std::collections::HashMap<String, String>, key: &str, value: &str) {
    env.insert(key.to_string(), value.to_string());
}

#[tokio::test]
async fn test_tcp_scenario_echoes_payload() {
    let outcome = ScenarioRunner::new(Transport::Tcp, test_config()).run().await;

    assert!(outcome.passed(), "scenario failed: {:?}", outcome.error);
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.warnings.is_empty(), "warnings: {:?}", outcome.warnings);
    assert!(outcome.all_stopped);

    let response = outcome.response.as_ref().expect("response recorded");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, outcome.payload);

    assert_eq!(outcome.states.first(), Some(&ScenarioState::Idle));
    assert_eq!(outcome.states.last(), Some(&ScenarioState::Done));
    assert!(outcome.states.contains(&ScenarioState::Asserting));
    for process in ["injector", "client_1", "echo_server"] {
        assert!(outcome.launched(process), "{process} not launched");
        assert!(outcome.event_time(process, TimelineEvent::Stopped).is_some());
    }
}

#[tokio::test]
async fn test_repeated_runs_use_fresh_payloads() {
    let config = test_config();
    let first = ScenarioRunner::new(Transport::Tcp, config.clone()).run().await;
    let second = ScenarioRunner::new(Transport::Tcp, config).run().await;

    assert!(first.passed(), "first run failed: {:?}", first.error);
    assert!(second.passed(), "second run failed: {:?}", second.error);
    assert_ne!(first.payload, second.payload);
    assert_eq!(second.response.unwrap().body, second.payload);
}

#[tokio::test]
async fn test_i2p_scenario_retries_until_circuit_ready() {
    let mut config = test_config();
    set_env(&mut config.process.env.client, "MOCK_PEER_FAIL_FIRST", "2");

    let outcome = ScenarioRunner::new(Transport::I2p, config).run().await;

    assert!(outcome.passed(), "scenario failed: {:?}", outcome.error);
    assert_eq!(outcome.attempts, 3);
    assert!(outcome.all_stopped);

    let injector_ready = outcome
        .event_time("injector", TimelineEvent::Ready)
        .expect("injector ready");
    let client_launched = outcome
        .event_time("client_1", TimelineEvent::Launched)
        .expect("client launched");
    assert!(client_launched >= injector_ready);
}

#[tokio::test]
async fn test_tcp_failure_status_is_not_retried() {
    let mut config = test_config();
    set_env(&mut config.process.env.client, "MOCK_PEER_FAIL_FIRST", "1");

    let outcome = ScenarioRunner::new(Transport::Tcp, config).run().await;

    assert!(!outcome.passed());
    assert!(matches!(
        outcome.error,
        Some(Error::RequestFailed { attempts: 1, status: Some(503), .. })
    ));
    assert!(outcome.all_stopped);
}

#[tokio::test]
async fn test_injector_exit_prevents_client_launch() {
    let mut config = test_config();
    set_env(&mut config.process.env.injector, "MOCK_PEER_EXIT_EARLY", "1");

    let outcome = ScenarioRunner::new(Transport::I2p, config).run().await;

    assert!(!outcome.passed());
    match &outcome.error {
        Some(Error::ProcessExitedEarly { name, tail, .. }) => {
            assert_eq!(name, "injector");
            assert!(tail.contains("simulated startup failure"), "tail: {tail}");
        }
        other => panic!("expected ProcessExitedEarly, got {other:?}"),
    }
    assert!(!outcome.launched("client_1"));
    assert!(outcome.warnings.is_empty());
    assert!(outcome.all_stopped);
}

#[tokio::test]
async fn test_crash_after_ready_reports_exit_and_tail() {
    let mut config = test_config();
    set_env(&mut config.process.env.injector, "MOCK_PEER_EXIT_AFTER_READY", "1");

    let outcome = ScenarioRunner::new(Transport::Tcp, config).run().await;

    assert!(!outcome.passed());
    match &outcome.error {
        Some(Error::ProcessExitedEarly { name, exit, tail }) => {
            assert_eq!(name, "injector");
            assert_eq!(exit, "exit code 7");
            assert!(tail.contains("crashed after ready"), "tail: {tail}");
        }
        other => panic!("expected ProcessExitedEarly, got {other:?}"),
    }
    assert!(outcome.event_time("injector", TimelineEvent::Ready).is_some());
    assert!(outcome.all_stopped);
}

#[tokio::test]
async fn test_missing_marker_times_out() {
    let mut config = test_config();
    config.timeouts.tcp_ready_secs = 1;
    set_env(&mut config.process.env.injector, "MOCK_PEER_SILENT", "1");

    let outcome = ScenarioRunner::new(Transport::Tcp, config).run().await;

    assert!(!outcome.passed());
    assert!(matches!(
        &outcome.error,
        Some(Error::ReadinessTimeout { name, .. }) if name == "injector"
    ));
    assert!(outcome.all_stopped);
    assert!(outcome.duration < std::time::Duration::from_secs(10));
}

#[tokio::test]
async fn test_scenario_timeout_still_tears_down() {
    let mut config = test_config();
    config.timeouts.i2p_scenario_secs = 2;
    config.request.i2p_max_attempts = 1000;
    config.request.retry_delay_ms = 200;
    set_env(&mut config.process.env.client, "MOCK_PEER_FAIL_FIRST", "1000");

    let outcome = ScenarioRunner::new(Transport::I2p, config).run().await;

    assert!(matches!(outcome.error, Some(Error::ScenarioTimeout { secs: 2, .. })));
    assert!(outcome.attempts > 1);
    assert!(outcome.all_stopped);
    assert_eq!(outcome.states.last(), Some(&ScenarioState::Done));
}

#[tokio::test]
async fn test_unclean_stop_is_only_a_warning() {
    let mut config = test_config();
    set_env(&mut config.process.env.client, "MOCK_PEER_IGNORE_SIGINT", "1");

    let outcome = ScenarioRunner::new(Transport::Tcp, config).run().await;

    assert!(outcome.passed(), "scenario failed: {:?}", outcome.error);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].name, "client_1");
    assert!(outcome.warnings[0].reason.contains("forced"));
    assert!(outcome.all_stopped);
}

#[tokio::test]
async fn test_suite_fails_if_any_scenario_fails() {
    let mut config = test_config();
    config.markers.i2p_ready = "never printed".to_string();
    config.timeouts.i2p_ready_secs = 1;

    let report = TestSuite::new(config).run(true).await;

    assert!(!report.passed());
    assert_eq!(report.failed(), 1);
    assert!(report.outcomes[0].passed(), "tcp failed: {:?}", report.outcomes[0].error);
    assert!(!report.outcomes[1].passed());

    let json = report.to_json();
    assert_eq!(json["passed"], false);
    assert_eq!(json["scenarios"][1]["error"]["code"], "READINESS_TIMEOUT");
}
