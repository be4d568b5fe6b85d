//! End-to-end runner tests over a scripted sandbox.

use serde_json::Value;
use std::sync::Arc;

use agent_runner::{Runner, QUERY_OPERATION};
use agent_runner_core::config::AppConfig;
use agent_runner_core::Error;
use agent_runner_resilience::CircuitState;
use agent_runner_sandbox::MockSandbox;

const STREAM_OUTPUT: &str = concat!(
    r#"{"type":"system","subtype":"init","session_id":"s1","model":"m"}"#,
    "\n",
    r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#,
    "\n",
    r#"{"type":"result","subtype":"success","is_error":false,"result":"hello","session_id":"s1"}"#,
    "\n",
);

fn runner(mock: Arc<MockSandbox>, tweak: impl FnOnce(&mut AppConfig)) -> Runner {
    let mut config = AppConfig::default();
    tweak(&mut config);
    Runner::from_config(&config, mock).unwrap()
}

fn lines(out: &[u8]) -> Vec<Value> {
    std::str::from_utf8(out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn test_json_query_prints_assistant_then_result() {
    let mock = Arc::new(MockSandbox::with_output(
        0,
        r#"{"result":"4","is_error":false,"session_id":"abc","num_turns":1}"#,
    ));
    let runner = runner(mock.clone(), |_| {});

    let mut out = Vec::new();
    let summary = runner.run("what is 2+2", &mut out).await.unwrap();

    let printed = lines(&out);
    assert_eq!(printed.len(), 2);
    assert_eq!(printed[0]["type"], "assistant");
    assert_eq!(printed[1]["type"], "result");
    assert_eq!(summary.messages, 2);
    assert_eq!(
        summary.result.unwrap().session_id.as_deref(),
        Some("abc")
    );

    let executed = mock.executed().await;
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].command().last().map(String::as_str), Some("what is 2+2"));
}

#[tokio::test]
async fn test_stream_json_query_prints_in_order() {
    let mock = Arc::new(MockSandbox::with_output(0, STREAM_OUTPUT));
    let runner = runner(mock.clone(), |c| c.transport.output_format = "stream-json".into());

    let mut out = Vec::new();
    let summary = runner.run("hi", &mut out).await.unwrap();

    let types: Vec<String> = lines(&out)
        .iter()
        .map(|v| v["type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(types, ["system", "assistant", "result"]);
    assert!(!summary.is_error());
    assert_eq!(mock.kills(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried() {
    let mock = Arc::new(MockSandbox::new());
    mock.push_output(1, "rate limited").await;
    mock.push_output(0, r#"{"result":"ok"}"#).await;
    let runner = runner(mock.clone(), |_| {});

    let mut out = Vec::new();
    let summary = runner.run("retry me", &mut out).await.unwrap();

    assert_eq!(mock.exec_count().await, 2);
    assert_eq!(summary.messages, 2);
    let metrics = runner.resilience().circuit_metrics(QUERY_OPERATION).unwrap();
    assert_eq!(metrics.failures_in_window, 1);
    assert_eq!(metrics.successes_in_window, 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_short_circuits_later_runs() {
    let mock = Arc::new(MockSandbox::new());
    for _ in 0..3 {
        mock.push_output(1, "down").await;
    }
    let runner = runner(mock.clone(), |c| {
        c.resilience.failure_threshold = 2;
        c.resilience.max_attempts = 1;
    });

    for _ in 0..2 {
        let err = runner.run("q", &mut Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::RetryExhausted { attempts: 1, .. }));
    }
    let err = runner.run("q", &mut Vec::new()).await.unwrap_err();
    assert!(err.is_circuit_open());

    assert_eq!(mock.exec_count().await, 2);
    assert_eq!(
        runner.resilience().circuit_metrics(QUERY_OPERATION).unwrap().state,
        CircuitState::Open
    );
}

#[tokio::test(start_paused = true)]
async fn test_streaming_failures_open_the_circuit() {
    let mock = Arc::new(MockSandbox::new());
    for _ in 0..3 {
        mock.push_output(1, "down\n").await;
    }
    let runner = runner(mock.clone(), |c| {
        c.transport.output_format = "stream-json".into();
        c.resilience.failure_threshold = 2;
        c.resilience.max_attempts = 1;
    });

    for _ in 0..2 {
        let err = runner.run("q", &mut Vec::new()).await.unwrap_err();
        match err {
            Error::ProcessFailed { exit_code, output } => {
                assert_eq!(exit_code, 1);
                assert_eq!(output, "down");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    let err = runner.run("q", &mut Vec::new()).await.unwrap_err();
    assert!(err.is_circuit_open());

    assert_eq!(mock.exec_count().await, 2);
    let metrics = runner.resilience().circuit_metrics(QUERY_OPERATION).unwrap();
    assert_eq!(metrics.state, CircuitState::Open);
    assert_eq!(metrics.failures_in_window, 2);
}

#[tokio::test]
async fn test_error_result_is_reported() {
    let mock = Arc::new(MockSandbox::with_output(
        0,
        r#"{"subtype":"error_max_turns","is_error":true}"#,
    ));
    let runner = runner(mock, |_| {});

    let mut out = Vec::new();
    let summary = runner.run("q", &mut out).await.unwrap();

    assert!(summary.is_error());
    // No assistant text to synthesize, only the result.
    assert_eq!(lines(&out).len(), 1);
}

#[tokio::test]
async fn test_invalid_format_in_config_is_rejected() {
    let mut config = AppConfig::default();
    config.transport.output_format = "yaml".into();
    let err = Runner::from_config(&config, Arc::new(MockSandbox::new())).unwrap_err();
    assert!(matches!(err, Error::InvalidSpec(_)));
}
