//! Tests for pipelines and the pipeline manager.
//!
//! Computations run against the in-memory backend; the worker handler reads
//! the JSON payload from the last argument and answers per operation name.

mod common;

use async_trait::async_trait;
use common::{Handler, MockBackend, manager, stdout};
use fedrun::pipeline::{ControllerStatus, RemoteExchange, RemoteRequest, StepOutput};
use fedrun::{
    ControlFrame, Error, InvocationOutput, NoRemote, OperatingMode, PipelineEvent,
    PipelineManager, PipelineManagerConfig, PipelineSpec, RemoteHandler, RunSpec,
};
use serde_json::{Value, json};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Fixtures
// =============================================================================

fn worker() -> Handler {
    Arc::new(|control: &ControlFrame| {
        let payload: Value = serde_json::from_str(control.args.last().unwrap()).unwrap();
        let input = &payload["input"];
        let iteration = payload["state"]["iteration"].as_u64().unwrap();
        let result = match control.args[0].as_str() {
            "sum" => json!({
                "output": {"sum": input["a"].as_i64().unwrap() + input["b"].as_i64().unwrap()},
                "success": true
            }),
            "double" => json!({
                "output": {"value": input["x"].as_i64().unwrap() * 2},
                "success": true
            }),
            "converge" => json!({
                "output": {"iteration": iteration},
                "cache": {"last": iteration},
                "success": iteration >= 3
            }),
            "local" => json!({"output": {"site": iteration}, "success": false}),
            "aggregate" => json!({"output": {"merged": input.clone()}, "success": true}),
            "fail" => {
                return Ok(InvocationOutput {
                    stdout: String::new(),
                    stderr: "Traceback: boom".to_string(),
                    code: 1,
                });
            }
            other => panic!("unknown operation {other}"),
        };
        Ok(stdout(&result.to_string()))
    })
}

fn step(controller: &str, op: &str, input_map: Value) -> Value {
    json!({
        "controller": controller,
        "computations": [{
            "id": op,
            "dockerImage": format!("fedrun/{op}"),
            "command": ["compute", op],
        }],
        "inputMap": input_map,
    })
}

fn pipeline(steps: Vec<Value>) -> PipelineSpec {
    PipelineSpec::from_json(&json!({ "steps": steps }).to_string()).unwrap()
}

struct Fixture {
    backend: Arc<MockBackend>,
    pipelines: PipelineManager,
    dir: TempDir,
}

fn fixture(mode: OperatingMode, backend: MockBackend) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(backend);
    let config = PipelineManagerConfig {
        client_id: "site1".to_string(),
        mode,
        operating_directory: dir.path().to_path_buf(),
        manager: common::test_config(),
    };
    let pipelines = PipelineManager::with_services(config, manager(Arc::clone(&backend)));
    Fixture {
        backend,
        pipelines,
        dir,
    }
}

fn run(run_id: &str, spec: PipelineSpec) -> RunSpec {
    RunSpec::new(run_id, spec)
}

/// Remote handler answering from a closure and recording every request.
struct ScriptedRemote {
    requests: Mutex<Vec<RemoteRequest>>,
    answer: fn(usize) -> StepOutput,
}

impl ScriptedRemote {
    fn new(answer: fn(usize) -> StepOutput) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            answer,
        })
    }

    fn requests(&self) -> Vec<RemoteRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteHandler for ScriptedRemote {
    async fn exchange(&self, request: RemoteRequest) -> fedrun::Result<StepOutput> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        Ok((self.answer)(requests.len()))
    }
}

// =============================================================================
// Local Pipelines
// =============================================================================

#[tokio::test]
async fn test_steps_chain_through_input_map() {
    let fx = fixture(OperatingMode::Local, MockBackend::new(worker()));
    let spec = pipeline(vec![
        step("local", "sum", json!({"a": {"value": 2}, "b": {"value": 3}})),
        step(
            "local",
            "double",
            json!({"x": {"fromCache": {"step": 0, "variable": "sum"}}}),
        ),
    ]);

    let handle = fx
        .pipelines
        .start_pipeline(run("run1", spec), Arc::new(NoRemote))
        .unwrap();
    let output = handle.wait().await.unwrap();
    assert_eq!(output, json!({"value": 10}));

    for dir in ["run1", "output/run1", "cache/run1"] {
        assert!(fx.dir.path().join(dir).is_dir(), "{dir} not created");
    }
    assert_eq!(fx.backend.creates(), 2, "one service per computation");
    assert!(fx.pipelines.active_runs().is_empty());
}

#[tokio::test]
async fn test_step_services_released() {
    let fx = fixture(OperatingMode::Local, MockBackend::new(worker()));
    let spec = pipeline(vec![step(
        "local",
        "sum",
        json!({"a": {"value": 1}, "b": {"value": 1}}),
    )]);
    fx.pipelines
        .start_pipeline(run("run2", spec), Arc::new(NoRemote))
        .unwrap()
        .wait()
        .await
        .unwrap();

    // Release stops in the background.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.backend.stops(), 1);
    assert!(fx.pipelines.services().get_services().is_empty());
}

#[tokio::test]
async fn test_run_finishes_without_event_subscribers() {
    let fx = fixture(OperatingMode::Local, MockBackend::new(worker()));
    let spec = pipeline(vec![step(
        "local",
        "double",
        json!({"x": {"value": 4}}),
    )]);
    drop(
        fx.pipelines
            .start_pipeline(run("run14", spec), Arc::new(NoRemote))
            .unwrap(),
    );

    for _ in 0..100 {
        if fx.pipelines.active_runs().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(fx.pipelines.active_runs().is_empty());
    assert_eq!(fx.backend.creates(), 1);
}

#[tokio::test]
async fn test_iterations_until_success() {
    let fx = fixture(OperatingMode::Local, MockBackend::new(worker()));
    let spec = pipeline(vec![step("local", "converge", json!({}))]);
    let mut handle = fx
        .pipelines
        .start_pipeline(run("run3", spec), Arc::new(NoRemote))
        .unwrap();

    let mut iterations = Vec::new();
    loop {
        match handle.events().recv().await.unwrap() {
            PipelineEvent::Step(progress)
                if progress.status == ControllerStatus::FinishedIteration =>
            {
                iterations.push(progress.iteration);
            }
            PipelineEvent::Finished { run_id, output } => {
                assert_eq!(run_id, "run3");
                assert_eq!(output, json!({"iteration": 3}));
                break;
            }
            PipelineEvent::Failed { error, .. } => panic!("run failed: {error}"),
            _ => {}
        }
    }
    assert_eq!(iterations, vec![1, 2, 3], "iteration grows by one per computation");
    assert_eq!(handle.wait().await.unwrap(), json!({"iteration": 3}));
    assert_eq!(fx.backend.creates(), 1, "iterations reuse the service");
}

#[tokio::test]
async fn test_computation_failure_fails_run() {
    let fx = fixture(OperatingMode::Local, MockBackend::new(worker()));
    let spec = pipeline(vec![
        step("local", "fail", json!({})),
        step("local", "double", json!({"x": {"value": 1}})),
    ]);
    let mut handle = fx
        .pipelines
        .start_pipeline(run("run4", spec), Arc::new(NoRemote))
        .unwrap();

    let failed = loop {
        if let PipelineEvent::Failed { error, .. } = handle.events().recv().await.unwrap() {
            break error;
        }
    };
    assert!(failed.contains("exitcode 1"), "{failed}");
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.exit_code(), Some(1));
    assert_eq!(fx.backend.creates(), 1, "later steps never start");
}

#[tokio::test]
async fn test_invalid_pipeline_rejected() {
    let fx = fixture(OperatingMode::Local, MockBackend::new(worker()));
    let err = fx
        .pipelines
        .start_pipeline(run("run5", PipelineSpec { steps: vec![] }), Arc::new(NoRemote))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPipeline(_)));

    let spec = pipeline(vec![step("local", "sum", json!({}))]);
    let err = fx
        .pipelines
        .start_pipeline(run("bad/id", spec), Arc::new(NoRemote))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPipeline(_)));
}

// =============================================================================
// Decentralized Pipelines
// =============================================================================

#[tokio::test]
async fn test_site_exchanges_until_remote_success() {
    let fx = fixture(OperatingMode::Local, MockBackend::new(worker()));
    let remote = ScriptedRemote::new(|n| StepOutput {
        output: json!({"round": n}),
        success: n >= 2,
    });
    let spec = pipeline(vec![step("decentralized", "local", json!({}))]);

    let output = fx
        .pipelines
        .start_pipeline(run("run6", spec), remote.clone())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(output, json!({"round": 2}));

    let requests = remote.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.exchange == RemoteExchange::Iteration));
    assert_eq!(requests[0].iteration, 1);
    assert_eq!(requests[1].iteration, 2);
    assert_eq!(requests[0].output.as_ref().unwrap().output, json!({"site": 1}));
}

#[tokio::test]
async fn test_aggregator_first_exchange_once() {
    let fx = fixture(OperatingMode::Remote, MockBackend::new(worker()));
    let remote = ScriptedRemote::new(|_| StepOutput {
        output: json!({"site1": 4}),
        success: false,
    });
    let spec = pipeline(vec![step("decentralized", "aggregate", json!({}))]);

    let output = fx
        .pipelines
        .start_pipeline(run("run7", spec), remote.clone())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(output, json!({"merged": {"site1": 4}}));

    let requests = remote.requests();
    let firsts = requests.iter().filter(|r| r.is_first()).count();
    assert_eq!(firsts, 1);
    assert!(requests[0].is_first(), "first exchange precedes all others");
    assert!(requests[0].output.is_none());
    assert!(requests.last().unwrap().is_transmit_only());
    assert_eq!(
        requests.last().unwrap().output.as_ref().unwrap().output,
        json!({"merged": {"site1": 4}})
    );
}

#[tokio::test]
async fn test_aggregation_waits_on_sites() {
    let fx = fixture(OperatingMode::Remote, MockBackend::new(worker()));
    let spec = pipeline(vec![step("decentralized", "aggregate", json!({}))]);
    let mut handle = fx
        .pipelines
        .start_aggregation(run("run12", spec).with_clients(["site3", "site2"]))
        .unwrap();
    let mut outbound = fx.pipelines.outbound("run12").unwrap();

    assert_eq!(fx.pipelines.waiting_on("run12").unwrap(), vec!["site2", "site3"]);
    assert_eq!(
        fx.pipelines
            .submit_client_output("run12", "site2", json!({"n": 2}))
            .unwrap(),
        vec!["site3"]
    );
    assert!(matches!(
        fx.pipelines
            .submit_client_output("run12", "site9", json!({})),
        Err(Error::Remote(_))
    ));
    loop {
        if let PipelineEvent::WaitingOn { run_id, clients } = handle.events().recv().await.unwrap() {
            assert_eq!(run_id, "run12");
            assert_eq!(clients, vec!["site3"]);
            break;
        }
    }
    fx.pipelines
        .submit_client_output("run12", "site3", json!({"n": 3}))
        .unwrap();

    let expected = json!({"merged": {"site2": {"n": 2}, "site3": {"n": 3}}});
    assert_eq!(handle.wait().await.unwrap(), expected);
    let sent = outbound.recv().await.unwrap();
    assert!(sent.is_transmit_only());
    assert_eq!(sent.output.unwrap().output, expected);
    assert!(matches!(
        fx.pipelines.waiting_on("run12"),
        Err(Error::RunNotFound(_))
    ));
}

#[tokio::test]
async fn test_aggregation_requires_remote_mode() {
    let fx = fixture(OperatingMode::Local, MockBackend::new(worker()));
    let spec = pipeline(vec![step("decentralized", "aggregate", json!({}))]);
    let err = fx
        .pipelines
        .start_aggregation(run("run13", spec.clone()).with_clients(["site2"]))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPipeline(_)));

    let remote = fixture(OperatingMode::Remote, MockBackend::new(worker()));
    let err = remote
        .pipelines
        .start_aggregation(run("run13", spec))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPipeline(_)));
}

#[tokio::test]
async fn test_decentralized_without_remote_fails() {
    let fx = fixture(OperatingMode::Local, MockBackend::new(worker()));
    let spec = pipeline(vec![step("decentralized", "local", json!({}))]);
    let err = fx
        .pipelines
        .start_pipeline(run("run8", spec), Arc::new(NoRemote))
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote(_)));
}

// =============================================================================
// Stopping
// =============================================================================

#[tokio::test]
async fn test_stop_pipeline_cancels_run() {
    let fx = fixture(
        OperatingMode::Local,
        MockBackend::new(worker()).with_delay(Duration::from_secs(5)),
    );
    let spec = pipeline(vec![step("local", "sum", json!({"a": {"value": 1}, "b": {"value": 1}}))]);
    let handle = fx
        .pipelines
        .start_pipeline(run("run9", spec.clone()), Arc::new(NoRemote))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let dup = fx
        .pipelines
        .start_pipeline(run("run9", spec), Arc::new(NoRemote))
        .unwrap_err();
    assert!(matches!(dup, Error::InvalidPipeline(_)));

    let err = fx.pipelines.stop_pipeline("someone-else", "run9").unwrap_err();
    assert!(matches!(err, Error::RunNotFound(_)));

    fx.pipelines.stop_pipeline("site1", "run9").unwrap();
    let err = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("cancelled run should end promptly")
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));
    assert!(fx.pipelines.run_state("run9").is_none());
    assert!(
        fx.pipelines.services().get_service("run9-sum").is_none(),
        "pending service released"
    );
    assert_eq!(fx.backend.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_run_timeout() {
    let fx = fixture(
        OperatingMode::Local,
        MockBackend::new(worker()).with_delay(Duration::from_secs(5)),
    );
    let spec = pipeline(vec![step("local", "sum", json!({"a": {"value": 1}, "b": {"value": 1}}))]);
    let handle = fx
        .pipelines
        .start_pipeline(run("run10", spec).with_timeout(Duration::from_secs(1)), Arc::new(NoRemote))
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(3), handle.wait())
        .await
        .expect("expired run should end promptly")
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "unexpected error: {err}");
}

#[tokio::test]
async fn test_stop_unknown_run() {
    let fx = fixture(OperatingMode::Local, MockBackend::new(worker()));
    let err = fx.pipelines.stop_pipeline("site1", "nope").unwrap_err();
    assert!(matches!(err, Error::RunNotFound(_)));
}
