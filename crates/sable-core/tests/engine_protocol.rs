//! Integration tests driving a full engine over an in-memory channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tempfile::TempDir;

use sable_core::dataset::{CellValue, Column, ColumnType, DataSource, Dataset};
use sable_core::ipc::protocol::{AnalysisStatus, ModuleRequest};
use sable_core::ipc::{Channel, MemoryChannel, Reply, Request, receive_json, send_json};
use sable_core::runtime::{
    AnalysisCall, AnalysisHost, AnalysisOutput, BuiltinRuntime, CodeRuntime, Flow, RuntimeError,
    RuntimeResult,
};
use sable_core::settings::Settings;
use sable_core::{Engine, EngineConfig, EngineState, ExitReason, ProcessWatch};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Built-in runtime with a scripted, counting analysis.
struct ScriptedRuntime {
    inner: BuiltinRuntime,
    analyses: Arc<AtomicUsize>,
}

impl CodeRuntime for ScriptedRuntime {
    fn apply_settings(&mut self, settings: &Settings) {
        self.inner.apply_settings(settings);
    }

    fn evaluate_filter(&mut self, code: &str, dataset: &Dataset) -> RuntimeResult<Vec<bool>> {
        self.inner.evaluate_filter(code, dataset)
    }

    fn compute_column(&mut self, code: &str, dataset: &Dataset) -> RuntimeResult<Vec<CellValue>> {
        self.inner.compute_column(code, dataset)
    }

    fn run_code(&mut self, code: &str, dataset: &Dataset, whitelisted: bool) -> RuntimeResult<String> {
        self.inner.run_code(code, dataset, whitelisted)
    }

    fn run_commander(&mut self, code: &str) -> RuntimeResult<()> {
        self.inner.run_commander(code)
    }

    fn module_request(&mut self, request: &ModuleRequest) -> RuntimeResult<String> {
        self.inner.module_request(request)
    }

    /// Runs `options.steps` checkpoints, sleeping between them. When
    /// `options.column` is set, that analysis column is written first.
    fn run_analysis(
        &mut self,
        call: &AnalysisCall<'_>,
        host: &mut dyn AnalysisHost,
    ) -> RuntimeResult<AnalysisOutput> {
        self.analyses.fetch_add(1, Ordering::SeqCst);

        if let Some(column) = call.request.options.get("column").and_then(Value::as_str) {
            host.set_analysis_column(column, vec![CellValue::Number(0.0); 3], ColumnType::Scale)
                .map_err(|e| RuntimeError::Evaluation(e.to_string()))?;
        }

        let steps = call.request.options.get("steps").and_then(Value::as_u64).unwrap_or(1);
        for step in 0..steps {
            let progress = ((step + 1) * 100 / steps) as u8;
            if host.checkpoint(Some(progress), None) == Flow::Abort {
                return Err(RuntimeError::Interrupted);
            }
            if steps > 1 {
                thread::sleep(Duration::from_millis(5));
            }
        }

        Ok(AnalysisOutput {
            results: json!({ "analysis": call.request.id, "revision": call.request.revision }),
            ..Default::default()
        })
    }
}

/// Serves a fixed dataset and counts loads.
struct CountingSource {
    dataset: Dataset,
    loads: Arc<AtomicUsize>,
}

impl DataSource for CountingSource {
    fn load(&mut self) -> sable_core::Result<Dataset> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.dataset.clone())
    }

    fn store_column(&mut self, _column: &Column) -> sable_core::Result<()> {
        Ok(())
    }

    fn remove_column(&mut self, _name: &str) -> sable_core::Result<()> {
        Ok(())
    }
}

struct FlagWatch(Arc<AtomicBool>);

impl ProcessWatch for FlagWatch {
    fn is_alive(&mut self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Harness {
    controller: MemoryChannel,
    engine: JoinHandle<(ExitReason, Engine)>,
    analyses: Arc<AtomicUsize>,
    loads: Arc<AtomicUsize>,
    parent_alive: Arc<AtomicBool>,
    _session: TempDir,
}

impl Harness {
    fn start() -> Self {
        Self::start_with(|_| {})
    }

    /// Start an engine; `before_run` may queue requests before the loop starts.
    fn start_with(before_run: impl FnOnce(&mut MemoryChannel)) -> Self {
        let dataset = Dataset::from_columns(vec![Column::scale("x", &[-1.0, 2.0, 3.0])]).unwrap();
        Self::launch(dataset, before_run)
    }

    fn with_dataset(dataset: Dataset) -> Self {
        Self::launch(dataset, |_| {})
    }

    fn launch(dataset: Dataset, before_run: impl FnOnce(&mut MemoryChannel)) -> Self {
        let session = TempDir::new().unwrap();
        let (mut controller, engine_end) = MemoryChannel::pair();
        let analyses = Arc::new(AtomicUsize::new(0));
        let loads = Arc::new(AtomicUsize::new(0));
        let parent_alive = Arc::new(AtomicBool::new(true));

        let config = EngineConfig {
            slave_no: 1,
            parent_pid: None,
            session_dir: session.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
        };
        let engine = Engine::new(
            config,
            Box::new(engine_end),
            Box::new(CountingSource {
                dataset,
                loads: Arc::clone(&loads),
            }),
            Box::new(ScriptedRuntime {
                inner: BuiltinRuntime::new(),
                analyses: Arc::clone(&analyses),
            }),
        )
        .unwrap()
        .with_parent_watch(Box::new(FlagWatch(Arc::clone(&parent_alive))));

        before_run(&mut controller);

        let engine = thread::spawn(move || {
            let mut engine = engine;
            let reason = engine.run();
            (reason, engine)
        });

        Self {
            controller,
            engine,
            analyses,
            loads,
            parent_alive,
            _session: session,
        }
    }

    fn send(&mut self, request: Value) {
        let request: Request = serde_json::from_value(request).unwrap();
        send_json(&mut self.controller, &request).unwrap();
    }

    fn recv(&mut self) -> Reply {
        receive_json::<Reply>(&mut self.controller, REPLY_TIMEOUT)
            .unwrap()
            .expect("Timed out waiting for a reply")
    }

    /// Receive until `pred` matches, returning everything received.
    fn recv_until(&mut self, pred: impl Fn(&Reply) -> bool) -> Vec<Reply> {
        let deadline = Instant::now() + REPLY_TIMEOUT;
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            let reply = self.recv();
            let done = pred(&reply);
            seen.push(reply);
            if done {
                return seen;
            }
        }
        panic!("Expected reply never arrived, got {:?}", seen);
    }

    fn assert_quiet(&mut self) {
        let reply: Option<Reply> =
            receive_json(&mut self.controller, Duration::from_millis(100)).unwrap();
        assert!(reply.is_none(), "Unexpected reply {:?}", reply);
    }

    fn stop(mut self) -> (ExitReason, Engine) {
        self.send(json!({ "typeRequest": "stop" }));
        self.recv_until(|r| matches!(r, Reply::EngineStopped));
        self.engine.join().unwrap()
    }
}

fn filter(request_id: i64, code: &str) -> Value {
    json!({
        "typeRequest": "filter",
        "filter": code,
        "generatedFilter": code,
        "requestId": request_id,
    })
}

fn analysis(id: i64, revision: i64, steps: u64) -> Value {
    json!({
        "typeRequest": "analysis",
        "id": id,
        "revision": revision,
        "name": "Scripted",
        "title": "Scripted",
        "options": { "steps": steps },
    })
}

fn is_status(reply: &Reply, id: i64, status: AnalysisStatus) -> bool {
    matches!(reply, Reply::Analysis(a) if a.id == id && a.status == status)
}

fn has_progress(reply: &Reply, id: i64) -> bool {
    matches!(reply, Reply::Analysis(a) if a.id == id && a.progress.is_some_and(|p| p > 0))
}

#[test]
fn test_filter_reply_carries_request_id() {
    let mut harness = Harness::start();
    harness.send(filter(7, "x > 0"));

    match harness.recv() {
        Reply::Filter(reply) => {
            assert_eq!(reply.request_id, 7);
            assert_eq!(reply.result, vec![false, true, true]);
        }
        other => panic!("Expected filter reply, got {:?}", other),
    }

    let (reason, engine) = harness.stop();
    assert_eq!(reason, ExitReason::Stopped);
    let dataset = engine.dataset().unwrap();
    assert_eq!(dataset.filter(), Some(&[false, true, true][..]));
}

#[test]
fn test_filter_calls_function_named_like_a_column() {
    let dataset = Dataset::from_columns(vec![
        Column::scale("x", &[-1.0, 2.0, 3.0]),
        Column::scale("mean", &[5.0, 0.0, 0.0]),
    ])
    .unwrap();
    let mut harness = Harness::with_dataset(dataset);

    harness.send(filter(12, "x > mean(x)"));
    match harness.recv() {
        Reply::Filter(reply) => {
            assert_eq!(reply.request_id, 12);
            assert_eq!(reply.result, vec![false, true, true]);
        }
        other => panic!("Expected filter reply, got {:?}", other),
    }

    harness.send(filter(13, "x < mean"));
    match harness.recv() {
        Reply::Filter(reply) => assert_eq!(reply.result, vec![true, false, false]),
        other => panic!("Expected filter reply, got {:?}", other),
    }
    harness.stop();
}

#[test]
fn test_malformed_filter_leaves_dataset_unchanged() {
    let mut harness = Harness::start();
    harness.send(filter(1, "x > 1"));
    assert!(matches!(harness.recv(), Reply::Filter(_)));

    harness.send(filter(7, "x > "));
    match harness.recv() {
        Reply::FilterError(reply) => {
            assert_eq!(reply.request_id, 7);
            assert!(!reply.error.is_empty());
        }
        other => panic!("Expected filter error, got {:?}", other),
    }

    let (_, engine) = harness.stop();
    assert_eq!(engine.dataset().unwrap().filter(), Some(&[false, true, true][..]));
}

#[test]
fn test_empty_filter_selects_all_rows() {
    let mut harness = Harness::start();
    harness.send(filter(3, "  "));
    match harness.recv() {
        Reply::Filter(reply) => assert_eq!(reply.result, vec![true; 3]),
        other => panic!("Expected filter reply, got {:?}", other),
    }
    harness.stop();
}

#[test]
fn test_malformed_message_is_skipped() {
    let mut harness = Harness::start();
    harness.controller.send("{ not json").unwrap();
    harness.controller.send(r#"{"typeRequest":"noSuchKind"}"#).unwrap();
    harness.send(filter(2, "x < 0"));

    assert_eq!(harness.recv().request_id(), Some(2));
    harness.stop();
}

#[test]
fn test_failed_compute_keeps_previous_values() {
    let mut harness = Harness::start();
    harness.send(json!({
        "typeRequest": "computeColumn",
        "columnName": "y",
        "code": "x * 2",
        "type": "scale",
        "forceType": false,
    }));
    match harness.recv() {
        Reply::ComputeColumn(reply) => assert!(reply.success, "{:?}", reply.error),
        other => panic!("Expected compute reply, got {:?}", other),
    }

    harness.send(json!({
        "typeRequest": "computeColumn",
        "columnName": "y",
        "code": "x +",
        "type": "scale",
        "forceType": false,
    }));
    match harness.recv() {
        Reply::ComputeColumn(reply) => {
            assert_eq!(reply.column_name, "y");
            assert!(!reply.success);
            assert!(reply.error.is_some());
        }
        other => panic!("Expected compute reply, got {:?}", other),
    }

    let (_, engine) = harness.stop();
    let column = engine.dataset().unwrap().column("y").unwrap();
    assert_eq!(
        column.values,
        vec![CellValue::Number(-2.0), CellValue::Number(4.0), CellValue::Number(6.0)]
    );
    let computed = column.computed.as_ref().unwrap();
    assert_eq!(computed.code, "x +");
    assert!(computed.error.is_some());
}

#[test]
fn test_invalid_column_name_is_rejected() {
    let mut harness = Harness::start();
    harness.send(json!({
        "typeRequest": "computeColumn",
        "columnName": "col0_enc",
        "code": "1",
        "type": "scale",
        "forceType": false,
    }));
    match harness.recv() {
        Reply::ComputeColumn(reply) => assert!(!reply.success),
        other => panic!("Expected compute reply, got {:?}", other),
    }
    let (_, engine) = harness.stop();
    assert!(engine.dataset().unwrap().column("col0_enc").is_none());
}

#[test]
fn test_code_replies_with_result_or_error() {
    let mut harness = Harness::start();
    harness.send(json!({ "typeRequest": "rCode", "rCode": "sum(x)", "requestId": 11, "whiteListed": true }));
    match harness.recv() {
        Reply::Code(reply) => {
            assert_eq!(reply.request_id, 11);
            assert!(reply.result.unwrap().contains('4'));
            assert!(reply.error.is_none());
        }
        other => panic!("Expected code reply, got {:?}", other),
    }

    harness.send(json!({
        "typeRequest": "rCode",
        "rCode": "set_option('a', 1)",
        "requestId": 12,
        "whiteListed": false,
    }));
    match harness.recv() {
        Reply::Code(reply) => {
            assert_eq!(reply.request_id, 12);
            assert!(reply.result.is_none());
            assert!(reply.error.is_some());
        }
        other => panic!("Expected code reply, got {:?}", other),
    }
    harness.stop();
}

#[test]
fn test_deeply_nested_code_is_an_error_reply() {
    let mut harness = Harness::start();
    let depth = 100_000;
    let code = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
    harness.send(json!({ "typeRequest": "rCode", "rCode": code, "requestId": 40, "whiteListed": true }));
    match harness.recv() {
        Reply::Code(reply) => {
            assert_eq!(reply.request_id, 40);
            assert!(reply.result.is_none());
            assert!(reply.error.unwrap().contains("nested too deeply"));
        }
        other => panic!("Expected code reply, got {:?}", other),
    }

    let deep_filter = format!("{}x > 0", "!".repeat(depth));
    harness.send(filter(41, &deep_filter));
    match harness.recv() {
        Reply::FilterError(reply) => assert_eq!(reply.request_id, 41),
        other => panic!("Expected filter error, got {:?}", other),
    }

    harness.send(filter(42, "x > 0"));
    assert!(matches!(harness.recv(), Reply::Filter(r) if r.request_id == 42));
    let (reason, _) = harness.stop();
    assert_eq!(reason, ExitReason::Stopped);
}

#[test]
fn test_commander_code_sends_nothing() {
    let mut harness = Harness::start();
    harness.send(json!({ "typeRequest": "codeCommander", "code": "this is not code" }));
    harness.assert_quiet();

    harness.send(filter(4, "x > 0"));
    assert_eq!(harness.recv().request_id(), Some(4));
    harness.stop();
}

#[test]
fn test_module_requests() {
    let mut harness = Harness::start();
    harness.send(json!({ "typeRequest": "moduleRequest", "moduleRequest": "loadModule", "moduleName": "Extra" }));
    match harness.recv() {
        Reply::ModuleRequest(reply) => {
            assert!(reply.success);
            assert_eq!(reply.module_name, "Extra");
        }
        other => panic!("Expected module reply, got {:?}", other),
    }

    harness.send(json!({ "typeRequest": "moduleRequest", "moduleRequest": "unloadModule", "moduleName": "Other" }));
    match harness.recv() {
        Reply::ModuleRequest(reply) => {
            assert!(!reply.success);
            assert_eq!(reply.kind, "unloadModule");
        }
        other => panic!("Expected module reply, got {:?}", other),
    }
    harness.stop();
}

#[test]
fn test_paused_engine_rejects_execution() {
    let mut harness = Harness::start();
    harness.send(json!({ "typeRequest": "pause" }));
    assert!(matches!(harness.recv(), Reply::EnginePaused));

    harness.send(filter(5, "x > 0"));
    match harness.recv() {
        Reply::FilterError(reply) => {
            assert_eq!(reply.request_id, 5);
            assert_eq!(reply.error, "engine is paused");
        }
        other => panic!("Expected paused error, got {:?}", other),
    }

    harness.send(analysis(1, 1, 1));
    assert!(matches!(harness.recv(), Reply::Analysis(a) if a.status == AnalysisStatus::Error));
    assert_eq!(harness.analyses.load(Ordering::SeqCst), 0);

    harness.send(json!({ "typeRequest": "resume" }));
    assert!(matches!(
        harness.recv(),
        Reply::EngineResumed { just_reloaded_data: false }
    ));

    harness.send(filter(6, "x > 0"));
    assert!(matches!(harness.recv(), Reply::Filter(r) if r.request_id == 6));
    harness.stop();
}

#[test]
fn test_resume_while_idle_is_a_no_op() {
    let mut harness = Harness::start();
    harness.send(json!({ "typeRequest": "resume" }));
    harness.assert_quiet();
    harness.stop();
}

#[test]
fn test_completed_analysis_is_resent_from_cache() {
    let mut harness = Harness::start();
    harness.send(analysis(1, 1, 1));
    let replies = harness.recv_until(|r| is_status(r, 1, AnalysisStatus::Complete));
    let Some(Reply::Analysis(first)) = replies.last() else {
        panic!("Expected analysis reply");
    };
    assert_eq!(first.results, json!({ "analysis": 1, "revision": 1 }));
    assert_eq!(harness.analyses.load(Ordering::SeqCst), 1);

    harness.send(analysis(1, 1, 1));
    match harness.recv() {
        Reply::Analysis(reply) => {
            assert_eq!(reply.status, AnalysisStatus::Complete);
            assert_eq!(reply.results, first.results);
        }
        other => panic!("Expected cached results, got {:?}", other),
    }
    assert_eq!(harness.analyses.load(Ordering::SeqCst), 1);

    harness.send(analysis(1, 2, 1));
    harness.recv_until(|r| is_status(r, 1, AnalysisStatus::Complete));
    assert_eq!(harness.analyses.load(Ordering::SeqCst), 2);

    let (_, engine) = harness.stop();
    assert_eq!(engine.analysis_status(), Some((1, 2, AnalysisStatus::Complete)));
}

#[test]
fn test_newer_analysis_supersedes_running_one() {
    let mut harness = Harness::start();
    harness.send(analysis(1, 1, 1000));
    harness.recv_until(|r| has_progress(r, 1));

    harness.send(analysis(2, 1, 1));
    let replies = harness.recv_until(|r| is_status(r, 2, AnalysisStatus::Complete));
    assert!(!replies.iter().any(|r| is_status(r, 1, AnalysisStatus::Complete)));
    assert_eq!(harness.analyses.load(Ordering::SeqCst), 2);

    let (_, engine) = harness.stop();
    assert_eq!(engine.analysis_status(), Some((2, 1, AnalysisStatus::Complete)));
}

#[test]
fn test_abort_running_analysis() {
    let mut harness = Harness::start();
    harness.send(analysis(3, 1, 1000));
    harness.recv_until(|r| has_progress(r, 3));

    let mut abort = analysis(3, 1, 1000);
    abort["perform"] = json!("abort");
    harness.send(abort);
    harness.recv_until(|r| is_status(r, 3, AnalysisStatus::Aborted));

    harness.send(filter(8, "x > 0"));
    assert_eq!(
        harness.recv_until(|r| r.request_id().is_some()).last().and_then(Reply::request_id),
        Some(8)
    );
    harness.stop();
}

#[test]
fn test_filter_during_analysis_is_replayed_after_completion() {
    let mut harness = Harness::start();
    harness.send(analysis(7, 1, 40));
    harness.recv_until(|r| has_progress(r, 7));

    harness.send(filter(31, "x > 0"));
    let replies = harness.recv_until(|r| r.request_id() == Some(31));

    let complete = replies
        .iter()
        .position(|r| is_status(r, 7, AnalysisStatus::Complete))
        .expect("Analysis did not complete");
    assert_eq!(complete, replies.len() - 2);
    match replies.last() {
        Some(Reply::Filter(reply)) => {
            assert_eq!(reply.request_id, 31);
            assert_eq!(reply.result, vec![false, true, true]);
        }
        other => panic!("Expected filter reply, got {:?}", other),
    }
    harness.stop();
}

#[test]
fn test_stale_analysis_column_removed_after_aborted_run() {
    let mut harness = Harness::start();
    let mut standardized = analysis(9, 1, 1000);
    standardized["options"]["column"] = json!("Z_x");
    harness.send(standardized);
    harness.recv_until(|r| has_progress(r, 9));

    let mut abort = analysis(9, 1, 1000);
    abort["perform"] = json!("abort");
    harness.send(abort);
    harness.recv_until(|r| is_status(r, 9, AnalysisStatus::Aborted));

    harness.send(analysis(9, 2, 1));
    harness.recv_until(|r| is_status(r, 9, AnalysisStatus::Complete));

    let (_, engine) = harness.stop();
    let dataset = engine.dataset().unwrap();
    assert!(dataset.column("Z_x").is_none());
    assert!(dataset.columns().iter().all(|c| c.analysis_id.is_none()));
}

#[test]
fn test_analysis_column_kept_while_still_produced() {
    let mut harness = Harness::start();
    for revision in 1..=2 {
        let mut run = analysis(10, revision, 1);
        run["options"]["column"] = json!("Z_x");
        harness.send(run);
        harness.recv_until(|r| is_status(r, 10, AnalysisStatus::Complete));
    }

    let (_, engine) = harness.stop();
    let column = engine.dataset().unwrap().column("Z_x").unwrap();
    assert_eq!(column.analysis_id, Some(10));
}

#[test]
fn test_pause_inside_analysis() {
    let mut harness = Harness::start();
    harness.send(analysis(4, 1, 40));
    harness.recv_until(|r| has_progress(r, 4));

    harness.send(json!({ "typeRequest": "pause" }));
    harness.recv_until(|r| matches!(r, Reply::EnginePaused));

    harness.send(filter(9, "x > 0"));
    match harness.recv() {
        Reply::FilterError(reply) => assert_eq!(reply.request_id, 9),
        other => panic!("Expected paused error, got {:?}", other),
    }

    harness.send(json!({ "typeRequest": "resume" }));
    assert!(matches!(
        harness.recv(),
        Reply::EngineResumed { just_reloaded_data: false }
    ));
    harness.recv_until(|r| is_status(r, 4, AnalysisStatus::Complete));
    harness.stop();
}

#[test]
fn test_stop_inside_analysis() {
    let mut harness = Harness::start();
    harness.send(analysis(5, 1, 1000));
    harness.recv_until(|r| has_progress(r, 5));

    let (reason, engine) = harness.stop();
    assert_eq!(reason, ExitReason::Stopped);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.analysis_status(), Some((5, 1, AnalysisStatus::Aborted)));
}

#[test]
fn test_reload_while_idle() {
    let mut harness = Harness::start();
    harness.send(json!({ "typeRequest": "reloadData" }));
    assert!(matches!(harness.recv(), Reply::EngineLoadingData));
    assert!(matches!(
        harness.recv(),
        Reply::EngineResumed { just_reloaded_data: true }
    ));
    assert_eq!(harness.loads.load(Ordering::SeqCst), 1);
    harness.stop();
}

#[test]
fn test_reload_while_paused_waits_for_resume() {
    let mut harness = Harness::start();
    harness.send(json!({ "typeRequest": "pause" }));
    assert!(matches!(harness.recv(), Reply::EnginePaused));

    harness.send(json!({ "typeRequest": "reloadData" }));
    harness.assert_quiet();
    assert_eq!(harness.loads.load(Ordering::SeqCst), 0);

    harness.send(json!({ "typeRequest": "resume" }));
    assert!(matches!(harness.recv(), Reply::EngineLoadingData));
    assert!(matches!(
        harness.recv(),
        Reply::EngineResumed { just_reloaded_data: true }
    ));
    assert_eq!(harness.loads.load(Ordering::SeqCst), 1);
    harness.stop();
}

#[test]
fn test_reload_while_running_waits_for_analysis() {
    let mut harness = Harness::start();
    harness.send(analysis(6, 1, 40));
    harness.recv_until(|r| has_progress(r, 6));

    harness.send(json!({ "typeRequest": "reloadData" }));
    let replies = harness.recv_until(|r| matches!(r, Reply::EngineResumed { .. }));

    let complete = replies
        .iter()
        .position(|r| is_status(r, 6, AnalysisStatus::Complete))
        .expect("Analysis did not complete");
    let loading = replies
        .iter()
        .position(|r| matches!(r, Reply::EngineLoadingData))
        .expect("No loading notification");
    assert!(complete < loading);
    assert!(matches!(
        replies.last(),
        Some(Reply::EngineResumed { just_reloaded_data: true })
    ));
    harness.stop();
}

#[test]
fn test_requests_queued_before_start_are_replayed() {
    let mut harness = Harness::start_with(|controller| {
        let settings: Request =
            serde_json::from_value(json!({ "typeRequest": "settings", "numDecimals": 5 })).unwrap();
        let request: Request = serde_json::from_value(filter(21, "x > 2")).unwrap();
        send_json(controller, &settings).unwrap();
        send_json(controller, &request).unwrap();
    });

    match harness.recv() {
        Reply::Filter(reply) => {
            assert_eq!(reply.request_id, 21);
            assert_eq!(reply.result, vec![false, false, true]);
        }
        other => panic!("Expected filter reply, got {:?}", other),
    }

    let (_, engine) = harness.stop();
    assert_eq!(engine.settings().num_decimals, 5);
}

#[test]
fn test_stop_reports_and_exits() {
    let harness = Harness::start();
    let (reason, engine) = harness.stop();
    assert_eq!(reason, ExitReason::Stopped);
    assert_eq!(reason.exit_code(), 0);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(engine.dataset().is_none());
}

#[test]
fn test_orphaned_engine_exits() {
    let harness = Harness::start();
    harness.parent_alive.store(false, Ordering::SeqCst);

    let (reason, engine) = harness.engine.join().unwrap();
    assert_eq!(reason, ExitReason::Orphaned);
    assert_ne!(reason.exit_code(), 0);
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[test]
fn test_orphaned_during_analysis_exits() {
    let mut harness = Harness::start();
    harness.send(analysis(11, 1, 1000));
    harness.recv_until(|r| has_progress(r, 11));
    harness.parent_alive.store(false, Ordering::SeqCst);

    let (reason, engine) = harness.engine.join().unwrap();
    assert_eq!(reason, ExitReason::Orphaned);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.analysis_status(), Some((11, 1, AnalysisStatus::Aborted)));
}

#[test]
fn test_orphaned_while_paused_inside_analysis_exits() {
    let mut harness = Harness::start();
    harness.send(analysis(12, 1, 1000));
    harness.recv_until(|r| has_progress(r, 12));

    harness.send(json!({ "typeRequest": "pause" }));
    harness.recv_until(|r| matches!(r, Reply::EnginePaused));
    harness.parent_alive.store(false, Ordering::SeqCst);

    let (reason, engine) = harness.engine.join().unwrap();
    assert_eq!(reason, ExitReason::Orphaned);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.analysis_status(), Some((12, 1, AnalysisStatus::Aborted)));
}

#[test]
fn test_closed_channel_exits() {
    let harness = Harness::start();
    drop(harness.controller);

    let (reason, _) = harness.engine.join().unwrap();
    assert_eq!(reason, ExitReason::ChannelClosed);
}
