//! End-to-end tests against the real `sable-engine` binary.

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use sable_core::ipc::protocol::{ComputeColumnRequest, FilterRequest, LogConfig};
use sable_core::{ColumnType, EngineHandle, EngineOptions, Reply, Request};

const TIMEOUT: Duration = Duration::from_secs(10);

fn write_dataset(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("data.json");
    let dataset = json!({
        "columns": [
            { "name": "x", "type": "scale", "values": [-1, 2, 3] },
            { "name": "group", "type": "nominal", "values": ["a", "b", "a"] }
        ]
    });
    std::fs::write(&path, serde_json::to_vec(&dataset).unwrap()).unwrap();
    path
}

fn spawn(temp: &TempDir) -> EngineHandle {
    let options = EngineOptions {
        slave_no: 0,
        session_dir: Some(temp.path().join("session")),
        data: Some(write_dataset(temp.path())),
        poll_ms: Some(20),
        ..Default::default()
    };
    EngineHandle::spawn_binary(Path::new(env!("CARGO_BIN_EXE_sable-engine")), &options).unwrap()
}

fn recv(engine: &mut EngineHandle) -> Reply {
    engine
        .receive(TIMEOUT)
        .unwrap()
        .expect("Timed out waiting for the engine")
}

fn stop(engine: &mut EngineHandle) {
    engine.send(&Request::Stop).unwrap();
    assert!(matches!(recv(engine), Reply::EngineStopped));
    let status = engine.wait_timeout(TIMEOUT).unwrap().expect("Engine did not exit");
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_filter_then_stop() {
    let temp = TempDir::new().unwrap();
    let mut engine = spawn(&temp);

    engine
        .send(&Request::Filter(FilterRequest {
            filter: "x > 0".to_string(),
            generated_filter: "x > 0".to_string(),
            request_id: 7,
        }))
        .unwrap();

    match recv(&mut engine) {
        Reply::Filter(reply) => {
            assert_eq!(reply.request_id, 7);
            assert_eq!(reply.result, vec![false, true, true]);
        }
        other => panic!("Expected filter reply, got {:?}", other),
    }

    stop(&mut engine);
}

#[test]
fn test_computed_column_is_written_back() {
    let temp = TempDir::new().unwrap();
    let mut engine = spawn(&temp);

    engine
        .send(&Request::ComputeColumn(ComputeColumnRequest {
            column_name: "double x".to_string(),
            code: "x * 2".to_string(),
            column_type: ColumnType::Scale,
            force_type: false,
        }))
        .unwrap();
    match recv(&mut engine) {
        Reply::ComputeColumn(reply) => assert!(reply.success, "{:?}", reply.error),
        other => panic!("Expected compute reply, got {:?}", other),
    }
    stop(&mut engine);

    let stored: serde_json::Value =
        serde_json::from_slice(&std::fs::read(temp.path().join("data.json")).unwrap()).unwrap();
    let columns = stored["columns"].as_array().unwrap();
    let computed = columns
        .iter()
        .find(|c| c["name"] == "double x")
        .expect("Computed column not stored");
    assert_eq!(computed["values"], json!([-2.0, 4.0, 6.0]));
}

#[test]
fn test_log_config_switches_to_file() {
    let temp = TempDir::new().unwrap();
    let mut engine = spawn(&temp);

    engine
        .send(&Request::LogCfg(LogConfig {
            log_to_file: true,
            log_dir: None,
            filter: Some("debug".to_string()),
        }))
        .unwrap();
    engine.send(&Request::ReloadData).unwrap();
    assert!(matches!(recv(&mut engine), Reply::EngineLoadingData));
    assert!(matches!(
        recv(&mut engine),
        Reply::EngineResumed { just_reloaded_data: true }
    ));
    stop(&mut engine);

    let log = temp.path().join("session").join("logs").join("engine-0.log");
    assert!(log.exists());
}

#[test]
fn test_engine_exits_when_parent_is_gone() {
    let temp = TempDir::new().unwrap();

    #[cfg(unix)]
    let parent_pid = {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    };
    #[cfg(not(unix))]
    let parent_pid = u32::MAX;

    let options = EngineOptions {
        parent_pid,
        session_dir: Some(temp.path().join("session")),
        poll_ms: Some(20),
        ..Default::default()
    };
    let mut engine =
        EngineHandle::spawn_binary(Path::new(env!("CARGO_BIN_EXE_sable-engine")), &options).unwrap();

    let status = engine.wait_timeout(TIMEOUT).unwrap().expect("Engine did not exit");
    assert_eq!(status.code(), Some(3));
}
