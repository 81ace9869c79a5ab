//! IPC protocol messages between the controller and an engine.
//!
//! Uses length-prefixed JSON messages.
//! Format: 4-byte length (u32 LE) + UTF-8 JSON body.
//!
//! Every message is an object tagged by `typeRequest`. Requests with a
//! correlation id (`filter`, `rCode`) are answered with a reply carrying the
//! same `requestId`.

use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dataset::ColumnType;
use crate::error::{Error, Result};
use crate::settings::SettingsUpdate;

/// Largest frame accepted from the wire.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Request sent from the controller to an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typeRequest", rename_all = "camelCase")]
pub enum Request {
    /// Run (or abort) an analysis.
    Analysis(AnalysisRequest),

    /// Evaluate a row filter.
    Filter(FilterRequest),

    /// Compute the values of a column from code.
    ComputeColumn(ComputeColumnRequest),

    /// Run a free-form code snippet.
    #[serde(rename = "rCode", alias = "code")]
    Code(CodeRequest),

    /// Run administrative code; no reply.
    CodeCommander(CommanderRequest),

    /// Load or unload a module.
    ModuleRequest(ModuleRequest),

    /// The shared dataset changed.
    ReloadData,

    /// Reconfigure logging.
    LogCfg(LogConfig),

    /// Update display settings.
    Settings(SettingsUpdate),

    /// Pause at the next safe point.
    Pause,

    /// Continue after a pause.
    Resume,

    /// Shut the engine down.
    Stop,
}

impl Request {
    /// Short name of the request kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Analysis(_) => "analysis",
            Self::Filter(_) => "filter",
            Self::ComputeColumn(_) => "computeColumn",
            Self::Code(_) => "rCode",
            Self::CodeCommander(_) => "codeCommander",
            Self::ModuleRequest(_) => "moduleRequest",
            Self::ReloadData => "reloadData",
            Self::LogCfg(_) => "logCfg",
            Self::Settings(_) => "settings",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }
}

/// What to do with an analysis request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Perform {
    #[default]
    Run,
    Abort,
}

/// Per-request image options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppi: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
}

/// Analysis request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub id: i64,
    pub revision: i64,
    pub name: String,
    #[serde(default)]
    pub title: String,
    /// Structured option tree, interpreted by the runtime.
    pub options: Value,
    #[serde(default)]
    pub perform: Perform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_module: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_font: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_options: Option<ImageOptions>,
    /// Runtime source file overriding the installed analysis.
    #[serde(default, rename = "rfile", skip_serializing_if = "Option::is_none")]
    pub code_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Filter request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRequest {
    /// Filter as the user wrote it.
    pub filter: String,
    /// Expanded filter that is actually evaluated.
    pub generated_filter: String,
    pub request_id: i64,
}

/// Compute-column request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeColumnRequest {
    pub column_name: String,
    pub code: String,
    #[serde(rename = "type", default)]
    pub column_type: ColumnType,
    #[serde(default)]
    pub force_type: bool,
}

/// Free-form code request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeRequest {
    #[serde(alias = "rCode")]
    pub code: String,
    pub request_id: i64,
    #[serde(rename = "whiteListed", default)]
    pub whitelisted: bool,
}

/// Administrative code payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommanderRequest {
    pub code: String,
}

/// Module request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRequest {
    /// `loadModule`, `unloadModule`, `installModule`, …
    #[serde(rename = "moduleRequest")]
    pub kind: String,
    pub module_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_code: Option<String>,
}

/// Logging options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Filter directive such as `debug` or `info,sable_core=trace`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Status of an analysis, shared by engine and controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnalysisStatus {
    #[default]
    Empty,
    Initializing,
    Waiting,
    Running,
    Complete,
    Error,
    Aborted,
    Changed,
}

impl AnalysisStatus {
    /// Whether the analysis reached an end state.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Aborted)
    }
}

/// Reply sent from an engine to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typeRequest", rename_all = "camelCase")]
pub enum Reply {
    /// Progress, partial or final analysis results.
    Analysis(AnalysisReply),

    /// Filter evaluated and applied.
    Filter(FilterReply),

    /// Filter could not be evaluated; nothing was applied.
    FilterError(FilterErrorReply),

    /// Result of a code request.
    #[serde(rename = "rCode")]
    Code(CodeReply),

    /// Outcome of a compute-column request.
    ComputeColumn(ComputeColumnReply),

    /// Outcome of a module request.
    ModuleRequest(ModuleReply),

    /// Engine paused.
    EnginePaused,

    /// Engine resumed.
    EngineResumed {
        #[serde(rename = "justReloadedData", default)]
        just_reloaded_data: bool,
    },

    /// Engine is reloading the dataset.
    EngineLoadingData,

    /// Engine stopped; no further replies follow.
    EngineStopped,
}

impl Reply {
    /// Correlation id, for replies that carry one.
    pub fn request_id(&self) -> Option<i64> {
        match self {
            Self::Filter(r) => Some(r.request_id),
            Self::FilterError(r) => Some(r.request_id),
            Self::Code(r) => Some(r.request_id),
            _ => None,
        }
    }
}

/// Analysis results message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReply {
    pub id: i64,
    pub revision: i64,
    pub name: String,
    pub title: String,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub results: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Successful filter result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterReply {
    pub request_id: i64,
    /// Inclusion flag per row.
    pub result: Vec<bool>,
}

/// Failed filter evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterErrorReply {
    pub request_id: i64,
    pub error: String,
}

/// Code result or error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeReply {
    pub request_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Compute-column outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeColumnReply {
    pub column_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Module request outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleReply {
    #[serde(rename = "moduleRequest")]
    pub kind: String,
    pub module_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| Error::Ipc(format!("IPC message too large: {} bytes", body.len())))?;

    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(body)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e)));
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    Ok(Some(body))
}

/// Write a message as a JSON frame.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    write_frame(writer, &body)
}

/// Read a JSON frame and decode it.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let body = read_frame(reader)?.ok_or(Error::ChannelClosed)?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_filter_request_from_wire() {
        let request: Request = serde_json::from_value(json!({
            "typeRequest": "filter",
            "filter": "x > 0",
            "generatedFilter": "x > 0",
            "requestId": 7
        }))
        .unwrap();

        match request {
            Request::Filter(filter) => {
                assert_eq!(filter.request_id, 7);
                assert_eq!(filter.generated_filter, "x > 0");
            }
            other => panic!("Wrong request type: {:?}", other),
        }
    }

    #[test]
    fn test_code_request_aliases() {
        let request: Request = serde_json::from_value(json!({
            "typeRequest": "code",
            "rCode": "1 + 1",
            "requestId": 3,
            "whiteListed": true
        }))
        .unwrap();

        assert_eq!(
            request,
            Request::Code(CodeRequest {
                code: "1 + 1".to_string(),
                request_id: 3,
                whitelisted: true,
            })
        );
    }

    #[test]
    fn test_unit_requests() {
        for (kind, expected) in [
            ("pause", Request::Pause),
            ("resume", Request::Resume),
            ("stop", Request::Stop),
            ("reloadData", Request::ReloadData),
        ] {
            let request: Request = serde_json::from_value(json!({ "typeRequest": kind })).unwrap();
            assert_eq!(request, expected);
            assert_eq!(request.kind(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result: std::result::Result<Request, _> =
            serde_json::from_value(json!({ "typeRequest": "dance" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_analysis_request_defaults() {
        let request: Request = serde_json::from_value(json!({
            "typeRequest": "analysis",
            "id": 1,
            "revision": 2,
            "name": "Descriptives",
            "options": { "variables": ["x"] }
        }))
        .unwrap();

        let Request::Analysis(analysis) = request else {
            panic!("Wrong request type");
        };
        assert_eq!(analysis.perform, Perform::Run);
        assert!(analysis.dynamic_module.is_none());
        assert_eq!(analysis.title, "");
    }

    #[test]
    fn test_reply_wire_format() {
        let reply = Reply::FilterError(FilterErrorReply {
            request_id: 7,
            error: "unexpected token".to_string(),
        });
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["typeRequest"], "filterError");
        assert_eq!(value["requestId"], 7);
        assert_eq!(reply.request_id(), Some(7));

        let resumed = serde_json::to_value(Reply::EngineResumed { just_reloaded_data: true }).unwrap();
        assert_eq!(resumed, json!({ "typeRequest": "engineResumed", "justReloadedData": true }));
    }

    #[test]
    fn test_frame_roundtrip_and_eof() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::Stop).unwrap();
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize, buf.len() - 4);

        let mut cursor = Cursor::new(buf);
        let decoded: Request = read_message(&mut cursor).unwrap();
        assert_eq!(decoded, Request::Stop);

        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut cursor = Cursor::new(u32::MAX.to_le_bytes().to_vec());
        assert!(matches!(read_frame(&mut cursor), Err(Error::Ipc(_))));
    }
}
