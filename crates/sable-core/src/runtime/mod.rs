//! Code execution runtime boundary.
//!
//! The engine never interprets code itself. Everything that evaluates user
//! code (filters, computed columns, free-form snippets, analyses) goes
//! through a [`CodeRuntime`]. Column references in that code are already
//! encoded (`col3_enc`) when the runtime sees them.
//!
//! [`BuiltinRuntime`] is the runtime shipped with the engine: a small
//! vectorized expression language plus a set of built-in analyses.

mod builtin;
mod eval;
mod expr;

pub use builtin::BuiltinRuntime;
pub use eval::{Evaluator, Vector};
pub use expr::{BinaryOp, Expr, UnaryOp, parse};

use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;
use thiserror::Error;

use crate::dataset::{CellValue, ColumnType, Dataset};
use crate::ipc::protocol::{AnalysisRequest, ModuleRequest};
use crate::paths::FileLocation;
use crate::settings::Settings;

/// Result type for runtime calls.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Failures reported by a code runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// The code could not be parsed.
    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    /// The code parsed but failed while running.
    #[error("{0}")]
    Evaluation(String),

    /// The operation is not allowed for non-whitelisted code.
    #[error("'{0}' is not allowed in this context")]
    NotWhitelisted(String),

    /// No analysis with that name is available.
    #[error("unknown analysis '{0}'")]
    UnknownAnalysis(String),

    /// A module could not be loaded, unloaded or used.
    #[error("module error: {0}")]
    Module(String),

    /// The host asked the running code to stop.
    #[error("interrupted")]
    Interrupted,

    /// The runtime panicked; the message is the panic payload.
    #[error("runtime panicked: {0}")]
    Panicked(String),
}

/// Whether running code should keep going after a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Abort,
}

/// An analysis invocation as handed to the runtime.
#[derive(Debug, Clone)]
pub struct AnalysisCall<'a> {
    pub request: &'a AnalysisRequest,
    /// State persisted by the previous completed run of this analysis.
    pub state: Option<Value>,
}

/// What a finished analysis produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisOutput {
    pub results: Value,
    pub meta: Option<Value>,
    /// State to persist for the next run.
    pub state: Option<Value>,
    /// Relative paths of files in the analysis directory that must survive.
    pub keep: Vec<String>,
}

/// Services the engine offers to a running analysis.
pub trait AnalysisHost {
    /// The dataset, with the current filter applied by `filtered_rows`.
    fn dataset(&mut self) -> crate::Result<&Dataset>;

    /// Create or overwrite a column owned by the running analysis.
    fn set_analysis_column(
        &mut self,
        name: &str,
        values: Vec<CellValue>,
        column_type: ColumnType,
    ) -> crate::Result<()>;

    /// Remove a column owned by the running analysis.
    ///
    /// Returns whether it existed.
    fn remove_analysis_column(&mut self, name: &str) -> crate::Result<bool>;

    /// Report progress and partial results, and find out whether to go on.
    ///
    /// This is the safe point where the engine reacts to pause, stop and
    /// superseding requests.
    fn checkpoint(&mut self, progress: Option<u8>, partial: Option<&Value>) -> Flow;

    /// Fresh temporary file in the analysis directory.
    fn temp_file(&mut self, extension: &str) -> crate::Result<FileLocation>;

    /// Named file in the analysis directory.
    fn specific_file(&mut self, name: &str) -> crate::Result<FileLocation>;
}

/// Executes user code on behalf of the engine.
pub trait CodeRuntime: Send {
    /// Receive the current display settings.
    fn apply_settings(&mut self, settings: &Settings);

    /// Evaluate a filter to one inclusion flag per row.
    fn evaluate_filter(&mut self, code: &str, dataset: &Dataset) -> RuntimeResult<Vec<bool>>;

    /// Evaluate column code to one value per row.
    fn compute_column(&mut self, code: &str, dataset: &Dataset) -> RuntimeResult<Vec<CellValue>>;

    /// Run a snippet and return its printed result.
    fn run_code(&mut self, code: &str, dataset: &Dataset, whitelisted: bool)
    -> RuntimeResult<String>;

    /// Run administrative code.
    fn run_commander(&mut self, code: &str) -> RuntimeResult<()>;

    /// Handle a module request.
    fn module_request(&mut self, request: &ModuleRequest) -> RuntimeResult<String>;

    /// Run an analysis to completion or until a checkpoint says abort.
    fn run_analysis(
        &mut self,
        call: &AnalysisCall<'_>,
        host: &mut dyn AnalysisHost,
    ) -> RuntimeResult<AnalysisOutput>;
}

/// Run `f`, turning a panic into [`RuntimeError::Panicked`].
pub fn guarded<T>(f: impl FnOnce() -> RuntimeResult<T>) -> RuntimeResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            tracing::error!("Runtime panicked: {}", message);
            Err(RuntimeError::Panicked(message))
        }
    }
}
