//! Error types for sable-core.

use thiserror::Error;

use crate::engine::EngineState;

/// Result type for sable-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sable-core.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IPC communication error with the controller.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The peer end of the channel is gone.
    #[error("channel closed")]
    ChannelClosed,

    /// Dataset could not be provided or updated.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Column name or column operation is invalid.
    #[error("column error: {0}")]
    Column(String),

    /// The code execution runtime reported a failure.
    #[error(transparent)]
    Runtime(#[from] crate::runtime::RuntimeError),

    /// A lifecycle transition not allowed by the state table.
    #[error("illegal engine transition from {from} to {to}")]
    IllegalTransition { from: EngineState, to: EngineState },

    /// Invalid engine or logging configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
