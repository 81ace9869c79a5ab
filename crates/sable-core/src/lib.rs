//! Core of the Sable statistics engine.
//!
//! This crate provides:
//! - The engine state machine and its request runners
//! - The controller protocol and its length-prefixed channel transport
//! - A columnar dataset store with column name encoding
//! - Session file paths for analysis state and results
//! - A built-in expression runtime and analyses

pub mod dataset;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod paths;
pub mod runtime;
pub mod settings;

pub use dataset::{CellValue, Column, ColumnType, DataSource, Dataset, JsonFileSource, MemorySource};
pub use engine::{
    DEFAULT_POLL_INTERVAL, Engine, EngineConfig, EngineState, ExitReason, FixedLogging, Identity,
    LogControl, ParentWatch, ProcessWatch,
};
pub use error::{Error, Result};
pub use ipc::{EngineHandle, EngineOptions, MemoryChannel, Reply, Request, StdioChannel};
pub use paths::{FileLocation, SessionDirs};
pub use runtime::{BuiltinRuntime, CodeRuntime, RuntimeError};
pub use settings::Settings;
