//! Inter-process communication between a controller and its engines.
//!
//! This module provides the wire protocol, the transports the engine reads
//! requests from, and the controller-side process handle.

mod channel;
mod handle;
pub mod protocol;

pub use channel::{Channel, MemoryChannel, StdioChannel, receive_json, send_json};
pub use handle::{EngineHandle, EngineOptions};
pub use protocol::{AnalysisStatus, Reply, Request, read_message, write_message};
