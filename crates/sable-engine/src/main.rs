//! Sable engine - statistics worker process.
//!
//! Reads length-prefixed JSON requests from stdin and writes replies to
//! stdout. Logs go to stderr. The exit code tells the controller why the
//! engine stopped.

mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sable_core::dataset::{DataSource, Dataset, JsonFileSource, MemorySource};
use sable_core::{BuiltinRuntime, DEFAULT_POLL_INTERVAL, Engine, EngineConfig, StdioChannel};

#[derive(Parser)]
#[command(name = "sable-engine")]
#[command(about = "Statistics engine driven by a controller over stdio")]
#[command(version)]
struct Cli {
    /// Slave index assigned by the controller
    #[arg(long, default_value = "0")]
    slave: u32,

    /// Process to watch; the engine exits when it is gone
    #[arg(long)]
    parent_pid: Option<u32>,

    /// Session working directory (default: <tmp>/sable-session-<parent-pid>)
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// JSON dataset file shared with the controller
    #[arg(long)]
    data: Option<PathBuf>,

    /// Receive loop poll interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let session_dir = self.session_dir.clone().unwrap_or_else(|| {
            let owner = self.parent_pid.unwrap_or_else(std::process::id);
            std::env::temp_dir().join(format!("sable-session-{}", owner))
        });

        EngineConfig {
            slave_no: self.slave,
            parent_pid: self.parent_pid,
            session_dir,
            poll_interval: self
                .poll_ms
                .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis),
        }
    }

    fn data_source(&self) -> Box<dyn DataSource> {
        match &self.data {
            Some(path) => Box::new(JsonFileSource::new(path)),
            None => Box::new(MemorySource::new(Dataset::default())),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_control = logging::init(cli.verbose, cli.slave);

    let config = cli.engine_config();
    tracing::info!(
        slave = config.slave_no,
        parent_pid = ?config.parent_pid,
        data = ?cli.data,
        "Starting engine"
    );

    let mut engine = Engine::new(
        config,
        Box::new(StdioChannel::from_stdio()),
        cli.data_source(),
        Box::new(BuiltinRuntime::new()),
    )
    .context("Failed to create engine")?
    .with_log_control(Box::new(log_control));

    let reason = engine.run();
    tracing::info!(?reason, code = reason.exit_code(), "Engine exiting");
    std::process::exit(reason.exit_code());
}
