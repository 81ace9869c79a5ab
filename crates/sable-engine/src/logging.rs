//! Logging setup for the engine process.
//!
//! Stdout carries the IPC channel, so logs go to stderr until a `logCfg`
//! request moves them into a per-engine log file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use sable_core::ipc::protocol::LogConfig;
use sable_core::{Error, LogControl};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

enum Target {
    Stderr,
    File { path: PathBuf, file: File },
}

/// Log output that can be switched between stderr and a file at runtime.
#[derive(Clone)]
pub struct LogWriter {
    target: Arc<Mutex<Target>>,
}

impl LogWriter {
    fn stderr() -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::Stderr)),
        }
    }

    fn set(&self, target: Target) {
        let mut current = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        *current = target;
    }

    fn file_path(&self) -> Option<PathBuf> {
        match &*self.target.lock().unwrap_or_else(PoisonError::into_inner) {
            Target::File { path, .. } => Some(path.clone()),
            Target::Stderr => None,
        }
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.target.lock().unwrap_or_else(PoisonError::into_inner) {
            Target::Stderr => io::stderr().write(buf),
            Target::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.target.lock().unwrap_or_else(PoisonError::into_inner) {
            Target::Stderr => io::stderr().flush(),
            Target::File { file, .. } => file.flush(),
        }
    }
}

/// Default filter directive.
fn default_directive(verbose: bool) -> &'static str {
    if verbose { "info,sable_core=debug,sable_engine=debug" } else { "info" }
}

/// Install the global subscriber and return the control for `logCfg`.
pub fn init(verbose: bool, slave_no: u32) -> ReloadableLogging {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let (filter, handle) = reload::Layer::new(filter);

    let writer = LogWriter::stderr();
    let make_writer = writer.clone();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(move || make_writer.clone())
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    ReloadableLogging {
        filter: handle,
        writer,
        slave_no,
    }
}

/// Applies `logCfg` requests to the global subscriber.
pub struct ReloadableLogging {
    filter: reload::Handle<EnvFilter, Registry>,
    writer: LogWriter,
    slave_no: u32,
}

impl ReloadableLogging {
    fn log_file(&self, dir: &Path) -> PathBuf {
        dir.join(format!("engine-{}.log", self.slave_no))
    }
}

impl LogControl for ReloadableLogging {
    fn apply(&mut self, config: &LogConfig, default_dir: &Path) -> sable_core::Result<()> {
        if let Some(directive) = &config.filter {
            let filter = EnvFilter::try_new(directive)
                .map_err(|e| Error::Config(format!("invalid log filter '{}': {}", directive, e)))?;
            self.filter
                .reload(filter)
                .map_err(|e| Error::Config(format!("failed to reload log filter: {}", e)))?;
        }

        if !config.log_to_file {
            if self.writer.file_path().is_some() {
                self.writer.set(Target::Stderr);
                tracing::info!("Logging to stderr");
            }
            return Ok(());
        }

        let dir = config.log_dir.as_deref().unwrap_or(default_dir);
        let path = self.log_file(dir);
        if self.writer.file_path().as_deref() == Some(path.as_path()) {
            return Ok(());
        }

        fs::create_dir_all(dir)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!(path = %path.display(), "Switching log output to file");
        self.writer.set(Target::File { path, file });
        Ok(())
    }
}
