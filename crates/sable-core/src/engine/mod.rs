//! The engine: a single-threaded request loop over one channel.
//!
//! An [`Engine`] owns its dataset, its runtime and its channel. The receive
//! loop polls the channel with a bounded timeout, checks the parent process
//! on every tick and hands each request to the runner for its kind. Runners
//! run to completion; analyses are the only long-running work and observe
//! pause, stop and newer analysis requests at their checkpoints.
//!
//! # Reload policy
//!
//! - idle: the dataset is reloaded immediately
//! - paused: the reload is performed on resume
//! - running: the reload is performed after the analysis finishes

mod analysis;
mod code;
mod compute;
mod filter;
mod lifecycle;
mod mailbox;
mod state;

pub use lifecycle::{ExitReason, Identity, ParentWatch, ProcessWatch, process_alive};
pub use state::EngineState;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dataset::{DataSource, Dataset, DatasetHandle};
use crate::error::{Error, Result};
use crate::ipc::Channel;
use crate::ipc::protocol::{AnalysisStatus, LogConfig, Reply, Request};
use crate::paths::SessionDirs;
use crate::runtime::{CodeRuntime, guarded};
use crate::settings::{Settings, SettingsUpdate};

use analysis::AnalysisContext;
use lifecycle::Lifecycle;
use mailbox::Mailbox;

/// Default receive-loop poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Startup configuration of an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub slave_no: u32,
    /// Parent process to watch; `None` disables the watchdog.
    pub parent_pid: Option<u32>,
    pub session_dir: PathBuf,
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slave_no: 0,
            parent_pid: None,
            session_dir: std::env::temp_dir().join("sable-session"),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Applies `logCfg` requests to the process logging setup.
pub trait LogControl: Send {
    /// Reconfigure logging. `default_dir` is the session log directory.
    fn apply(&mut self, config: &LogConfig, default_dir: &Path) -> Result<()>;
}

/// Log control that keeps the logging setup as it is.
#[derive(Debug, Default)]
pub struct FixedLogging;

impl LogControl for FixedLogging {
    fn apply(&mut self, config: &LogConfig, _default_dir: &Path) -> Result<()> {
        tracing::debug!(?config, "Logging is not reconfigurable, ignoring logCfg");
        Ok(())
    }
}

/// What the loop does after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Continue,
    Exit(ExitReason),
}

/// A statistics engine serving one controller.
pub struct Engine {
    lifecycle: Lifecycle,
    mailbox: Mailbox,
    dataset: DatasetHandle,
    runtime: Box<dyn CodeRuntime>,
    settings: Settings,
    dirs: SessionDirs,
    analysis: Option<AnalysisContext>,
    log_control: Box<dyn LogControl>,
    poll_interval: Duration,
}

impl Engine {
    /// Create an engine. The session directory is created if needed.
    pub fn new(
        config: EngineConfig,
        channel: Box<dyn Channel>,
        source: Box<dyn DataSource>,
        runtime: Box<dyn CodeRuntime>,
    ) -> Result<Self> {
        let dirs = SessionDirs::new(&config.session_dir, config.slave_no)?;

        Ok(Self {
            lifecycle: Lifecycle::new(Identity {
                slave_no: config.slave_no,
                parent_pid: config.parent_pid,
            }),
            mailbox: Mailbox::new(channel),
            dataset: DatasetHandle::new(source),
            runtime,
            settings: Settings::default(),
            dirs,
            analysis: None,
            log_control: Box::new(FixedLogging),
            poll_interval: config.poll_interval,
        })
    }

    /// Use `log_control` for `logCfg` requests.
    pub fn with_log_control(mut self, log_control: Box<dyn LogControl>) -> Self {
        self.log_control = log_control;
        self
    }

    /// Watch `watch` instead of the configured parent pid.
    pub fn with_parent_watch(mut self, watch: Box<dyn ProcessWatch>) -> Self {
        self.lifecycle.set_watch(watch);
        self
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.state()
    }

    pub fn identity(&self) -> Identity {
        self.lifecycle.identity()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The dataset, if it has been loaded.
    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.cached()
    }

    /// Id, revision and status of the current analysis.
    pub fn analysis_status(&self) -> Option<(i64, i64, AnalysisStatus)> {
        self.analysis
            .as_ref()
            .map(|ctx| (ctx.request.id, ctx.request.revision, ctx.status))
    }

    /// Absorb input that is already waiting, then become idle.
    ///
    /// Settings and logging options are applied right away; anything else
    /// is deferred until the engine is idle.
    pub fn initialize(&mut self) -> Result<()> {
        while let Some(request) = self.mailbox.receive(Duration::ZERO)? {
            match request {
                Request::Settings(update) => {
                    self.settings.absorb(&update);
                }
                Request::LogCfg(config) => self.configure_logging(&config),
                other => self.mailbox.defer(other),
            }
        }

        let settings = self.settings.clone();
        let runtime = &mut self.runtime;
        if let Err(e) = guarded(|| {
            runtime.apply_settings(&settings);
            Ok(())
        }) {
            tracing::error!("Failed to apply initial settings: {}", e);
        }

        self.lifecycle.transition(EngineState::Idle)?;
        let identity = self.lifecycle.identity();
        tracing::info!(
            slave = identity.slave_no,
            parent_pid = ?identity.parent_pid,
            session = %self.dirs.root.display(),
            "Engine initialized"
        );
        Ok(())
    }

    /// Run the receive loop until the engine stops.
    pub fn run(&mut self) -> ExitReason {
        if self.state() == EngineState::Initializing
            && let Err(e) = self.initialize()
        {
            return self.exit_on_error(e);
        }

        loop {
            if !self.lifecycle.parent_alive() {
                tracing::error!("Parent process is gone, stopping");
                self.lifecycle.force_stop();
                return ExitReason::Orphaned;
            }

            let next = if self.state() == EngineState::Idle && self.mailbox.has_deferred() {
                Ok(self.mailbox.take_deferred())
            } else {
                self.mailbox.receive(self.poll_interval)
            };

            let request = match next {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => return self.exit_on_error(e),
            };

            match self.dispatch(request) {
                Ok(Control::Continue) => {}
                Ok(Control::Exit(reason)) => {
                    self.lifecycle.force_stop();
                    return reason;
                }
                Err(e) => return self.exit_on_error(e),
            }
        }
    }

    fn exit_on_error(&mut self, error: Error) -> ExitReason {
        self.lifecycle.force_stop();
        match error {
            Error::ChannelClosed => {
                tracing::warn!("Controller closed the channel, stopping");
                ExitReason::ChannelClosed
            }
            other => {
                tracing::error!(error = %other, "Fatal engine error");
                ExitReason::Fatal
            }
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<Control> {
        match self.state() {
            EngineState::Idle => self.dispatch_idle(request),
            EngineState::Paused => self.dispatch_paused(request),
            state => {
                tracing::warn!(%state, kind = request.kind(), "Request outside the receive loop states");
                Ok(Control::Continue)
            }
        }
    }

    fn dispatch_idle(&mut self, request: Request) -> Result<Control> {
        match request {
            Request::Stop => {
                self.stop()?;
                Ok(Control::Exit(ExitReason::Stopped))
            }
            Request::Pause => {
                self.pause()?;
                Ok(Control::Continue)
            }
            Request::Resume => {
                tracing::debug!("Resume while idle, nothing to do");
                Ok(Control::Continue)
            }
            Request::Settings(update) => {
                self.absorb_settings(&update);
                Ok(Control::Continue)
            }
            Request::LogCfg(config) => {
                self.configure_logging(&config);
                Ok(Control::Continue)
            }
            Request::ReloadData => {
                self.reload_data()?;
                Ok(Control::Continue)
            }
            execution => self.execute(execution),
        }
    }

    fn dispatch_paused(&mut self, request: Request) -> Result<Control> {
        match request {
            Request::Stop => {
                self.stop()?;
                Ok(Control::Exit(ExitReason::Stopped))
            }
            Request::Resume => {
                self.resume()?;
                Ok(Control::Continue)
            }
            Request::Pause => Ok(Control::Continue),
            Request::ReloadData => {
                tracing::debug!("Reload while paused, performing it on resume");
                self.lifecycle.reload_pending = true;
                Ok(Control::Continue)
            }
            Request::Settings(_) | Request::LogCfg(_) => {
                self.mailbox.defer(request);
                Ok(Control::Continue)
            }
            execution => {
                self.mailbox.reject_paused(&execution)?;
                Ok(Control::Continue)
            }
        }
    }

    /// Run one execution request: idle → running → idle.
    fn execute(&mut self, request: Request) -> Result<Control> {
        self.lifecycle.transition(EngineState::Running)?;

        let control = match request {
            Request::Analysis(analysis) => self.run_analysis_request(analysis)?,
            Request::Filter(filter) => {
                self.run_filter(filter)?;
                Control::Continue
            }
            Request::ComputeColumn(compute) => {
                self.run_compute_column(compute)?;
                Control::Continue
            }
            Request::Code(code) => {
                self.run_code(code)?;
                Control::Continue
            }
            Request::CodeCommander(commander) => {
                self.run_commander(commander);
                Control::Continue
            }
            Request::ModuleRequest(module) => {
                self.run_module_request(module)?;
                Control::Continue
            }
            other => {
                tracing::warn!(kind = other.kind(), "Not an execution request");
                Control::Continue
            }
        };

        if let Control::Exit(_) = control {
            return Ok(control);
        }

        self.lifecycle.transition(EngineState::Idle)?;
        if self.lifecycle.reload_pending {
            self.reload_data()?;
        }
        Ok(control)
    }

    fn pause(&mut self) -> Result<()> {
        self.lifecycle.transition(EngineState::Paused)?;
        tracing::info!("Engine paused");
        self.mailbox.send(&Reply::EnginePaused)
    }

    /// Leave the paused state, performing a reload that arrived meanwhile.
    fn resume(&mut self) -> Result<()> {
        let mut reloaded = false;
        if self.lifecycle.reload_pending {
            self.mailbox.send(&Reply::EngineLoadingData)?;
            reloaded = self.refresh_dataset();
        }

        self.lifecycle.transition(EngineState::Idle)?;
        tracing::info!(reloaded, "Engine resumed");
        self.mailbox.send(&Reply::EngineResumed {
            just_reloaded_data: reloaded,
        })
    }

    fn reload_data(&mut self) -> Result<()> {
        self.mailbox.send(&Reply::EngineLoadingData)?;
        let reloaded = self.refresh_dataset();
        self.mailbox.send(&Reply::EngineResumed {
            just_reloaded_data: reloaded,
        })
    }

    /// Reload the dataset; on failure it is reloaded lazily on next use.
    fn refresh_dataset(&mut self) -> bool {
        self.lifecycle.reload_pending = false;
        match self.dataset.refresh() {
            Ok(dataset) => {
                tracing::info!(
                    rows = dataset.row_count(),
                    columns = dataset.columns().len(),
                    "Dataset reloaded"
                );
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload dataset");
                self.dataset.mark_stale();
                false
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        let dropped = self.mailbox.drop_deferred();
        if let Some(ctx) = &mut self.analysis
            && !ctx.status.is_finished()
        {
            ctx.status = AnalysisStatus::Aborted;
        }

        self.lifecycle.transition(EngineState::Stopped)?;
        tracing::info!(dropped, "Engine stopped");

        match self.mailbox.send(&Reply::EngineStopped) {
            Err(Error::ChannelClosed) => {
                tracing::debug!("Controller gone before engineStopped");
                Ok(())
            }
            other => other,
        }
    }

    fn absorb_settings(&mut self, update: &SettingsUpdate) {
        if !self.settings.absorb(update) {
            return;
        }
        tracing::debug!(settings = ?self.settings, "Settings updated");

        let settings = &self.settings;
        let runtime = &mut self.runtime;
        if let Err(e) = guarded(|| {
            runtime.apply_settings(settings);
            Ok(())
        }) {
            tracing::error!("Runtime rejected settings: {}", e);
        }
    }

    /// Replace encoded column names in a runtime message with user names.
    fn decode_message(&self, message: &str) -> String {
        match self.dataset.cached() {
            Some(dataset) => dataset.encoder().decode_all(message),
            None => message.to_string(),
        }
    }

    fn configure_logging(&mut self, config: &LogConfig) {
        if let Err(e) = self.log_control.apply(config, &self.dirs.log_dir) {
            tracing::warn!(error = %e, "Failed to apply logCfg");
        }
    }
}
