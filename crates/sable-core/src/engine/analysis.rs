//! Analysis runner.
//!
//! At most one analysis is current. Its results are cached so that a
//! resubmission with the same id and revision is answered without running
//! it again. While it runs, the runtime calls back into [`EngineHost`] at
//! checkpoints; that is where pause, stop and newer analysis requests are
//! picked up from the channel.
//!
//! Columns owned by an analysis that its latest completed run did not write
//! are removed, whatever happened to the runs in between.

use std::fs;
use std::time::Duration;

use rustc_hash::FxHashSet;
use serde_json::Value;

use super::lifecycle::{ExitReason, Lifecycle};
use super::mailbox::Mailbox;
use super::state::EngineState;
use super::{Control, Engine};
use crate::dataset::{CellValue, ColumnType, Dataset, DatasetHandle, coerce_values};
use crate::error::{Error, Result};
use crate::ipc::protocol::{AnalysisReply, AnalysisRequest, AnalysisStatus, Perform, Reply, Request};
use crate::paths::{FileLocation, SessionDirs};
use crate::runtime::{AnalysisCall, AnalysisHost, AnalysisOutput, Flow, RuntimeError, guarded};

/// The current analysis and its last results.
#[derive(Debug, Clone)]
pub(crate) struct AnalysisContext {
    pub request: AnalysisRequest,
    pub status: AnalysisStatus,
    pub results: Value,
    pub meta: Option<Value>,
}

impl AnalysisContext {
    fn new(request: AnalysisRequest) -> Self {
        Self {
            request,
            status: AnalysisStatus::Waiting,
            results: Value::Null,
            meta: None,
        }
    }

    fn is_same_run(&self, request: &AnalysisRequest) -> bool {
        self.request.id == request.id && self.request.revision == request.revision
    }

    fn reply(&self, error: Option<String>) -> Reply {
        status_reply(&self.request, self.status, self.results.clone(), self.meta.clone(), None, error)
    }
}

fn status_reply(
    request: &AnalysisRequest,
    status: AnalysisStatus,
    results: Value,
    results_meta: Option<Value>,
    progress: Option<u8>,
    error: Option<String>,
) -> Reply {
    Reply::Analysis(AnalysisReply {
        id: request.id,
        revision: request.revision,
        name: request.name.clone(),
        title: request.title.clone(),
        status,
        results,
        results_meta,
        progress,
        error,
    })
}

/// Why a running analysis was told to abort at a checkpoint.
#[derive(Debug)]
enum Interrupt {
    Stop,
    Orphaned,
    ChannelClosed,
    /// `perform: abort` for the running analysis.
    Aborted,
    /// A newer analysis request arrived.
    Superseded(AnalysisRequest),
}

enum Step {
    Done(Control),
    Superseded(AnalysisRequest),
}

impl Engine {
    pub(super) fn run_analysis_request(&mut self, request: AnalysisRequest) -> Result<Control> {
        if request.perform == Perform::Abort {
            self.abort_analysis(&request)?;
            return Ok(Control::Continue);
        }

        if let Some(ctx) = &self.analysis
            && ctx.is_same_run(&request)
            && ctx.status == AnalysisStatus::Complete
        {
            tracing::debug!(
                analysis_id = request.id,
                revision = request.revision,
                "Resending cached analysis results"
            );
            self.mailbox.send(&ctx.reply(None))?;
            return Ok(Control::Continue);
        }

        self.analysis = Some(AnalysisContext::new(request));
        loop {
            match self.run_current_analysis()? {
                Step::Done(control) => return Ok(control),
                Step::Superseded(next) => {
                    self.analysis = Some(AnalysisContext::new(next));
                }
            }
        }
    }

    fn abort_analysis(&mut self, request: &AnalysisRequest) -> Result<()> {
        match &mut self.analysis {
            Some(ctx) if ctx.request.id == request.id && !ctx.status.is_finished() => {
                ctx.status = AnalysisStatus::Aborted;
                tracing::info!(analysis_id = request.id, "Analysis aborted");
                self.mailbox.send(&ctx.reply(None))
            }
            _ => {
                tracing::debug!(analysis_id = request.id, "Abort for an analysis that is not running");
                Ok(())
            }
        }
    }

    fn run_current_analysis(&mut self) -> Result<Step> {
        let Some(ctx) = self.analysis.as_mut() else {
            return Ok(Step::Done(Control::Continue));
        };
        ctx.status = AnalysisStatus::Running;
        let request = ctx.request.clone();
        let analysis_id = request.id;

        tracing::info!(
            analysis_id,
            revision = request.revision,
            name = %request.name,
            "Running analysis"
        );
        self.mailbox.send(&status_reply(
            &request,
            AnalysisStatus::Running,
            Value::Null,
            None,
            Some(0),
            None,
        ))?;

        let state = self.load_state(analysis_id);
        let (result, interrupt, produced) = {
            let mut host = EngineHost {
                dataset: &mut self.dataset,
                mailbox: &mut self.mailbox,
                lifecycle: &mut self.lifecycle,
                dirs: &mut self.dirs,
                poll_interval: self.poll_interval,
                request: &request,
                interrupt: None,
                produced: FxHashSet::default(),
            };
            let call = AnalysisCall {
                request: &request,
                state,
            };
            let runtime = &mut self.runtime;
            let result = guarded(|| runtime.run_analysis(&call, &mut host));
            (result, host.interrupt, host.produced)
        };

        match interrupt {
            Some(Interrupt::Stop) => {
                tracing::info!(analysis_id, "Analysis interrupted by stop");
                self.stop()?;
                return Ok(Step::Done(Control::Exit(ExitReason::Stopped)));
            }
            Some(Interrupt::Orphaned) => {
                tracing::error!(analysis_id, "Parent process is gone during analysis");
                self.set_analysis_status(AnalysisStatus::Aborted);
                return Ok(Step::Done(Control::Exit(ExitReason::Orphaned)));
            }
            Some(Interrupt::ChannelClosed) => return Err(Error::ChannelClosed),
            Some(Interrupt::Aborted) => {
                tracing::info!(analysis_id, "Analysis aborted");
                self.set_analysis_status(AnalysisStatus::Aborted);
                self.send_analysis_reply(None)?;
                return Ok(Step::Done(Control::Continue));
            }
            Some(Interrupt::Superseded(next)) => {
                let status = if next.id == analysis_id {
                    AnalysisStatus::Changed
                } else {
                    AnalysisStatus::Aborted
                };
                tracing::info!(
                    analysis_id,
                    next_id = next.id,
                    next_revision = next.revision,
                    "Analysis superseded, discarding its output"
                );
                self.set_analysis_status(status);
                return Ok(Step::Superseded(next));
            }
            None => {}
        }

        match result {
            Ok(output) => {
                self.remove_stale_columns(analysis_id, &produced);
                self.complete_analysis(output)?;
            }
            Err(RuntimeError::Interrupted) => {
                self.set_analysis_status(AnalysisStatus::Aborted);
                self.send_analysis_reply(None)?;
            }
            Err(e) => {
                let message = self.decode_message(&e.to_string());
                tracing::warn!(analysis_id, error = %message, "Analysis failed");
                self.set_analysis_status(AnalysisStatus::Error);
                self.send_analysis_reply(Some(message))?;
            }
        }

        Ok(Step::Done(Control::Continue))
    }

    fn complete_analysis(&mut self, output: AnalysisOutput) -> Result<()> {
        let Some(ctx) = self.analysis.as_mut() else {
            return Ok(());
        };
        let analysis_id = ctx.request.id;

        if let Some(state) = &output.state
            && let Err(e) = write_json(self.dirs.state_file(analysis_id), state)
        {
            tracing::warn!(analysis_id, error = %e, "Failed to persist analysis state");
        }
        if let Err(e) = write_json(self.dirs.results_file(analysis_id), &output.results) {
            tracing::warn!(analysis_id, error = %e, "Failed to persist analysis results");
        }
        if let Err(e) = self.dirs.remove_non_keep_files(analysis_id, &output.keep) {
            tracing::warn!(analysis_id, error = %e, "Failed to clean analysis files");
        }

        ctx.results = output.results;
        ctx.meta = output.meta;
        ctx.status = AnalysisStatus::Complete;
        tracing::info!(analysis_id, revision = ctx.request.revision, "Analysis complete");
        self.mailbox.send(&ctx.reply(None))
    }

    /// Remove columns owned by `analysis_id` that are not in `produced`.
    fn remove_stale_columns(&mut self, analysis_id: i64, produced: &FxHashSet<String>) {
        let Some(dataset) = self.dataset.cached() else {
            return;
        };
        let stale: Vec<String> = dataset
            .columns()
            .iter()
            .filter(|c| c.analysis_id == Some(analysis_id) && !produced.contains(&c.name))
            .map(|c| c.name.clone())
            .collect();

        for name in stale {
            if let Ok(dataset) = self.dataset.provide() {
                dataset.delete_column(&name);
            }
            if let Err(e) = self.dataset.remove_column(&name) {
                tracing::warn!(analysis_id, column = %name, error = %e, "Failed to remove stale column");
                continue;
            }
            tracing::info!(analysis_id, column = %name, "Removed stale analysis column");
        }
    }

    fn load_state(&self, analysis_id: i64) -> Option<Value> {
        let location = self.dirs.state_file(analysis_id).ok()?;
        let bytes = fs::read(location.absolute()).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(analysis_id, error = %e, "Ignoring unreadable analysis state");
                None
            }
        }
    }

    fn set_analysis_status(&mut self, status: AnalysisStatus) {
        if let Some(ctx) = &mut self.analysis {
            ctx.status = status;
        }
    }

    fn send_analysis_reply(&mut self, error: Option<String>) -> Result<()> {
        match &self.analysis {
            Some(ctx) => self.mailbox.send(&ctx.reply(error)),
            None => Ok(()),
        }
    }
}

fn write_json(location: Result<FileLocation>, value: &Value) -> Result<()> {
    let location = location?;
    fs::write(location.absolute(), serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

/// The engine as seen by a running analysis.
struct EngineHost<'a> {
    dataset: &'a mut DatasetHandle,
    mailbox: &'a mut Mailbox,
    lifecycle: &'a mut Lifecycle,
    dirs: &'a mut SessionDirs,
    poll_interval: Duration,
    request: &'a AnalysisRequest,
    interrupt: Option<Interrupt>,
    /// Analysis columns written during this run.
    produced: FxHashSet<String>,
}

impl EngineHost<'_> {
    /// Send a reply; a broken channel interrupts the analysis.
    fn send(&mut self, reply: &Reply) -> bool {
        match self.mailbox.send(reply) {
            Ok(()) => true,
            Err(e) => {
                self.channel_failed(e);
                false
            }
        }
    }

    fn channel_failed(&mut self, error: Error) {
        if !matches!(error, Error::ChannelClosed) {
            tracing::error!(error = %error, "Channel failed during analysis");
        }
        self.interrupt = Some(Interrupt::ChannelClosed);
    }

    /// React to a request that arrived while the analysis runs.
    fn handle_request(&mut self, request: Request) -> Option<Flow> {
        match request {
            Request::Stop => {
                self.interrupt = Some(Interrupt::Stop);
                Some(Flow::Abort)
            }
            Request::Pause => self.pause(),
            Request::Resume => None,
            Request::ReloadData => {
                tracing::debug!("Reload during analysis, performing it afterwards");
                self.lifecycle.reload_pending = true;
                None
            }
            Request::Analysis(next) => {
                let current = self.request;
                if next.perform == Perform::Abort {
                    if next.id != current.id {
                        tracing::debug!(analysis_id = next.id, "Abort for an analysis that is not running");
                        return None;
                    }
                    self.interrupt = Some(Interrupt::Aborted);
                    return Some(Flow::Abort);
                }
                if next.id == current.id && next.revision == current.revision {
                    tracing::debug!(analysis_id = next.id, "Duplicate analysis request ignored");
                    return None;
                }
                self.interrupt = Some(Interrupt::Superseded(next));
                Some(Flow::Abort)
            }
            other => {
                self.mailbox.defer(other);
                None
            }
        }
    }

    /// Block in the paused state until resume or stop.
    fn pause(&mut self) -> Option<Flow> {
        if let Err(e) = self.lifecycle.transition(EngineState::Paused) {
            tracing::warn!(error = %e, "Cannot pause");
            return None;
        }
        tracing::info!(analysis_id = self.request.id, "Engine paused during analysis");
        if !self.send(&Reply::EnginePaused) {
            return Some(Flow::Abort);
        }

        loop {
            if !self.lifecycle.parent_alive() {
                self.interrupt = Some(Interrupt::Orphaned);
                return Some(Flow::Abort);
            }

            let request = match self.mailbox.receive(self.poll_interval) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    self.channel_failed(e);
                    return Some(Flow::Abort);
                }
            };

            match request {
                Request::Resume => {
                    if let Err(e) = self.lifecycle.transition(EngineState::Running) {
                        tracing::warn!(error = %e, "Cannot resume");
                    }
                    tracing::info!("Engine resumed");
                    // A pending reload waits until the analysis is done.
                    if !self.send(&Reply::EngineResumed {
                        just_reloaded_data: false,
                    }) {
                        return Some(Flow::Abort);
                    }
                    return None;
                }
                Request::Stop => {
                    self.interrupt = Some(Interrupt::Stop);
                    return Some(Flow::Abort);
                }
                Request::Pause => {}
                Request::ReloadData => self.lifecycle.reload_pending = true,
                Request::Settings(_) | Request::LogCfg(_) => self.mailbox.defer(request),
                execution => {
                    if let Err(e) = self.mailbox.reject_paused(&execution) {
                        self.channel_failed(e);
                        return Some(Flow::Abort);
                    }
                }
            }
        }
    }
}

impl AnalysisHost for EngineHost<'_> {
    fn dataset(&mut self) -> Result<&Dataset> {
        self.dataset.provide().map(|dataset| &*dataset)
    }

    fn set_analysis_column(
        &mut self,
        name: &str,
        values: Vec<CellValue>,
        column_type: ColumnType,
    ) -> Result<()> {
        let owner = self.request.id;
        let dataset = self.dataset.provide()?;

        if dataset.column_analysis_id(name) != Some(owner) {
            if dataset.column(name).is_some() {
                return Err(Error::Column(format!(
                    "column '{}' is not owned by analysis {}",
                    name, owner
                )));
            }
            dataset.create_column(name)?;
            if let Some(column) = dataset.column_mut(name) {
                column.analysis_id = Some(owner);
            }
        }

        let values = coerce_values(values, column_type);
        dataset.set_column_data_and_type(name, values, column_type)?;
        tracing::debug!(analysis_id = owner, column = name, "Analysis column updated");
        self.produced.insert(name.to_string());
        self.dataset.store_column(name)
    }

    fn remove_analysis_column(&mut self, name: &str) -> Result<bool> {
        let owner = self.request.id;
        let dataset = self.dataset.provide()?;
        if dataset.column_analysis_id(name) != Some(owner) {
            return Ok(false);
        }
        dataset.delete_column(name);
        self.produced.remove(name);
        self.dataset.remove_column(name)?;
        tracing::debug!(analysis_id = owner, column = name, "Analysis column removed");
        Ok(true)
    }

    fn checkpoint(&mut self, progress: Option<u8>, partial: Option<&Value>) -> Flow {
        if self.interrupt.is_some() {
            return Flow::Abort;
        }

        if progress.is_some() || partial.is_some() {
            let reply = status_reply(
                self.request,
                AnalysisStatus::Running,
                partial.cloned().unwrap_or(Value::Null),
                None,
                progress,
                None,
            );
            if !self.send(&reply) {
                return Flow::Abort;
            }
        }

        if !self.lifecycle.parent_alive() {
            self.interrupt = Some(Interrupt::Orphaned);
            return Flow::Abort;
        }

        loop {
            match self.mailbox.receive(Duration::ZERO) {
                Ok(Some(request)) => {
                    if let Some(flow) = self.handle_request(request) {
                        return flow;
                    }
                }
                Ok(None) => return Flow::Continue,
                Err(e) => {
                    self.channel_failed(e);
                    return Flow::Abort;
                }
            }
        }
    }

    fn temp_file(&mut self, extension: &str) -> Result<FileLocation> {
        self.dirs.temp_file(self.request.id, extension)
    }

    fn specific_file(&mut self, name: &str) -> Result<FileLocation> {
        self.dirs.specific_file(self.request.id, name)
    }
}
