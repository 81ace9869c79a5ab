//! Inbound request queue and outbound replies.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::Result;
use crate::ipc::protocol::{
    AnalysisReply, AnalysisStatus, CodeReply, ComputeColumnReply, FilterErrorReply, ModuleReply,
    Reply, Request,
};
use crate::ipc::Channel;

/// The engine end of the channel plus requests put aside for later.
pub(crate) struct Mailbox {
    channel: Box<dyn Channel>,
    deferred: VecDeque<Request>,
}

impl Mailbox {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            channel,
            deferred: VecDeque::new(),
        }
    }

    /// Next well-formed request from the channel.
    ///
    /// Malformed messages and unknown kinds are logged and skipped.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Request>> {
        let mut timeout = timeout;
        loop {
            let Some(text) = self.channel.receive(timeout)? else {
                return Ok(None);
            };
            match serde_json::from_str::<Request>(&text) {
                Ok(request) => {
                    tracing::trace!(kind = request.kind(), "Received request");
                    return Ok(Some(request));
                }
                Err(e) => {
                    tracing::warn!(error = %e, message = %truncate(&text), "Dropping malformed message");
                    timeout = Duration::ZERO;
                }
            }
        }
    }

    pub fn defer(&mut self, request: Request) {
        tracing::debug!(kind = request.kind(), queued = self.deferred.len() + 1, "Deferred request");
        self.deferred.push_back(request);
    }

    pub fn take_deferred(&mut self) -> Option<Request> {
        self.deferred.pop_front()
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Drop all deferred requests. Returns how many were dropped.
    pub fn drop_deferred(&mut self) -> usize {
        let count = self.deferred.len();
        for request in self.deferred.drain(..) {
            tracing::info!(kind = request.kind(), "Dropping deferred request on stop");
        }
        count
    }

    pub fn send(&mut self, reply: &Reply) -> Result<()> {
        let text = serde_json::to_string(reply)?;
        self.channel.send(&text)
    }

    /// Answer an execution request that arrived while paused.
    pub fn reject_paused(&mut self, request: &Request) -> Result<()> {
        const PAUSED: &str = "engine is paused";

        let reply = match request {
            Request::Filter(filter) => Reply::FilterError(FilterErrorReply {
                request_id: filter.request_id,
                error: PAUSED.to_string(),
            }),
            Request::Code(code) => Reply::Code(CodeReply {
                request_id: code.request_id,
                result: None,
                error: Some(PAUSED.to_string()),
            }),
            Request::ComputeColumn(compute) => Reply::ComputeColumn(ComputeColumnReply {
                column_name: compute.column_name.clone(),
                success: false,
                error: Some(PAUSED.to_string()),
            }),
            Request::ModuleRequest(module) => Reply::ModuleRequest(ModuleReply {
                kind: module.kind.clone(),
                module_name: module.module_name.clone(),
                success: false,
                result: None,
                error: Some(PAUSED.to_string()),
            }),
            Request::Analysis(analysis) => Reply::Analysis(AnalysisReply {
                id: analysis.id,
                revision: analysis.revision,
                name: analysis.name.clone(),
                title: analysis.title.clone(),
                status: AnalysisStatus::Error,
                results: serde_json::Value::Null,
                results_meta: None,
                progress: None,
                error: Some(PAUSED.to_string()),
            }),
            other => {
                tracing::warn!(kind = other.kind(), "Ignoring request while paused");
                return Ok(());
            }
        };

        tracing::debug!(kind = request.kind(), "Rejected request while paused");
        self.send(&reply)
    }
}

fn truncate(text: &str) -> &str {
    const LIMIT: usize = 200;
    match text.char_indices().nth(LIMIT) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}
