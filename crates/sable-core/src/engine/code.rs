//! Free-form code, commander code and module requests.

use super::Engine;
use crate::error::Result;
use crate::ipc::protocol::{CodeReply, CodeRequest, CommanderRequest, ModuleReply, ModuleRequest, Reply};
use crate::runtime::guarded;

impl Engine {
    /// Run code for the controller and reply with its printed result.
    pub(super) fn run_code(&mut self, request: CodeRequest) -> Result<()> {
        let request_id = request.request_id;

        let (result, error) = match self.evaluate_code(&request) {
            Ok(output) => (Some(output), None),
            Err(error) => {
                tracing::debug!(request_id, %error, "Code failed");
                (None, Some(error))
            }
        };

        self.mailbox.send(&Reply::Code(CodeReply {
            request_id,
            result,
            error,
        }))
    }

    fn evaluate_code(&mut self, request: &CodeRequest) -> std::result::Result<String, String> {
        let dataset = self.dataset.provide().map_err(|e| e.to_string())?;
        let encoder = dataset.encoder();
        let encoded = encoder.encode_all(&request.code);

        let runtime = &mut self.runtime;
        let dataset = &*dataset;
        guarded(|| runtime.run_code(&encoded, dataset, request.whitelisted))
            .map(|output| encoder.decode_all(&output))
            .map_err(|e| encoder.decode_all(&e.to_string()))
    }

    /// Run administrative code. Nothing is sent back.
    pub(super) fn run_commander(&mut self, request: CommanderRequest) {
        let runtime = &mut self.runtime;
        match guarded(|| runtime.run_commander(&request.code)) {
            Ok(()) => tracing::debug!("Commander code done"),
            Err(e) => tracing::error!(error = %e, "Commander code failed"),
        }
    }

    /// Load, unload or install a module.
    pub(super) fn run_module_request(&mut self, request: ModuleRequest) -> Result<()> {
        let runtime = &mut self.runtime;
        let outcome = guarded(|| runtime.module_request(&request));

        let reply = match outcome {
            Ok(result) => {
                tracing::info!(kind = %request.kind, module = %request.module_name, "Module request done");
                ModuleReply {
                    kind: request.kind,
                    module_name: request.module_name,
                    success: true,
                    result: Some(result),
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(kind = %request.kind, module = %request.module_name, error = %e, "Module request failed");
                ModuleReply {
                    kind: request.kind,
                    module_name: request.module_name,
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                }
            }
        };

        self.mailbox.send(&Reply::ModuleRequest(reply))
    }
}
