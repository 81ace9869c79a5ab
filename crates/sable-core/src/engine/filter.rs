//! Filter runner.

use super::Engine;
use crate::error::Result;
use crate::ipc::protocol::{FilterErrorReply, FilterReply, FilterRequest, Reply};
use crate::runtime::guarded;

impl Engine {
    /// Evaluate a filter and install it, or report why it failed.
    ///
    /// The dataset's filter only changes when the whole inclusion vector
    /// was computed.
    pub(super) fn run_filter(&mut self, request: FilterRequest) -> Result<()> {
        let request_id = request.request_id;

        let reply = match self.evaluate_filter(&request.generated_filter) {
            Ok(result) => {
                let included = result.iter().filter(|keep| **keep).count();
                tracing::debug!(request_id, rows = result.len(), included, "Filter applied");
                Reply::Filter(FilterReply { request_id, result })
            }
            Err(error) => {
                tracing::debug!(request_id, filter = %request.filter, %error, "Filter failed");
                Reply::FilterError(FilterErrorReply { request_id, error })
            }
        };

        self.mailbox.send(&reply)
    }

    fn evaluate_filter(&mut self, code: &str) -> std::result::Result<Vec<bool>, String> {
        let dataset = self.dataset.provide().map_err(|e| e.to_string())?;

        if code.trim().is_empty() {
            let result = vec![true; dataset.row_count()];
            dataset.apply_filter(result.clone()).map_err(|e| e.to_string())?;
            return Ok(result);
        }

        let encoder = dataset.encoder();
        let encoded = encoder.encode_all(code);
        let runtime = &mut self.runtime;
        let result = guarded(|| runtime.evaluate_filter(&encoded, dataset))
            .map_err(|e| encoder.decode_all(&e.to_string()))?;

        if result.len() != dataset.row_count() {
            return Err(format!(
                "filter returned {} values but the data has {} rows",
                result.len(),
                dataset.row_count()
            ));
        }

        dataset.apply_filter(result.clone()).map_err(|e| e.to_string())?;
        Ok(result)
    }
}
