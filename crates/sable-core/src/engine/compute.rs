//! Compute-column runner.

use super::Engine;
use crate::dataset::{CellValue, ColumnType, ComputedInfo, coerce_values, infer_type};
use crate::error::Result;
use crate::ipc::protocol::{ComputeColumnReply, ComputeColumnRequest, Reply};
use crate::runtime::guarded;

impl Engine {
    /// Compute a column from code and commit it in one step.
    ///
    /// On failure the column keeps its previous values and carries the
    /// error in its computed info.
    pub(super) fn run_compute_column(&mut self, request: ComputeColumnRequest) -> Result<()> {
        let name = request.column_name.clone();

        let reply = match self.compute_column(&request) {
            Ok(column_type) => {
                tracing::debug!(column = %name, %column_type, "Computed column");
                if let Err(e) = self.dataset.store_column(&name) {
                    tracing::warn!(column = %name, error = %e, "Failed to store computed column");
                }
                ComputeColumnReply {
                    column_name: name,
                    success: true,
                    error: None,
                }
            }
            Err(error) => {
                tracing::debug!(column = %name, %error, "Column computation failed");
                self.mark_compute_error(&request, &error);
                ComputeColumnReply {
                    column_name: name,
                    success: false,
                    error: Some(error),
                }
            }
        };

        self.mailbox.send(&Reply::ComputeColumn(reply))
    }

    fn compute_column(
        &mut self,
        request: &ComputeColumnRequest,
    ) -> std::result::Result<ColumnType, String> {
        let dataset = self.dataset.provide().map_err(|e| e.to_string())?;
        let name = request.column_name.as_str();

        if !dataset.is_column_name_ok(name) {
            return Err(format!("'{}' is not a valid column name", name));
        }
        if dataset.column_analysis_id(name).is_some() {
            return Err(format!("column '{}' belongs to an analysis", name));
        }
        if let Some(encoded) = dataset.create_column(name).map_err(|e| e.to_string())? {
            tracing::debug!(column = name, %encoded, "New computed column");
        }

        let encoder = dataset.encoder();
        let encoded = encoder.encode_all(&request.code);
        let runtime = &mut self.runtime;
        let values = guarded(|| runtime.compute_column(&encoded, dataset))
            .map_err(|e| encoder.decode_all(&e.to_string()))?;

        if values.len() != dataset.row_count() {
            return Err(format!(
                "code returned {} values but the data has {} rows",
                values.len(),
                dataset.row_count()
            ));
        }

        let column_type = resolve_type(request.column_type, &values, request.force_type);
        let values = coerce_values(values, column_type);
        dataset
            .set_column_data_and_type(name, values, column_type)
            .map_err(|e| e.to_string())?;

        let column = dataset
            .column_mut(name)
            .ok_or_else(|| format!("column '{}' does not exist", name))?;
        column.computed = Some(ComputedInfo {
            code: request.code.clone(),
            error: None,
        });
        Ok(column_type)
    }

    fn mark_compute_error(&mut self, request: &ComputeColumnRequest, error: &str) {
        let Some(column) = self
            .dataset
            .provide()
            .ok()
            .and_then(|dataset| dataset.column_mut(&request.column_name))
        else {
            return;
        };
        if column.analysis_id.is_some() {
            return;
        }

        column.computed = Some(ComputedInfo {
            code: request.code.clone(),
            error: Some(error.to_string()),
        });
    }
}

/// Pick the stored type of computed values.
///
/// A forced type always wins. Otherwise the inferred type is used when the
/// declared one is unknown, and text values downgrade a declared scale type
/// to nominal.
fn resolve_type(declared: ColumnType, values: &[CellValue], force: bool) -> ColumnType {
    let inferred = infer_type(values);
    if force && declared != ColumnType::Unknown {
        return declared;
    }
    match (declared, inferred) {
        (ColumnType::Unknown, inferred) => inferred,
        (declared, ColumnType::Unknown) => declared,
        (ColumnType::Scale, ColumnType::Nominal) => ColumnType::Nominal,
        (declared, _) => declared,
    }
}
