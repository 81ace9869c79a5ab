//! Columnar dataset store.
//!
//! The engine owns exactly one [`Dataset`] per session. It is fetched lazily
//! from a shared [`DataSource`] through a [`DatasetHandle`] and refreshed
//! when the controller announces new data.
//!
//! Column writes are all-or-nothing: a value vector is validated completely
//! before it replaces the previous one, so no request ever observes a
//! partially written column.

mod column;
mod encoder;
mod source;

pub use column::{CellValue, Column, ColumnType, ComputedInfo, coerce_values, infer_type};
pub use encoder::{ColumnEncoder, encoded_name, encoded_slot, is_encoded_name};
pub use source::{DataSource, JsonFileSource, MemorySource};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Ordered collection of typed columns with a common row count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    columns: Vec<Column>,
    #[serde(default)]
    row_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter: Option<Vec<bool>>,
    /// Next free encoded slot.
    #[serde(skip)]
    next_slot: usize,
}

impl Dataset {
    /// Build a dataset from columns, assigning encoded names where missing.
    ///
    /// # Errors
    /// Fails if columns differ in length or names are duplicated.
    pub fn from_columns(columns: Vec<Column>) -> Result<Self> {
        let row_count = columns.first().map_or(0, |c| c.values.len());
        let mut dataset = Self {
            columns: Vec::with_capacity(columns.len()),
            row_count,
            filter: None,
            next_slot: 0,
        };

        for column in columns {
            dataset.push_column(column)?;
        }

        Ok(dataset)
    }

    /// Re-establish invariants after deserialization.
    pub(crate) fn normalize(self) -> Result<Self> {
        let filter = self.filter.clone();
        let mut dataset = Self::from_columns(self.columns)?;
        if self.row_count > dataset.row_count && dataset.columns.is_empty() {
            dataset.row_count = self.row_count;
        }
        if let Some(filter) = filter {
            dataset.apply_filter(filter)?;
        }
        Ok(dataset)
    }

    fn push_column(&mut self, mut column: Column) -> Result<()> {
        if self.columns.iter().any(|c| c.name == column.name) {
            return Err(Error::Dataset(format!("duplicate column name '{}'", column.name)));
        }
        if column.values.len() != self.row_count {
            return Err(Error::Dataset(format!(
                "column '{}' has {} rows, expected {}",
                column.name,
                column.values.len(),
                self.row_count
            )));
        }

        if column.encoded.is_empty() || self.column_by_encoded(&column.encoded).is_some() {
            column.encoded = self.allocate_encoded();
        } else if let Some(slot) = encoded_slot(&column.encoded) {
            self.next_slot = self.next_slot.max(slot + 1);
        }

        self.columns.push(column);
        Ok(())
    }

    fn allocate_encoded(&mut self) -> String {
        loop {
            let candidate = encoded_name(self.next_slot);
            self.next_slot += 1;
            if self.column_by_encoded(&candidate).is_none() {
                return candidate;
            }
        }
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// All columns in order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Look up a column by user-facing name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a column by encoded identifier.
    pub fn column_by_encoded(&self, encoded: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.encoded == encoded)
    }

    /// Measurement level of a column.
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.column(name).map(|c| c.column_type)
    }

    /// Analysis that created a column, if any.
    pub fn column_analysis_id(&self, name: &str) -> Option<i64> {
        self.column(name).and_then(|c| c.analysis_id)
    }

    /// Name encoder for the current set of columns.
    pub fn encoder(&self) -> ColumnEncoder {
        ColumnEncoder::new(
            self.columns
                .iter()
                .map(|c| (c.name.as_str(), c.encoded.as_str())),
        )
    }

    /// Whether `name` may be used for a new or computed column.
    pub fn is_column_name_ok(&self, name: &str) -> bool {
        !name.is_empty()
            && name.trim() == name
            && !name.chars().any(|c| c.is_control() || c == '`' || c == '"')
            && !is_encoded_name(name)
    }

    /// Create an empty column.
    ///
    /// Returns the encoded name, or `None` if a column with that name exists.
    ///
    /// # Errors
    /// Fails if the name is not acceptable.
    pub fn create_column(&mut self, name: &str) -> Result<Option<String>> {
        if !self.is_column_name_ok(name) {
            return Err(Error::Column(format!("'{}' is not a valid column name", name)));
        }
        if self.column(name).is_some() {
            return Ok(None);
        }

        let mut column = Column::new(
            name,
            ColumnType::Unknown,
            vec![CellValue::Missing; self.row_count],
        );
        column.encoded = self.allocate_encoded();
        let encoded = column.encoded.clone();
        self.columns.push(column);

        tracing::debug!(column = name, encoded = %encoded, "Created column");
        Ok(Some(encoded))
    }

    /// Remove a column. Returns whether it existed.
    pub fn delete_column(&mut self, name: &str) -> bool {
        let before = self.columns.len();
        self.columns.retain(|c| c.name != name);
        before != self.columns.len()
    }

    /// Replace the values and type of a column in one step.
    ///
    /// Returns `true` if anything changed.
    ///
    /// # Errors
    /// Fails without touching the column if it does not exist or the value
    /// count does not match the row count.
    pub fn set_column_data_and_type(
        &mut self,
        name: &str,
        values: Vec<CellValue>,
        column_type: ColumnType,
    ) -> Result<bool> {
        if values.len() != self.row_count {
            return Err(Error::Column(format!(
                "'{}' needs {} values but got {}",
                name,
                self.row_count,
                values.len()
            )));
        }

        let column = self
            .column_mut(name)
            .ok_or_else(|| Error::Column(format!("column '{}' does not exist", name)))?;

        let changed = column.values != values || column.column_type != column_type;
        column.values = values;
        column.column_type = column_type;
        Ok(changed)
    }

    /// Mutable access to a column by user-facing name.
    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Install a row filter.
    ///
    /// # Errors
    /// Fails without changing the current filter if the length is wrong.
    pub fn apply_filter(&mut self, filter: Vec<bool>) -> Result<()> {
        if filter.len() != self.row_count {
            return Err(Error::Dataset(format!(
                "filter has {} rows, dataset has {}",
                filter.len(),
                self.row_count
            )));
        }
        self.filter = if filter.iter().all(|keep| *keep) {
            None
        } else {
            Some(filter)
        };
        Ok(())
    }

    /// The active filter, if any rows are excluded.
    pub fn filter(&self) -> Option<&[bool]> {
        self.filter.as_deref()
    }

    /// Indices of rows that pass the active filter.
    pub fn filtered_rows(&self) -> Vec<usize> {
        match &self.filter {
            Some(filter) => filter
                .iter()
                .enumerate()
                .filter_map(|(i, keep)| keep.then_some(i))
                .collect(),
            None => (0..self.row_count).collect(),
        }
    }
}

/// Lazily provided dataset backed by a shared source.
pub struct DatasetHandle {
    source: Box<dyn DataSource>,
    cached: Option<Dataset>,
}

impl DatasetHandle {
    /// Create a handle; nothing is loaded until the first `provide`.
    pub fn new(source: Box<dyn DataSource>) -> Self {
        Self { source, cached: None }
    }

    /// Current dataset, loading it from the source if needed.
    pub fn provide(&mut self) -> Result<&mut Dataset> {
        if self.cached.is_none() {
            let dataset = self.source.load()?;
            tracing::debug!(
                rows = dataset.row_count(),
                columns = dataset.columns().len(),
                "Loaded dataset"
            );
            self.cached = Some(dataset);
        }

        self.cached
            .as_mut()
            .ok_or_else(|| Error::Dataset("dataset unavailable".to_string()))
    }

    /// Forget the cached copy; the next `provide` reloads.
    pub fn mark_stale(&mut self) {
        self.cached = None;
    }

    /// Reload right away.
    pub fn refresh(&mut self) -> Result<&mut Dataset> {
        self.mark_stale();
        self.provide()
    }

    /// The cached dataset without loading.
    pub fn cached(&self) -> Option<&Dataset> {
        self.cached.as_ref()
    }

    /// Persist a column of the cached dataset back to the source.
    pub fn store_column(&mut self, name: &str) -> Result<()> {
        let column = self
            .cached
            .as_ref()
            .and_then(|d| d.column(name))
            .ok_or_else(|| Error::Column(format!("column '{}' does not exist", name)))?;
        self.source.store_column(column)
    }

    /// Remove a column from the source.
    pub fn remove_column(&mut self, name: &str) -> Result<()> {
        self.source.remove_column(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        Dataset::from_columns(vec![
            Column::scale("x", &[-1.0, 2.0, 3.0]),
            Column::nominal("group", &["a", "b", "a"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_encoded_names_are_unique() {
        let dataset = sample();
        assert_eq!(dataset.column("x").unwrap().encoded, "col0_enc");
        assert_eq!(dataset.column("group").unwrap().encoded, "col1_enc");
        assert_eq!(dataset.column_by_encoded("col1_enc").unwrap().name, "group");
    }

    #[test]
    fn test_rejects_ragged_columns() {
        let result = Dataset::from_columns(vec![
            Column::scale("x", &[1.0, 2.0]),
            Column::scale("y", &[1.0]),
        ]);
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_create_column() {
        let mut dataset = sample();
        let encoded = dataset.create_column("z").unwrap();
        assert_eq!(encoded.as_deref(), Some("col2_enc"));
        assert_eq!(dataset.create_column("z").unwrap(), None);
        assert!(dataset.create_column("col9_enc").is_err());
        assert!(dataset.create_column("").is_err());
        assert_eq!(dataset.column("z").unwrap().values.len(), 3);
    }

    #[test]
    fn test_set_column_data_is_all_or_nothing() {
        let mut dataset = sample();
        let before = dataset.column("x").unwrap().clone();

        let result = dataset.set_column_data_and_type("x", vec![CellValue::Number(1.0)], ColumnType::Scale);
        assert!(result.is_err());
        assert_eq!(dataset.column("x").unwrap(), &before);

        let changed = dataset
            .set_column_data_and_type(
                "x",
                vec![CellValue::Number(1.0); 3],
                ColumnType::Scale,
            )
            .unwrap();
        assert!(changed);
    }

    #[test]
    fn test_filter() {
        let mut dataset = sample();
        assert!(dataset.apply_filter(vec![true]).is_err());
        dataset.apply_filter(vec![false, true, true]).unwrap();
        assert_eq!(dataset.filtered_rows(), vec![1, 2]);
        dataset.apply_filter(vec![true; 3]).unwrap();
        assert!(dataset.filter().is_none());
    }

    #[test]
    fn test_handle_is_lazy() {
        let mut handle = DatasetHandle::new(Box::new(MemorySource::new(sample())));
        assert!(handle.cached().is_none());
        assert_eq!(handle.provide().unwrap().row_count(), 3);
        assert!(handle.cached().is_some());
        handle.mark_stale();
        assert!(handle.cached().is_none());
    }
}
