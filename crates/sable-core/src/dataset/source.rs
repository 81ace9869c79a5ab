//! Shared dataset sources.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::{Column, Dataset};

/// Where the engine fetches its dataset from.
///
/// The source is shared between the controller and all engines of a
/// session; an engine reloads from it when told the data changed.
pub trait DataSource: Send {
    /// Load the current dataset.
    fn load(&mut self) -> Result<Dataset>;

    /// Write a (computed) column back so other engines see it.
    fn store_column(&mut self, column: &Column) -> Result<()>;

    /// Remove a column from the shared copy.
    fn remove_column(&mut self, name: &str) -> Result<()>;
}

/// Dataset stored as a JSON document on disk.
///
/// ```json
/// { "columns": [ { "name": "x", "type": "scale", "values": [-1, 2, 3] } ] }
/// ```
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    /// Create a source for the JSON file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read(&self) -> Result<Dataset> {
        let bytes = fs::read(&self.path).map_err(|e| {
            Error::Dataset(format!("failed to read '{}': {}", self.path.display(), e))
        })?;
        let dataset: Dataset = serde_json::from_slice(&bytes)?;
        dataset.normalize()
    }

    fn write(&self, dataset: &Dataset) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(dataset)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DataSource for JsonFileSource {
    fn load(&mut self) -> Result<Dataset> {
        self.read()
    }

    fn store_column(&mut self, column: &Column) -> Result<()> {
        let mut dataset = self.read()?;
        match dataset.column_mut(&column.name) {
            Some(existing) => *existing = column.clone(),
            None => {
                let mut columns = dataset.columns().to_vec();
                columns.push(column.clone());
                dataset = Dataset::from_columns(columns)?;
            }
        }
        self.write(&dataset)
    }

    fn remove_column(&mut self, name: &str) -> Result<()> {
        let mut dataset = self.read()?;
        if dataset.delete_column(name) {
            self.write(&dataset)?;
        }
        Ok(())
    }
}

/// In-memory source, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    dataset: Dataset,
    loads: usize,
}

impl MemorySource {
    /// Create a source serving `dataset`.
    pub fn new(dataset: Dataset) -> Self {
        Self { dataset, loads: 0 }
    }

    /// How many times the dataset was loaded.
    pub fn loads(&self) -> usize {
        self.loads
    }
}

impl DataSource for MemorySource {
    fn load(&mut self) -> Result<Dataset> {
        self.loads += 1;
        Ok(self.dataset.clone())
    }

    fn store_column(&mut self, column: &Column) -> Result<()> {
        match self.dataset.column_mut(&column.name) {
            Some(existing) => *existing = column.clone(),
            None => {
                let mut columns = self.dataset.columns().to_vec();
                columns.push(column.clone());
                self.dataset = Dataset::from_columns(columns)?;
            }
        }
        Ok(())
    }

    fn remove_column(&mut self, name: &str) -> Result<()> {
        self.dataset.delete_column(name);
        Ok(())
    }
}
