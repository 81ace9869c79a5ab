//! Session directory management.
//!
//! Every engine of one controller session shares a working directory. Files
//! produced for an analysis live below `resources/<analysis id>`:
//!
//! ```text
//! <session>/
//! ├── resources/
//! │   └── 7/               # analysis id
//! │       ├── state.json   # persisted analysis state
//! │       ├── results.json # last complete results
//! │       └── _0_1.csv     # temp file from slave 0
//! └── logs/                # per-engine log files (logCfg)
//! ```
//!
//! Paths are handed out as a (root, relative path) pair so the controller
//! can relocate the resources when it archives a session.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

const RESOURCES_DIR: &str = "resources";
const STATE_FILE: &str = "state.json";
const RESULTS_FILE: &str = "results.json";

/// A file below the session root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLocation {
    /// Session root directory.
    pub root: PathBuf,
    /// Path relative to `root`, always `/`-separated.
    pub relative_path: String,
}

impl FileLocation {
    /// Absolute path of the file.
    pub fn absolute(&self) -> PathBuf {
        self.relative_path
            .split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

/// Directory structure for one engine within a session.
#[derive(Debug, Clone)]
pub struct SessionDirs {
    /// The session working directory.
    pub root: PathBuf,

    /// Directory holding per-engine log files.
    pub log_dir: PathBuf,

    /// Slave index of the owning engine, used to keep temp names disjoint.
    slave_no: u32,

    /// Number of temp files handed out so far.
    temp_counter: u64,
}

impl SessionDirs {
    /// Create the directory structure under `root`.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn new(root: impl AsRef<Path>, slave_no: u32) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let log_dir = root.join("logs");

        fs::create_dir_all(root.join(RESOURCES_DIR))?;
        fs::create_dir_all(&log_dir)?;

        Ok(Self {
            root,
            log_dir,
            slave_no,
            temp_counter: 0,
        })
    }

    /// A fresh temp file for an analysis, with the given extension.
    pub fn temp_file(&mut self, analysis_id: i64, extension: &str) -> Result<FileLocation> {
        self.temp_counter += 1;
        let extension = extension.trim_start_matches('.');
        let name = if extension.is_empty() {
            format!("_{}_{}", self.slave_no, self.temp_counter)
        } else {
            format!("_{}_{}.{}", self.slave_no, self.temp_counter, extension)
        };
        self.specific_file(analysis_id, &name)
    }

    /// The persisted state file of an analysis.
    pub fn state_file(&self, analysis_id: i64) -> Result<FileLocation> {
        self.specific_file(analysis_id, STATE_FILE)
    }

    /// The results file of an analysis.
    pub fn results_file(&self, analysis_id: i64) -> Result<FileLocation> {
        self.specific_file(analysis_id, RESULTS_FILE)
    }

    /// An arbitrarily named file inside the analysis resource directory.
    pub fn specific_file(&self, analysis_id: i64, name: &str) -> Result<FileLocation> {
        let relative_path = format!("{}/{}/{}", RESOURCES_DIR, analysis_id, name);
        let location = FileLocation {
            root: self.root.clone(),
            relative_path,
        };

        if let Some(parent) = location.absolute().parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(location)
    }

    /// Resource directory of an analysis.
    pub fn analysis_dir(&self, analysis_id: i64) -> PathBuf {
        self.root.join(RESOURCES_DIR).join(analysis_id.to_string())
    }

    /// Remove every file of an analysis that is not listed in `keep`.
    ///
    /// `keep` holds relative paths as returned in [`FileLocation`]. The
    /// state and results files are always kept. Returns the number of
    /// removed files.
    pub fn remove_non_keep_files(&self, analysis_id: i64, keep: &[String]) -> Result<usize> {
        let dir = self.analysis_dir(analysis_id);
        if !dir.exists() {
            return Ok(0);
        }

        let prefix = format!("{}/{}/", RESOURCES_DIR, analysis_id);
        let mut removed = 0;

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if name == STATE_FILE || name == RESULTS_FILE {
                continue;
            }

            let relative = format!("{}{}", prefix, name);
            if keep.iter().any(|k| k == &relative || k == &name) {
                continue;
            }

            fs::remove_file(entry.path())?;
            removed += 1;
        }

        if removed > 0 {
            tracing::debug!(analysis_id, removed, "Removed non-kept analysis files");
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_creates_structure() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = SessionDirs::new(temp.path(), 0).expect("Failed to create dirs");

        assert!(dirs.root.join("resources").exists());
        assert!(dirs.log_dir.exists());
    }

    #[test]
    fn test_paths_are_root_relative() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let mut dirs = SessionDirs::new(temp.path(), 2).expect("Failed to create dirs");

        let state = dirs.state_file(7).unwrap();
        assert_eq!(state.root, temp.path());
        assert_eq!(state.relative_path, "resources/7/state.json");

        let results = dirs.results_file(7).unwrap();
        assert_eq!(results.relative_path, "resources/7/results.json");

        let specific = dirs.specific_file(7, "plot.svg").unwrap();
        assert_eq!(specific.relative_path, "resources/7/plot.svg");
        assert!(specific.absolute().parent().unwrap().exists());

        let first = dirs.temp_file(7, "png").unwrap();
        let second = dirs.temp_file(7, ".png").unwrap();
        assert_eq!(first.relative_path, "resources/7/_2_1.png");
        assert_eq!(second.relative_path, "resources/7/_2_2.png");
    }

    #[test]
    fn test_remove_non_keep_files() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let mut dirs = SessionDirs::new(temp.path(), 0).expect("Failed to create dirs");

        let keep = dirs.temp_file(3, "csv").unwrap();
        let drop = dirs.temp_file(3, "csv").unwrap();
        let state = dirs.state_file(3).unwrap();
        for location in [&keep, &drop, &state] {
            fs::write(location.absolute(), "x").unwrap();
        }

        let removed = dirs
            .remove_non_keep_files(3, &[keep.relative_path.clone()])
            .unwrap();

        assert_eq!(removed, 1);
        assert!(keep.absolute().exists());
        assert!(!drop.absolute().exists());
        assert!(state.absolute().exists());
    }
}
