//! The runtime shipped with the engine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;

use rustc_hash::FxHashSet;
use serde_json::{Value, json};

use crate::dataset::{CellValue, ColumnType, Dataset};
use crate::ipc::protocol::ModuleRequest;
use crate::settings::Settings;

use super::eval::{Evaluator, aggregate};
use super::expr::parse;
use super::{AnalysisCall, AnalysisHost, AnalysisOutput, CodeRuntime, Flow, RuntimeError, RuntimeResult};

const STANDARDIZED_PREFIX: &str = "Z_";

fn host_error(e: crate::Error) -> RuntimeError {
    RuntimeError::Evaluation(e.to_string())
}

/// Expression language and built-in analyses.
#[derive(Debug, Default)]
pub struct BuiltinRuntime {
    settings: Settings,
    options: BTreeMap<String, String>,
    modules: FxHashSet<String>,
}

impl BuiltinRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value set by `set_option`.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// Whether a module is loaded.
    pub fn is_module_loaded(&self, name: &str) -> bool {
        self.modules.contains(name)
    }

    fn evaluate(
        &mut self,
        code: &str,
        dataset: Option<&Dataset>,
        whitelisted: bool,
    ) -> RuntimeResult<super::Vector> {
        let expr = parse(code)?;
        let mut evaluator = Evaluator::new(dataset, whitelisted);
        let value = evaluator.eval(&expr)?;
        for (key, value) in evaluator.option_writes {
            tracing::debug!(option = %key, value = %value, "Runtime option set");
            self.options.insert(key, value);
        }
        Ok(value)
    }

    fn descriptives(
        &self,
        call: &AnalysisCall<'_>,
        host: &mut dyn AnalysisHost,
    ) -> RuntimeResult<AnalysisOutput> {
        let options = &call.request.options;
        let variables: Vec<String> = options
            .get("variables")
            .and_then(Value::as_array)
            .map(|vars| {
                vars.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let standardize = options
            .get("standardizedColumns")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut table = Vec::with_capacity(variables.len());
        let mut standardized = Vec::new();

        for (i, variable) in variables.iter().enumerate() {
            let progress = u8::try_from(i * 100 / variables.len()).unwrap_or(100);
            let partial = json!({ "descriptives": table });
            if host.checkpoint(Some(progress), Some(&partial)) == Flow::Abort {
                return Err(RuntimeError::Interrupted);
            }

            let (row, z_values) = {
                let dataset = host.dataset().map_err(host_error)?;
                describe_variable(dataset, variable, standardize)?
            };
            table.push(row);

            if let Some(values) = z_values {
                let name = format!("{}{}", STANDARDIZED_PREFIX, variable);
                host.set_analysis_column(&name, values, ColumnType::Scale)
                    .map_err(host_error)?;
                standardized.push(name);
            }
        }

        let previous: BTreeSet<String> = call
            .state
            .as_ref()
            .and_then(|s| s.get("standardizedColumns"))
            .and_then(Value::as_array)
            .map(|cols| {
                cols.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        for stale in previous.iter().filter(|c| !standardized.contains(c)) {
            host.remove_analysis_column(stale).map_err(host_error)?;
        }

        if host.checkpoint(Some(100), None) == Flow::Abort {
            return Err(RuntimeError::Interrupted);
        }

        let summary = host.temp_file("csv").map_err(host_error)?;
        fs::write(summary.absolute(), self.summary_csv(&table))
            .map_err(|e| RuntimeError::Evaluation(format!("failed to write summary: {}", e)))?;

        Ok(AnalysisOutput {
            results: json!({
                "title": call.request.title,
                "descriptives": table,
                "summaryFile": summary,
            }),
            meta: Some(json!({ "descriptives": "table", "summaryFile": "file" })),
            state: Some(json!({ "standardizedColumns": standardized })),
            keep: vec![summary.relative_path],
        })
    }

    fn summary_csv(&self, table: &[Value]) -> String {
        let mut csv = String::from("variable,n,missing,mean,sd,min,max\n");
        for row in table {
            let field = |key: &str| {
                row.get(key)
                    .and_then(Value::as_f64)
                    .map(|v| self.settings.format_number(v))
                    .unwrap_or_default()
            };
            let _ = writeln!(
                csv,
                "{},{},{},{},{},{},{}",
                row.get("variable").and_then(Value::as_str).unwrap_or_default(),
                field("n"),
                field("missing"),
                field("mean"),
                field("sd"),
                field("min"),
                field("max"),
            );
        }
        csv
    }
}

/// One row of the descriptives table, plus z-scores when requested.
fn describe_variable(
    dataset: &Dataset,
    variable: &str,
    standardize: bool,
) -> RuntimeResult<(Value, Option<Vec<CellValue>>)> {
    let column = dataset
        .column(variable)
        .ok_or_else(|| RuntimeError::Evaluation(format!("variable '{}' not found", variable)))?;
    let rows = dataset.filtered_rows();
    let missing = rows.iter().filter(|&&r| column.values[r].is_missing()).count();
    let n = rows.len() - missing;

    if column.column_type != ColumnType::Scale {
        let mut levels: BTreeMap<String, usize> = BTreeMap::new();
        for label in rows.iter().filter_map(|&r| column.values[r].label()) {
            *levels.entry(label).or_default() += 1;
        }
        let levels: Vec<Value> = levels
            .into_iter()
            .map(|(level, count)| json!({ "level": level, "count": count }))
            .collect();
        let row = json!({ "variable": variable, "n": n, "missing": missing, "levels": levels });
        return Ok((row, None));
    }

    let numbers = column.numbers();
    let present: Vec<f64> = rows.iter().filter_map(|&r| numbers[r]).collect();
    let mean = aggregate("mean", &present);
    let sd = aggregate("sd", &present);
    let row = json!({
        "variable": variable,
        "n": n,
        "missing": missing,
        "mean": mean,
        "sd": sd,
        "min": aggregate("min", &present),
        "max": aggregate("max", &present),
    });

    let z_values = match (standardize, mean, sd) {
        (true, Some(mean), Some(sd)) if sd > 0.0 => {
            let included: FxHashSet<usize> = rows.iter().copied().collect();
            Some(
                numbers
                    .iter()
                    .enumerate()
                    .map(|(r, v)| match v {
                        Some(v) if included.contains(&r) => CellValue::Number((v - mean) / sd),
                        _ => CellValue::Missing,
                    })
                    .collect(),
            )
        }
        _ => None,
    };

    Ok((row, z_values))
}

fn module_name(reference: &Value) -> Option<&str> {
    reference
        .as_str()
        .or_else(|| reference.get("moduleName").and_then(Value::as_str))
}

impl CodeRuntime for BuiltinRuntime {
    fn apply_settings(&mut self, settings: &Settings) {
        self.settings = settings.clone();
    }

    fn evaluate_filter(&mut self, code: &str, dataset: &Dataset) -> RuntimeResult<Vec<bool>> {
        self.evaluate(code, Some(dataset), false)?
            .into_filter(dataset.row_count())
    }

    fn compute_column(&mut self, code: &str, dataset: &Dataset) -> RuntimeResult<Vec<CellValue>> {
        self.evaluate(code, Some(dataset), false)?
            .into_cells(dataset.row_count())
    }

    fn run_code(
        &mut self,
        code: &str,
        dataset: &Dataset,
        whitelisted: bool,
    ) -> RuntimeResult<String> {
        let value = self.evaluate(code, Some(dataset), whitelisted)?;
        Ok(value.render(&self.settings))
    }

    fn run_commander(&mut self, code: &str) -> RuntimeResult<()> {
        self.evaluate(code, None, true).map(|_| ())
    }

    fn module_request(&mut self, request: &ModuleRequest) -> RuntimeResult<String> {
        let name = &request.module_name;
        match request.kind.as_str() {
            "loadModule" => {
                self.modules.insert(name.clone());
                Ok(format!("module '{}' loaded", name))
            }
            "unloadModule" => {
                if self.modules.remove(name) {
                    Ok(format!("module '{}' unloaded", name))
                } else {
                    Err(RuntimeError::Module(format!("module '{}' is not loaded", name)))
                }
            }
            "installModule" => Err(RuntimeError::Module(
                "installing modules is not supported by the built-in runtime".to_string(),
            )),
            other => Err(RuntimeError::Module(format!(
                "unknown module request '{}'",
                other
            ))),
        }
    }

    fn run_analysis(
        &mut self,
        call: &AnalysisCall<'_>,
        host: &mut dyn AnalysisHost,
    ) -> RuntimeResult<AnalysisOutput> {
        if let Some(reference) = &call.request.dynamic_module {
            let name = module_name(reference).ok_or_else(|| {
                RuntimeError::Module("dynamic module reference without a name".to_string())
            })?;
            if !self.modules.contains(name) {
                return Err(RuntimeError::Module(format!("module '{}' is not loaded", name)));
            }
        }

        match call.request.name.as_str() {
            "Descriptives" => self.descriptives(call, host),
            other => Err(RuntimeError::UnknownAnalysis(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Column;
    use crate::ipc::protocol::{AnalysisRequest, Perform};
    use crate::paths::{FileLocation, SessionDirs};
    use tempfile::TempDir;

    fn dataset() -> Dataset {
        Dataset::from_columns(vec![
            Column::scale("x", &[-1.0, 2.0, 3.0]),
            Column::nominal("g", &["a", "b", "a"]),
        ])
        .unwrap()
    }

    struct TestHost {
        dataset: Dataset,
        dirs: SessionDirs,
        checkpoints: usize,
        abort_after: Option<usize>,
    }

    impl AnalysisHost for TestHost {
        fn dataset(&mut self) -> crate::Result<&Dataset> {
            Ok(&self.dataset)
        }

        fn set_analysis_column(
            &mut self,
            name: &str,
            values: Vec<CellValue>,
            column_type: ColumnType,
        ) -> crate::Result<()> {
            self.dataset.create_column(name)?;
            self.dataset.set_column_data_and_type(name, values, column_type)?;
            Ok(())
        }

        fn remove_analysis_column(&mut self, name: &str) -> crate::Result<bool> {
            Ok(self.dataset.delete_column(name))
        }

        fn checkpoint(&mut self, _progress: Option<u8>, _partial: Option<&Value>) -> Flow {
            self.checkpoints += 1;
            match self.abort_after {
                Some(limit) if self.checkpoints > limit => Flow::Abort,
                _ => Flow::Continue,
            }
        }

        fn temp_file(&mut self, extension: &str) -> crate::Result<FileLocation> {
            self.dirs.temp_file(1, extension)
        }

        fn specific_file(&mut self, name: &str) -> crate::Result<FileLocation> {
            self.dirs.specific_file(1, name)
        }
    }

    fn host(temp: &TempDir) -> TestHost {
        TestHost {
            dataset: dataset(),
            dirs: SessionDirs::new(temp.path(), 0).unwrap(),
            checkpoints: 0,
            abort_after: None,
        }
    }

    fn request(options: Value) -> AnalysisRequest {
        AnalysisRequest {
            id: 1,
            revision: 1,
            name: "Descriptives".to_string(),
            title: "Descriptive Statistics".to_string(),
            options,
            perform: Perform::Run,
            dynamic_module: None,
            result_font: None,
            image_options: None,
            code_file: None,
            language: None,
        }
    }

    #[test]
    fn test_filter_and_compute() {
        let data = dataset();
        let mut runtime = BuiltinRuntime::new();
        assert_eq!(
            runtime.evaluate_filter("col0_enc > 0", &data).unwrap(),
            vec![false, true, true]
        );
        assert_eq!(
            runtime.compute_column("col0_enc * 2", &data).unwrap(),
            vec![
                CellValue::Number(-2.0),
                CellValue::Number(4.0),
                CellValue::Number(6.0)
            ]
        );
        assert!(matches!(
            runtime.evaluate_filter("col0_enc >", &data),
            Err(RuntimeError::Parse { .. })
        ));
    }

    #[test]
    fn test_run_code_whitelist() {
        let data = dataset();
        let mut runtime = BuiltinRuntime::new();
        assert_eq!(runtime.run_code("1 + 1", &data, false).unwrap(), "[1] 2");
        assert!(matches!(
            runtime.run_code("set_option('seed', 1)", &data, false),
            Err(RuntimeError::NotWhitelisted(_))
        ));
        runtime.run_code("set_option('seed', 1)", &data, true).unwrap();
        assert_eq!(runtime.option("seed"), Some("1"));

        runtime.run_commander("set_option('mode', 'batch')").unwrap();
        assert_eq!(runtime.option("mode"), Some("batch"));
    }

    #[test]
    fn test_modules() {
        let mut runtime = BuiltinRuntime::new();
        let load = ModuleRequest {
            kind: "loadModule".to_string(),
            module_name: "Regression".to_string(),
            module_code: None,
        };
        runtime.module_request(&load).unwrap();
        assert!(runtime.is_module_loaded("Regression"));

        let unload = ModuleRequest {
            kind: "unloadModule".to_string(),
            ..load.clone()
        };
        runtime.module_request(&unload).unwrap();
        assert!(runtime.module_request(&unload).is_err());

        let install = ModuleRequest {
            kind: "installModule".to_string(),
            ..load
        };
        assert!(matches!(
            runtime.module_request(&install),
            Err(RuntimeError::Module(_))
        ));
    }

    #[test]
    fn test_descriptives() {
        let temp = TempDir::new().unwrap();
        let mut host = host(&temp);
        let mut runtime = BuiltinRuntime::new();
        let request = request(json!({ "variables": ["x", "g"] }));
        let call = AnalysisCall { request: &request, state: None };

        let output = runtime.run_analysis(&call, &mut host).unwrap();
        let table = output.results["descriptives"].as_array().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0]["n"], 3);
        assert_eq!(table[0]["min"], -1.0);
        assert_eq!(table[1]["levels"][0], json!({ "level": "a", "count": 2 }));
        assert_eq!(host.checkpoints, 3);

        assert_eq!(output.keep.len(), 1);
        let summary = temp.path().join(&output.keep[0]);
        let csv = fs::read_to_string(summary).unwrap();
        assert!(csv.starts_with("variable,n,missing"));
        assert!(csv.contains("x,3,0,"));
    }

    #[test]
    fn test_descriptives_standardized_columns() {
        let temp = TempDir::new().unwrap();
        let mut host = host(&temp);
        let mut runtime = BuiltinRuntime::new();

        let on = request(json!({ "variables": ["x"], "standardizedColumns": true }));
        let output = runtime
            .run_analysis(&AnalysisCall { request: &on, state: None }, &mut host)
            .unwrap();
        assert!(host.dataset.column("Z_x").is_some());

        let off = request(json!({ "variables": ["x"], "standardizedColumns": false }));
        runtime
            .run_analysis(&AnalysisCall { request: &off, state: output.state }, &mut host)
            .unwrap();
        assert!(host.dataset.column("Z_x").is_none());
    }

    #[test]
    fn test_descriptives_aborts_at_checkpoint() {
        let temp = TempDir::new().unwrap();
        let mut host = host(&temp);
        host.abort_after = Some(1);
        let mut runtime = BuiltinRuntime::new();
        let request = request(json!({ "variables": ["x", "g"] }));

        let result = runtime.run_analysis(&AnalysisCall { request: &request, state: None }, &mut host);
        assert_eq!(result, Err(RuntimeError::Interrupted));
    }

    #[test]
    fn test_unknown_analysis_and_missing_module() {
        let temp = TempDir::new().unwrap();
        let mut host = host(&temp);
        let mut runtime = BuiltinRuntime::new();

        let mut unknown = request(json!({}));
        unknown.name = "Anova".to_string();
        assert!(matches!(
            runtime.run_analysis(&AnalysisCall { request: &unknown, state: None }, &mut host),
            Err(RuntimeError::UnknownAnalysis(_))
        ));

        let mut dynamic = request(json!({ "variables": ["x"] }));
        dynamic.dynamic_module = Some(json!({ "moduleName": "Regression" }));
        assert!(matches!(
            runtime.run_analysis(&AnalysisCall { request: &dynamic, state: None }, &mut host),
            Err(RuntimeError::Module(_))
        ));
    }
}
